//! Tests for the binary clip format

use super::*;
use glam::{DQuat, DVec3};

fn minimal_record() -> ExportRecord {
    ExportRecord {
        priority: 3,
        duration: 1.0,
        emote_name: String::new(),
        loop_in: 0.0,
        loop_out: 1.0,
        looped: false,
        ease_in: 0.0,
        ease_out: 0.0,
        hand_pose: 1,
        fps: 24.0,
        frame_start: 0,
        frame_end: 24,
        joints: Vec::new(),
    }
}

// ========================================================================
// Quantizer Tests
// ========================================================================

#[test]
fn test_quant_edge_codes() {
    assert_eq!(encode_u16(-1.0, -1.0, 1.0), 0);
    assert_eq!(encode_u16(1.0, -1.0, 1.0), 65535);
    assert_eq!(encode_u16(0.0, 0.0, 1.0), 0);
    assert_eq!(encode_u16(1.0, 0.0, 1.0), 65535);
    // out-of-range values clamp
    assert_eq!(encode_u16(2.5, -1.0, 1.0), 65535);
    assert_eq!(encode_u16(-7.0, -1.0, 1.0), 0);
}

#[test]
fn test_quant_zero_width_range() {
    assert_eq!(encode_u16(0.3, 0.5, 0.5), 0);
    assert_eq!(encode_u16(123.0, 0.5, 0.5), 0);
    assert_eq!(decode_u16(0, 0.5, 0.5), 0.5);
}

#[test]
fn test_quant_round_trip_within_one_step() {
    let (lower, upper) = (-1.0, 1.0);
    let step = quant_step(lower, upper);
    for i in 0..=1000 {
        let v = lower + (upper - lower) * (f64::from(i) / 1000.0);
        if v.abs() < 2.0 * step {
            continue; // dead zone handled separately
        }
        let decoded = decode_u16(encode_u16(v, lower, upper), lower, upper);
        assert!(
            (decoded - v).abs() <= step,
            "v = {v}: decoded {decoded}, err {}",
            (decoded - v).abs()
        );
    }
}

#[test]
fn test_quant_dead_zone_snaps_to_exact_zero() {
    let (lower, upper) = (-1.0, 1.0);
    let step = quant_step(lower, upper);
    for v in [0.0, step * 0.5, -step * 0.5, step * 0.9, -step * 0.9] {
        let decoded = decode_u16(encode_u16(v, lower, upper), lower, upper);
        assert_eq!(decoded, 0.0, "v = {v} must decode to exactly zero");
    }
}

#[test]
fn test_quant_asymmetric_range() {
    let (lower, upper) = (0.0, 10.0);
    let step = quant_step(lower, upper);
    let decoded = decode_u16(encode_u16(7.25, lower, upper), lower, upper);
    assert!((decoded - 7.25).abs() <= step);
}

// ========================================================================
// Header Tests
// ========================================================================

#[test]
fn test_header_roundtrip() {
    let header = AnimHeader {
        version: ANIM_VERSION,
        sub_version: ANIM_SUB_VERSION,
        priority: 4,
        duration: 2.5,
        emote_name: "wave".to_string(),
        loop_in: 0.5,
        loop_out: 2.0,
        looped: true,
        ease_in: 0.8,
        ease_out: 0.8,
        hand_pose: 2,
        joint_count: 7,
    };
    let mut bytes = Vec::new();
    header.write_to(&mut bytes).unwrap();

    let (parsed, consumed) = AnimHeader::from_bytes(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(parsed, header);
    assert!(parsed.validate());
}

#[test]
fn test_header_from_short_bytes() {
    assert!(AnimHeader::from_bytes(&[0u8; 6]).is_none());
}

#[test]
fn test_header_validation_rejects_bad_version() {
    let mut header = minimal_record().header(1);
    assert!(header.validate());
    header.version = 9;
    assert!(!header.validate());
    header.version = ANIM_VERSION;
    header.joint_count = 33;
    assert!(!header.validate());
}

// ========================================================================
// Writer Tests
// ========================================================================

#[test]
fn test_writer_byte_layout() {
    let mut record = minimal_record();
    let mut joint = ExportJoint::new("mPelvis", 3);
    joint.rot_keys.push(RotKey {
        time: 0.0,
        rot: DQuat::IDENTITY,
    });
    record.joints.push(joint);

    let mut data = Vec::new();
    let summary = write_anim(&mut data, &record).unwrap();
    assert!(summary.duplicates.is_empty() && summary.silent.is_empty());

    // header(41) + joint block(28) + sentinel(4)
    assert_eq!(data.len(), 73);
    assert_eq!(&data[0..4], &[1, 0, 0, 0], "version 1, sub-version 0");
    assert_eq!(&data[41..49], b"mPelvis\0");
    // rot key: time 0 -> code 0; identity quat x/y/z -> midpoint code 32767
    assert_eq!(&data[57..59], &[0x00, 0x00]);
    assert_eq!(&data[59..61], &[0xFF, 0x7F]);
    assert_eq!(&data[61..63], &[0xFF, 0x7F]);
    assert_eq!(&data[63..65], &[0xFF, 0x7F]);
    // loc count 0, then the trailing sentinel
    assert_eq!(&data[65..69], &[0, 0, 0, 0]);
    assert_eq!(&data[69..73], &[0, 0, 0, 0]);
}

#[test]
fn test_writer_location_compensation() {
    let mut record = minimal_record();
    let mut joint = ExportJoint::new("mPelvis", 3);
    joint.loc_keys.push(LocKey {
        time: 0.0,
        loc: DVec3::new(0.0, 0.0, 1.0),
    });
    record.joints.push(joint);

    let mut data = Vec::new();
    write_anim(&mut data, &record).unwrap();

    // header(41) + name(8) + priority(4) + rot count(4) + loc count(4) + time(2)
    // puts the x component at offset 63 and z at 67
    let z_code = u16::from_le_bytes([data[67], data[68]]);
    let decoded = decode_u16(z_code, -1.0, 1.0) * MAX_PELVIS_OFFSET;
    assert!(
        (decoded - 1.0).abs() <= MAX_PELVIS_OFFSET * quant_step(-1.0, 1.0),
        "z decoded to {decoded}"
    );
}

#[test]
fn test_writer_deduplicates_by_name() {
    let mut record = minimal_record();
    record.joints.push(ExportJoint::new("mPelvis", 3));
    record.joints.push(ExportJoint::new("mPelvis", 3));
    record.joints.push(ExportJoint::new("mTorso", 3));

    let mut data = Vec::new();
    let summary = write_anim(&mut data, &record).unwrap();
    assert_eq!(summary.duplicates, ["mPelvis".to_string()]);

    let names = read_joint_names(&data).unwrap();
    assert_eq!(names, ["mPelvis".to_string(), "mTorso".to_string()]);
}

#[test]
fn test_writer_announces_silent_joints() {
    let mut record = minimal_record();
    record.joints.push(ExportJoint::new("mChest", 2));

    let mut data = Vec::new();
    let summary = write_anim(&mut data, &record).unwrap();
    assert_eq!(summary.silent, ["mChest".to_string()]);

    let (header, _) = AnimHeader::from_bytes(&data).unwrap();
    assert_eq!(header.joint_count, 1);
}

#[test]
fn test_writer_rejects_too_many_joints() {
    let mut record = minimal_record();
    for i in 0..33 {
        record.joints.push(ExportJoint::new(format!("mBone{i}"), 0));
    }
    let err = write_anim(&mut Vec::new(), &record).unwrap_err();
    assert!(matches!(err, AnimError::TooManyJoints { count: 33 }));
}

#[test]
fn test_writer_at_joint_limit_succeeds() {
    let mut record = minimal_record();
    for i in 0..32 {
        record.joints.push(ExportJoint::new(format!("mBone{i}"), 0));
    }
    let mut data = Vec::new();
    write_anim(&mut data, &record).unwrap();
    assert_eq!(read_joint_names(&data).unwrap().len(), 32);
}

#[test]
fn test_writer_negative_w_is_flipped() {
    let mut record = minimal_record();
    let mut joint = ExportJoint::new("mPelvis", 0);
    // -q encodes the same rotation as q; stream stores the w >= 0 form
    joint.rot_keys.push(RotKey {
        time: 0.0,
        rot: -DQuat::from_rotation_z(0.5),
    });
    record.joints.push(joint);

    let mut data = Vec::new();
    write_anim(&mut data, &record).unwrap();

    let z_code = u16::from_le_bytes([data[63], data[64]]);
    let z = decode_u16(z_code, -1.0, 1.0);
    let expected = DQuat::from_rotation_z(0.5).z;
    assert!((z - expected).abs() <= quant_step(-1.0, 1.0));
}
