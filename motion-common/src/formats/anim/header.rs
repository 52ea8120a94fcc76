//! Binary clip header

use std::io::{self, Write};

/// Format version understood by the legacy consumer.
pub const ANIM_VERSION: u16 = 1;

/// Format sub-version.
pub const ANIM_SUB_VERSION: u16 = 0;

/// Global header of a binary clip.
///
/// Variable-length because the emote name is a null-terminated string in
/// the middle of the otherwise fixed field block.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimHeader {
    pub version: u16,
    pub sub_version: u16,
    /// Base clip priority
    pub priority: i32,
    /// Clip duration in seconds
    pub duration: f32,
    /// Emote to trigger alongside the clip; empty for none
    pub emote_name: String,
    /// Loop entry point, seconds
    pub loop_in: f32,
    /// Loop exit point, seconds
    pub loop_out: f32,
    pub looped: bool,
    /// Ease-in time, seconds
    pub ease_in: f32,
    /// Ease-out time, seconds
    pub ease_out: f32,
    /// Hand pose identifier
    pub hand_pose: i32,
    /// Number of joint blocks that follow
    pub joint_count: i32,
}

impl AnimHeader {
    /// Write the header, little-endian.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&self.sub_version.to_le_bytes())?;
        w.write_all(&self.priority.to_le_bytes())?;
        w.write_all(&self.duration.to_le_bytes())?;
        w.write_all(self.emote_name.as_bytes())?;
        w.write_all(&[0])?;
        w.write_all(&self.loop_in.to_le_bytes())?;
        w.write_all(&self.loop_out.to_le_bytes())?;
        w.write_all(&i32::from(self.looped).to_le_bytes())?;
        w.write_all(&self.ease_in.to_le_bytes())?;
        w.write_all(&self.ease_out.to_le_bytes())?;
        w.write_all(&self.hand_pose.to_le_bytes())?;
        w.write_all(&self.joint_count.to_le_bytes())?;
        Ok(())
    }

    /// Parse a header from the start of a byte stream.
    ///
    /// Returns the header and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Option<(Self, usize)> {
        let mut r = Reader { bytes, pos: 0 };
        let version = r.u16()?;
        let sub_version = r.u16()?;
        let priority = r.i32()?;
        let duration = r.f32()?;
        let emote_name = r.cstr()?;
        let loop_in = r.f32()?;
        let loop_out = r.f32()?;
        let looped = r.i32()? != 0;
        let ease_in = r.f32()?;
        let ease_out = r.f32()?;
        let hand_pose = r.i32()?;
        let joint_count = r.i32()?;
        Some((
            Self {
                version,
                sub_version,
                priority,
                duration,
                emote_name,
                loop_in,
                loop_out,
                looped,
                ease_in,
                ease_out,
                hand_pose,
                joint_count,
            },
            r.pos,
        ))
    }

    /// Validate header plausibility.
    pub fn validate(&self) -> bool {
        self.version == ANIM_VERSION
            && self.sub_version == ANIM_SUB_VERSION
            && self.duration >= 0.0
            && (0..=super::writer::MAX_EXPORT_JOINTS as i32).contains(&self.joint_count)
    }
}

/// Minimal little-endian cursor used by header parsing and the joint-name
/// read-back helper.
pub(super) struct Reader<'a> {
    pub bytes: &'a [u8],
    pub pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Option<&[u8]> {
        let chunk = self.bytes.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(chunk)
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.take(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Option<f32> {
        self.take(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn cstr(&mut self) -> Option<String> {
        let rest = self.bytes.get(self.pos..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Some(s)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}
