//! motion-export - skeletal motion export tool
//!
//! Samples animation clips from glTF scenes and serializes them to the
//! quantized binary clip format (.anim) or the hierarchical text format
//! (.bvh), optionally retargeting between skeletons first.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use motion_common::formats::bvh::{self, BvhOptions};
use motion_common::formats::anim;
use motion_common::motion::{ChannelSet, SampledMotion};
use motion_common::skeleton::Skeleton;

use motion_export::{
    build_record, collect_channels, gltf_src, sample_range, BoneMap, ClipEvaluator,
    CollectOptions, ExportConfig, ExportReport, ProgressCounter, RetargetOptions, RetargetSession,
};
use motion_export::clip::{Action, ClipSource};

#[derive(Parser)]
#[command(name = "motion-export")]
#[command(about = "Skeletal motion export tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReferenceLineArg {
    None,
    Frozen,
    BoneLock,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a binary clip from a glTF animation
    Anim {
        /// Input glTF/GLB file
        input: PathBuf,

        /// Output .anim file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Animation index (default: first animation)
        #[arg(short, long)]
        animation: Option<usize>,

        /// Skin index (default: first skin)
        #[arg(short, long)]
        skin: Option<usize>,

        /// Run configuration file (export.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Sampling frame rate override
        #[arg(short, long)]
        fps: Option<f64>,

        /// Export translation channels beyond the pelvis
        #[arg(long)]
        with_translation: bool,
    },

    /// Export a BVH file from a glTF animation
    Bvh {
        /// Input glTF/GLB file
        input: PathBuf,

        /// Output .bvh file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Animation index (default: first animation)
        #[arg(short, long)]
        animation: Option<usize>,

        /// Skin index (default: first skin)
        #[arg(short, long)]
        skin: Option<usize>,

        /// Run configuration file (export.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Synthetic leading reference line
        #[arg(long, value_enum, default_value = "none")]
        reference_line: ReferenceLineArg,
    },

    /// Retarget a clip onto another skeleton, then export a binary clip
    Retarget {
        /// Source glTF/GLB file (provides the motion)
        source: PathBuf,

        /// Target glTF/GLB file (provides the skeleton)
        target: PathBuf,

        /// Output .anim file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Animation index in the source (default: first animation)
        #[arg(short, long)]
        animation: Option<usize>,

        /// Run configuration file (export.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List animations in a glTF file
    List {
        /// Input glTF/GLB file
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Anim {
            input,
            output,
            animation,
            skin,
            config,
            fps,
            with_translation,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(fps) = fps {
                cfg.fps = fps;
            }
            cfg.with_translation |= with_translation;

            let output = output.unwrap_or_else(|| input.with_extension("anim"));
            tracing::info!("Exporting clip {:?} -> {:?}", input, output);

            let (mut eval, mut report) = evaluator_for(&input, skin, animation, &cfg)?;
            let (channels, motion) = capture(&mut eval, &cfg, &mut report)?;
            write_anim_file(&output, eval.skeleton(), &channels, &motion, &cfg, &mut report)?;
            report.log_summary();
            tracing::info!("Done!");
        }

        Commands::Bvh {
            input,
            output,
            animation,
            skin,
            config,
            reference_line,
        } => {
            let cfg = load_config(config.as_deref())?;
            let output = output.unwrap_or_else(|| input.with_extension("bvh"));
            tracing::info!("Exporting BVH {:?} -> {:?}", input, output);

            let (mut eval, mut report) = evaluator_for(&input, skin, animation, &cfg)?;
            let (channels, motion) = capture(&mut eval, &cfg, &mut report)?;

            let opts = BvhOptions {
                fps: cfg.fps,
                reference_line: match reference_line {
                    ReferenceLineArg::None => None,
                    ReferenceLineArg::Frozen => Some(bvh::ReferenceLine::Frozen),
                    ReferenceLineArg::BoneLock => Some(bvh::ReferenceLine::BoneLock),
                },
                reference_frame: cfg.reference_frame.unwrap_or(0),
                ..BvhOptions::default()
            };
            let frames: BTreeSet<i32> = motion.frames().collect();

            let file = File::create(&output)
                .with_context(|| format!("Failed to create output: {:?}", output))?;
            let mut writer = BufWriter::new(file);
            let result = bvh::write_bvh(
                &mut writer,
                eval.skeleton(),
                &channels,
                &motion,
                &frames,
                &opts,
            )
            .and_then(|()| writer.flush().map_err(bvh::BvhError::Io));
            if let Err(err) = result {
                // never leave a truncated document behind
                drop_output(&output);
                return Err(err).with_context(|| format!("BVH export failed: {:?}", output));
            }
            report.log_summary();
            tracing::info!("Done!");
        }

        Commands::Retarget {
            source,
            target,
            output,
            animation,
            config,
        } => {
            let cfg = load_config(config.as_deref())?;
            let output = output.unwrap_or_else(|| target.with_extension("anim"));
            tracing::info!("Retargeting {:?} onto {:?} -> {:?}", source, target, output);

            let mut report = ExportReport::default();
            let (mut src_eval, _) = evaluator_for(&source, None, animation, &cfg)?;
            let target_scene = gltf_src::load_scene(&target, None, cfg.fps)?;
            let mut tgt_eval = ClipEvaluator::with_local_matrices(
                target_scene.skeleton,
                ClipSource::from_action(Action::new("rest")),
                target_scene.local_rest.clone(),
                target_scene.local_bind.clone(),
            );

            let (start, end) = frame_span(&cfg, src_eval.clip());
            let map = bone_map(&cfg, src_eval.skeleton(), tgt_eval.skeleton());
            let opts = RetargetOptions {
                reference_frame: cfg.reference_frame,
                use_restpose: cfg.use_restpose,
                with_translation: cfg.with_translation,
                simplification: cfg.simplification,
                tolerance: cfg.tolerance,
                seamless_loc_frames: cfg.seamless_loc_frames,
                seamless_rot_frames: cfg.seamless_rot_frames,
                frame_start: start,
                frame_end: end,
                pinned: BTreeSet::new(),
            };

            let src_skel = src_eval.skeleton().clone();
            let tgt_skel = tgt_eval.skeleton().clone();
            let mut session = RetargetSession::new(map, opts);
            session.align_reference(&mut src_eval, &src_skel, &mut tgt_eval, &tgt_skel, &mut report)?;
            session.collect_motion(&mut src_eval, &src_skel)?;
            session.simplify()?;
            let action = session.transfer(&mut tgt_eval, &tgt_skel)?;

            // export the transferred clip through the ordinary pipeline
            let mut eval = ClipEvaluator::with_local_matrices(
                tgt_skel,
                ClipSource::from_action(action),
                target_scene.local_rest,
                target_scene.local_bind,
            );
            let (channels, motion) = capture(&mut eval, &cfg, &mut report)?;
            write_anim_file(&output, eval.skeleton(), &channels, &motion, &cfg, &mut report)?;
            report.log_summary();
            tracing::info!("Done!");
        }

        Commands::List { input } => {
            gltf_src::list_animations(&input)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ExportConfig> {
    match path {
        Some(path) => ExportConfig::load(path),
        None => Ok(ExportConfig::default()),
    }
}

/// Build a clip evaluator for one animation of a glTF file.
fn evaluator_for(
    input: &Path,
    skin: Option<usize>,
    animation: Option<usize>,
    cfg: &ExportConfig,
) -> Result<(ClipEvaluator, ExportReport)> {
    let scene = gltf_src::load_scene(input, skin, cfg.fps)?;
    let index = animation.unwrap_or(0);
    let action = scene
        .actions
        .into_iter()
        .nth(index)
        .with_context(|| format!("Animation index {} not found in glTF", index))?;
    tracing::info!(
        "Using animation '{}' on a {}-bone skeleton",
        action.name,
        scene.skeleton.len()
    );
    let eval = ClipEvaluator::with_local_matrices(
        scene.skeleton,
        ClipSource::from_action(action),
        scene.local_rest,
        scene.local_bind,
    );
    Ok((eval, ExportReport::default()))
}

/// The frame span of an export run: configured range, else the clip's.
fn frame_span(cfg: &ExportConfig, clip: &ClipSource) -> (i32, i32) {
    let keyed = clip.frame_range().unwrap_or((0, 0));
    (
        cfg.frame_start.unwrap_or(keyed.0),
        cfg.frame_end.unwrap_or(keyed.1),
    )
}

/// Collect channels and sample the configured frame range.
fn capture(
    eval: &mut ClipEvaluator,
    cfg: &ExportConfig,
    report: &mut ExportReport,
) -> Result<(ChannelSet, SampledMotion)> {
    let opts = CollectOptions {
        with_translation: cfg.with_translation,
        use_bind_pose: cfg.use_bind_pose,
    };
    let channels = collect_channels(
        eval.skeleton(),
        eval.clip(),
        eval,
        &opts,
        &cfg.parent_overrides,
        report,
    )?;
    tracing::info!("Collected {} export bones", channels.len());

    let (start, end) = frame_span(cfg, eval.clip());
    let frames: Vec<i32> = (start..=end)
        .filter(|f| cfg.keep_reference_frame || Some(*f) != cfg.reference_frame)
        .collect();
    let skel = eval.skeleton().clone();
    let progress = ProgressCounter::default();
    let motion = sample_range(eval, &skel, &channels, frames, report, &progress);
    Ok((channels, motion))
}

/// Assemble and write the binary clip, removing the file on fatal errors.
fn write_anim_file(
    output: &Path,
    skel: &Skeleton,
    channels: &ChannelSet,
    motion: &SampledMotion,
    cfg: &ExportConfig,
    report: &mut ExportReport,
) -> Result<()> {
    let record = build_record(skel, channels, motion, cfg);
    let file =
        File::create(output).with_context(|| format!("Failed to create output: {:?}", output))?;
    let mut writer = BufWriter::new(file);
    let written = anim::write_anim(&mut writer, &record)
        .map_err(anyhow::Error::from)
        .and_then(|summary| {
            writer.flush()?;
            Ok(summary)
        });
    match written {
        Ok(summary) => {
            report.duplicate_joints = summary.duplicates;
            report.silent_joints = summary.silent;
            tracing::info!(
                "Exported clip: {} joints, {:.2}s at {} fps",
                record.joints.len(),
                record.duration,
                record.fps
            );
            Ok(())
        }
        Err(err) => {
            // a fatal error must not leave a half-written clip behind
            drop_output(output);
            Err(err).with_context(|| format!("Clip export failed: {:?}", output))
        }
    }
}

fn drop_output(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        tracing::warn!("could not remove partial output {:?}: {err}", path);
    }
}

/// The bone mapping for a retarget run: the configured table, or every
/// source bone whose name also exists in the target.
fn bone_map(cfg: &ExportConfig, source: &Skeleton, target: &Skeleton) -> BoneMap {
    let center_source = cfg
        .center_source
        .clone()
        .unwrap_or_else(|| motion_common::rig::PELVIS.to_string());
    let center_target = cfg
        .retarget_map
        .get(&center_source)
        .cloned()
        .or_else(|| cfg.center_target.clone())
        .unwrap_or_else(|| center_source.clone());
    let mut map = BoneMap::new(&center_source, &center_target);
    if cfg.retarget_map.is_empty() {
        for bone in source.bones() {
            if target.contains(&bone.name) {
                map.insert(&bone.name, &bone.name);
            }
        }
    } else {
        for (src, tgt) in &cfg.retarget_map {
            map.insert(src, tgt);
        }
    }
    map
}
