//! Concrete command lines for the supported external tools.
//!
//! | Stage       | Tool                          | Invocations      | Progress        |
//! |-------------|-------------------------------|------------------|-----------------|
//! | render      | Blender (Cycles)              | one, frame range | output lines    |
//! | denoise     | OIDN or FastDVDnet            | one per frame    | completed calls |
//! | upscale     | Real-ESRGAN (ncnn)            | one, directory   | output files    |
//! | interpolate | RIFE (ncnn)                   | one, directory   | none            |
//! | encode      | FFmpeg                        | one              | none            |

use std::path::{Path, PathBuf};

use lumen_core::config::{Codec, DenoiseMethod, RunConfiguration};
use lumen_core::stage::StageName;
use lumen_core::types::CPU_DEVICE_ID;

use crate::command::{CommandBuilder, ProgressSource, StageCommand, StageContext, StagePlan};
use crate::error::StageError;

/// File name prefix for every frame image the pipeline writes.
pub const FRAME_PREFIX: &str = "render_";
/// Extension of intermediate frame images.
pub const FRAME_EXTENSION: &str = "png";
/// Final artifact written by the encode stage.
pub const VIDEO_FILE_NAME: &str = "output.mov";
/// Name of the generated renderer settings script.
pub const RENDER_SCRIPT_NAME: &str = "render_settings.py";

const UPSCALE_MODEL: &str = "realesrgan-x4plus-anime";

/// Locations of the external tools. `None` means the tool was not found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPaths {
    pub blender: Option<PathBuf>,
    pub oidn: Option<PathBuf>,
    pub python: Option<PathBuf>,
    pub fastdvdnet: Option<PathBuf>,
    pub realesrgan: Option<PathBuf>,
    pub rife: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
}

impl ToolPaths {
    /// Resolve tool locations from environment variables, falling back to
    /// well-known executable names on `PATH`.
    ///
    /// | Env Var           | Fallback on `PATH`             |
    /// |-------------------|--------------------------------|
    /// | `BLENDER_PATH`    | `blender`                      |
    /// | `OIDN_PATH`       | `oidnDenoise`                  |
    /// | `PYTHON_PATH`     | `python3`, `python`            |
    /// | `FASTDVDNET_PATH` | (none, a script path)          |
    /// | `REALESRGAN_PATH` | `realesrgan-ncnn-vulkan`       |
    /// | `RIFE_PATH`       | `rife-ncnn-vulkan`             |
    /// | `FFMPEG_PATH`     | `ffmpeg`                       |
    pub fn from_env() -> Self {
        let path_var = std::env::var_os("PATH");
        let resolve = |var: &str, candidates: &[&str]| -> Option<PathBuf> {
            if let Some(value) = std::env::var_os(var).filter(|v| !v.is_empty()) {
                return Some(PathBuf::from(value));
            }
            let path_var = path_var.as_ref()?;
            candidates
                .iter()
                .find_map(|name| find_in_path(name, path_var))
        };

        Self {
            blender: resolve("BLENDER_PATH", &["blender"]),
            oidn: resolve("OIDN_PATH", &["oidnDenoise"]),
            python: resolve("PYTHON_PATH", &["python3", "python"]),
            fastdvdnet: resolve("FASTDVDNET_PATH", &[]),
            realesrgan: resolve("REALESRGAN_PATH", &["realesrgan-ncnn-vulkan"]),
            rife: resolve("RIFE_PATH", &["rife-ncnn-vulkan"]),
            ffmpeg: resolve("FFMPEG_PATH", &["ffmpeg"]),
        }
    }
}

fn find_in_path(name: &str, path_var: &std::ffi::OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn require<'a>(path: &'a Option<PathBuf>, env_var: &str) -> Result<&'a Path, StageError> {
    path.as_deref()
        .ok_or_else(|| StageError::ToolNotFound(format!("set {env_var} or put the tool on PATH")))
}

/// [`CommandBuilder`] for Blender, OIDN, FastDVDnet, Real-ESRGAN, RIFE
/// and FFmpeg.
#[derive(Debug, Clone)]
pub struct ToolCommandBuilder {
    paths: ToolPaths,
}

impl ToolCommandBuilder {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    fn render(&self, config: &RunConfiguration, ctx: &StageContext) -> Result<StagePlan, StageError> {
        let blender = require(&self.paths.blender, "BLENDER_PATH")?;
        let script = ctx.temp_dir.join(RENDER_SCRIPT_NAME);
        std::fs::write(&script, render_settings_script(config, ctx))?;

        let mut cmd = StageCommand::new(blender)
            .arg("-b")
            .arg(&config.scene_file)
            .arg("-P")
            .arg(&script)
            .arg("-a")
            .current_dir(&ctx.output_dir);
        if let Some(id) = ctx.device {
            cmd = cmd.env("CUDA_VISIBLE_DEVICES", id.to_string());
        }

        Ok(StagePlan::single(cmd, ProgressSource::Stream, ctx.output_dir.clone())
            .with_frames(config.frame_start, config.frame_count()))
    }

    fn denoise(&self, config: &RunConfiguration, ctx: &StageContext) -> Result<StagePlan, StageError> {
        let input = ctx.require_input()?;
        let frames = list_frames(input)?;

        let invocations = match config.denoise {
            DenoiseMethod::Oidn => {
                let oidn = require(&self.paths.oidn, "OIDN_PATH")?;
                frames
                    .iter()
                    .map(|frame| {
                        let mut cmd = StageCommand::new(oidn)
                            .arg("--hdr")
                            .arg(frame)
                            .arg("-o")
                            .arg(output_for(frame, &ctx.output_dir));
                        if let Some(id) = ctx.device {
                            cmd = cmd
                                .args(["--device", "cuda"])
                                .env("CUDA_VISIBLE_DEVICES", id.to_string());
                        }
                        cmd
                    })
                    .collect()
            }
            DenoiseMethod::Fastdvdnet => {
                let python = require(&self.paths.python, "PYTHON_PATH")?;
                let script = require(&self.paths.fastdvdnet, "FASTDVDNET_PATH")?;
                frames
                    .iter()
                    .map(|frame| {
                        let mut cmd = StageCommand::new(python)
                            .arg(script)
                            .arg("-i")
                            .arg(frame)
                            .arg("-o")
                            .arg(output_for(frame, &ctx.output_dir));
                        if let Some(id) = ctx.device {
                            cmd = cmd.env("CUDA_VISIBLE_DEVICES", id.to_string());
                        }
                        cmd
                    })
                    .collect()
            }
            DenoiseMethod::None => Vec::new(),
        };

        let total = u32::try_from(frames.len()).unwrap_or(u32::MAX);
        Ok(StagePlan {
            invocations,
            progress: ProgressSource::Invocations,
            frame_start: 1,
            frames_total: total,
            output_location: ctx.output_dir.clone(),
        })
    }

    fn upscale(&self, config: &RunConfiguration, ctx: &StageContext) -> Result<StagePlan, StageError> {
        let realesrgan = require(&self.paths.realesrgan, "REALESRGAN_PATH")?;
        let input = ctx.require_input()?;
        let total = u32::try_from(list_frames(input)?.len()).unwrap_or(u32::MAX);

        let gpu = ctx
            .device
            .map_or(CPU_DEVICE_ID.to_string(), |id| id.to_string());
        let cmd = StageCommand::new(realesrgan)
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(&ctx.output_dir)
            .args(["-n", UPSCALE_MODEL])
            .arg("-s")
            .arg(config.upscale_factor.to_string())
            .args(["-f", FRAME_EXTENSION])
            .arg("-g")
            .arg(gpu);

        let progress = ProgressSource::OutputFiles {
            dir: ctx.output_dir.clone(),
            extension: FRAME_EXTENSION.to_string(),
        };
        Ok(StagePlan::single(cmd, progress, ctx.output_dir.clone()).with_frames(1, total))
    }

    fn interpolate(&self, ctx: &StageContext) -> Result<StagePlan, StageError> {
        let rife = require(&self.paths.rife, "RIFE_PATH")?;
        let input = ctx.require_input()?;
        list_frames(input)?;

        let gpu = ctx
            .device
            .map_or(CPU_DEVICE_ID.to_string(), |id| id.to_string());
        let cmd = StageCommand::new(rife)
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(&ctx.output_dir)
            .arg("-f")
            .arg(format!("{FRAME_PREFIX}%08d.{FRAME_EXTENSION}"))
            .arg("-g")
            .arg(gpu);

        Ok(StagePlan::single(cmd, ProgressSource::Untracked, ctx.output_dir.clone()))
    }

    fn encode(&self, config: &RunConfiguration, ctx: &StageContext) -> Result<StagePlan, StageError> {
        let ffmpeg = require(&self.paths.ffmpeg, "FFMPEG_PATH")?;
        let input = ctx.require_input()?;
        list_frames(input)?;

        // Interpolated sequences are renumbered from 1.
        let start_number = if ctx.previous == Some(StageName::Interpolate) {
            1
        } else {
            config.frame_start
        };
        let output = ctx.output_dir.join(VIDEO_FILE_NAME);
        let cmd = StageCommand::new(ffmpeg)
            .arg("-y")
            .arg("-framerate")
            .arg(config.framerate.to_string())
            .arg("-start_number")
            .arg(start_number.to_string())
            .arg("-i")
            .arg(input.join(format!("{FRAME_PREFIX}%08d.{FRAME_EXTENSION}")))
            .args(codec_args(config.codec))
            .arg(&output);

        Ok(StagePlan::single(cmd, ProgressSource::Untracked, output))
    }
}

impl CommandBuilder for ToolCommandBuilder {
    fn build(&self, config: &RunConfiguration, ctx: &StageContext) -> Result<StagePlan, StageError> {
        match ctx.stage {
            StageName::Render => self.render(config, ctx),
            StageName::Denoise => self.denoise(config, ctx),
            StageName::Upscale => self.upscale(config, ctx),
            StageName::Interpolate => self.interpolate(ctx),
            StageName::Encode => self.encode(config, ctx),
        }
    }
}

/// FFmpeg video codec arguments, alpha-preserving for both codecs.
pub fn codec_args(codec: Codec) -> Vec<&'static str> {
    match codec {
        Codec::ProresKs => vec!["-c:v", codec.encoder_name(), "-profile:v", "4", "-pix_fmt", "yuva444p10le"],
        Codec::Qtrle => vec!["-c:v", codec.encoder_name(), "-pix_fmt", "rgba"],
    }
}

/// Python settings applied by the renderer before rendering the animation.
pub fn render_settings_script(config: &RunConfiguration, ctx: &StageContext) -> String {
    let output_pattern = ctx.output_dir.join(format!("{FRAME_PREFIX}########"));
    let mut script = format!(
        "import bpy\n\
         scene = bpy.context.scene\n\
         scene.frame_start = {start}\n\
         scene.frame_end = {end}\n\
         scene.render.resolution_x = {width}\n\
         scene.render.resolution_y = {height}\n\
         scene.render.resolution_percentage = 100\n\
         scene.render.engine = 'CYCLES'\n\
         scene.cycles.samples = {samples}\n\
         scene.render.image_settings.file_format = 'PNG'\n\
         scene.render.image_settings.color_mode = 'RGBA'\n\
         scene.render.filepath = {filepath}\n",
        start = config.frame_start,
        end = config.frame_end,
        width = config.resolution.width,
        height = config.resolution.height,
        samples = config.sample_count,
        filepath = python_string(&output_pattern.to_string_lossy()),
    );
    if ctx.device.is_some() {
        script.push_str(
            "prefs = bpy.context.preferences.addons['cycles'].preferences\n\
             prefs.compute_device_type = 'CUDA'\n\
             prefs.get_devices()\n\
             for device in prefs.devices:\n    device.use = device.type == 'CUDA'\n\
             scene.cycles.device = 'GPU'\n",
        );
    } else {
        script.push_str("scene.cycles.device = 'CPU'\n");
    }
    script
}

fn python_string(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// Sorted frame images in `dir`. An empty directory is an error: every
/// stage after render needs at least one frame.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, StageError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StageError::Io(format!("cannot read {}: {e}", dir.display())))?;
    let mut frames = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_frame = path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(FRAME_EXTENSION));
        if is_frame {
            frames.push(path);
        }
    }
    if frames.is_empty() {
        return Err(StageError::MissingInput(dir.display().to_string()));
    }
    frames.sort();
    Ok(frames)
}

fn output_for(frame: &Path, output_dir: &Path) -> PathBuf {
    match frame.file_name() {
        Some(name) => output_dir.join(name),
        None => output_dir.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
