//! MP4 and GIF export through an `ffmpeg` subprocess.
//!
//! Files are encoded under a hidden `.<name>.part` sibling and renamed into
//! place once ffmpeg exits cleanly, so a partially written video is never
//! visible under its final name.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, ensure, Context, Result};
use chrono::{DateTime, Local};
use ndarray::{ArrayView4, ArrayView5, Axis};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ExportConfig;
use crate::logging::FFMPEG_STDERR_TARGET;
use crate::runtime::command_for;

const MAX_NAME_SUFFIX: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    pub fps: u32,
    pub crf: u8,
    pub gif_fps: u32,
    pub gif_height: u32,
}

impl ExportSettings {
    pub fn new(fps: u32, export: &ExportConfig) -> Self {
        Self {
            fps,
            crf: export.crf,
            gif_fps: export.gif_fps,
            gif_height: export.gif_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedVideo {
    pub mp4: PathBuf,
    pub gif: PathBuf,
    pub frames: usize,
    pub width: usize,
    pub height: usize,
}

/// `[F, 3, H, W]` floats in `[0, 1]` to one interleaved RGB24 buffer per frame.
pub fn frames_to_rgb24(frames: ArrayView4<'_, f32>) -> Result<Vec<Vec<u8>>> {
    let (_, channels, height, width) = frames.dim();
    ensure!(channels == 3, "expected 3 colour channels, got {channels}");

    let to_byte = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;

    Ok(frames
        .axis_iter(Axis(0))
        .map(|frame| {
            let mut rgb = Vec::with_capacity(height * width * 3);
            for y in 0..height {
                for x in 0..width {
                    rgb.push(to_byte(frame[[0, y, x]]));
                    rgb.push(to_byte(frame[[1, y, x]]));
                    rgb.push(to_byte(frame[[2, y, x]]));
                }
            }
            rgb
        })
        .collect())
}

/// `<dir>/YYYYMMDD_HHMMSS.mp4`, or `_N` suffixed when that name is taken.
pub fn timestamped_output_path(dir: &Path, now: DateTime<Local>) -> Result<PathBuf> {
    let stem = now.format("%Y%m%d_%H%M%S").to_string();
    let taken = |path: &Path| path.exists() || part_path(path).exists();

    let first = dir.join(format!("{stem}.mp4"));
    if !taken(&first) {
        return Ok(first);
    }
    (1..MAX_NAME_SUFFIX)
        .map(|n| dir.join(format!("{stem}_{n}.mp4")))
        .find(|candidate| !taken(candidate))
        .with_context(|| format!("no free output name for {stem} in {}", dir.display()))
}

/// Hidden in-progress sibling of `path`.
pub fn part_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.part"))
}

fn finalize(part: &Path, target: &Path) -> Result<()> {
    fs::rename(part, target).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            part.display(),
            target.display()
        )
    })
}

fn spawn_stderr_drain<R: Read + Send + 'static>(stderr: R) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) if !line.is_empty() => debug!(target: FFMPEG_STDERR_TARGET, "{}", line),
                Ok(_) => {}
                Err(e) => {
                    debug!(target: FFMPEG_STDERR_TARGET, "read error: {}", e);
                    break;
                }
            }
        }
    })
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub crf: u8,
}

impl EncoderConfig {
    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            self.fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            // yuv420p needs even dimensions.
            "-vf".into(),
            "pad=ceil(iw/2)*2:ceil(ih/2)*2".into(),
            "-c:v".into(),
            "libx264".into(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            self.output_path.to_string_lossy().into_owned(),
        ]
    }

    pub fn frame_size(&self) -> usize {
        self.width * self.height * 3
    }
}

/// Raw RGB24 frames in through stdin, H.264 MP4 out. Kills ffmpeg on drop.
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        ensure!(
            config.width > 0 && config.height > 0,
            "cannot encode {}x{} frames",
            config.width,
            config.height
        );
        let args = config.build_ffmpeg_args();
        debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "Launching ffmpeg encoder");

        let mut child = command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg; is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(spawn_stderr_drain(stderr)),
            frame_size: config.frame_size(),
        })
    }

    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                data.len()
            );
        }
        self.stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")
    }

    pub fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if !status.success() {
            bail!("ffmpeg encoder exited with status {status}");
        }
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

pub fn gif_ffmpeg_args(mp4: &Path, gif: &Path, fps: u32, height: u32) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-i".into(),
        mp4.to_string_lossy().into_owned(),
        "-vf".into(),
        format!("fps={fps},scale=-1:{height}:flags=lanczos"),
        "-f".into(),
        "gif".into(),
        gif.to_string_lossy().into_owned(),
    ]
}

/// Re-encode `mp4` as a GIF preview next to it.
pub fn convert_to_gif(mp4: &Path, fps: u32, height: u32) -> Result<PathBuf> {
    let gif = mp4.with_extension("gif");
    let part = part_path(&gif);

    let mut child = command_for("ffmpeg")
        .args(gif_ffmpeg_args(mp4, &part, fps, height))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to launch ffmpeg for GIF conversion")?;
    let drain = child.stderr.take().map(spawn_stderr_drain);
    let status = child.wait().context("failed to wait for ffmpeg")?;
    if let Some(handle) = drain {
        let _ = handle.join();
    }

    if !status.success() {
        let _ = fs::remove_file(&part);
        bail!("ffmpeg GIF conversion exited with status {status}");
    }
    finalize(&part, &gif)?;
    Ok(gif)
}

fn encode_mp4(frames: &[Vec<u8>], config: &EncoderConfig) -> Result<()> {
    let mut encoder = VideoEncoder::new(config)?;
    for frame in frames {
        encoder.write_frame(frame)?;
    }
    encoder.finish()
}

/// Encode the first batch item of `[B, F, 3, H, W]` into `output_dir`.
pub fn export_video(
    batch: ArrayView5<'_, f32>,
    output_dir: &Path,
    settings: &ExportSettings,
) -> Result<ExportedVideo> {
    ensure!(batch.dim().0 > 0, "nothing to export: empty batch");
    if batch.dim().0 > 1 {
        warn!(batch = batch.dim().0, "Exporting only the first video of the batch");
    }

    let video = batch.index_axis(Axis(0), 0);
    let (frame_count, _, height, width) = video.dim();
    ensure!(frame_count > 0, "nothing to export: video has no frames");
    let rgb = frames_to_rgb24(video)?;

    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;
    let mp4 = timestamped_output_path(output_dir, Local::now())?;
    let part = part_path(&mp4);

    let config = EncoderConfig {
        output_path: part.clone(),
        width,
        height,
        fps: settings.fps,
        crf: settings.crf,
    };
    if let Err(e) = encode_mp4(&rgb, &config) {
        let _ = fs::remove_file(&part);
        return Err(e);
    }
    finalize(&part, &mp4)?;

    let gif = convert_to_gif(&mp4, settings.gif_fps, settings.gif_height)?;

    info!(
        mp4 = %mp4.display(),
        gif = %gif.display(),
        frames = frame_count,
        width,
        height,
        "Exported video"
    );
    Ok(ExportedVideo {
        mp4,
        gif,
        frames: frame_count,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ndarray::{Array4, Array5};

    use super::*;

    fn fixed_time() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn rgb_conversion_clamps_rounds_and_interleaves() {
        let mut frames = Array4::<f32>::zeros((1, 3, 1, 2));
        frames[[0, 0, 0, 0]] = 1.0;
        frames[[0, 1, 0, 0]] = 0.5;
        frames[[0, 2, 0, 0]] = -0.2;
        frames[[0, 0, 0, 1]] = 1.7;
        frames[[0, 1, 0, 1]] = 0.002;
        frames[[0, 2, 0, 1]] = 0.999;

        let rgb = frames_to_rgb24(frames.view()).expect("convert");
        assert_eq!(rgb, vec![vec![255, 128, 0, 255, 1, 255]]);
    }

    #[test]
    fn rgb_conversion_rejects_non_rgb() {
        let frames = Array4::<f32>::zeros((2, 4, 2, 2));
        assert!(frames_to_rgb24(frames.view()).is_err());
    }

    #[test]
    fn output_name_uses_local_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = timestamped_output_path(dir.path(), fixed_time()).expect("path");
        assert_eq!(path, dir.path().join("20240309_140507.mp4"));
    }

    #[test]
    fn output_name_gets_suffix_on_collision() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("20240309_140507.mp4"), b"x").expect("write");
        fs::write(dir.path().join(".20240309_140507_1.mp4.part"), b"x").expect("write");

        let path = timestamped_output_path(dir.path(), fixed_time()).expect("path");
        assert_eq!(path, dir.path().join("20240309_140507_2.mp4"));
    }

    #[test]
    fn part_path_is_hidden_sibling() {
        assert_eq!(
            part_path(Path::new("/out/20240309_140507.mp4")),
            PathBuf::from("/out/.20240309_140507.mp4.part")
        );
    }

    #[test]
    fn encoder_args_pipe_rgb24_into_h264_mp4() {
        let config = EncoderConfig {
            output_path: PathBuf::from("/out/.clip.mp4.part"),
            width: 720,
            height: 480,
            fps: 8,
            crf: 18,
        };
        let args = config.build_ffmpeg_args();

        let pair = |flag: &str| {
            let pos = args.iter().position(|a| a == flag).expect("flag present");
            args[pos + 1].clone()
        };
        assert_eq!(pair("-s"), "720x480");
        assert_eq!(pair("-r"), "8");
        assert_eq!(pair("-i"), "pipe:0");
        assert_eq!(pair("-c:v"), "libx264");
        assert_eq!(pair("-crf"), "18");
        assert_eq!(args.last().map(String::as_str), Some("/out/.clip.mp4.part"));
        assert!(args.windows(2).any(|w| w == ["-f", "mp4"]));
        assert_eq!(config.frame_size(), 720 * 480 * 3);
    }

    #[test]
    fn gif_args_keep_aspect_ratio_at_fixed_height() {
        let args = gif_ffmpeg_args(Path::new("a.mp4"), Path::new(".a.gif.part"), 8, 240);
        assert!(args.contains(&"fps=8,scale=-1:240:flags=lanczos".to_string()));
        assert!(args.windows(2).any(|w| w == ["-f", "gif"]));
    }

    #[test]
    #[ignore = "requires ffmpeg on PATH"]
    fn exports_mp4_and_gif() {
        let dir = tempfile::tempdir().expect("tempdir");
        let batch = Array5::<f32>::from_elem((1, 4, 3, 32, 48), 0.5);
        let settings = ExportSettings::new(8, &ExportConfig::default());

        let exported = export_video(batch.view(), dir.path(), &settings).expect("export");
        assert!(exported.mp4.is_file());
        assert!(exported.gif.is_file());
        assert_eq!(exported.gif, exported.mp4.with_extension("gif"));
        assert!(!part_path(&exported.mp4).exists());
    }
}
