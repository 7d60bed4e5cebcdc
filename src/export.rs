//! Turning a folder of snapshots into a video.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

use crate::frame::{DecodedFrame, FrameError};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No snapshots found in {0}")]
    NoImages(PathBuf),
    #[error("Invalid resolution `{0}` (use `original` or WIDTHxHEIGHT)")]
    InvalidResolution(String),
    #[error("Failed to start ffmpeg")]
    Spawn(#[source] std::io::Error),
    #[error("ffmpeg exited with {status}: {stderr_tail}")]
    Ffmpeg { status: String, stderr_tail: String },
    #[error("Export I/O error")]
    Io(#[from] std::io::Error),
    #[error("Snapshot could not be decoded")]
    Frame(#[from] FrameError),
    #[error("H264 encoder error")]
    H264(#[from] openh264::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// External ffmpeg binary; produces a container file.
    #[default]
    Ffmpeg,
    /// Built-in OpenH264 encoder; produces a raw Annex-B stream.
    H264,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub framerate: u32,
    /// Constant rate factor, 0 (lossless) to 51.
    pub quality: u32,
    /// Keep only every Nth snapshot.
    pub speed_multiplier: u32,
    /// `original` or `WIDTHxHEIGHT`.
    pub resolution: String,
    pub codec: String,
    pub format: String,
    pub encoder: EncoderKind,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            framerate: 24,
            quality: 20,
            speed_multiplier: 1,
            resolution: "original".into(),
            codec: "libx264".into(),
            format: "mp4".into(),
            encoder: EncoderKind::Ffmpeg,
        }
    }
}

impl ExportSettings {
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.framerate == 0 {
            problems.push("Export framerate must be greater than 0".to_string());
        }
        if self.quality > 51 {
            problems.push("Export quality (CRF) must be between 0 and 51".to_string());
        }
        if self.speed_multiplier == 0 {
            problems.push("Export speed multiplier must be at least 1".to_string());
        }
        if let Err(err) = self.target_resolution() {
            problems.push(err.to_string());
        }
        problems
    }

    /// `None` keeps the snapshots' own size.
    pub fn target_resolution(&self) -> Result<Option<(u32, u32)>, ExportError> {
        let value = self.resolution.trim();
        if value.eq_ignore_ascii_case("original") {
            return Ok(None);
        }

        let invalid = || ExportError::InvalidResolution(self.resolution.clone());
        let (width, height) = value
            .split_once(['x', 'X'])
            .ok_or_else(invalid)?;
        let width: u32 = width.trim().parse().map_err(|_| invalid())?;
        let height: u32 = height.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Some((width, height)))
    }

    /// File name for a video of `date_key`'s snapshots.
    pub fn output_file_name(&self, date_key: &str) -> String {
        match self.encoder {
            EncoderKind::Ffmpeg => format!("timelapse_{date_key}.{}", self.format),
            EncoderKind::H264 => format!("timelapse_{date_key}.h264"),
        }
    }
}

/// The snapshots of one folder, in capture order.
#[derive(Debug, Clone)]
pub struct ImageCollection {
    pub folder: PathBuf,
    pub images: Vec<PathBuf>,
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
    pub total_bytes: u64,
}

impl ImageCollection {
    pub fn scan(folder: &Path) -> Result<Self, ExportError> {
        let mut images = Vec::new();
        let mut total_bytes = 0;

        for entry in std::fs::read_dir(folder)? {
            let entry = entry?;
            let path = entry.path();
            let is_jpeg = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"));
            if is_jpeg && entry.file_type()?.is_file() {
                total_bytes += entry.metadata()?.len();
                images.push(path);
            }
        }

        if images.is_empty() {
            return Err(ExportError::NoImages(folder.to_path_buf()));
        }
        // Names are timestamps, so lexical order is capture order
        images.sort();

        Ok(Self {
            folder: folder.to_path_buf(),
            first_timestamp: images.first().and_then(|p| snapshot_timestamp(p)),
            last_timestamp: images.last().and_then(|p| snapshot_timestamp(p)),
            images,
            total_bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Every `speed_multiplier`th image, starting with the first.
    pub fn selected(&self, speed_multiplier: u32) -> Vec<&Path> {
        self.images
            .iter()
            .step_by(speed_multiplier.max(1) as usize)
            .map(PathBuf::as_path)
            .collect()
    }

    /// Time between the first and last snapshot, `Xh Ym`.
    pub fn duration_label(&self) -> Option<String> {
        let span = self.last_timestamp? - self.first_timestamp?;
        let minutes = span.num_minutes();
        Some(format!("{}h {}m", minutes / 60, minutes % 60))
    }
}

/// Capture time from a `YYYYMMDD-HHMMSS.jpg` name.
pub fn snapshot_timestamp(path: &Path) -> Option<NaiveDateTime> {
    let stem = path.file_stem()?.to_str()?;
    NaiveDateTime::parse_from_str(stem, "%Y%m%d-%H%M%S").ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportProgress {
    pub status: String,
    /// 0-100
    pub percent: f32,
    pub stats: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    pub output: PathBuf,
    pub frames: u64,
    pub message: String,
}

/// Something that can encode an [`ImageCollection`] into a video file.
pub trait VideoEncoder: Send + Sync {
    fn export(
        &self,
        images: &ImageCollection,
        output: &Path,
        settings: &ExportSettings,
        progress: &mut dyn FnMut(ExportProgress),
    ) -> Result<ExportOutcome, ExportError>;
}

pub fn encoder_for(settings: &ExportSettings, ffmpeg_path: &Path) -> Box<dyn VideoEncoder> {
    match settings.encoder {
        EncoderKind::Ffmpeg => Box::new(FfmpegExporter::new(ffmpeg_path)),
        EncoderKind::H264 => Box::new(H264Exporter),
    }
}

/// Encodes through an external `ffmpeg` using the concat demuxer.
#[derive(Debug, Clone)]
pub struct FfmpegExporter {
    pub ffmpeg_path: PathBuf,
}

impl FfmpegExporter {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn args(
        &self,
        list: &Path,
        output: &Path,
        settings: &ExportSettings,
    ) -> Result<Vec<String>, ExportError> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list.display().to_string(),
            "-c:v".into(),
            settings.codec.clone(),
            "-crf".into(),
            settings.quality.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-r".into(),
            settings.framerate.to_string(),
        ];

        if let Some((width, height)) = settings.target_resolution()? {
            args.extend(["-vf".into(), format!("scale={width}:{height}")]);
        }

        args.push(output.display().to_string());
        Ok(args)
    }
}

/// Concat demuxer input showing each image for one frame at `framerate`.
fn concat_list(images: &[&Path], framerate: u32) -> String {
    let frame_seconds = 1.0 / f64::from(framerate.max(1));
    let mut list = String::from("ffconcat version 1.0\n");

    for image in images {
        let escaped = image.display().to_string().replace('\'', "'\\''");
        list.push_str(&format!("file '{escaped}'\nduration {frame_seconds:.6}\n"));
    }
    // The last entry's duration is ignored unless it is listed again
    if let Some(last) = images.last() {
        let escaped = last.display().to_string().replace('\'', "'\\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }

    list
}

/// `(frame, fps)` from an ffmpeg stats line.
fn parse_progress_line(line: &str) -> Option<(u64, Option<f32>)> {
    let field = |name: &str| -> Option<&str> {
        let start = line.find(name)? + name.len();
        line[start..].split_whitespace().next()
    };

    let frame = field("frame=")?.parse().ok()?;
    let fps = field("fps=").and_then(|fps| fps.parse().ok());
    Some((frame, fps))
}

impl VideoEncoder for FfmpegExporter {
    fn export(
        &self,
        images: &ImageCollection,
        output: &Path,
        settings: &ExportSettings,
        progress: &mut dyn FnMut(ExportProgress),
    ) -> Result<ExportOutcome, ExportError> {
        let selected = images.selected(settings.speed_multiplier);
        let total = selected.len() as u64;

        let list_path = output.with_extension("ffconcat");
        std::fs::write(&list_path, concat_list(&selected, settings.framerate))?;
        let args = self.args(&list_path, output, settings)?;
        debug!("Running {} {}", self.ffmpeg_path.display(), args.join(" "));

        progress(ExportProgress {
            status: format!("Encoding {total} frames with ffmpeg"),
            percent: 0.0,
            stats: None,
        });

        let result = run_ffmpeg(&self.ffmpeg_path, &args, total, progress);
        let _ = std::fs::remove_file(&list_path);
        result?;

        progress(ExportProgress {
            status: "Done".into(),
            percent: 100.0,
            stats: None,
        });

        Ok(ExportOutcome {
            output: output.to_path_buf(),
            frames: total,
            message: format!("Created {} from {total} frames", output.display()),
        })
    }
}

fn run_ffmpeg(
    ffmpeg_path: &Path,
    args: &[String],
    total: u64,
    progress: &mut dyn FnMut(ExportProgress),
) -> Result<(), ExportError> {
    let mut child = Command::new(ffmpeg_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ExportError::Spawn)?;

    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    if let Some(stderr) = child.stderr.take() {
        // Stats lines end in '\r', everything else in '\n'
        for chunk in BufReader::new(stderr).split(b'\r') {
            let chunk = chunk?;
            for line in String::from_utf8_lossy(&chunk).lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                if let Some((frame, fps)) = parse_progress_line(line) {
                    let percent = if total == 0 {
                        0.0
                    } else {
                        (frame as f32 / total as f32 * 100.0).min(99.0)
                    };
                    progress(ExportProgress {
                        status: format!("Encoding frame {frame}/{total}"),
                        percent,
                        stats: fps.map(|fps| format!("{fps:.1} fps")),
                    });
                } else {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
        }
    }

    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(ExportError::Ffmpeg {
            status: status.to_string(),
            stderr_tail: Vec::from(tail).join("\n"),
        })
    }
}

/// Encodes with the bundled OpenH264 encoder into a raw H.264 stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct H264Exporter;

impl VideoEncoder for H264Exporter {
    fn export(
        &self,
        images: &ImageCollection,
        output: &Path,
        settings: &ExportSettings,
        progress: &mut dyn FnMut(ExportProgress),
    ) -> Result<ExportOutcome, ExportError> {
        let selected = images.selected(settings.speed_multiplier);
        let total = selected.len() as u64;
        let first = selected
            .first()
            .ok_or_else(|| ExportError::NoImages(images.folder.clone()))?;

        let (width, height) = match settings.target_resolution()? {
            Some(size) => size,
            None => {
                let frame = DecodedFrame::decode(&std::fs::read(first)?)?;
                (frame.width, frame.height)
            }
        };
        // YUV 4:2:0 needs even dimensions
        let (width, height) = ((width & !1).max(2), (height & !1).max(2));

        let config = openh264::encoder::EncoderConfig::new(width, height);
        let mut encoder = openh264::encoder::Encoder::with_config(config)?;
        let mut out = BufWriter::new(File::create(output)?);

        let started = std::time::Instant::now();
        for (index, path) in selected.iter().enumerate() {
            let frame = DecodedFrame::decode(&std::fs::read(path)?)?.resized(width, height)?;
            let yuv = openh264::formats::YUVBuffer::with_rgb(
                width as usize,
                height as usize,
                &frame.rgb[..],
            );
            let bitstream = encoder.encode(&yuv)?;
            out.write_all(&bitstream.to_vec())?;

            let done = index as u64 + 1;
            let elapsed = started.elapsed().as_secs_f32();
            progress(ExportProgress {
                status: format!("Encoding frame {done}/{total}"),
                percent: done as f32 / total as f32 * 100.0,
                stats: (elapsed > 0.0).then(|| format!("{:.1} fps", done as f32 / elapsed)),
            });
        }
        out.flush()?;

        info!("Wrote {} H.264 frames to {}", total, output.display());
        Ok(ExportOutcome {
            output: output.to_path_buf(),
            frames: total,
            message: format!(
                "Created {} from {total} frames ({}x{}, raw H.264 at {} fps)",
                output.display(),
                width,
                height,
                settings.framerate
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::jpeg_fixture;
    use tempfile::TempDir;

    fn snapshot_folder(names: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), jpeg_fixture(32, 32, [90, 90, 160])).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
        dir
    }

    #[test]
    fn resolution_is_original_or_width_by_height() {
        let mut settings = ExportSettings::default();
        assert_eq!(settings.target_resolution().unwrap(), None);
        assert!(settings.problems().is_empty());

        settings.resolution = "1920x1080".into();
        assert_eq!(settings.target_resolution().unwrap(), Some((1920, 1080)));

        for bad in ["1920", "0x1080", "widexhigh"] {
            settings.resolution = bad.into();
            assert!(settings.target_resolution().is_err(), "{bad}");
        }

        settings.framerate = 0;
        settings.quality = 60;
        assert_eq!(settings.problems().len(), 3);
    }

    #[test]
    fn scans_snapshots_in_capture_order() {
        let dir = snapshot_folder(&[
            "20240815-230000.jpg",
            "20240815-221500.jpg",
            "20240816-013000.jpg",
        ]);
        let images = ImageCollection::scan(dir.path()).unwrap();

        assert_eq!(images.len(), 3);
        assert!(images.images[0].ends_with("20240815-221500.jpg"));
        assert_eq!(images.duration_label().as_deref(), Some("3h 15m"));
        assert!(images.total_bytes > 0);

        let every_other = images.selected(2);
        assert_eq!(every_other.len(), 2);
        assert!(every_other[1].ends_with("20240816-013000.jpg"));
    }

    #[test]
    fn empty_folder_has_nothing_to_export() {
        let dir = snapshot_folder(&[]);
        assert!(matches!(
            ImageCollection::scan(dir.path()),
            Err(ExportError::NoImages(_))
        ));
    }

    #[test]
    fn concat_list_escapes_quotes_and_repeats_the_last_file() {
        let a = Path::new("/snaps/a.jpg");
        let b = Path::new("/snaps/it's.jpg");
        let list = concat_list(&[a, b], 25);

        assert!(list.contains("file '/snaps/a.jpg'\nduration 0.040000\n"));
        assert!(list.ends_with("file '/snaps/it'\\''s.jpg'\n"));
    }

    #[test]
    fn parses_ffmpeg_stats_lines() {
        assert_eq!(
            parse_progress_line("frame=  120 fps= 48 q=28.0 size=     256kB time=00:00:05.00"),
            Some((120, Some(48.0)))
        );
        assert_eq!(parse_progress_line("frame=7"), Some((7, None)));
        assert_eq!(parse_progress_line("Input #0, concat, from 'list'"), None);
    }

    #[test]
    fn ffmpeg_args_carry_the_settings() {
        let settings = ExportSettings {
            resolution: "1280x720".into(),
            quality: 23,
            ..ExportSettings::default()
        };
        let args = FfmpegExporter::new("ffmpeg")
            .args(Path::new("list.ffconcat"), Path::new("out.mp4"), &settings)
            .unwrap();

        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "23"));
        assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1] == "scale=1280:720"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn missing_ffmpeg_fails_to_spawn() {
        let dir = snapshot_folder(&["20240815-230000.jpg"]);
        let images = ImageCollection::scan(dir.path()).unwrap();

        let result = FfmpegExporter::new("/nonexistent/ffmpeg").export(
            &images,
            &dir.path().join("out.mp4"),
            &ExportSettings::default(),
            &mut |_| {},
        );
        assert!(matches!(result, Err(ExportError::Spawn(_))));
        assert!(!dir.path().join("out.ffconcat").exists());
    }

    #[test]
    fn h264_export_writes_an_annex_b_stream() {
        let dir = snapshot_folder(&[
            "20240815-230000.jpg",
            "20240815-230030.jpg",
            "20240815-230100.jpg",
        ]);
        let images = ImageCollection::scan(dir.path()).unwrap();
        let output = dir.path().join("out.h264");

        let mut updates = Vec::new();
        let outcome = H264Exporter
            .export(
                &images,
                &output,
                &ExportSettings {
                    encoder: EncoderKind::H264,
                    ..ExportSettings::default()
                },
                &mut |update| updates.push(update),
            )
            .unwrap();

        assert_eq!(outcome.frames, 3);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates.last().map(|u| u.percent), Some(100.0));

        let stream = std::fs::read(&output).unwrap();
        assert!(stream.starts_with(&[0, 0, 0, 1]));
    }
}
