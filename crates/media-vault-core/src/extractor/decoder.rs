//! Probing and frame grabs through external ffprobe/ffmpeg binaries.

use image::DynamicImage;
use serde::Deserialize;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{Error, Result};

/// Packets sampled from the primary video stream for frame-rate estimation.
pub const PACKET_WINDOW: usize = 60;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub duration: Option<f64>,
    pub bitrate: Option<u64>,
    pub video: Option<VideoStream>,
    pub audio: Option<AudioStream>,
    /// Presentation timestamps (seconds) of the first packets of the video stream.
    pub video_packet_pts: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStream {
    pub codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub avg_frame_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStream {
    pub codec: Option<String>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
}

/// Decodes audio/video containers. Runs on extractor threads, so calls may block.
pub trait MediaDecoder: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ProbeReport>;

    /// Decode the frame nearest `seconds` from the primary video stream.
    fn frame_at(&self, path: &Path, seconds: f64) -> Result<DynamicImage>;
}

pub struct FfmpegDecoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn run(&self, program: &str, command: &mut Command) -> Result<Vec<u8>> {
        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| Error::Other(format!("failed to spawn {}: {}", program, err)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Other(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    fn packet_window(&self, path: &Path) -> Result<Vec<f64>> {
        let stdout = self.run(
            &self.ffprobe,
            Command::new(&self.ffprobe)
                .args(["-v", "error", "-select_streams", "v:0"])
                .args(["-show_entries", "packet=pts_time"])
                .args(["-read_intervals", &format!("%+#{}", PACKET_WINDOW)])
                .args(["-print_format", "json"])
                .arg(path),
        )?;
        parse_packet_output(&stdout)
    }
}

impl MediaDecoder for FfmpegDecoder {
    fn probe(&self, path: &Path) -> Result<ProbeReport> {
        let stdout = self.run(
            &self.ffprobe,
            Command::new(&self.ffprobe)
                .args(["-v", "error", "-print_format", "json"])
                .args(["-show_format", "-show_streams"])
                .arg(path),
        )?;
        let mut report = parse_probe_output(&stdout)?;
        if report.video.is_some() {
            report.video_packet_pts = self.packet_window(path)?;
        }
        debug!("Probed {}: {:?}", path.display(), report);
        Ok(report)
    }

    fn frame_at(&self, path: &Path, seconds: f64) -> Result<DynamicImage> {
        let stdout = self.run(
            &self.ffmpeg,
            Command::new(&self.ffmpeg)
                .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
                .args(["-ss", &format!("{:.3}", seconds)])
                .arg("-i")
                .arg(path)
                .args(["-an", "-sn", "-frames:v", "1"])
                .args(["-f", "image2pipe", "-vcodec", "png", "-"]),
        )?;
        if stdout.is_empty() {
            return Err(Error::Other(format!(
                "no frame decoded at {:.3}s from {}",
                seconds,
                path.display()
            )));
        }
        Ok(image::load_from_memory(&stdout)?)
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct PacketOutput {
    #[serde(default)]
    packets: Vec<PacketEntry>,
}

#[derive(Deserialize)]
struct PacketEntry {
    pts_time: Option<String>,
}

/// "30000/1001" → 29.97; "0/0" and malformed rates are `None`.
pub fn parse_rational(value: &str) -> Option<f64> {
    let (num, den) = value.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    (den > 0.0 && num > 0.0).then(|| num / den)
}

/// Interpret ffprobe `-show_format -show_streams` JSON. The first stream of
/// each type is the primary one.
pub fn parse_probe_output(json: &[u8]) -> Result<ProbeReport> {
    let output: ProbeOutput = serde_json::from_slice(json)?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .and_then(|s| {
            Some(VideoStream {
                codec: s.codec_name.clone(),
                width: s.width?,
                height: s.height?,
                avg_frame_rate: s.avg_frame_rate.as_deref().and_then(parse_rational),
            })
        });

    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|s| AudioStream {
            codec: s.codec_name.clone(),
            channels: s.channels,
            sample_rate: s.sample_rate.as_deref().and_then(|r| r.parse().ok()),
        });

    let (duration, bitrate) = match &output.format {
        Some(format) => (
            format.duration.as_deref().and_then(|d| d.parse().ok()),
            format.bit_rate.as_deref().and_then(|b| b.parse().ok()),
        ),
        None => (None, None),
    };

    if video.is_none() && audio.is_none() {
        return Err(Error::Validation(
            "no audio or video stream found".to_string(),
        ));
    }

    Ok(ProbeReport {
        duration,
        bitrate,
        video,
        audio,
        video_packet_pts: Vec::new(),
    })
}

pub fn parse_packet_output(json: &[u8]) -> Result<Vec<f64>> {
    let output: PacketOutput = serde_json::from_slice(json)?;
    Ok(output
        .packets
        .iter()
        .filter_map(|p| p.pts_time.as_deref())
        .filter_map(|t| t.parse().ok())
        .take(PACKET_WINDOW)
        .collect())
}
