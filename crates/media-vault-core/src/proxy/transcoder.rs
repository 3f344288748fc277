use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub audio_bitrate_kbps: u32,
    /// Source duration, used to turn elapsed output time into a fraction.
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeOutput {
    pub width: u32,
    pub height: u32,
}

/// Produces a playback proxy. Called on a blocking thread; must return
/// [`Error::Cancelled`] promptly once `cancel` is set.
pub trait Transcoder: Send + Sync {
    fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &AtomicBool,
        progress: &dyn Fn(f64),
    ) -> Result<TranscodeOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    Fraction(f64),
    End,
}

/// Interpret one `key=value` line of ffmpeg's `-progress` output.
pub fn parse_progress_line(line: &str, duration: Option<f64>) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "progress" if value == "end" => Some(ProgressLine::End),
        // Despite the name, out_time_ms is in microseconds, like out_time_us.
        "out_time_us" | "out_time_ms" => {
            let micros: f64 = value.parse().ok()?;
            let total = duration.filter(|d| *d > 0.0)?;
            Some(ProgressLine::Fraction((micros / 1_000_000.0 / total).clamp(0.0, 1.0)))
        }
        _ => None,
    }
}

pub struct FfmpegTranscoder {
    ffmpeg: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    fn command(&self, job: &TranscodeJob) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
            .arg("-i")
            .arg(&job.input)
            .args(["-vf", &format!("scale={}:{}", job.width, job.height)])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "23"])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-c:a", "aac", "-b:a", &format!("{}k", job.audio_bitrate_kbps)])
            .args(["-movflags", "+faststart"])
            .args(["-progress", "pipe:1", "-nostats"])
            .arg(&job.output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &AtomicBool,
        progress: &dyn Fn(f64),
    ) -> Result<TranscodeOutput> {
        let mut child = self
            .command(job)
            .spawn()
            .map_err(|err| Error::Other(format!("failed to spawn {}: {}", self.ffmpeg, err)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("ffmpeg stdout not captured".to_string()))?;
        let child = Mutex::new(child);
        let finished = AtomicBool::new(false);
        let killed = AtomicBool::new(false);

        // Watches for cancellation while the reader below blocks on output.
        thread::scope(|scope| {
            scope.spawn(|| {
                while !finished.load(Ordering::SeqCst) {
                    if cancel.load(Ordering::SeqCst) {
                        if let Ok(mut child) = child.lock() {
                            let _ = child.kill();
                        }
                        killed.store(true, Ordering::SeqCst);
                        break;
                    }
                    thread::sleep(CANCEL_POLL_INTERVAL);
                }
            });

            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                match parse_progress_line(&line, job.duration) {
                    Some(ProgressLine::Fraction(fraction)) => progress(fraction),
                    Some(ProgressLine::End) => progress(1.0),
                    None => {}
                }
            }
            finished.store(true, Ordering::SeqCst);
        });

        let output = match child.lock() {
            Ok(mut guard) => wait_with_stderr(&mut guard)?,
            Err(_) => return Err(Error::Other("ffmpeg child lock poisoned".to_string())),
        };

        if killed.load(Ordering::SeqCst) || cancel.load(Ordering::SeqCst) {
            debug!("Transcode of {} cancelled", job.input.display());
            let _ = std::fs::remove_file(&job.output);
            return Err(Error::Cancelled);
        }
        if !output.0 {
            warn!("ffmpeg failed on {}: {}", job.input.display(), output.1);
            return Err(Error::Other(format!("ffmpeg failed: {}", output.1)));
        }

        Ok(TranscodeOutput {
            width: job.width,
            height: job.height,
        })
    }
}

/// Wait for the child and collect (success, trimmed stderr).
fn wait_with_stderr(child: &mut Child) -> Result<(bool, String)> {
    let mut stderr = String::new();
    if let Some(pipe) = child.stderr.take() {
        for line in BufReader::new(pipe).lines().map_while(|line| line.ok()) {
            stderr.push_str(&line);
            stderr.push('\n');
        }
    }
    let status = child.wait()?;
    Ok((status.success(), stderr.trim().to_string()))
}
