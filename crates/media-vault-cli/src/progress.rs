use indicatif::{ProgressBar, ProgressStyle};
use media_vault_core::proxy::ProxyState;
use media_vault_core::{MediaId, ProgressReporter};
use std::sync::Mutex;
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Batches: bar over items, with extraction progress folded in
/// - Uploads: byte percentage of the current file
/// - Proxies: percentage of the running transcode
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICK_CHARS)
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            pb.enable_steady_tick(Duration::from_millis(80));
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                f(pb);
            }
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_batch_start(&self, total: usize) {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(bar_style(
            "  {spinner:.cyan} [{bar:30.cyan/dim}] {pos}/{len} items {msg}",
        ));
        self.set_bar(pb);
    }

    fn on_batch_progress(&self, completed: usize, total: usize) {
        self.with_bar(|pb| {
            if pb.length() != Some(total as u64) {
                pb.set_length(total as u64);
            }
            pb.set_position(completed as u64);
        });
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        self.finish_bar();
        if failed == 0 {
            eprintln!("  \x1b[32m✓\x1b[0m {} items done", succeeded);
        } else {
            eprintln!(
                "  \x1b[33m!\x1b[0m {} items done, {} failed",
                succeeded, failed
            );
        }
    }

    fn on_upload_progress(&self, file_name: &str, _bytes_written: u64, percent: f64) {
        self.with_bar(|pb| pb.set_message(format!("{} {:.0}%", file_name, percent)));
    }

    fn on_extract_progress(&self, completed: usize, total: usize) {
        self.with_bar(|pb| pb.set_message(format!("extracted {}/{}", completed, total)));
    }

    fn on_proxy_state(&self, media_id: &MediaId, state: &ProxyState) {
        match state {
            ProxyState::Generating { progress } if *progress == 0.0 => {
                let pb = ProgressBar::new(100);
                pb.set_style(bar_style(
                    "  {spinner:.cyan} Proxy [{bar:30.cyan/dim}] {pos}% {msg}",
                ));
                pb.set_message(media_id.to_string());
                self.set_bar(pb);
            }
            ProxyState::Generating { .. } => {}
            ProxyState::Ready(info) => {
                self.finish_bar();
                eprintln!(
                    "  \x1b[32m✓\x1b[0m Proxy for {} ready at {}x{}",
                    media_id, info.width, info.height
                );
            }
            ProxyState::Error(message) => {
                self.finish_bar();
                eprintln!("  \x1b[31m✗\x1b[0m Proxy for {} failed: {}", media_id, message);
            }
            ProxyState::Idle => self.finish_bar(),
        }
    }

    fn on_proxy_progress(&self, _media_id: &MediaId, fraction: f64) {
        self.with_bar(|pb| pb.set_position((fraction * 100.0).round() as u64));
    }
}
