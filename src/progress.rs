use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Fire-and-forget progress reporting; implementations must not block the run.
pub trait ProgressSink: Sync {
    fn report(&self, message: &str, resolved: usize, total: usize);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _message: &str, _resolved: usize, _total: usize) {}
}

/// Emits progress as `tracing` events, for non-interactive runs.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, message: &str, resolved: usize, total: usize) {
        tracing::info!(resolved, total, "{message}");
    }
}

pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(prefix: &str, total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_prefix(prefix.to_string());
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:32.cyan/blue}] \
{pos}/{len} ({percent}%) {per_sec} {msg}",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.enable_steady_tick(Duration::from_millis(250));
        bar.set_message("starting lookups");
        Self { bar }
    }

    pub fn finish(&self, message: String) {
        self.bar.finish_with_message(message);
    }

    pub fn abandon(&self, message: String) {
        self.bar.abandon_with_message(message);
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, message: &str, resolved: usize, total: usize) {
        if self.bar.length() != Some(total as u64) {
            self.bar.set_length(total as u64);
        }
        self.bar.set_position(resolved as u64);
        self.bar.set_message(message.to_string());
    }
}
