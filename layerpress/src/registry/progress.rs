#[cfg(feature = "progress")]
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Observer for blob uploads, keyed by blob digest.
pub trait ProgressTracker: Send + Sync {
    fn start_upload(&self, digest: &str, total_bytes: u64);
    fn update(&self, digest: &str, bytes: u64);
    fn finish(&self, digest: &str, skipped: bool);
    /// The upload started with `start_upload` did not complete.
    fn fail(&self, digest: &str);
}

pub struct NoopProgress;

impl ProgressTracker for NoopProgress {
    fn start_upload(&self, _digest: &str, _total_bytes: u64) {}
    fn update(&self, _digest: &str, _bytes: u64) {}
    fn finish(&self, _digest: &str, _skipped: bool) {}
    fn fail(&self, _digest: &str) {}
}

#[cfg(feature = "progress")]
pub struct IndicatifProgress {
    multi: MultiProgress,
    bars: std::sync::Mutex<std::collections::HashMap<String, ProgressBar>>,
}

#[cfg(feature = "progress")]
impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[cfg(feature = "progress")]
impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "progress")]
fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..12.min(hex.len())]
}

#[cfg(feature = "progress")]
impl ProgressTracker for IndicatifProgress {
    fn start_upload(&self, digest: &str, total_bytes: u64) {
        let pb = self.multi.add(ProgressBar::new(total_bytes));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.green/blue}] {bytes}/{total_bytes} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(short_digest(digest).to_string());
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(digest.to_string(), pb);
        }
    }

    fn update(&self, digest: &str, bytes: u64) {
        if let Some(pb) = self.bars.lock().ok().and_then(|bars| bars.get(digest).cloned()) {
            pb.inc(bytes);
        }
    }

    fn finish(&self, digest: &str, skipped: bool) {
        let message = if skipped { "Already exists" } else { "Pushed" };
        match self.bars.lock().ok().and_then(|mut bars| bars.remove(digest)) {
            Some(pb) => pb.finish_with_message(format!("{} {message}", short_digest(digest))),
            None if skipped => {
                let _ = self
                    .multi
                    .println(format!("{} {message}", short_digest(digest)));
            }
            None => {}
        }
    }

    fn fail(&self, digest: &str) {
        if let Some(pb) = self.bars.lock().ok().and_then(|mut bars| bars.remove(digest)) {
            pb.abandon_with_message(format!("{} Failed", short_digest(digest)));
        }
    }
}
