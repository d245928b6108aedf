// ============================================================
// Layer 6 - Progress Reporting
// ============================================================
// EngineObserver implementations. Pure side effects: nothing a
// trainer or test run computes depends on them.
//
//   ProgressObserver - indicatif bars on stderr, one per epoch and
//                      one for the test set, plus a stats line per
//                      epoch through tracing
//   SilentObserver   - does nothing (tests, non-interactive runs)

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

use crate::domain::traits::EngineObserver;

pub struct SilentObserver;

impl EngineObserver for SilentObserver {}

/// Progress bars on stderr plus a log line per epoch and per checkpoint.
pub struct ProgressObserver {
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self { bar: Mutex::new(None) }
    }

    fn start(&self, len: usize, template: &str, message: String) {
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_message(message);
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(old) = slot.replace(bar) {
                old.finish_and_clear();
            }
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                f(bar);
            }
        }
    }

    fn finish(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineObserver for ProgressObserver {
    fn epoch_started(&self, fold: usize, epoch: usize, iterations: usize) {
        self.start(
            iterations,
            "{msg} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {prefix}",
            format!("fold {fold} epoch {epoch}"),
        );
    }

    fn iteration_completed(&self, loss: f64, lr: f64) {
        self.with_bar(|bar| {
            bar.set_prefix(format!("loss={loss:.4} lr={lr:.2e}"));
            bar.inc(1);
        });
    }

    fn epoch_completed(&self, fold: usize, epoch: usize, mean_loss: f64) {
        self.finish();
        tracing::info!("fold {} epoch {}: train_loss={:.4}", fold, epoch, mean_loss);
    }

    fn validation_completed(&self, fold: usize, epoch: usize, metric: f64, saved: bool) {
        tracing::info!(
            "fold {} epoch {}: val_mean_dice={:.4}{}",
            fold, epoch, metric,
            if saved { " (new best, checkpoint saved)" } else { "" },
        );
    }

    fn inference_started(&self, total: usize) {
        self.start(
            total,
            "{msg} [{elapsed_precise}] {bar:40.green/white} {pos}/{len} {prefix}",
            "inference".to_string(),
        );
    }

    fn sample_completed(&self, id: &str) {
        self.with_bar(|bar| {
            bar.set_prefix(id.to_string());
            bar.inc(1);
        });
    }

    fn inference_completed(&self) {
        self.finish();
    }
}
