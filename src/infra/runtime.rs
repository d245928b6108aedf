// ============================================================
// Layer 6 — Run Context
// ============================================================
// Everything that would otherwise be process-global state,
// bundled and passed explicitly to every component that needs it:
//
//   device     chosen once at startup, never reassigned
//   seed       fed to the backend RNG, fold splits, loader shuffle
//              and augmentation RNGs
//   amp        whether this run uses a reduced-precision backend
//   interrupt  raised by the Ctrl-C handler, polled by the trainer
//              between iterations

use anyhow::{Context, Result};
use burn::prelude::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Clone, Debug)]
pub struct RunContext<B: Backend> {
    pub device: B::Device,
    pub seed:   u64,
    pub amp:    bool,
    interrupt:  Arc<AtomicBool>,
}

impl<B: Backend> RunContext<B> {
    /// Seeds the backend RNG as a side effect.
    pub fn new(device: B::Device, seed: u64, amp: bool) -> Self {
        B::seed(seed);
        Self { device, seed, amp, interrupt: Arc::new(AtomicBool::new(false)) }
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }
}

/// Install the process-wide Ctrl-C handler. Call at most once.
pub fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(flag)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_interrupt_flag_is_shared() {
        let ctx   = RunContext::<NdArray<f32>>::new(Default::default(), 1, false);
        let clone = ctx.clone();
        assert!(!clone.interrupted());
        ctx.interrupt();
        assert!(clone.interrupted());
    }
}
