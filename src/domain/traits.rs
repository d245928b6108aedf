// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The application layer talks to sample discovery and progress
// reporting through these traits only:
//   - NiftiDirectory implements SampleSource
//   - ProgressObserver / SilentObserver implement EngineObserver
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;
use crate::domain::sample::SamplePair;

// ─── SampleSource ─────────────────────────────────────────────────────────────
/// Any component that can enumerate image/label samples.
pub trait SampleSource {
    /// Every sample the source knows about, sorted by id.
    fn load_pairs(&self) -> Result<Vec<SamplePair>>;
}

// ─── EngineObserver ───────────────────────────────────────────────────────────
/// Receives progress events from the training, validation and test
/// loops. Purely a side channel: nothing it does feeds back into
/// the engines.
pub trait EngineObserver {
    /// A training epoch with `iterations` batches is starting.
    fn epoch_started(&self, _fold: usize, _epoch: usize, _iterations: usize) {}

    /// One optimiser step finished.
    fn iteration_completed(&self, _loss: f64, _lr: f64) {}

    /// The epoch's batches are exhausted; validation follows.
    fn epoch_completed(&self, _fold: usize, _epoch: usize, _mean_loss: f64) {}

    /// A validation pass produced its key metric.
    fn validation_completed(&self, _fold: usize, _epoch: usize, _metric: f64, _saved: bool) {}

    /// A test/inference pass over `total` samples is starting.
    fn inference_started(&self, _total: usize) {}

    /// One sample was segmented.
    fn sample_completed(&self, _id: &str) {}

    /// The inference pass is over.
    fn inference_completed(&self) {}
}
