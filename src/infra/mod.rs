// ============================================================
// Layer 6 - Infrastructure Layer
// ============================================================
// Handles all cross-cutting concerns that don't belong in
// any specific business layer:
//
//   checkpoint.rs - Saving and loading model weights
//                   Uses Burn's NamedMpkFileRecorder; the
//                   per-fold CheckpointSaver keeps the top-K
//                   checkpoints by validation Dice.
//
//   metrics.rs    - Dice and Hausdorff on label maps, the
//                   running MetricAccumulator, the per-epoch
//                   CSV log and the test results table.
//
//   progress.rs   - indicatif progress bars behind the
//                   EngineObserver trait.
//
//   runtime.rs    - RunContext (device, seed, amp, interrupt
//                   flag) and the Ctrl-C handler.
//
//   logging.rs    - tracing subscriber: stderr + log file.
//
// Reference: Rust Book §7 (Modules)
//            Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Model checkpoint saving, loading and top-K retention
pub mod checkpoint;

/// Segmentation metrics and CSV outputs
pub mod metrics;

/// Progress bars for training and inference
pub mod progress;

/// Explicit run context and interrupt handling
pub mod runtime;

/// Tracing subscriber setup
pub mod logging;
