// ============================================================
// Layer 5 - ML / Model Layer (Burn)
// ============================================================
// All network, loss and optimisation code lives here.
// Everything is generic over the Burn backend; the CLI picks
// the concrete backend once at startup.
//
// What's in this layer:
//
//   model.rs     - SegResNet: residual 3D encoder-decoder
//                  built from Conv3d, GroupNorm and Dropout
//
//   loss.rs      - Dice, Dice + cross-entropy, cross-entropy
//
//   optim.rs     - Adam / AdamW / SGD behind DynOptimizer
//
//   scheduler.rs - per-iteration learning-rate schedules
//
//   inferer.rs   - sliding-window inference with Gaussian
//                  blending
//
//   tta.rs       - test-time augmentation (noise + flips)
//
//   evaluator.rs - inference + Dice over a loader
//
//   trainer.rs   - the per-fold training state machine
//
//   factory.rs   - the component registry: config → objects
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            MONAI sliding_window_inference

/// SegResNet architecture
pub mod model;

/// Segmentation losses
pub mod loss;

/// Object-safe optimiser wrapper
pub mod optim;

/// Learning-rate schedules
pub mod scheduler;

/// Sliding-window inference
pub mod inferer;

/// Test-time augmentation
pub mod tta;

/// Validation and test evaluation
pub mod evaluator;

/// Per-fold training loop
pub mod trainer;

/// Config → runtime objects
pub mod factory;
