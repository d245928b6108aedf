// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// a specific goal (training the folds, or segmenting a test set).
//
// Rules for this layer:
//   - No ML math or model code here
//   - No UI or printing here (that's Layer 1)
//   - Only workflow coordination
//
// Think of this layer as the "director": it tells other
// layers what to do but doesn't do the work itself.
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// The run configuration file
pub mod config;

// The k-fold training workflow
pub mod train_use_case;

// The test / test-segment workflow
pub mod test_use_case;
