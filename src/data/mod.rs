// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// This layer handles everything from NIfTI files on disk all
// the way to device-ready tensor batches.
//
// The pipeline flows in this order:
//
//   <imgdir>/mri/*.nii.gz + <imgdir>/masks/*.nii
//       │
//       ▼
//   NiftiDirectory    → pairs images and masks by file stem
//       │
//       ▼
//   kfold_split       → seeded train / validation folds
//       │
//       ▼
//   SegDataset        → decodes NIfTI, resamples, scales, caches;
//       │               draws random crops + augmentation in train mode
//       ▼
//   SegBatcher        → stacks volumes into [N, 1, X, Y, Z] tensors
//       │
//       ▼
//   DataLoader        → feeds batches to the trainer / evaluator
//
// Each module is responsible for exactly one step.
//
// Reference: Burn Book §4 (Datasets and Dataloaders)
//            NIfTI-1 Data Format (nifti.nimh.nih.gov)

/// NIfTI-1 reader and writer
pub mod nifti;

/// Discovers image/label pairs under a data directory
pub mod loader;

/// Seeded k-fold and hold-out splitting
pub mod splitter;

/// Deterministic preprocessing and random augmentation
pub mod transforms;

/// Implements Burn's Dataset trait over cached volumes
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;
