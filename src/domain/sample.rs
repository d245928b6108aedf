// ============================================================
// Layer 3 — Sample Pairs and Fold Splits
// ============================================================
// A sample is identified by its file stem: `case_001.nii.gz` in
// `mri/` and `case_001.nii` in `masks/` both have id `case_001`.
// Pairing happens on that id, never on directory listing order.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One image file and, when ground truth exists, its mask file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplePair {
    /// Shared file stem of image and mask
    pub id: String,

    /// Path to the MRI volume
    pub image: PathBuf,

    /// Path to the label volume; `None` for segment-only inputs
    pub label: Option<PathBuf>,
}

impl SamplePair {
    pub fn new(id: impl Into<String>, image: impl Into<PathBuf>, label: Option<PathBuf>) -> Self {
        Self {
            id:    id.into(),
            image: image.into(),
            label,
        }
    }

    /// Returns true if a ground-truth mask is attached
    pub fn is_labelled(&self) -> bool {
        self.label.is_some()
    }
}

/// The train/validation partition owned by one fold.
/// `train` and `valid` never share a sample.
#[derive(Debug, Clone)]
pub struct FoldSplit {
    pub index: usize,
    pub train: Vec<SamplePair>,
    pub valid: Vec<SamplePair>,
}

impl FoldSplit {
    /// Checkpoint namespace of this fold: `{model_id}_fold{index}`
    pub fn prefix(&self, model_id: &str) -> String {
        fold_prefix(model_id, self.index)
    }

    pub fn total(&self) -> usize {
        self.train.len() + self.valid.len()
    }
}

/// `<model_id>_fold<index>`: the start of every checkpoint name of a fold.
pub fn fold_prefix(model_id: &str, index: usize) -> String {
    format!("{model_id}_fold{index}")
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_prefix() {
        let fold = FoldSplit { index: 3, train: Vec::new(), valid: Vec::new() };
        assert_eq!(fold.prefix("SegResNet_192"), "SegResNet_192_fold3");
    }

    #[test]
    fn test_labelled_flag() {
        let a = SamplePair::new("a", "mri/a.nii.gz", Some("masks/a.nii".into()));
        let b = SamplePair::new("b", "mri/b.nii.gz", None);
        assert!(a.is_labelled());
        assert!(!b.is_labelled());
    }
}
