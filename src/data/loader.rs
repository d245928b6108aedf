// ============================================================
// Layer 4 — Sample Discovery
// ============================================================
// Finds image/label files under a data directory:
//
//   <imgdir>/
//     mri/    case_001.nii.gz  case_002.nii.gz ...
//     masks/  case_001.nii     case_002.nii    ...
//
// Images and masks are matched by file stem. A stem present on
// one side only is an error, reported with every offending id.
//
// Reference: Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::data::nifti::nifti_stem;
use crate::domain::sample::SamplePair;
use crate::domain::traits::SampleSource;

pub const IMAGE_SUBDIR: &str = "mri";
pub const MASK_SUBDIR:  &str = "masks";

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("images without masks in '{dir}': {ids:?}")]
    MissingMasks { dir: String, ids: Vec<String> },

    #[error("masks without images in '{dir}': {ids:?}")]
    MissingImages { dir: String, ids: Vec<String> },

    #[error("two files share the id '{id}' in '{dir}'")]
    DuplicateId { dir: String, id: String },
}

/// A directory laid out as `mri/` + `masks/`.
pub struct NiftiDirectory {
    dir:         PathBuf,
    with_labels: bool,
}

impl NiftiDirectory {
    /// Labelled data: every image must have a mask.
    pub fn labelled(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), with_labels: true }
    }

    /// Image-only data: `masks/` is ignored even if present.
    pub fn images_only(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), with_labels: false }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SampleSource for NiftiDirectory {
    fn load_pairs(&self) -> Result<Vec<SamplePair>> {
        let images = list_volumes(&self.dir.join(IMAGE_SUBDIR), true)?;

        if !self.with_labels {
            return Ok(images
                .into_iter()
                .map(|(id, image)| SamplePair::new(id, image, None))
                .collect());
        }

        let mut masks = list_volumes(&self.dir.join(MASK_SUBDIR), false)?;
        let dir = self.dir.display().to_string();

        let missing_masks: Vec<String> = images
            .keys()
            .filter(|id| !masks.contains_key(*id))
            .cloned()
            .collect();
        if !missing_masks.is_empty() {
            return Err(PairingError::MissingMasks { dir, ids: missing_masks }.into());
        }
        let missing_images: Vec<String> = masks
            .keys()
            .filter(|id| !images.contains_key(*id))
            .cloned()
            .collect();
        if !missing_images.is_empty() {
            return Err(PairingError::MissingImages { dir, ids: missing_images }.into());
        }

        // BTreeMap iteration keeps ids sorted
        let pairs: Vec<SamplePair> = images
            .into_iter()
            .filter_map(|(id, image)| {
                let label = masks.remove(&id)?;
                Some(SamplePair::new(id, image, Some(label)))
            })
            .collect();

        tracing::info!("Found {} image/label pairs in '{}'", pairs.len(), self.dir.display());
        Ok(pairs)
    }
}

/// Every `.nii` / `.nii.gz` under `dir`, keyed by stem.
/// Images are expected gzipped (`*.nii.gz`); masks may be either.
fn list_volumes(dir: &Path, gz_only: bool) -> Result<BTreeMap<String, PathBuf>> {
    let mut found = BTreeMap::new();

    for entry in fs::read_dir(dir)
        .with_context(|| format!("Cannot read directory '{}'", dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if gz_only && !name.ends_with(".nii.gz") {
            tracing::debug!("Skipping non-image file '{}'", path.display());
            continue;
        }
        let Some(id) = nifti_stem(&path) else {
            continue;
        };
        if found.insert(id.clone(), path).is_some() {
            return Err(PairingError::DuplicateId { dir: dir.display().to_string(), id }.into());
        }
    }

    Ok(found)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: PathBuf) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_pairs_by_stem_not_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path().join("mri/b.nii.gz"));
        touch(dir.path().join("mri/a.nii.gz"));
        touch(dir.path().join("masks/a.nii"));
        touch(dir.path().join("masks/b.nii"));
        touch(dir.path().join("mri/readme.txt"));

        let pairs = NiftiDirectory::labelled(dir.path()).load_pairs().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].id, "a");
        assert!(pairs[0].image.ends_with("mri/a.nii.gz"));
        assert!(pairs[0].label.as_ref().unwrap().ends_with("masks/a.nii"));
        assert_eq!(pairs[1].id, "b");
    }

    #[test]
    fn test_unmatched_image_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path().join("mri/a.nii.gz"));
        touch(dir.path().join("mri/c.nii.gz"));
        touch(dir.path().join("masks/a.nii"));

        let err = NiftiDirectory::labelled(dir.path()).load_pairs().unwrap_err();
        match err.downcast_ref::<PairingError>() {
            Some(PairingError::MissingMasks { ids, .. }) => assert_eq!(ids, &vec!["c".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unmatched_mask_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path().join("mri/a.nii.gz"));
        touch(dir.path().join("masks/a.nii"));
        touch(dir.path().join("masks/z.nii"));

        let err = NiftiDirectory::labelled(dir.path()).load_pairs().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PairingError>(),
            Some(PairingError::MissingImages { .. })
        ));
    }

    #[test]
    fn test_images_only_ignores_masks() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path().join("mri/a.nii.gz"));

        let pairs = NiftiDirectory::images_only(dir.path()).load_pairs().unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(!pairs[0].is_labelled());
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NiftiDirectory::labelled(dir.path().join("nope")).load_pairs().is_err());
    }
}
