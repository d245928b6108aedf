// ============================================================
// Layer 4 — Cached Segmentation Dataset
// ============================================================
// Implements Burn's Dataset trait over preprocessed volumes.
//
// All NIfTI decoding and deterministic preprocessing happens
// once, in `SegDataset::cache`; epochs after the first only pay
// for the random augmentation.
//
// In train mode each volume yields `crop_samples` patches per
// epoch, so `len()` is `volumes * crop_samples` and index i
// maps to volume `i / crop_samples`. Every `get` seeds a fresh
// RNG from the run seed plus a draw counter, so loader workers
// can call it concurrently.
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

use anyhow::{bail, Context, Result};
use burn::data::dataset::Dataset;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::data::nifti::read_volume;
use crate::data::transforms::{Preprocess, RandomAugment};
use crate::domain::sample::SamplePair;
use crate::domain::volume::Volume;

/// A preprocessed sample held in memory for the whole run.
#[derive(Debug, Clone)]
pub struct CachedSample {
    pub id:             String,
    pub image:          Volume,
    pub label:          Option<Volume>,
    /// Voxel grid of the file on disk, before resampling
    pub original_shape: [usize; 3],
}

/// What the DataLoader hands to the batcher.
#[derive(Debug, Clone)]
pub struct SegItem {
    pub id:             String,
    pub image:          Volume,
    pub label:          Option<Volume>,
    pub original_shape: [usize; 3],
}

/// Preprocessed volumes held in memory for the whole run.
///
/// Volumes are read and preprocessed once; in train mode every access
/// draws a fresh augmented crop from the cached volume.
pub struct SegDataset {
    samples: Vec<CachedSample>,
    augment: Option<RandomAugment>,
    seed:    u64,
    draws:   AtomicU64,
}

impl SegDataset {
    /// Read and preprocess every pair. `augment` switches the dataset
    /// into train mode, which requires labels on every sample.
    pub fn cache(
        pairs:      &[SamplePair],
        preprocess: &Preprocess,
        augment:    Option<RandomAugment>,
        seed:       u64,
    ) -> Result<Self> {
        let mut samples = Vec::with_capacity(pairs.len());

        for pair in pairs {
            let (_, raw_image) = read_volume(&pair.image)
                .with_context(|| format!("Loading image for '{}'", pair.id))?;

            let label = match &pair.label {
                Some(path) => {
                    let (_, raw_label) = read_volume(path)
                        .with_context(|| format!("Loading mask for '{}'", pair.id))?;
                    if raw_label.shape != raw_image.shape {
                        bail!(
                            "Sample '{}': image shape {:?} does not match mask shape {:?}",
                            pair.id, raw_image.shape, raw_label.shape
                        );
                    }
                    Some(preprocess.label(&raw_label))
                }
                None if augment.is_some() => {
                    bail!("Sample '{}' has no mask but is used for training", pair.id)
                }
                None => None,
            };

            samples.push(CachedSample {
                id:             pair.id.clone(),
                image:          preprocess.image(&raw_image),
                label,
                original_shape: raw_image.shape,
            });
        }

        tracing::info!("Cached {} volumes", samples.len());
        Ok(Self::from_samples(samples, augment, seed))
    }

    pub fn from_samples(samples: Vec<CachedSample>, augment: Option<RandomAugment>, seed: u64) -> Self {
        Self { samples, augment, seed, draws: AtomicU64::new(0) }
    }

    pub fn volume_count(&self) -> usize {
        self.samples.len()
    }

    fn crops_per_volume(&self) -> usize {
        self.augment.as_ref().map_or(1, RandomAugment::crop_samples)
    }
}

impl Dataset<SegItem> for SegDataset {
    fn get(&self, index: usize) -> Option<SegItem> {
        let sample = self.samples.get(index / self.crops_per_volume())?;

        let Some(augment) = &self.augment else {
            return Some(SegItem {
                id:             sample.id.clone(),
                image:          sample.image.clone(),
                label:          sample.label.clone(),
                original_shape: sample.original_shape,
            });
        };

        let draw = self.draws.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed ^ draw.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let (image, label) = augment.apply(&sample.image, sample.label.as_ref()?, &mut rng);

        Some(SegItem {
            id:             sample.id.clone(),
            image,
            label:          Some(label),
            original_shape: sample.original_shape,
        })
    }

    fn len(&self) -> usize {
        self.samples.len() * self.crops_per_volume()
    }
}
