// ============================================================
// Layer 2 — TestUseCase
// ============================================================
// Segments the test set with a trained checkpoint:
//
//   Step 1: Discover test samples         (Layer 4 - data)
//   Step 2: Rebuild model + load weights  (Layer 5 / 6)
//   Step 3: Per sample: sliding window + TTA → argmax
//   Step 4: Write <id>_seg.nii into the prediction folder,
//           back on the source voxel grid with its header
//   Step 5: (test only) Dice + Hausdorff per sample → results.csv
//
// `test-segment` skips Step 5 and needs no masks.

use anyhow::{Context, Result};
use burn::prelude::*;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::application::config::RunConfig;
use crate::data::{
    loader::NiftiDirectory,
    nifti::{read_header, write_volume, VoxelKind},
    transforms::{resample, Interp},
};
use crate::domain::{
    traits::{EngineObserver, SampleSource},
    volume::Volume,
};
use crate::infra::{
    checkpoint::load_model,
    metrics::{dice_score, hausdorff_distance, ResultRow, ResultsTable},
    runtime::RunContext,
};
use crate::ml::{
    evaluator::{label_bytes, sample_slice, Evaluator},
    factory::{build_dataloader, build_inferer, build_model, LoaderMode},
};

pub const RESULTS_FILE: &str = "results.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Labelled test set: predictions + metrics
    Evaluate,
    /// Images only: predictions
    SegmentOnly,
}

#[derive(Debug)]
pub struct TestSummary {
    pub predictions: Vec<PathBuf>,
    /// `None` in SegmentOnly mode
    pub results:     Option<ResultsTable>,
    pub interrupted: bool,
}

/// The `test` and `test-segment` modes.
///
/// Both load one checkpoint and write a prediction per image; only
/// `test` reads masks and produces `results.csv`.
pub struct TestUseCase {
    config:   RunConfig,
    snapshot: PathBuf,
    mode:     TestMode,
}

impl TestUseCase {
    pub fn new(config: RunConfig, snapshot: impl Into<PathBuf>, mode: TestMode) -> Self {
        Self { config, snapshot: snapshot.into(), mode }
    }

    /// Segment every test image, stopping between samples on Ctrl-C.
    pub fn execute<B: Backend>(&self, ctx: &RunContext<B>, observer: &dyn EngineObserver) -> Result<TestSummary> {
        let cfg     = &self.config;
        let device  = &ctx.device;
        let section = cfg.test_section()?;
        let output  = cfg.prediction_folder();

        // ── Step 1: samples ───────────────────────────────────────────────────
        let source = match self.mode {
            TestMode::Evaluate    => NiftiDirectory::labelled(&section.imgdir),
            TestMode::SegmentOnly => NiftiDirectory::images_only(&section.imgdir),
        };
        let pairs = source.load_pairs()?;
        tracing::info!(
            "Testing: {} samples from '{}', predictions → '{}'",
            pairs.len(), section.imgdir.display(), output.display(),
        );
        let images: HashMap<String, PathBuf> =
            pairs.iter().map(|p| (p.id.clone(), p.image.clone())).collect();

        // ── Step 2: model ─────────────────────────────────────────────────────
        let model = build_model::<B>(&cfg.model, device)?;
        let model = load_model(model, &self.snapshot, device)?;

        let loader    = build_dataloader::<B>(cfg, section, LoaderMode::Test, &pairs, device)?;
        let evaluator = Evaluator::new(build_inferer(section.imgsize(cfg)), cfg.num_classes)
            .with_tta(cfg.tta.clone());
        tracing::info!("TTA: {} predictions per sample", cfg.tta.predictions_per_sample());

        // ── Step 3–5: per sample ──────────────────────────────────────────────
        let mut summary = TestSummary {
            predictions: Vec::new(),
            results:     (self.mode == TestMode::Evaluate).then(ResultsTable::default),
            interrupted: false,
        };
        observer.inference_started(pairs.len());

        'batches: for batch in loader.iter() {
            for (i, id) in batch.ids.iter().enumerate() {
                if ctx.interrupted() {
                    summary.interrupted = true;
                    break 'batches;
                }
                let shape = batch.shapes[i];
                let image = sample_slice(batch.images.clone(), i, shape);
                let pred  = label_bytes(evaluator.predict(&model, image))?;

                let source_image = images
                    .get(id)
                    .with_context(|| format!("No source image recorded for '{id}'"))?;
                let path = write_prediction(&output, id, source_image, &pred, shape, batch.original_shapes[i])?;
                summary.predictions.push(path);

                if let (Some(table), Some(labels)) = (summary.results.as_mut(), batch.labels.as_ref()) {
                    let truth = label_bytes(sample_slice(labels.clone(), i, shape))?;
                    let row = ResultRow {
                        id:                 id.clone(),
                        dice_score:         dice_score(&pred, &truth, cfg.num_classes),
                        hausdorff_distance: hausdorff_distance(&pred, &truth, shape),
                    };
                    tracing::info!(
                        "{}: dice={:.4} hausdorff={:.2}",
                        row.id, row.dice_score, row.hausdorff_distance,
                    );
                    table.push(row);
                }
                observer.sample_completed(id);
            }
        }
        observer.inference_completed();

        if let Some(table) = &summary.results {
            table.write(&output.join(RESULTS_FILE))?;
            tracing::info!("Mean dice over {} samples: {:.4}", table.rows().len(), table.mean_dice());
        }
        Ok(summary)
    }
}

/// `<output>/<id>_seg.nii`, uint8, resampled back to the source
/// grid and carrying the source image's header.
fn write_prediction(
    output:         &Path,
    id:             &str,
    source_image:   &Path,
    labels:         &[u8],
    shape:          [usize; 3],
    original_shape: [usize; 3],
) -> Result<PathBuf> {
    let header = read_header(source_image)?;
    let grid   = Volume::from_labels(shape, header.spacing(), labels);
    let mut volume = resample(&grid, original_shape, Interp::Nearest);
    volume.spacing = header.spacing();

    let path = output.join(format!("{id}_seg.nii"));
    write_volume(&path, &header, &volume, VoxelKind::UInt8)?;
    tracing::debug!("Wrote prediction '{}'", path.display());
    Ok(path)
}
