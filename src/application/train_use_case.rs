// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Discover image/mask pairs     (Layer 4 - data)
//   Step 2: Build the fold splits         (Layer 4 - data)
//   Step 3: Save the effective config     (Layer 6 - infra)
//   Step 4: Train every fold in turn      (Layer 5 - ml)
//
// Folds run strictly one after another. Each owns its model,
// optimiser, schedule and `<model_id>_fold<i>*` checkpoints, so
// a crash in fold i leaves folds 0..i intact on disk.
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use anyhow::{bail, Result};
use burn::tensor::backend::AutodiffBackend;

use crate::application::config::RunConfig;
use crate::data::{
    loader::NiftiDirectory,
    splitter::{holdout_split, kfold_split},
};
use crate::domain::{
    sample::FoldSplit,
    traits::{EngineObserver, SampleSource},
};
use crate::infra::{checkpoint::save_json, runtime::RunContext};
use crate::ml::trainer::{FoldOutcome, FoldTrainer};

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub folds:       Vec<FoldOutcome>,
    pub interrupted: bool,
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
/// The `train` mode: every fold, one after another.
pub struct TrainUseCase {
    config: RunConfig,
}

impl TrainUseCase {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Execute the full training pipeline end to end
    pub fn execute<B: AutodiffBackend>(
        &self,
        ctx:      &RunContext<B>,
        observer: &dyn EngineObserver,
    ) -> Result<TrainSummary> {
        let cfg = &self.config;

        // ── Step 1 + 2: samples and folds ─────────────────────────────────────
        let splits = self.build_splits()?;
        tracing::info!("Training {} fold(s) for model '{}'", splits.len(), cfg.model_id);

        // ── Step 3: save config next to the checkpoints ───────────────────────
        save_json(cfg, &cfg.workdir.join(format!("{}_config.json", cfg.model_id)))?;

        // ── Step 4: folds, sequentially ───────────────────────────────────────
        let mut summary = TrainSummary { folds: Vec::new(), interrupted: false };
        for split in &splits {
            let outcome = FoldTrainer::new(cfg, ctx, observer).run(split)?;
            let stop = outcome.interrupted;
            summary.folds.push(outcome);
            if stop {
                summary.interrupted = true;
                break;
            }
        }

        if !summary.interrupted {
            tracing::info!("Training complete!");
        }
        Ok(summary)
    }

    fn build_splits(&self) -> Result<Vec<FoldSplit>> {
        let cfg   = &self.config;
        let train = NiftiDirectory::labelled(&cfg.data.train.imgdir).load_pairs()?;
        if train.is_empty() {
            bail!("No training samples found in '{}'", cfg.data.train.imgdir.display());
        }

        if cfg.uses_holdout() {
            let valid = NiftiDirectory::labelled(&cfg.valid_section().imgdir).load_pairs()?;
            if valid.is_empty() {
                bail!("No validation samples found in '{}'", cfg.valid_section().imgdir.display());
            }
            tracing::info!("Hold-out validation: {} train, {} valid", train.len(), valid.len());
            return Ok(vec![holdout_split(train, valid)]);
        }

        if train.len() < cfg.folds {
            bail!(
                "{}-fold cross-validation needs at least {} samples, found {}",
                cfg.folds, cfg.folds, train.len(),
            );
        }
        Ok(kfold_split(&train, cfg.folds, cfg.seed))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::config::tests::write_fixture;
    use crate::domain::sample::fold_prefix;
    use crate::infra::progress::SilentObserver;
    use burn::backend::{Autodiff, NdArray};
    use std::fs;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_single_epoch_holdout_run() {
        let fixture = write_fixture(1);
        let mut cfg = fixture.config.clone();
        if let Some(valid) = cfg.data.valid.as_mut() {
            valid.imgdir = fixture.dir.path().join("test");
        }

        let ctx     = RunContext::<TestBackend>::new(Default::default(), cfg.seed, false);
        let summary = TrainUseCase::new(cfg.clone()).execute(&ctx, &SilentObserver).unwrap();

        assert!(!summary.interrupted);
        assert_eq!(summary.folds.len(), 1);
        let loss = summary.folds[0].last_train_loss;
        assert!(loss.is_finite() && loss >= 0.0);

        let prefix = fold_prefix(&cfg.model_id, 0);
        let checkpoints = fs::read_dir(&cfg.workdir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .count();
        assert_eq!(checkpoints, 1);
        assert!(cfg.workdir.join(format!("{}_config.json", cfg.model_id)).exists());
        assert!(cfg.workdir.join("metrics_fold0.csv").exists());
    }

    #[test]
    fn test_too_few_samples_for_kfold() {
        let fixture = write_fixture(1);
        let ctx     = RunContext::<TestBackend>::new(Default::default(), 0, false);
        let result  = TrainUseCase::new(fixture.config.clone()).execute(&ctx, &SilentObserver);
        assert!(result.is_err());
    }
}
