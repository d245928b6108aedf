// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Trains one fold. Each fold owns its model, optimiser, LR
// schedule, checkpoint saver and metrics CSV; nothing is
// shared between folds.
//
//   Idle → Training(1) → Validating(1) → CheckpointDecision(1)
//        → Training(2) → … → CheckpointDecision(epochs) → Done
//
// Any state can end in Interrupted once Ctrl-C is seen; the
// trainer checks between iterations and between states.
//
// Key Burn insight:
//   - Training uses B (an AutodiffBackend) for gradients
//   - model.valid() returns the model on B::InnerBackend
//   - The validation loader is therefore built for B::InnerBackend
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use anyhow::Result;
use burn::{
    data::dataloader::DataLoader,
    module::AutodiffModule,
    optim::GradientsParams,
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use std::path::PathBuf;

use crate::application::config::RunConfig;
use crate::data::batcher::SegBatch;
use crate::domain::{sample::FoldSplit, traits::EngineObserver};
use crate::infra::{
    checkpoint::CheckpointSaver,
    metrics::{EpochMetrics, MetricsLogger},
    runtime::RunContext,
};
use crate::ml::{
    evaluator::Evaluator,
    factory::{
        build_dataloader, build_inferer, build_loss, build_model, build_optimizer,
        build_scheduler, LoaderMode,
    },
    loss::SegLoss,
    model::SegResNet,
    optim::DynOptimizer,
    scheduler::LrSchedule,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FoldState {
    Idle,
    Training { epoch: usize },
    Validating { epoch: usize },
    CheckpointDecision { epoch: usize, dice: f64 },
    Done,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct FoldOutcome {
    pub fold:            usize,
    pub epochs_run:      usize,
    /// Mean training loss of the last completed epoch
    pub last_train_loss: f64,
    pub best_dice:       f64,
    pub best_checkpoint: Option<PathBuf>,
    pub checkpoints:     Vec<PathBuf>,
    pub interrupted:     bool,
}

/// Trains one fold from scratch: its own model, optimizer, schedule
/// and checkpoint namespace.
pub struct FoldTrainer<'a, B: AutodiffBackend> {
    cfg:      &'a RunConfig,
    ctx:      &'a RunContext<B>,
    observer: &'a dyn EngineObserver,
}

/// Everything an epoch mutates.
struct EpochState<B: AutodiffBackend> {
    model:    SegResNet<B>,
    optim:    Box<dyn DynOptimizer<SegResNet<B>, B>>,
    schedule: Box<dyn LrSchedule>,
    lr:       f64,
}

impl<'a, B: AutodiffBackend> FoldTrainer<'a, B> {
    pub fn new(cfg: &'a RunConfig, ctx: &'a RunContext<B>, observer: &'a dyn EngineObserver) -> Self {
        Self { cfg, ctx, observer }
    }

    /// Run the fold to completion or until Ctrl-C.
    ///
    /// An interrupted fold still reports what it saved; checkpoints
    /// already on disk are never removed by an interrupt.
    pub fn run(&self, split: &FoldSplit) -> Result<FoldOutcome> {
        let cfg    = self.cfg;
        let device = &self.ctx.device;
        let prefix = split.prefix(&cfg.model_id);
        tracing::info!(
            "Fold {}: {} training / {} validation volumes",
            split.index, split.train.len(), split.valid.len(),
        );

        // ── Loaders ───────────────────────────────────────────────────────────
        let train_loader = build_dataloader::<B>(
            cfg, &cfg.data.train, LoaderMode::Train, &split.train, device,
        )?;
        let val_loader = build_dataloader::<B::InnerBackend>(
            cfg, cfg.valid_section(), LoaderMode::Val, &split.valid, device,
        )?;
        let iterations = train_loader.num_items().div_ceil(cfg.data.train.batch_size(cfg)).max(1);

        // ── Components ────────────────────────────────────────────────────────
        let loss = build_loss(&cfg.loss)?;
        let mut state = EpochState {
            model:    build_model::<B>(&cfg.model, device)?,
            optim:    build_optimizer::<SegResNet<B>, B>(&cfg.optimizer),
            schedule: build_scheduler(cfg.scheduler.as_ref(), cfg.optimizer.lr(), iterations)?,
            lr:       cfg.optimizer.lr(),
        };
        let evaluator = Evaluator::new(build_inferer(cfg.imgsize), cfg.num_classes);
        let mut saver = CheckpointSaver::new(&cfg.workdir, &prefix, cfg.checkpoints_kept)?;
        let logger    = MetricsLogger::new(&cfg.workdir, split.index)?;

        let mut outcome = FoldOutcome {
            fold:            split.index,
            epochs_run:      0,
            last_train_loss: f64::NAN,
            best_dice:       f64::NAN,
            best_checkpoint: None,
            checkpoints:     Vec::new(),
            interrupted:     false,
        };

        // ── State machine ─────────────────────────────────────────────────────
        let mut fold_state = FoldState::Idle;
        loop {
            tracing::debug!("Fold {} state: {:?}", split.index, fold_state);
            if self.ctx.interrupted() && !matches!(fold_state, FoldState::Done | FoldState::Interrupted) {
                fold_state = FoldState::Interrupted;
            }

            fold_state = match fold_state {
                FoldState::Idle => FoldState::Training { epoch: 1 },

                FoldState::Training { epoch } => {
                    self.observer.epoch_started(split.index, epoch, iterations);
                    match self.train_epoch(&mut state, &loss, train_loader.as_ref())? {
                        Some(mean_loss) => {
                            self.observer.epoch_completed(split.index, epoch, mean_loss);
                            if !mean_loss.is_finite() {
                                tracing::warn!("Fold {} epoch {}: training loss is {}", split.index, epoch, mean_loss);
                            }
                            outcome.last_train_loss = mean_loss;
                            outcome.epochs_run      = epoch;
                            FoldState::Validating { epoch }
                        }
                        None => FoldState::Interrupted,
                    }
                }

                FoldState::Validating { epoch } => {
                    let model_valid = state.model.valid();
                    let dice = evaluator.mean_dice(&model_valid, val_loader.as_ref(), self.observer)?;
                    FoldState::CheckpointDecision { epoch, dice }
                }

                FoldState::CheckpointDecision { epoch, dice } => {
                    let saved = saver.consider(&state.model, epoch, dice)?;
                    self.observer.validation_completed(split.index, epoch, dice, saved.is_some());
                    logger.log(&EpochMetrics {
                        fold:       split.index,
                        epoch,
                        train_loss: outcome.last_train_loss,
                        val_dice:   dice,
                        lr:         state.lr,
                    })?;

                    if epoch >= cfg.epochs {
                        FoldState::Done
                    } else {
                        FoldState::Training { epoch: epoch + 1 }
                    }
                }

                FoldState::Done => break,

                FoldState::Interrupted => {
                    tracing::warn!("Fold {} interrupted after {} epochs", split.index, outcome.epochs_run);
                    outcome.interrupted = true;
                    break;
                }
            };
        }

        if saver.best().is_finite() {
            outcome.best_dice = saver.best();
        }
        outcome.best_checkpoint = saver.best_path().map(PathBuf::from);
        outcome.checkpoints     = saver.saved().map(PathBuf::from).collect();
        tracing::info!(
            "Fold {} finished: best val_mean_dice={:.4} ({} checkpoints)",
            split.index, outcome.best_dice, outcome.checkpoints.len(),
        );
        Ok(outcome)
    }

    /// One pass over the training loader. `None` if interrupted.
    fn train_epoch(
        &self,
        state:  &mut EpochState<B>,
        loss:   &SegLoss,
        loader: &dyn DataLoader<SegBatch<B>>,
    ) -> Result<Option<f64>> {
        let mut loss_sum = 0.0f64;
        let mut batches  = 0usize;

        for batch in loader.iter() {
            if self.ctx.interrupted() {
                return Ok(None);
            }
            let Some(labels) = batch.labels else {
                anyhow::bail!("Training batch without masks ({:?})", batch.ids);
            };

            // LR for this iteration, then forward / backward / step
            let lr     = state.schedule.step();
            let logits = state.model.forward(batch.images);
            let value  = loss.forward(logits, labels);

            let loss_val: f64 = value.clone().into_scalar().elem::<f64>();
            loss_sum += loss_val;
            batches  += 1;

            let grads = value.backward();
            let grads = GradientsParams::from_grads(grads, &state.model);
            let model = state.model.clone();
            state.model = state.optim.step(lr, model, grads);
            state.lr    = lr;

            self.observer.iteration_completed(loss_val, lr);
        }

        Ok(Some(if batches > 0 { loss_sum / batches as f64 } else { f64::NAN }))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::config::tests::write_fixture;
    use crate::data::{loader::NiftiDirectory, splitter::holdout_split};
    use crate::domain::traits::SampleSource;
    use crate::infra::progress::SilentObserver;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_one_epoch_one_checkpoint() {
        let fixture = write_fixture(1);
        let cfg     = &fixture.config;
        let ctx     = RunContext::<TestBackend>::new(Default::default(), cfg.seed, false);

        let train = NiftiDirectory::labelled(&cfg.data.train.imgdir).load_pairs().unwrap();
        let split = holdout_split(train.clone(), train);

        let outcome = FoldTrainer::new(cfg, &ctx, &SilentObserver).run(&split).unwrap();
        assert_eq!(outcome.epochs_run, 1);
        assert!(outcome.last_train_loss.is_finite());
        assert!(outcome.last_train_loss >= 0.0);
        assert_eq!(outcome.checkpoints.len(), 1);
        assert!(!outcome.interrupted);
    }

    #[test]
    fn test_interrupt_before_first_epoch() {
        let fixture = write_fixture(1);
        let cfg     = &fixture.config;
        let ctx     = RunContext::<TestBackend>::new(Default::default(), cfg.seed, false);
        ctx.interrupt();

        let train = NiftiDirectory::labelled(&cfg.data.train.imgdir).load_pairs().unwrap();
        let split = holdout_split(train.clone(), train);

        let outcome = FoldTrainer::new(cfg, &ctx, &SilentObserver).run(&split).unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.epochs_run, 0);
        assert!(outcome.checkpoints.is_empty());
    }
}
