// ============================================================
// Layer 5 — Pipeline Factory
// ============================================================
// Turns the run configuration into runtime objects:
//
//   build_model       ModelSpec      → SegResNet<B>
//   build_loss        LossSpec       → SegLoss
//   build_optimizer   OptimizerSpec  → Box<dyn DynOptimizer>
//   build_scheduler   SchedulerSpec? → Box<dyn LrSchedule>
//   build_dataloader  pairs + mode   → Arc<dyn DataLoader<SegBatch<B>>>
//   build_inferer     roi            → SlidingWindowInferer
//
// The *Spec enums are the closed component registry. They are
// adjacently tagged, so a config entry reads
//
//   [loss]
//   name   = "DiceCELoss"
//   params = { include_background = false, to_onehot_y = true, softmax = true }
//
// and a name that is not a variant fails while the config file is
// parsed. Parameter combinations that parse but that the Rust
// implementation does not support fail here with RegistryError.

use anyhow::Result;
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::application::config::{DataSection, RunConfig};
use crate::data::{
    batcher::{SegBatch, SegBatcher},
    dataset::SegDataset,
    transforms::{Preprocess, RandomAugment},
};
use crate::domain::sample::SamplePair;
use crate::ml::{
    inferer::SlidingWindowInferer,
    loss::{DiceCeParams, DiceLoss, DiceParams, SegLoss},
    model::{SegResNet, SegResNetConfig},
    optim::{self, AdamParams, AdamWParams, DynOptimizer, SgdParams},
    scheduler::{
        Constant, CosineAnnealingLr, CosineAnnealingLrParams, CosineCycle, CosineCycleParams,
        LrSchedule, StepLr, StepLrParams,
    },
};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("{component} '{name}': {reason}")]
    Unsupported { component: &'static str, name: &'static str, reason: String },
}

fn unsupported(component: &'static str, name: &'static str, reason: impl Into<String>) -> RegistryError {
    RegistryError::Unsupported { component, name, reason: reason.into() }
}

// ─── Registry ─────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "params")]
pub enum ModelSpec {
    SegResNet(SegResNetParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegResNetParams {
    pub spatial_dims:   usize,
    pub init_filters:   usize,
    pub in_channels:    usize,
    pub out_channels:   usize,
    pub dropout_prob:   Option<f64>,
    pub norm_name:      String,
    pub num_groups:     usize,
    pub use_conv_final: bool,
    pub blocks_down:    Vec<usize>,
    pub blocks_up:      Vec<usize>,
}

impl Default for SegResNetParams {
    fn default() -> Self {
        Self {
            spatial_dims:   3,
            init_filters:   8,
            in_channels:    1,
            out_channels:   2,
            dropout_prob:   None,
            norm_name:      "group".to_string(),
            num_groups:     8,
            use_conv_final: true,
            blocks_down:    vec![1, 2, 2, 4],
            blocks_up:      vec![1, 1, 1],
        }
    }
}

impl ModelSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SegResNet(_) => "SegResNet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "params")]
pub enum LossSpec {
    DiceLoss(DiceParams),
    #[serde(rename = "DiceCELoss")]
    DiceCeLoss(DiceCeParams),
    CrossEntropyLoss(CrossEntropyParams),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrossEntropyParams {}

impl LossSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DiceLoss(_)         => "DiceLoss",
            Self::DiceCeLoss(_)       => "DiceCELoss",
            Self::CrossEntropyLoss(_) => "CrossEntropyLoss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "params")]
pub enum OptimizerSpec {
    Adam(AdamParams),
    AdamW(AdamWParams),
    #[serde(rename = "SGD")]
    Sgd(SgdParams),
}

impl OptimizerSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Adam(_)  => "Adam",
            Self::AdamW(_) => "AdamW",
            Self::Sgd(_)   => "SGD",
        }
    }

    /// Base learning rate.
    pub fn lr(&self) -> f64 {
        match self {
            Self::Adam(p)  => p.lr,
            Self::AdamW(p) => p.lr,
            Self::Sgd(p)   => p.lr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "params")]
pub enum SchedulerSpec {
    CosineAnnealingScheduler(CosineCycleParams),
    #[serde(rename = "CosineAnnealingLR")]
    CosineAnnealingLr(CosineAnnealingLrParams),
    #[serde(rename = "StepLR")]
    StepLr(StepLrParams),
}

impl SchedulerSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CosineAnnealingScheduler(_) => "CosineAnnealingScheduler",
            Self::CosineAnnealingLr(_)        => "CosineAnnealingLR",
            Self::StepLr(_)                   => "StepLR",
        }
    }
}

// ─── Builders ─────────────────────────────────────────────────────────────────
/// Translate the `model` registry entry into a `SegResNetConfig`.
///
/// Settings the network cannot express are rejected here, so
/// `RunConfig::validate` catches them before any data is read:
/// non-3D input, non-group norm, no final conv, a decoder that is not
/// exactly one level shorter than the encoder.
pub fn model_config(spec: &ModelSpec) -> Result<SegResNetConfig, RegistryError> {
    let ModelSpec::SegResNet(p) = spec;
    const NAME: &str = "SegResNet";

    if p.spatial_dims != 3 {
        return Err(unsupported("model", NAME, format!("spatial_dims={} (only 3 is supported)", p.spatial_dims)));
    }
    if p.norm_name != "group" {
        return Err(unsupported("model", NAME, format!("norm_name='{}' (only 'group' is supported)", p.norm_name)));
    }
    if !p.use_conv_final {
        return Err(unsupported("model", NAME, "use_conv_final=false"));
    }
    if p.blocks_down.is_empty() || p.blocks_up.len() + 1 != p.blocks_down.len() {
        return Err(unsupported(
            "model", NAME,
            format!("blocks_up must have one entry fewer than blocks_down ({:?} / {:?})", p.blocks_up, p.blocks_down),
        ));
    }
    if p.num_groups == 0 || p.init_filters % p.num_groups != 0 {
        return Err(unsupported(
            "model", NAME,
            format!("init_filters={} is not divisible by num_groups={}", p.init_filters, p.num_groups),
        ));
    }

    Ok(SegResNetConfig::new()
        .with_in_channels(p.in_channels)
        .with_out_channels(p.out_channels)
        .with_init_filters(p.init_filters)
        .with_blocks_down(p.blocks_down.clone())
        .with_blocks_up(p.blocks_up.clone())
        .with_norm_groups(p.num_groups)
        .with_dropout_prob(p.dropout_prob.unwrap_or(0.0)))
}

/// Validated config → freshly initialised network on `device`.
pub fn build_model<B: Backend>(spec: &ModelSpec, device: &B::Device) -> Result<SegResNet<B>, RegistryError> {
    let model = model_config(spec)?.init::<B>(device);
    tracing::info!("Model: {} ({} parameters)", spec.name(), model.num_params());
    Ok(model)
}

/// Resolve the `loss` entry.
///
/// Only the softmax + one-hot form of the Dice family is implemented;
/// asking for sigmoid or raw-label Dice is an error rather than a
/// silent substitution.
pub fn build_loss(spec: &LossSpec) -> Result<SegLoss, RegistryError> {
    let check = |name: &'static str, p: &DiceParams| -> Result<(), RegistryError> {
        if p.sigmoid {
            return Err(unsupported("loss", name, "sigmoid=true (only softmax is supported)"));
        }
        if !p.softmax {
            return Err(unsupported("loss", name, "softmax=false (logits must be normalised with softmax)"));
        }
        if !p.to_onehot_y {
            return Err(unsupported("loss", name, "to_onehot_y=false (labels are class-index maps)"));
        }
        Ok(())
    };

    let loss = match spec {
        LossSpec::DiceLoss(p) => {
            check("DiceLoss", p)?;
            SegLoss::Dice(DiceLoss::from(p))
        }
        LossSpec::DiceCeLoss(p) => {
            let dice = p.dice();
            check("DiceCELoss", &dice)?;
            SegLoss::DiceCe { dice: DiceLoss::from(&dice), lambda_dice: p.lambda_dice, lambda_ce: p.lambda_ce }
        }
        LossSpec::CrossEntropyLoss(_) => SegLoss::CrossEntropy,
    };
    tracing::info!("Criterion: {}", loss.name());
    Ok(loss)
}

/// Boxed optimizer for the `optimizer` entry. The learning rate itself
/// is supplied per step by the schedule.
pub fn build_optimizer<M, B>(spec: &OptimizerSpec) -> Box<dyn DynOptimizer<M, B>>
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
{
    tracing::info!("Optimizer: {} (lr={:e})", spec.name(), spec.lr());
    match spec {
        OptimizerSpec::Adam(p)  => optim::adam(p),
        OptimizerSpec::AdamW(p) => optim::adamw(p),
        OptimizerSpec::Sgd(p)   => optim::sgd(p),
    }
}

/// `None` means no schedule was configured: the base LR is used for
/// every iteration.
pub fn build_scheduler(
    spec:                 Option<&SchedulerSpec>,
    base_lr:              f64,
    iterations_per_epoch: usize,
) -> Result<Box<dyn LrSchedule>, RegistryError> {
    let schedule: Box<dyn LrSchedule> = match spec {
        None => {
            tracing::info!("LR Scheduler: none, constant lr={:e}", base_lr);
            return Ok(Box::new(Constant(base_lr)));
        }
        Some(SchedulerSpec::CosineAnnealingScheduler(p)) => {
            if p.param_name != "lr" {
                return Err(unsupported(
                    "scheduler", "CosineAnnealingScheduler",
                    format!("param_name='{}' (only 'lr' can be scheduled)", p.param_name),
                ));
            }
            Box::new(CosineCycle::new(p, iterations_per_epoch))
        }
        Some(SchedulerSpec::CosineAnnealingLr(p)) => Box::new(CosineAnnealingLr::new(p, base_lr)),
        Some(SchedulerSpec::StepLr(p))            => Box::new(StepLr::new(p, base_lr)),
    };
    tracing::info!("LR Scheduler: {}", schedule.name());
    Ok(schedule)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderMode {
    /// Random crops + augmentation, `crop_samples` patches per volume
    Train,
    /// Whole volumes, deterministic preprocessing only
    Val,
    /// As Val, never shuffled
    Test,
}

/// Decode and cache `pairs`, then wrap them in a Burn DataLoader.
pub fn build_dataloader<B: Backend>(
    cfg:     &RunConfig,
    section: &DataSection,
    mode:    LoaderMode,
    pairs:   &[SamplePair],
    device:  &B::Device,
) -> Result<Arc<dyn DataLoader<SegBatch<B>>>> {
    let preprocess = Preprocess::new(cfg.pixdim);
    let augment = (mode == LoaderMode::Train)
        .then(|| RandomAugment::new(cfg.augment.clone(), section.imgsize(cfg)));
    let dataset = SegDataset::cache(pairs, &preprocess, augment, cfg.seed)?;

    let batch_size  = section.batch_size(cfg);
    let num_workers = section.loader.num_workers.unwrap_or(cfg.num_workers);
    tracing::info!(
        "{:?} loader: {} volumes, {} items, batch_size={}, workers={}",
        mode, dataset.volume_count(), burn::data::dataset::Dataset::len(&dataset), batch_size, num_workers,
    );

    let builder = DataLoaderBuilder::new(SegBatcher::<B>::new(device.clone())).batch_size(batch_size);
    // 0 workers = load on the calling thread
    let builder = if num_workers > 0 { builder.num_workers(num_workers) } else { builder };
    let builder = if section.loader.shuffle && mode != LoaderMode::Test {
        builder.shuffle(cfg.seed)
    } else {
        builder
    };
    Ok(builder.build(dataset))
}

/// Sliding-window inferer with the fixed run settings: windows of
/// `roi`, two windows per network call, 50% overlap.
pub fn build_inferer(roi: [usize; 3]) -> SlidingWindowInferer {
    SlidingWindowInferer::new(roi)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_unknown_names_fail_to_parse() {
        let err = toml::from_str::<LossSpec>("name = \"FocalLoss\"\nparams = {}");
        assert!(err.is_err());
        let err = toml::from_str::<OptimizerSpec>("name = \"Adagrad\"\nparams = {}");
        assert!(err.is_err());
        let err = toml::from_str::<SchedulerSpec>("name = \"OneCycle\"\nparams = {}");
        assert!(err.is_err());
    }

    #[test]
    fn test_model_has_configured_output_channels() {
        let spec  = ModelSpec::SegResNet(SegResNetParams {
            init_filters: 4,
            num_groups:   2,
            blocks_down:  vec![1, 1],
            blocks_up:    vec![1],
            ..Default::default()
        });
        let device = Default::default();
        let model  = build_model::<TestBackend>(&spec, &device).unwrap();
        let out    = model.forward(Tensor::zeros([1, 1, 4, 4, 2], &device));
        assert_eq!(out.dims()[1], 2);
    }

    #[test]
    fn test_model_rejects_2d() {
        let spec = ModelSpec::SegResNet(SegResNetParams { spatial_dims: 2, ..Default::default() });
        assert!(model_config(&spec).is_err());
    }

    #[test]
    fn test_dice_ce_from_config() {
        let spec: LossSpec = toml::from_str(
            "name = \"DiceCELoss\"\nparams = { include_background = false, to_onehot_y = true, softmax = true }",
        )
        .unwrap();
        match build_loss(&spec).unwrap() {
            SegLoss::DiceCe { dice, lambda_dice, lambda_ce } => {
                assert!(!dice.include_background);
                assert_eq!((lambda_dice, lambda_ce), (1.0, 1.0));
            }
            other => panic!("unexpected loss {other:?}"),
        }
    }

    #[test]
    fn test_sigmoid_dice_is_rejected() {
        let spec = LossSpec::DiceLoss(DiceParams { sigmoid: true, ..Default::default() });
        assert!(matches!(build_loss(&spec), Err(RegistryError::Unsupported { .. })));
    }

    #[test]
    fn test_missing_scheduler_is_constant() {
        let mut s = build_scheduler(None, 3e-4, 10).unwrap();
        assert_eq!(s.step(), 3e-4);
        assert_eq!(s.name(), "Constant");
    }

    #[test]
    fn test_scheduler_param_name_checked() {
        let spec = SchedulerSpec::CosineAnnealingScheduler(CosineCycleParams {
            param_name: "momentum".to_string(),
            ..Default::default()
        });
        assert!(build_scheduler(Some(&spec), 1e-3, 10).is_err());
    }
}
