// ============================================================
// Layer 5 — Optimisers
// ============================================================
// Burn's `Optimizer` trait carries an associated Record type,
// so `Box<dyn Optimizer<..>>` is not possible. `DynOptimizer`
// keeps only `step`, which is all the trainer needs, and is
// implemented for every Burn optimiser by a blanket impl.
//
// The learning rate lives in the optimiser params (the base LR);
// the trainer passes the per-iteration value from the schedule
// into every `step`.
//
// Reference: Burn Book §5 (Optimizers)
//            Kingma & Ba (2015) Adam
//            Loshchilov & Hutter (2019) AdamW

use burn::{
    module::AutodiffModule,
    optim::{
        decay::WeightDecayConfig,
        momentum::MomentumConfig,
        AdamConfig, AdamWConfig, GradientsParams, Optimizer, SgdConfig,
    },
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

/// Object-safe view of a burn optimizer.
///
/// burn's `OptimizerAdaptor` types differ per algorithm; boxing them
/// behind this trait lets the factory pick one from the config while
/// the trainer stays generic over the model only.
pub trait DynOptimizer<M, B>: Send
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;
}

impl<M, B, O> DynOptimizer<M, B> for O
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
    O: Optimizer<M, B>,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        Optimizer::step(self, lr, module, grads)
    }
}

// ─── Parameters ───────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdamParams {
    pub lr:           f64,
    pub betas:        (f32, f32),
    pub eps:          f32,
    pub weight_decay: f32,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self { lr: 1e-3, betas: (0.9, 0.999), eps: 1e-8, weight_decay: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdamWParams {
    pub lr:           f64,
    pub betas:        (f32, f32),
    pub eps:          f32,
    pub weight_decay: f32,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self { lr: 1e-3, betas: (0.9, 0.999), eps: 1e-8, weight_decay: 1e-2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SgdParams {
    pub lr:           f64,
    pub momentum:     f64,
    pub dampening:    f64,
    pub weight_decay: f32,
    pub nesterov:     bool,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self { lr: 1e-2, momentum: 0.0, dampening: 0.0, weight_decay: 0.0, nesterov: false }
    }
}

fn weight_decay(penalty: f32) -> Option<WeightDecayConfig> {
    (penalty > 0.0).then(|| WeightDecayConfig::new(penalty))
}

// ─── Constructors ─────────────────────────────────────────────────────────────
/// Adam with optional L2 weight decay.
pub fn adam<M, B>(p: &AdamParams) -> Box<dyn DynOptimizer<M, B>>
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
{
    // m = β1*m + (1-β1)*g        (mean)
    // v = β2*v + (1-β2)*g²       (variance)
    // θ = θ - lr * m / (√v + ε)  (update)
    Box::new(
        AdamConfig::new()
            .with_beta_1(p.betas.0)
            .with_beta_2(p.betas.1)
            .with_epsilon(p.eps)
            .with_weight_decay(weight_decay(p.weight_decay))
            .init::<B, M>(),
    )
}

/// AdamW: decoupled weight decay.
pub fn adamw<M, B>(p: &AdamWParams) -> Box<dyn DynOptimizer<M, B>>
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
{
    Box::new(
        AdamWConfig::new()
            .with_beta_1(p.betas.0)
            .with_beta_2(p.betas.1)
            .with_epsilon(p.eps)
            .with_weight_decay(p.weight_decay)
            .init::<B, M>(),
    )
}

pub fn sgd<M, B>(p: &SgdParams) -> Box<dyn DynOptimizer<M, B>>
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
{
    let momentum = (p.momentum > 0.0).then(|| {
        MomentumConfig::new()
            .with_momentum(p.momentum)
            .with_dampening(p.dampening)
            .with_nesterov(p.nesterov)
    });
    Box::new(
        SgdConfig::new()
            .with_momentum(momentum)
            .with_weight_decay(weight_decay(p.weight_decay))
            .init::<B, M>(),
    )
}
