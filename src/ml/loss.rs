// ============================================================
// Layer 5 — Segmentation Losses
// ============================================================
// All losses take raw logits [N, C, X, Y, Z] and integer label
// maps [N, 1, X, Y, Z] and return a scalar [1] tensor.
//
// Dice loss, per (sample, class) pair:
//
//   p = softmax(logits, dim=1)        t = one_hot(labels)
//   I = Σ p·t                         D = Σ p + Σ t
//   loss = 1 − (2I + smooth_nr) / (D + smooth_dr)
//
// then averaged over samples and (optionally foreground-only)
// classes. With `batch = true` the sums also run over N.
//
// Cross entropy flattens every voxel into one row of a
// [N·X·Y·Z, C] logit matrix and reuses Burn's CrossEntropyLoss.
//
// Reference: Milletari et al. (2016) V-Net
//            Burn Book §5 (Loss functions)

use burn::{
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
    tensor::activation::softmax,
};
use serde::{Deserialize, Serialize};

// ─── Parameters (as written in the run config) ────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiceParams {
    pub include_background: bool,
    pub to_onehot_y:        bool,
    pub softmax:            bool,
    pub sigmoid:            bool,
    pub squared_pred:       bool,
    pub batch:              bool,
    pub smooth_nr:          f64,
    pub smooth_dr:          f64,
}

impl Default for DiceParams {
    fn default() -> Self {
        Self {
            include_background: true,
            to_onehot_y:        false,
            softmax:            false,
            sigmoid:            false,
            squared_pred:       false,
            batch:              false,
            smooth_nr:          1e-5,
            smooth_dr:          1e-5,
        }
    }
}

/// DiceCE always runs softmax against one-hot labels, so those
/// two switches default to on here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiceCeParams {
    pub include_background: bool,
    pub to_onehot_y:        bool,
    pub softmax:            bool,
    pub sigmoid:            bool,
    pub squared_pred:       bool,
    pub batch:              bool,
    pub smooth_nr:          f64,
    pub smooth_dr:          f64,
    pub lambda_dice:        f64,
    pub lambda_ce:          f64,
}

impl Default for DiceCeParams {
    fn default() -> Self {
        let dice = DiceParams::default();
        Self {
            include_background: dice.include_background,
            to_onehot_y:        true,
            softmax:            true,
            sigmoid:            false,
            squared_pred:       dice.squared_pred,
            batch:              dice.batch,
            smooth_nr:          dice.smooth_nr,
            smooth_dr:          dice.smooth_dr,
            lambda_dice:        1.0,
            lambda_ce:          1.0,
        }
    }
}

impl DiceCeParams {
    /// The Dice half of the combined loss.
    pub fn dice(&self) -> DiceParams {
        DiceParams {
            include_background: self.include_background,
            to_onehot_y:        self.to_onehot_y,
            softmax:            self.softmax,
            sigmoid:            self.sigmoid,
            squared_pred:       self.squared_pred,
            batch:              self.batch,
            smooth_nr:          self.smooth_nr,
            smooth_dr:          self.smooth_dr,
        }
    }
}

// ─── Losses ───────────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct DiceLoss {
    pub include_background: bool,
    pub squared_pred:       bool,
    pub batch:              bool,
    pub smooth_nr:          f64,
    pub smooth_dr:          f64,
}

impl From<&DiceParams> for DiceLoss {
    fn from(p: &DiceParams) -> Self {
        Self {
            include_background: p.include_background,
            squared_pred:       p.squared_pred,
            batch:              p.batch,
            smooth_nr:          p.smooth_nr,
            smooth_dr:          p.smooth_dr,
        }
    }
}

impl DiceLoss {
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 5>, labels: Tensor<B, 5, Int>) -> Tensor<B, 1> {
        let [n, c, _, _, _] = logits.dims();
        let probs  = softmax(logits, 1);
        let target = one_hot(labels, c);

        let (probs, target, c) = if !self.include_background && c > 1 {
            let [_, _, x, y, z] = probs.dims();
            (
                probs.slice([0..n, 1..c, 0..x, 0..y, 0..z]),
                target.slice([0..n, 1..c, 0..x, 0..y, 0..z]),
                c - 1,
            )
        } else {
            (probs, target, c)
        };

        // [N, C, V], or [1, C, N·V] when reducing over the batch too
        let (probs, target) = if self.batch {
            (
                probs.swap_dims(0, 1).reshape([1, c as i32, -1]),
                target.swap_dims(0, 1).reshape([1, c as i32, -1]),
            )
        } else {
            (probs.reshape([n as i32, c as i32, -1]), target.reshape([n as i32, c as i32, -1]))
        };

        let intersection = (probs.clone() * target.clone()).sum_dim(2);
        let denominator  = if self.squared_pred {
            probs.powf_scalar(2.0).sum_dim(2) + target.powf_scalar(2.0).sum_dim(2)
        } else {
            probs.sum_dim(2) + target.sum_dim(2)
        };

        let dice = (intersection * 2.0 + self.smooth_nr) / (denominator + self.smooth_dr);
        (dice.neg() + 1.0).mean()
    }
}

/// Mean voxel-wise cross-entropy of `[N, C, X, Y, Z]` logits against
/// `[N, 1, X, Y, Z]` class ids.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 5>, labels: Tensor<B, 5, Int>) -> Tensor<B, 1> {
    let [_, c, _, _, _] = logits.dims();
    let device = logits.device();
    let rows   = logits.permute([0, 2, 3, 4, 1]).reshape([-1, c as i32]);
    let target = labels.flatten::<1>(0, 4);
    CrossEntropyLossConfig::new().init(&device).forward(rows, target)
}

/// [N, 1, X, Y, Z] class ids → [N, C, X, Y, Z] float indicators.
pub fn one_hot<B: Backend>(labels: Tensor<B, 5, Int>, classes: usize) -> Tensor<B, 5> {
    let channels: Vec<Tensor<B, 5>> = (0..classes)
        .map(|k| labels.clone().equal_elem(k as i32).float())
        .collect();
    Tensor::cat(channels, 1)
}

/// The loss a run trains with; built from the config by the factory.
#[derive(Debug, Clone)]
pub enum SegLoss {
    Dice(DiceLoss),
    DiceCe { dice: DiceLoss, lambda_dice: f64, lambda_ce: f64 },
    CrossEntropy,
}

impl SegLoss {
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 5>, labels: Tensor<B, 5, Int>) -> Tensor<B, 1> {
        match self {
            Self::Dice(dice) => dice.forward(logits, labels),
            Self::DiceCe { dice, lambda_dice, lambda_ce } => {
                let d  = dice.forward(logits.clone(), labels.clone());
                let ce = cross_entropy(logits, labels);
                d * *lambda_dice + ce * *lambda_ce
            }
            Self::CrossEntropy => cross_entropy(logits, labels),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Dice(_)       => "DiceLoss",
            Self::DiceCe { .. } => "DiceCELoss",
            Self::CrossEntropy  => "CrossEntropyLoss",
        }
    }
}
