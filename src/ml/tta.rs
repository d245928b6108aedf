// ============================================================
// Layer 5 — Test-Time Augmentation
// ============================================================
// Averages sliding-window predictions over perturbed copies of
// the input:
//
//   pass 0:            original image
//   for each of `noise_passes`:
//     noisy = image + N(0, noise_std)
//     noisy                      → prediction
//     flip(noisy, X) → predict → flip back
//     flip(noisy, Y) → predict → flip back
//
// With the defaults that is 1 + 4 × 3 = 13 predictions, all
// weighted equally. The mean logits are turned into a label map
// with argmax over the class channel.

use burn::{prelude::*, tensor::Distribution};
use serde::{Deserialize, Serialize};

use crate::ml::inferer::SlidingWindowInferer;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtaConfig {
    pub noise_passes: usize,
    pub noise_std:    f64,
    /// Also predict on X- and Y-flipped copies of every noisy pass
    pub flips:        bool,
}

impl Default for TtaConfig {
    fn default() -> Self {
        Self { noise_passes: 4, noise_std: 0.01, flips: true }
    }
}

impl TtaConfig {
    pub fn predictions_per_sample(&self) -> usize {
        1 + self.noise_passes * if self.flips { 3 } else { 1 }
    }
}

/// Spatial axes flipped during TTA: X and Y of [N, C, X, Y, Z].
const FLIP_DIMS: [isize; 2] = [2, 3];

/// Mean network output over every TTA pass.
pub fn tta_average<B, F>(
    image:   Tensor<B, 5>,
    cfg:     &TtaConfig,
    inferer: &SlidingWindowInferer,
    net:     &F,
) -> Tensor<B, 5>
where
    B: Backend,
    F: Fn(Tensor<B, 5>) -> Tensor<B, 5>,
{
    let mut sum   = inferer.infer(image.clone(), net);
    let mut count = 1usize;

    for _ in 0..cfg.noise_passes {
        let noisy = if cfg.noise_std > 0.0 {
            let noise = Tensor::random(
                image.shape(),
                Distribution::Normal(0.0, cfg.noise_std),
                &image.device(),
            );
            image.clone() + noise
        } else {
            image.clone()
        };

        sum = sum + inferer.infer(noisy.clone(), net);
        count += 1;

        if cfg.flips {
            for dim in FLIP_DIMS {
                let pred = inferer.infer(noisy.clone().flip([dim]), net);
                sum = sum + pred.flip([dim]);
                count += 1;
            }
        }
    }

    tracing::debug!("TTA averaged {} predictions", count);
    sum / count as f64
}

/// [N, C, X, Y, Z] scores → [N, 1, X, Y, Z] class ids.
pub fn to_label_map<B: Backend>(scores: Tensor<B, 5>) -> Tensor<B, 5, Int> {
    scores.argmax(1)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use crate::ml::inferer::window_starts;
    use std::cell::Cell;

    type TestBackend = NdArray<f32>;

    /// Pointwise two-class "network": logits (x, 1 − x).
    fn pointwise(x: Tensor<TestBackend, 5>) -> Tensor<TestBackend, 5> {
        Tensor::cat(vec![x.clone(), x.neg() + 1.0], 1)
    }

    #[test]
    fn test_constant_input_tta_equals_single_pass() {
        let device  = Default::default();
        let image   = Tensor::<TestBackend, 5>::full([1, 1, 10, 8, 4], 0.7, &device);
        let inferer = SlidingWindowInferer::new([8, 8, 4]);
        let cfg     = TtaConfig { noise_std: 0.0, ..Default::default() };

        let single = inferer.infer(image.clone(), pointwise);
        let tta    = tta_average(image, &cfg, &inferer, &pointwise);
        let diff: f32 = (single - tta).abs().max().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_flip_is_undone_for_asymmetric_input() {
        let device = Default::default();
        let data: Vec<f32> = (0..32).map(|v| v as f32 / 32.0).collect();
        let image = Tensor::<TestBackend, 5>::from_data(TensorData::new(data, [1, 1, 4, 4, 2]), &device);
        let inferer = SlidingWindowInferer::new([4, 4, 2]);
        let cfg     = TtaConfig { noise_passes: 1, noise_std: 0.0, flips: true };

        let single = inferer.infer(image.clone(), pointwise);
        let tta    = tta_average(image, &cfg, &inferer, &pointwise);
        let diff: f32 = (single - tta).abs().max().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_prediction_count() {
        assert_eq!(TtaConfig::default().predictions_per_sample(), 13);
        assert_eq!(TtaConfig { flips: false, ..Default::default() }.predictions_per_sample(), 5);
    }

    #[test]
    fn test_default_config_runs_thirteen_passes_per_window() {
        let device  = Default::default();
        let image   = Tensor::<TestBackend, 5>::zeros([1, 1, 12, 8, 4], &device);
        let mut inferer = SlidingWindowInferer::new([8, 8, 4]);
        inferer.sw_batch_size = 1;
        let windows: usize = [(12, 8), (8, 8), (4, 4)]
            .iter()
            .map(|&(size, roi)| window_starts(size, roi, inferer.overlap).len())
            .product();
        assert_eq!(windows, 2);

        let calls = Cell::new(0usize);
        let counting = |x: Tensor<TestBackend, 5>| {
            calls.set(calls.get() + 1);
            pointwise(x)
        };
        tta_average(image, &TtaConfig::default(), &inferer, &counting);
        assert_eq!(calls.get(), 13 * windows);
    }

    #[test]
    fn test_passes_are_weighted_equally() {
        // the k-th network call returns the constant k, so the mean of 1..=13 is 7
        let device  = Default::default();
        let image   = Tensor::<TestBackend, 5>::zeros([1, 1, 8, 8, 4], &device);
        let inferer = SlidingWindowInferer::new([8, 8, 4]);

        let calls = Cell::new(0usize);
        let nth_call = |x: Tensor<TestBackend, 5>| {
            calls.set(calls.get() + 1);
            let [n, _, a, b, c] = x.dims();
            Tensor::<TestBackend, 5>::full([n, 2, a, b, c], calls.get() as f32, &x.device())
        };
        let mean = tta_average(image, &TtaConfig::default(), &inferer, &nth_call);
        assert_eq!(calls.get(), 13);
        let lo: f32 = mean.clone().min().into_scalar();
        let hi: f32 = mean.max().into_scalar();
        assert!((lo - 7.0).abs() < 1e-4 && (hi - 7.0).abs() < 1e-4, "{lo} {hi}");
    }

    #[test]
    fn test_label_map_argmax() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 5>::from_data(
            TensorData::new(vec![0.9f32, 0.2, 0.1, 0.8], [1, 2, 2, 1, 1]),
            &device,
        );
        let labels: Vec<i64> = to_label_map(scores).into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(labels, vec![0, 1]);
    }
}
