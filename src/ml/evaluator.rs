// ============================================================
// Layer 5 — Evaluation Engine
// ============================================================
// Runs a model over a loader without gradients:
//
//   batch → split into samples (each cropped to its own shape)
//         → sliding-window inference (optionally with TTA)
//         → argmax over classes
//         → Dice against the mask, pushed into a MetricAccumulator
//
// Validation during training uses `mean_dice`; the test use case
// uses `predict` directly so it can also write the label maps.

use anyhow::{Context, Result};
use burn::{data::dataloader::DataLoader, prelude::*};

use crate::data::batcher::SegBatch;
use crate::domain::traits::EngineObserver;
use crate::infra::metrics::{dice_score, MetricAccumulator};
use crate::ml::{
    inferer::SlidingWindowInferer,
    model::SegResNet,
    tta::{tta_average, to_label_map, TtaConfig},
};

/// Turns a trained network into label maps and scores them.
///
/// Validation uses it without TTA; the test modes attach a
/// `TtaConfig` with `with_tta`.
pub struct Evaluator {
    inferer:     SlidingWindowInferer,
    num_classes: usize,
    tta:         Option<TtaConfig>,
}

impl Evaluator {
    pub fn new(inferer: SlidingWindowInferer, num_classes: usize) -> Self {
        Self { inferer, num_classes, tta: None }
    }

    pub fn with_tta(mut self, cfg: TtaConfig) -> Self {
        self.tta = Some(cfg);
        self
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// image [1, 1, X, Y, Z] → label map [1, 1, X, Y, Z]
    pub fn predict<B: Backend>(&self, model: &SegResNet<B>, image: Tensor<B, 5>) -> Tensor<B, 5, Int> {
        let net = |x: Tensor<B, 5>| model.forward(x);
        let scores = match &self.tta {
            Some(cfg) => tta_average(image, cfg, &self.inferer, &net),
            None      => self.inferer.infer(image, &net),
        };
        to_label_map(scores)
    }

    /// Mean foreground Dice over every labelled sample in `loader`.
    pub fn mean_dice<B: Backend>(
        &self,
        model:    &SegResNet<B>,
        loader:   &dyn DataLoader<SegBatch<B>>,
        observer: &dyn EngineObserver,
    ) -> Result<f64> {
        let mut acc = MetricAccumulator::default();

        for batch in loader.iter() {
            let Some(labels) = batch.labels.clone() else {
                anyhow::bail!("Validation batch without masks ({:?})", batch.ids);
            };
            for (i, id) in batch.ids.iter().enumerate() {
                let image = sample_slice(batch.images.clone(), i, batch.shapes[i]);
                let truth = sample_slice(labels.clone(), i, batch.shapes[i]);

                let pred  = label_bytes(self.predict(model, image))?;
                let truth = label_bytes(truth)?;
                let dice  = dice_score(&pred, &truth, self.num_classes);
                tracing::debug!("val '{}': dice={:.4}", id, dice);

                acc.push(dice);
                observer.sample_completed(id);
            }
        }

        Ok(acc.mean())
    }
}

/// Item `i` of a zero-padded batch, cropped back to its real `shape`.
pub fn sample_slice<B: Backend, K: burn::tensor::BasicOps<B>>(
    batch: Tensor<B, 5, K>,
    i:     usize,
    shape: [usize; 3],
) -> Tensor<B, 5, K> {
    let channels = batch.dims()[1];
    batch.slice([i..i + 1, 0..channels, 0..shape[0], 0..shape[1], 0..shape[2]])
}

/// Label map tensor → one byte per voxel, z fastest.
pub fn label_bytes<B: Backend>(labels: Tensor<B, 5, Int>) -> Result<Vec<u8>> {
    let values = labels
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("Reading label map from device")?;
    Ok(values.into_iter().map(|v| v.clamp(0, u8::MAX as i64) as u8).collect())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        batcher::SegBatcher,
        dataset::{CachedSample, SegDataset},
    };
    use crate::domain::volume::Volume;
    use crate::infra::progress::SilentObserver;
    use crate::ml::model::SegResNetConfig;
    use burn::{backend::NdArray, data::dataloader::DataLoaderBuilder};

    type TestBackend = NdArray<f32>;

    fn tiny_model() -> SegResNet<TestBackend> {
        SegResNetConfig::new()
            .with_init_filters(4)
            .with_norm_groups(2)
            .with_blocks_down(vec![1, 1])
            .with_blocks_up(vec![1])
            .init(&Default::default())
    }

    #[test]
    fn test_predict_keeps_spatial_shape() {
        let evaluator = Evaluator::new(SlidingWindowInferer::new([4, 4, 2]), 2);
        let image     = Tensor::<TestBackend, 5>::zeros([1, 1, 6, 5, 3], &Default::default());
        let pred      = evaluator.predict(&tiny_model(), image);
        assert_eq!(pred.dims(), [1, 1, 6, 5, 3]);
    }

    #[test]
    fn test_sample_slice_drops_padding() {
        let batch = Tensor::<TestBackend, 5>::ones([2, 1, 4, 4, 4], &Default::default());
        let item  = sample_slice(batch, 1, [3, 2, 4]);
        assert_eq!(item.dims(), [1, 1, 3, 2, 4]);
    }

    #[test]
    fn test_label_bytes() {
        let t = Tensor::<TestBackend, 5, Int>::from_data(
            TensorData::new(vec![0i64, 1, 1, 0], [1, 1, 2, 2, 1]),
            &Default::default(),
        );
        assert_eq!(label_bytes(t).unwrap(), vec![0, 1, 1, 0]);
    }

    #[test]
    fn test_mean_dice_is_a_probability() {
        let shape = [4, 4, 2];
        let mut label = Volume::zeros(shape, [1.0; 3]);
        label.set(1, 1, 0, 1.0);
        let sample = CachedSample {
            id:             "a".to_string(),
            image:          Volume::filled(shape, [1.0; 3], 0.5),
            label:          Some(label),
            original_shape: shape,
        };
        let dataset = SegDataset::from_samples(vec![sample], None, 0);
        let loader  = DataLoaderBuilder::new(SegBatcher::<TestBackend>::new(Default::default()))
            .batch_size(1)
            .build(dataset);

        let evaluator = Evaluator::new(SlidingWindowInferer::new(shape), 2);
        let dice = evaluator.mean_dice(&tiny_model(), loader.as_ref(), &SilentObserver).unwrap();
        assert!((0.0..=1.0).contains(&dice));
    }
}
