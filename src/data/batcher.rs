// ============================================================
// Layer 4 — Segmentation Batcher
// ============================================================
// Implements Burn's Batcher trait to stack a Vec<SegItem> into
// tensors:
//
//   images: [N, 1, X, Y, Z]  float intensities
//   labels: [N, 1, X, Y, Z]  int class ids (if every item has one)
//
// Training patches all share the roi shape. Whole validation /
// test volumes may not; smaller items are zero-padded at the far
// end of each axis up to the largest shape in the batch, and the
// true shape of each item is kept in `shapes`.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::SegItem;
use crate::domain::volume::Volume;

#[derive(Debug, Clone)]
pub struct SegBatch<B: Backend> {
    pub ids:             Vec<String>,
    pub images:          Tensor<B, 5>,
    pub labels:          Option<Tensor<B, 5, Int>>,
    /// Shape of each item before batch padding
    pub shapes:          Vec<[usize; 3]>,
    /// Shape of each item's source file, before resampling
    pub original_shapes: Vec<[usize; 3]>,
}

impl<B: Backend> SegBatch<B> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct SegBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> SegBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<SegItem, SegBatch<B>> for SegBatcher<B> {
    fn batch(&self, items: Vec<SegItem>) -> SegBatch<B> {
        let n = items.len();
        let mut shape = [1usize; 3];
        for item in &items {
            for axis in 0..3 {
                shape[axis] = shape[axis].max(item.image.shape[axis]);
            }
        }
        let [sx, sy, sz] = shape;

        let image_flat: Vec<f32> = items
            .iter()
            .flat_map(|item| embed(&item.image, shape).data)
            .collect();
        let images = Tensor::<B, 5>::from_data(
            TensorData::new(image_flat, [n, 1, sx, sy, sz]),
            &self.device,
        );

        let labels = if items.iter().all(|item| item.label.is_some()) {
            let label_flat: Vec<i32> = items
                .iter()
                .filter_map(|item| item.label.as_ref())
                .flat_map(|label| embed(label, shape).data.into_iter().map(|v| v.round() as i32))
                .collect();
            Some(Tensor::<B, 5, Int>::from_data(
                TensorData::new(label_flat, [n, 1, sx, sy, sz]),
                &self.device,
            ))
        } else {
            None
        };

        SegBatch {
            ids:             items.iter().map(|item| item.id.clone()).collect(),
            images,
            labels,
            shapes:          items.iter().map(|item| item.image.shape).collect(),
            original_shapes: items.iter().map(|item| item.original_shape).collect(),
        }
    }
}

/// Copy `volume` into the leading corner of a zero volume of `shape`.
fn embed(volume: &Volume, shape: [usize; 3]) -> Volume {
    if volume.shape == shape {
        return volume.clone();
    }
    let mut out = Volume::zeros(shape, volume.spacing);
    let [vx, vy, vz] = volume.shape;
    for x in 0..vx {
        for y in 0..vy {
            let src = volume.offset(x, y, 0);
            let dst = out.offset(x, y, 0);
            out.data[dst..dst + vz].copy_from_slice(&volume.data[src..src + vz]);
        }
    }
    out
}
