// ============================================================
// Layer 5 — Sliding-Window Inferer
// ============================================================
// Runs a fixed-size network over a volume of any size:
//
//   1. replicate-pad every spatial axis up to the roi size
//   2. tile the volume with roi-sized windows, stepping
//      roi·(1 − overlap) voxels (the last window is shifted
//      back so it ends exactly at the border)
//   3. run the network on `sw_batch_size` windows at a time
//   4. weight each window's logits with a Gaussian importance
//      map (σ = sigma_scale·roi per axis, peak 1, floor 1e-3)
//      and accumulate weights and weighted logits
//   5. divide, then crop the padding away
//
// The Gaussian weighting makes predictions near window borders,
// where the receptive field is truncated, count for less.
//
// Reference: MONAI SlidingWindowInferer

use burn::prelude::*;
use std::ops::Range;

/// Smallest weight in the importance map.
const IMPORTANCE_FLOOR: f32 = 1e-3;

#[derive(Debug, Clone)]
pub struct SlidingWindowInferer {
    pub roi:           [usize; 3],
    pub sw_batch_size: usize,
    pub overlap:       f64,
    pub sigma_scale:   f64,
}

impl SlidingWindowInferer {
    pub fn new(roi: [usize; 3]) -> Self {
        Self { roi, sw_batch_size: 2, overlap: 0.5, sigma_scale: 0.125 }
    }

    /// input [N, C, X, Y, Z] → blended network output [N, C_out, X, Y, Z]
    pub fn infer<B, F>(&self, input: Tensor<B, 5>, net: F) -> Tensor<B, 5>
    where
        B: Backend,
        F: Fn(Tensor<B, 5>) -> Tensor<B, 5>,
    {
        let [n, c, x, y, z] = input.dims();
        let device = input.device();
        let spatial = [x, y, z];

        // ── 1. pad ────────────────────────────────────────────────────────────
        let mut before = [0usize; 3];
        let mut padded = input;
        for axis in 0..3 {
            let diff = self.roi[axis].saturating_sub(spatial[axis]);
            before[axis] = diff / 2;
            padded = pad_replicate_axis(padded, axis + 2, diff / 2, diff - diff / 2);
        }
        let [_, _, px, py, pz] = padded.dims();
        let padded_shape = [px, py, pz];

        // ── 2. windows ────────────────────────────────────────────────────────
        let starts: Vec<Vec<usize>> = (0..3)
            .map(|a| window_starts(padded_shape[a], self.roi[a], self.overlap))
            .collect();
        let mut windows = Vec::new();
        for &sx in &starts[0] {
            for &sy in &starts[1] {
                for &sz in &starts[2] {
                    windows.push([sx, sy, sz]);
                }
            }
        }

        let [rx, ry, rz] = self.roi;
        let importance = Tensor::<B, 5>::from_data(
            TensorData::new(gaussian_importance(self.roi, self.sigma_scale), [1, 1, rx, ry, rz]),
            &device,
        );

        // ── 3-4. run and accumulate ───────────────────────────────────────────
        let mut output: Option<Tensor<B, 5>> = None;
        let mut weight = Tensor::<B, 5>::zeros([1, 1, px, py, pz], &device);

        for group in windows.chunks(self.sw_batch_size.max(1)) {
            let tiles: Vec<Tensor<B, 5>> = group
                .iter()
                .map(|&s| padded.clone().slice(window_ranges(n, c, s, self.roi)))
                .collect();
            let logits = net(Tensor::cat(tiles, 0));
            let [_, c_out, _, _, _] = logits.dims();

            let mut acc = output
                .take()
                .unwrap_or_else(|| Tensor::zeros([n, c_out, px, py, pz], &device));

            for (i, &s) in group.iter().enumerate() {
                let tile = logits.clone().slice([i * n..(i + 1) * n, 0..c_out, 0..rx, 0..ry, 0..rz]);
                let out_ranges = window_ranges(n, c_out, s, self.roi);
                let current = acc.clone().slice(out_ranges.clone());
                acc = acc.slice_assign(out_ranges, current + tile * importance.clone());

                let w_ranges = window_ranges(1, 1, s, self.roi);
                let current = weight.clone().slice(w_ranges.clone());
                weight = weight.slice_assign(w_ranges, current + importance.clone());
            }
            output = Some(acc);
        }

        // ── 5. normalise and crop ─────────────────────────────────────────────
        let Some(acc) = output else {
            return Tensor::zeros([n, c, x, y, z], &device);
        };
        let [_, c_out, _, _, _] = acc.dims();
        let blended = acc / weight;
        blended.slice([
            0..n,
            0..c_out,
            before[0]..before[0] + x,
            before[1]..before[1] + y,
            before[2]..before[2] + z,
        ])
    }
}

/// Window start offsets along one axis.
pub fn window_starts(size: usize, roi: usize, overlap: f64) -> Vec<usize> {
    if roi >= size {
        return vec![0];
    }
    let step = ((roi as f64 * (1.0 - overlap)) as usize).max(1);
    let mut starts: Vec<usize> = (0..).map(|i| i * step).take_while(|&s| s + roi < size).collect();
    starts.push(size - roi);
    starts
}

fn window_ranges(n: usize, c: usize, start: [usize; 3], roi: [usize; 3]) -> [Range<usize>; 5] {
    [
        0..n,
        0..c,
        start[0]..start[0] + roi[0],
        start[1]..start[1] + roi[1],
        start[2]..start[2] + roi[2],
    ]
}

/// Separable Gaussian centred on the roi, normalised to a peak of 1.
pub fn gaussian_importance(roi: [usize; 3], sigma_scale: f64) -> Vec<f32> {
    let axis = |len: usize| -> Vec<f64> {
        let sigma  = (len as f64 * sigma_scale).max(f64::EPSILON);
        let centre = (len / 2) as f64;
        (0..len)
            .map(|i| (-((i as f64 - centre).powi(2)) / (2.0 * sigma * sigma)).exp())
            .collect()
    };
    let (gx, gy, gz) = (axis(roi[0]), axis(roi[1]), axis(roi[2]));

    let mut map = Vec::with_capacity(roi.iter().product());
    for a in &gx {
        for b in &gy {
            for c in &gz {
                map.push(a * b * c);
            }
        }
    }
    let peak = map.iter().cloned().fold(f64::MIN, f64::max).max(f64::EPSILON);
    map.into_iter()
        .map(|v| ((v / peak) as f32).max(IMPORTANCE_FLOOR))
        .collect()
}

/// Repeat the first / last slice along `dim` `before` / `after` times.
pub fn pad_replicate_axis<B: Backend>(x: Tensor<B, 5>, dim: usize, before: usize, after: usize) -> Tensor<B, 5> {
    if before == 0 && after == 0 {
        return x;
    }
    let dims = x.dims();
    let edge = |at: usize, times: usize| -> Tensor<B, 5> {
        let mut ranges: [Range<usize>; 5] = std::array::from_fn(|i| 0..dims[i]);
        ranges[dim] = at..at + 1;
        let mut shape = dims;
        shape[dim] = times;
        x.clone().slice(ranges).expand::<5, _>(Shape::new(shape))
    };

    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        parts.push(edge(0, before));
    }
    parts.push(x.clone());
    if after > 0 {
        parts.push(edge(dims[dim] - 1, after));
    }
    Tensor::cat(parts, dim)
}
