// ============================================================
// Layer 4 — Volume Transforms
// ============================================================
// Two groups of transforms, mirroring how the dataset uses them:
//
//   Deterministic (run once per sample, result cached):
//     1. optional resampling to a target voxel spacing
//        (trilinear for images, nearest for labels)
//     2. min-max intensity scaling of the image to [0, 1]
//
//   Random (train mode only, run on every dataset access):
//     1. replicate-pad to at least the patch size
//     2. random rotation + scaling about the volume centre
//        (trilinear image, nearest label, reflected borders)
//     3. crop one patch centred on a foreground or background
//        voxel (equal odds), like RandCropByPosNegLabel
//     4. Gaussian noise on the image
//     5. independent flips along x, y and z
//
// Image and label always receive the same spatial operations.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::domain::volume::Volume;

// ─── Augmentation settings ────────────────────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Replicate-pad volumes smaller than the patch before cropping
    pub pad_to_roi:   bool,
    /// Patches drawn per volume per epoch
    pub crop_samples: usize,
    /// Probability that a patch is centred on a foreground voxel
    pub pos_ratio:    f64,
    /// Probability of adding Gaussian noise to the image
    pub noise_prob:   f64,
    /// Standard deviation of that noise
    pub noise_std:    f32,
    /// Probability of flipping along each axis
    pub flip_prob:    f64,
    /// Probability of a random rotation + scaling
    pub affine_prob:  f64,
    /// Rotation about x, y, z drawn from ±range (radians)
    pub rotate_range: [f32; 3],
    /// Scale factor along x, y, z drawn from 1 ± range
    pub scale_range:  [f32; 3],
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            pad_to_roi:   true,
            crop_samples: 3,
            pos_ratio:    0.5,
            noise_prob:   0.15,
            noise_std:    0.01,
            flip_prob:    0.5,
            affine_prob:  0.25,
            rotate_range: [0.1, 0.1, 0.0],
            scale_range:  [0.2, 0.2, 0.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interp {
    Linear,
    Nearest,
}

// ─── Deterministic preprocessing ──────────────────────────────────────────────
/// The cacheable part of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Preprocess {
    /// Target voxel spacing; `None` keeps the native grid
    pub pixdim: Option<[f32; 3]>,
}

impl Preprocess {
    pub fn new(pixdim: Option<[f32; 3]>) -> Self {
        Self { pixdim }
    }

    pub fn image(&self, volume: &Volume) -> Volume {
        let mut out = self.respace(volume, Interp::Linear);
        scale_intensity(&mut out, 0.0, 1.0);
        out
    }

    pub fn label(&self, volume: &Volume) -> Volume {
        self.respace(volume, Interp::Nearest)
    }

    fn respace(&self, volume: &Volume, interp: Interp) -> Volume {
        match self.pixdim {
            Some(target) => {
                let shape = spacing_shape(volume.shape, volume.spacing, target);
                let mut out = resample(volume, shape, interp);
                out.spacing = target;
                out
            }
            None => volume.clone(),
        }
    }
}

/// Linearly map values to `[minv, maxv]`. A constant volume maps to `minv`.
pub fn scale_intensity(volume: &mut Volume, minv: f32, maxv: f32) {
    let (lo, hi) = volume.min_max();
    if hi - lo <= f32::EPSILON {
        volume.data.iter_mut().for_each(|v| *v = minv);
        return;
    }
    let scale = (maxv - minv) / (hi - lo);
    volume.data.iter_mut().for_each(|v| *v = (*v - lo) * scale + minv);
}

/// Voxel counts after resampling from `spacing` to `target`.
pub fn spacing_shape(shape: [usize; 3], spacing: [f32; 3], target: [f32; 3]) -> [usize; 3] {
    let mut out = [1usize; 3];
    for i in 0..3 {
        let extent = shape[i] as f32 * spacing[i];
        out[i] = ((extent / target[i]).round() as usize).max(1);
    }
    out
}

/// Resize `volume` to `shape` (half-voxel aligned sampling).
/// Spacing is scaled so the physical extent is unchanged.
pub fn resample(volume: &Volume, shape: [usize; 3], interp: Interp) -> Volume {
    if shape == volume.shape {
        return volume.clone();
    }
    let mut spacing = volume.spacing;
    let mut ratio   = [1f32; 3];
    for i in 0..3 {
        ratio[i]   = volume.shape[i] as f32 / shape[i] as f32;
        spacing[i] *= ratio[i];
    }
    let src = |o: usize, axis: usize| -> f32 {
        let s = (o as f32 + 0.5) * ratio[axis] - 0.5;
        s.clamp(0.0, (volume.shape[axis] - 1) as f32)
    };

    let mut out = Volume::zeros(shape, spacing);
    for x in 0..shape[0] {
        let fx = src(x, 0);
        for y in 0..shape[1] {
            let fy = src(y, 1);
            for z in 0..shape[2] {
                let fz = src(z, 2);
                let v = match interp {
                    Interp::Nearest => volume.get(
                        fx.round() as usize,
                        fy.round() as usize,
                        fz.round() as usize,
                    ),
                    Interp::Linear => trilinear(volume, fx, fy, fz),
                };
                out.set(x, y, z, v);
            }
        }
    }
    out
}

fn trilinear(v: &Volume, fx: f32, fy: f32, fz: f32) -> f32 {
    let (x0, y0, z0) = (fx.floor() as usize, fy.floor() as usize, fz.floor() as usize);
    let x1 = (x0 + 1).min(v.shape[0] - 1);
    let y1 = (y0 + 1).min(v.shape[1] - 1);
    let z1 = (z0 + 1).min(v.shape[2] - 1);
    let (dx, dy, dz) = (fx - x0 as f32, fy - y0 as f32, fz - z0 as f32);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    let c00 = lerp(v.get(x0, y0, z0), v.get(x1, y0, z0), dx);
    let c01 = lerp(v.get(x0, y0, z1), v.get(x1, y0, z1), dx);
    let c10 = lerp(v.get(x0, y1, z0), v.get(x1, y1, z0), dx);
    let c11 = lerp(v.get(x0, y1, z1), v.get(x1, y1, z1), dx);
    lerp(lerp(c00, c10, dy), lerp(c01, c11, dy), dz)
}

// ─── Random augmentation ──────────────────────────────────────────────────────
/// Draws one augmented training patch per call.
#[derive(Debug, Clone)]
pub struct RandomAugment {
    cfg: AugmentConfig,
    roi: [usize; 3],
}

impl RandomAugment {
    pub fn new(cfg: AugmentConfig, roi: [usize; 3]) -> Self {
        Self { cfg, roi }
    }

    pub fn crop_samples(&self) -> usize {
        self.cfg.crop_samples.max(1)
    }

    pub fn apply<R: Rng>(&self, image: &Volume, label: &Volume, rng: &mut R) -> (Volume, Volume) {
        let (mut image, mut label) = if self.cfg.pad_to_roi {
            (image.pad_replicate(self.roi).0, label.pad_replicate(self.roi).0)
        } else {
            (image.clone(), label.clone())
        };

        if rng.gen_bool(self.cfg.affine_prob.clamp(0.0, 1.0)) {
            let affine = Affine3::sample(self.cfg.rotate_range, self.cfg.scale_range, rng);
            image = affine.apply(&image, Interp::Linear);
            label = affine.apply(&label, Interp::Nearest);
        }

        let size: [usize; 3] = std::array::from_fn(|i| self.roi[i].min(image.shape[i]));
        let start = pick_crop_start(&label, size, self.cfg.pos_ratio, rng);
        image = image.crop(start, size);
        label = label.crop(start, size);

        if rng.gen_bool(self.cfg.noise_prob.clamp(0.0, 1.0)) {
            add_gaussian_noise(&mut image, self.cfg.noise_std, rng);
        }

        for axis in 0..3 {
            if rng.gen_bool(self.cfg.flip_prob.clamp(0.0, 1.0)) {
                image = image.flip(axis);
                label = label.flip(axis);
            }
        }

        (image, label)
    }
}

/// Start corner of a `size` crop whose centre sits on a randomly
/// chosen foreground (probability `pos_ratio`) or background voxel,
/// shifted as needed to keep the crop inside the volume.
pub fn pick_crop_start<R: Rng>(label: &Volume, size: [usize; 3], pos_ratio: f64, rng: &mut R) -> [usize; 3] {
    let want_fg = rng.gen_bool(pos_ratio.clamp(0.0, 1.0));
    let (fg, bg): (Vec<usize>, Vec<usize>) = (0..label.len()).partition(|&i| label.data[i] > 0.5);

    let pool = match (want_fg, fg.is_empty(), bg.is_empty()) {
        (true, false, _) | (false, _, true) => &fg,
        _ => &bg,
    };
    let center = if pool.is_empty() {
        [label.shape[0] / 2, label.shape[1] / 2, label.shape[2] / 2]
    } else {
        label.coords(pool[rng.gen_range(0..pool.len())])
    };

    std::array::from_fn(|i| {
        let max_start = label.shape[i] - size[i];
        center[i].saturating_sub(size[i] / 2).min(max_start)
    })
}

/// Rotation and scaling about the volume centre, in voxel units.
///
/// `m` maps an output voxel (relative to the centre) to the position it
/// is read from in the input, so `apply` is a pure resampling pass and
/// the output keeps the input's shape and spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine3 {
    m: [[f32; 3]; 3],
}

impl Affine3 {
    pub fn identity() -> Self {
        Self::from_params([0.0; 3], [1.0; 3])
    }

    /// Rx(angles[0]) · Ry(angles[1]) · Rz(angles[2]) · diag(scales)
    pub fn from_params(angles: [f32; 3], scales: [f32; 3]) -> Self {
        let (sx, cx) = angles[0].sin_cos();
        let (sy, cy) = angles[1].sin_cos();
        let (sz, cz) = angles[2].sin_cos();
        let rx = [[1.0, 0.0, 0.0], [0.0, cx, -sx], [0.0, sx, cx]];
        let ry = [[cy, 0.0, sy], [0.0, 1.0, 0.0], [-sy, 0.0, cy]];
        let rz = [[cz, -sz, 0.0], [sz, cz, 0.0], [0.0, 0.0, 1.0]];

        let mut m = matmul(matmul(rx, ry), rz);
        for row in m.iter_mut() {
            for (j, v) in row.iter_mut().enumerate() {
                *v *= scales[j];
            }
        }
        Self { m }
    }

    /// Angles uniform in ±`rotate_range`, scales uniform in 1 ± `scale_range`.
    /// A zero range leaves that axis untouched.
    pub fn sample<R: Rng>(rotate_range: [f32; 3], scale_range: [f32; 3], rng: &mut R) -> Self {
        let mut symmetric = |range: f32| if range > 0.0 { rng.gen_range(-range..=range) } else { 0.0 };
        let angles = rotate_range.map(&mut symmetric);
        let scales = scale_range.map(|r| 1.0 + symmetric(r));
        Self::from_params(angles, scales)
    }

    pub fn apply(&self, volume: &Volume, interp: Interp) -> Volume {
        let shape  = volume.shape;
        let center = shape.map(|s| (s as f32 - 1.0) / 2.0);
        let mut out = Volume::zeros(shape, volume.spacing);

        for x in 0..shape[0] {
            for y in 0..shape[1] {
                for z in 0..shape[2] {
                    let c = [x as f32 - center[0], y as f32 - center[1], z as f32 - center[2]];
                    let src: [f32; 3] = std::array::from_fn(|i| {
                        let row = self.m[i];
                        reflect(row[0] * c[0] + row[1] * c[1] + row[2] * c[2] + center[i], shape[i])
                    });
                    let v = match interp {
                        Interp::Nearest => volume.get(
                            src[0].round() as usize,
                            src[1].round() as usize,
                            src[2].round() as usize,
                        ),
                        Interp::Linear => trilinear(volume, src[0], src[1], src[2]),
                    };
                    out.set(x, y, z, v);
                }
            }
        }
        out
    }
}

fn matmul(a: [[f32; 3]; 3], b: [[f32; 3]; 3]) -> [[f32; 3]; 3] {
    std::array::from_fn(|i| std::array::from_fn(|j| (0..3).map(|k| a[i][k] * b[k][j]).sum()))
}

/// Mirror `coord` back into `[0, size - 1]`.
fn reflect(coord: f32, size: usize) -> f32 {
    let last = (size - 1) as f32;
    if last <= 0.0 {
        return 0.0;
    }
    let c = coord.rem_euclid(2.0 * last);
    (if c > last { 2.0 * last - c } else { c }).clamp(0.0, last)
}

/// Add N(0, std²) to every voxel. A negative or NaN `std` leaves the volume as is.
pub fn add_gaussian_noise<R: Rng>(volume: &mut Volume, std: f32, rng: &mut R) {
    let Ok(normal) = Normal::new(0.0f32, std) else {
        return;
    };
    volume.data.iter_mut().for_each(|v| *v += normal.sample(rng));
}
