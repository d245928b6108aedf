// ============================================================
// Layer 3 — Volume Domain Type
// ============================================================
// A dense 3D grid of f32 values with its voxel spacing.
//
// Memory layout is [x, y, z] with z varying fastest, which is
// the same order a Burn tensor of shape [.., X, Y, Z] uses.
// Label maps are stored in the same type with integral values.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Number of voxels along x, y and z
    pub shape: [usize; 3],

    /// Physical size of one voxel (mm) along x, y and z
    pub spacing: [f32; 3],

    /// Voxel values, `shape[0] * shape[1] * shape[2]` of them
    pub data: Vec<f32>,
}

impl Volume {
    pub fn new(shape: [usize; 3], spacing: [f32; 3], data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, spacing, data }
    }

    pub fn zeros(shape: [usize; 3], spacing: [f32; 3]) -> Self {
        Self::filled(shape, spacing, 0.0)
    }

    pub fn filled(shape: [usize; 3], spacing: [f32; 3], value: f32) -> Self {
        Self::new(shape, spacing, vec![value; shape.iter().product()])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.shape[1] + y) * self.shape[2] + z
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[self.offset(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f32) {
        let i = self.offset(x, y, z);
        self.data[i] = value;
    }

    /// Inverse of `offset`
    #[inline]
    pub fn coords(&self, index: usize) -> [usize; 3] {
        let z = index % self.shape[2];
        let y = (index / self.shape[2]) % self.shape[1];
        let x = index / (self.shape[1] * self.shape[2]);
        [x, y, z]
    }

    /// Smallest and largest value; (0, 0) for an empty volume
    pub fn min_max(&self) -> (f32, f32) {
        if self.data.is_empty() {
            return (0.0, 0.0);
        }
        self.data.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
    }

    /// Mirror the volume along one spatial axis (0 = x, 1 = y, 2 = z)
    pub fn flip(&self, axis: usize) -> Volume {
        let [sx, sy, sz] = self.shape;
        let mut out = Volume::zeros(self.shape, self.spacing);
        for x in 0..sx {
            for y in 0..sy {
                for z in 0..sz {
                    let (fx, fy, fz) = match axis {
                        0 => (sx - 1 - x, y, z),
                        1 => (x, sy - 1 - y, z),
                        _ => (x, y, sz - 1 - z),
                    };
                    out.set(x, y, z, self.get(fx, fy, fz));
                }
            }
        }
        out
    }

    /// Copy out the box `[start, start + size)`.
    /// The box must lie inside the volume.
    pub fn crop(&self, start: [usize; 3], size: [usize; 3]) -> Volume {
        let mut out = Volume::zeros(size, self.spacing);
        for x in 0..size[0] {
            for y in 0..size[1] {
                let src = self.offset(start[0] + x, start[1] + y, start[2]);
                let dst = out.offset(x, y, 0);
                out.data[dst..dst + size[2]].copy_from_slice(&self.data[src..src + size[2]]);
            }
        }
        out
    }

    /// Grow every axis to at least `min_shape` by repeating edge voxels.
    /// Padding is split evenly, the extra voxel (odd difference) going
    /// after. Returns the padded volume and the leading pad per axis.
    pub fn pad_replicate(&self, min_shape: [usize; 3]) -> (Volume, [usize; 3]) {
        let mut before = [0usize; 3];
        let mut shape  = self.shape;
        for axis in 0..3 {
            let diff = min_shape[axis].saturating_sub(self.shape[axis]);
            before[axis] = diff / 2;
            shape[axis] += diff;
        }
        if shape == self.shape {
            return (self.clone(), before);
        }

        let clamp = |v: usize, lead: usize, size: usize| v.saturating_sub(lead).min(size - 1);
        let mut out = Volume::zeros(shape, self.spacing);
        for x in 0..shape[0] {
            let sx = clamp(x, before[0], self.shape[0]);
            for y in 0..shape[1] {
                let sy = clamp(y, before[1], self.shape[1]);
                for z in 0..shape[2] {
                    let sz = clamp(z, before[2], self.shape[2]);
                    out.set(x, y, z, self.get(sx, sy, sz));
                }
            }
        }
        (out, before)
    }

    /// Round every voxel to the nearest class id
    pub fn to_labels(&self) -> Vec<u8> {
        self.data.iter().map(|&v| v.round().clamp(0.0, 255.0) as u8).collect()
    }

    pub fn from_labels(shape: [usize; 3], spacing: [f32; 3], labels: &[u8]) -> Volume {
        Volume::new(shape, spacing, labels.iter().map(|&l| l as f32).collect())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: [usize; 3]) -> Volume {
        let n = shape.iter().product::<usize>();
        Volume::new(shape, [1.0; 3], (0..n).map(|v| v as f32).collect())
    }

    #[test]
    fn test_offset_and_coords_agree() {
        let v = ramp([3, 4, 5]);
        for i in 0..v.len() {
            let [x, y, z] = v.coords(i);
            assert_eq!(v.offset(x, y, z), i);
        }
    }

    #[test]
    fn test_flip_twice_is_identity() {
        let v = ramp([2, 3, 4]);
        for axis in 0..3 {
            assert_eq!(v.flip(axis).flip(axis), v);
        }
        assert_eq!(v.flip(2).get(0, 0, 0), v.get(0, 0, 3));
    }

    #[test]
    fn test_crop_copies_box() {
        let v = ramp([4, 4, 4]);
        let c = v.crop([1, 2, 3], [2, 2, 1]);
        assert_eq!(c.shape, [2, 2, 1]);
        assert_eq!(c.get(0, 0, 0), v.get(1, 2, 3));
        assert_eq!(c.get(1, 1, 0), v.get(2, 3, 3));
    }

    #[test]
    fn test_pad_replicate_repeats_edges() {
        let v = ramp([1, 2, 2]);
        let (p, before) = v.pad_replicate([3, 2, 3]);
        assert_eq!(p.shape, [3, 2, 3]);
        assert_eq!(before, [1, 0, 0]);
        // every x slice is a copy of the single source slice
        assert_eq!(p.get(0, 1, 1), v.get(0, 1, 1));
        assert_eq!(p.get(2, 1, 1), v.get(0, 1, 1));
        // z grew 2 → 3, the extra voxel repeats the last one
        assert_eq!(p.get(1, 0, 2), v.get(0, 0, 1));
    }

    #[test]
    fn test_pad_noop_when_large_enough() {
        let v = ramp([4, 4, 4]);
        let (p, before) = v.pad_replicate([2, 2, 2]);
        assert_eq!(p, v);
        assert_eq!(before, [0, 0, 0]);
    }

    #[test]
    fn test_min_max() {
        let v = Volume::new([1, 1, 3], [1.0; 3], vec![2.0, -1.0, 5.0]);
        assert_eq!(v.min_max(), (-1.0, 5.0));
    }
}
