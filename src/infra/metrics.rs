// ============================================================
// Layer 6 — Segmentation Metrics and Logs
// ============================================================
// Host-side metrics on discrete label maps, plus the two CSV
// files a run produces.
//
// Dice, per foreground class k:
//
//   dice_k = 2·|P_k ∩ T_k| / (|P_k| + |T_k|)
//
//   both empty → 1.0, exactly one empty → 0.0.
//   The reported score is the mean over k = 1..num_classes.
//
// Hausdorff distance between the foreground (label > 0) masks:
//
//   1. boundary = mask voxels with a 6-neighbour outside the mask
//      (voxels on the volume border count as boundary)
//   2. exact Euclidean distance transform of each boundary
//      (Felzenszwalb & Huttenlocher, separable per axis)
//   3. HD = max over both directions of the largest distance from
//      a boundary voxel to the other boundary, in voxels
//
//   either mask empty → +∞.
//
// Output files:
//   <workdir>/metrics_fold<i>.csv   one row per epoch
//   <prediction_folder>/results.csv one row per test sample
//
// Reference: Taha & Hanbury (2015) Metrics for evaluating 3D
//            medical image segmentation
//            Felzenszwalb & Huttenlocher (2012) Distance
//            Transforms of Sampled Functions

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

/// Stand-in for +∞ inside the distance transform.
const FAR: f64 = 1e20;

// ─── Dice ─────────────────────────────────────────────────────────────────────
/// Dice overlap of one class between two flattened label maps.
///
/// Both slices must come from the same grid. A class absent from
/// both maps scores 1.0: predicting nothing where there is nothing
/// is a perfect answer, not an undefined one.
pub fn class_dice(pred: &[u8], truth: &[u8], class: u8) -> f64 {
    let (mut inter, mut p, mut t) = (0usize, 0usize, 0usize);
    for (&a, &b) in pred.iter().zip(truth) {
        let (in_p, in_t) = (a == class, b == class);
        p     += usize::from(in_p);
        t     += usize::from(in_t);
        inter += usize::from(in_p && in_t);
    }
    if p + t == 0 {
        return 1.0;
    }
    2.0 * inter as f64 / (p + t) as f64
}

/// Mean Dice over the foreground classes 1..num_classes.
pub fn dice_score(pred: &[u8], truth: &[u8], num_classes: usize) -> f64 {
    let classes = num_classes.max(2);
    let total: f64 = (1..classes).map(|k| class_dice(pred, truth, k as u8)).sum();
    total / (classes - 1) as f64
}

// ─── Hausdorff ────────────────────────────────────────────────────────────────
/// Symmetric Hausdorff distance between the foreground surfaces of
/// two label maps on a `shape` grid, in voxels.
///
/// Returns `f64::INFINITY` when either map has no foreground; the
/// results table writes that as `inf` instead of inventing a distance.
pub fn hausdorff_distance(pred: &[u8], truth: &[u8], shape: [usize; 3]) -> f64 {
    let pred_mask:  Vec<bool> = pred.iter().map(|&v| v > 0).collect();
    let truth_mask: Vec<bool> = truth.iter().map(|&v| v > 0).collect();
    if !pred_mask.contains(&true) || !truth_mask.contains(&true) {
        return f64::INFINITY;
    }

    let pred_edge  = boundary(&pred_mask, shape);
    let truth_edge = boundary(&truth_mask, shape);
    let to_truth   = squared_edt(&truth_edge, shape);
    let to_pred    = squared_edt(&pred_edge, shape);

    let directed = |edge: &[bool], dist: &[f64]| -> f64 {
        edge.iter()
            .zip(dist)
            .filter(|(&e, _)| e)
            .map(|(_, &d)| d)
            .fold(0.0, f64::max)
    };
    directed(&pred_edge, &to_truth)
        .max(directed(&truth_edge, &to_pred))
        .sqrt()
}

/// Mask voxels with at least one 6-neighbour outside the mask.
fn boundary(mask: &[bool], [sx, sy, sz]: [usize; 3]) -> Vec<bool> {
    let at = |x: usize, y: usize, z: usize| mask[(x * sy + y) * sz + z];
    let mut edge = vec![false; mask.len()];
    for x in 0..sx {
        for y in 0..sy {
            for z in 0..sz {
                if !at(x, y, z) {
                    continue;
                }
                let on_border = x == 0 || y == 0 || z == 0 || x + 1 == sx || y + 1 == sy || z + 1 == sz;
                edge[(x * sy + y) * sz + z] = on_border
                    || !at(x - 1, y, z) || !at(x + 1, y, z)
                    || !at(x, y - 1, z) || !at(x, y + 1, z)
                    || !at(x, y, z - 1) || !at(x, y, z + 1);
            }
        }
    }
    edge
}

/// Squared Euclidean distance from every voxel to the nearest seed.
pub fn squared_edt(seeds: &[bool], [sx, sy, sz]: [usize; 3]) -> Vec<f64> {
    let mut dist: Vec<f64> = seeds.iter().map(|&s| if s { 0.0 } else { FAR }).collect();
    let mut line = Vec::new();
    let mut out  = Vec::new();

    // one pass per axis; (len, stride, starting offsets)
    let passes: [(usize, usize, Vec<usize>); 3] = [
        (sz, 1, (0..sx * sy).map(|i| i * sz).collect()),
        (sy, sz, (0..sx).flat_map(|x| (0..sz).map(move |z| x * sy * sz + z)).collect()),
        (sx, sy * sz, (0..sy * sz).collect()),
    ];
    for (len, stride, starts) in passes.iter() {
        for &start in starts {
            line.clear();
            line.extend((0..*len).map(|i| dist[start + i * stride]));
            out.resize(*len, 0.0);
            edt_1d(&line, &mut out);
            for (i, &d) in out.iter().enumerate() {
                dist[start + i * stride] = d;
            }
        }
    }
    dist
}

/// Lower envelope of parabolas rooted at (q, f[q]).
fn edt_1d(f: &[f64], d: &mut [f64]) {
    let n = f.len();
    if n == 0 {
        return;
    }
    let mut v = vec![0usize; n];
    let mut z = vec![0f64; n + 1];
    let mut k = 0usize;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;

    let cross = |q: usize, p: usize| -> f64 {
        let (qf, pf) = (q as f64, p as f64);
        ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * qf - 2.0 * pf)
    };

    for q in 1..n {
        let mut s = cross(q, v[k]);
        while k > 0 && s <= z[k] {
            k -= 1;
            s = cross(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }

    k = 0;
    for (q, slot) in d.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let diff = q as f64 - v[k] as f64;
        *slot = diff * diff + f[v[k]];
    }
}

// ─── Accumulator ──────────────────────────────────────────────────────────────
/// Running mean over one evaluation pass. NaN values are skipped.
#[derive(Debug, Default, Clone)]
pub struct MetricAccumulator {
    sum:   f64,
    count: usize,
}

impl MetricAccumulator {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn push(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.sum   += value;
        self.count += 1;
    }

    /// NaN when nothing has been pushed.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.sum / self.count as f64
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

// ─── Per-epoch log ────────────────────────────────────────────────────────────
/// One row of metrics data for a single training epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub fold:       usize,
    /// The epoch number (starts at 1)
    pub epoch:      usize,
    /// Mean loss over all training iterations of the epoch
    pub train_loss: f64,
    /// Mean foreground Dice on the validation set
    pub val_dice:   f64,
    /// LR used for the last iteration of the epoch
    pub lr:         f64,
}

impl EpochMetrics {
    /// Higher Dice is better; NaN never improves.
    pub fn is_improvement(&self, best_val_dice: f64) -> bool {
        self.val_dice > best_val_dice || (best_val_dice.is_nan() && !self.val_dice.is_nan())
    }
}

/// Appends epoch metrics to `<dir>/metrics_fold<i>.csv`.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet.
    pub fn new(dir: &Path, fold: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create '{}'", dir.display()))?;
        let csv_path = dir.join(format!("metrics_fold{fold}.csv"));

        if !csv_path.exists() {
            let mut w = csv::Writer::from_path(&csv_path)
                .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
            w.write_record(["fold", "epoch", "train_loss", "val_dice", "lr"])?;
            w.flush()?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }
        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot append to '{}'", self.csv_path.display()))?;
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        w.serialize(m)?;
        w.flush()?;

        tracing::debug!(
            "Logged fold {} epoch {}: train_loss={:.4}, val_dice={:.4}",
            m.fold, m.epoch, m.train_loss, m.val_dice,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ─── Test results ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub id:                 String,
    pub dice_score:         f64,
    pub hausdorff_distance: f64,
}

#[derive(Debug, Default)]
pub struct ResultsTable {
    rows: Vec<ResultRow>,
}

impl ResultsTable {
    pub fn push(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn mean_dice(&self) -> f64 {
        let mut acc = MetricAccumulator::default();
        self.rows.iter().for_each(|r| acc.push(r.dice_score));
        acc.mean()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut w = csv::Writer::from_path(path)
            .with_context(|| format!("Cannot write results to '{}'", path.display()))?;
        if self.rows.is_empty() {
            w.write_record(["id", "dice_score", "hausdorff_distance"])?;
        }
        for row in &self.rows {
            w.serialize(row)?;
        }
        w.flush()?;
        tracing::info!("Wrote {} result rows to '{}'", self.rows.len(), path.display());
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn cube(shape: [usize; 3], lo: [usize; 3], hi: [usize; 3]) -> Vec<u8> {
        let mut v = vec![0u8; shape.iter().product()];
        for x in lo[0]..hi[0] {
            for y in lo[1]..hi[1] {
                for z in lo[2]..hi[2] {
                    v[(x * shape[1] + y) * shape[2] + z] = 1;
                }
            }
        }
        v
    }

    #[test]
    fn test_dice_identical_and_disjoint() {
        let a = cube([6, 6, 6], [1, 1, 1], [3, 3, 3]);
        let b = cube([6, 6, 6], [4, 4, 4], [6, 6, 6]);
        assert_eq!(dice_score(&a, &a, 2), 1.0);
        assert_eq!(dice_score(&a, &b, 2), 0.0);
    }

    #[test]
    fn test_dice_empty_cases() {
        let empty = vec![0u8; 8];
        let one   = vec![0, 0, 0, 1, 0, 0, 0, 0];
        assert_eq!(dice_score(&empty, &empty, 2), 1.0);
        assert_eq!(dice_score(&one, &empty, 2), 0.0);
    }

    #[test]
    fn test_dice_half_overlap() {
        let p = vec![1, 1, 0, 0];
        let t = vec![1, 0, 0, 0];
        assert!((dice_score(&p, &t, 2) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_edt_single_seed() {
        let shape = [5, 5, 5];
        let mut seeds = vec![false; 125];
        seeds[(2 * 5 + 2) * 5 + 2] = true;
        let d = squared_edt(&seeds, shape);
        assert_eq!(d[(2 * 5 + 2) * 5 + 2], 0.0);
        assert_eq!(d[0], 12.0);
        assert_eq!(d[(4 * 5 + 2) * 5 + 2], 4.0);
    }

    #[test]
    fn test_hausdorff_identical_is_zero() {
        let a = cube([8, 8, 8], [2, 2, 2], [5, 5, 5]);
        assert_eq!(hausdorff_distance(&a, &a, [8, 8, 8]), 0.0);
    }

    #[test]
    fn test_hausdorff_shifted_cube() {
        let a = cube([10, 10, 10], [2, 2, 2], [5, 5, 5]);
        let b = cube([10, 10, 10], [5, 2, 2], [8, 5, 5]);
        assert!((hausdorff_distance(&a, &b, [10, 10, 10]) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_hausdorff_empty_is_infinite() {
        let a = cube([4, 4, 4], [1, 1, 1], [2, 2, 2]);
        let e = vec![0u8; 64];
        assert!(hausdorff_distance(&a, &e, [4, 4, 4]).is_infinite());
    }

    #[test]
    fn test_accumulator_skips_nan() {
        let mut acc = MetricAccumulator::default();
        assert!(acc.mean().is_nan());
        acc.push(0.5);
        acc.push(f64::NAN);
        acc.push(1.0);
        assert_eq!(acc.mean(), 0.75);
        assert_eq!(acc.count(), 2);
        acc.reset();
        assert_eq!(acc.count(), 0);
    }

    #[test]
    fn test_is_improvement() {
        let m = EpochMetrics { fold: 0, epoch: 2, train_loss: 0.5, val_dice: 0.7, lr: 1e-3 };
        assert!(m.is_improvement(0.6));
        assert!(!m.is_improvement(0.7));
        assert!(m.is_improvement(f64::NAN));
    }

    #[test]
    fn test_metrics_logger_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetricsLogger::new(dir.path(), 3).unwrap();
        for epoch in 1..=2 {
            log.log(&EpochMetrics { fold: 3, epoch, train_loss: 1.0, val_dice: 0.5, lr: 1e-4 }).unwrap();
        }
        let text = fs::read_to_string(log.csv_path()).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("fold,epoch,train_loss,val_dice,lr"));
    }

    #[test]
    fn test_results_table_csv() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/results.csv");
        let mut table = ResultsTable::default();
        table.push(ResultRow { id: "case_1".into(), dice_score: 0.8, hausdorff_distance: 2.5 });
        table.write(&path).unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<ResultRow> = rdr.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "case_1");
        assert_eq!(rdr.headers().unwrap(), vec!["id", "dice_score", "hausdorff_distance"]);
    }
}
