// ============================================================
// Layer 6 — Checkpoints
// ============================================================
// Saves and restores model weights with Burn's
// NamedMpkFileRecorder at full precision, so a reload gives
// back bit-identical f32 parameters.
//
// File naming convention (all under workdir):
//
//   <model_id>_fold<i>_epoch<e>_dice<score×10⁴>.mpk
//
//   e.g. SegResNet_DiceCELoss_fold0_epoch12_dice8731.mpk
//
// A CheckpointSaver belongs to one fold. It writes a checkpoint
// whenever the validation metric beats the best seen so far,
// and keeps only the `keep` highest-scoring files of that fold,
// deleting the lowest-scoring one when the limit is exceeded.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const CHECKPOINT_EXT: &str = "mpk";

type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Write `model` to `path`, adding `.mpk` if it is missing.
pub fn save_model<B: Backend, M: Module<B>>(model: &M, path: &Path) -> Result<PathBuf> {
    let path = with_extension(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    ModelRecorder::new()
        .record(model.clone().into_record(), path.clone())
        .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;
    Ok(path)
}

/// Load weights from `path` (with or without `.mpk`) into `model`.
/// The architecture must match the one that was saved.
pub fn load_model<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<M> {
    let path = with_extension(path);
    let record = ModelRecorder::new()
        .load(path.clone(), device)
        .with_context(|| {
            format!("Cannot load checkpoint '{}'. Does it match the configured model?", path.display())
        })?;
    tracing::info!("Loaded checkpoint '{}'", path.display());
    Ok(model.load_record(record))
}

/// `a/b` → `a/b.mpk`. Appends instead of replacing so ids containing
/// dots survive.
fn with_extension(path: &Path) -> PathBuf {
    let is_mpk = path.extension().is_some_and(|e| e == CHECKPOINT_EXT);
    if is_mpk {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(CHECKPOINT_EXT);
    PathBuf::from(name)
}

/// Persist a serialisable value (e.g. the run config) next to the checkpoints.
pub fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json).with_context(|| format!("Cannot write '{}'", path.display()))?;
    tracing::debug!("Saved '{}'", path.display());
    Ok(())
}

// ─── Top-K saver ──────────────────────────────────────────────────────────────
/// Keeps the best `keep` checkpoints of one fold on disk.
///
/// Every file it writes starts with the fold prefix
/// (`<model_id>_fold<i>`), so checkpoints of different folds can
/// share a workdir without ever evicting each other.
pub struct CheckpointSaver {
    dir:    PathBuf,
    prefix: String,
    keep:   usize,
    best:   f64,
    /// (score, path), best first
    saved:  Vec<(f64, PathBuf)>,
}

impl CheckpointSaver {
    /// Create a saver for one fold.
    /// Creates `dir` if it doesn't already exist; `keep` is at least 1.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, keep: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            keep:   keep.max(1),
            best:   f64::NEG_INFINITY,
            saved:  Vec::new(),
        })
    }

    /// Highest score saved so far.
    ///
    /// Starts at negative infinity, so the first finite score is
    /// always an improvement and always produces a checkpoint.
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Files still on disk, best first.
    /// Evicted checkpoints are no longer listed.
    pub fn saved(&self) -> impl Iterator<Item = &Path> {
        self.saved.iter().map(|(_, p)| p.as_path())
    }

    /// Best checkpoint written so far.
    pub fn best_path(&self) -> Option<&Path> {
        self.saved.first().map(|(_, p)| p.as_path())
    }

    /// File name for a checkpoint of `epoch` scoring `score`.
    ///
    /// The score is stored as an integer in units of 10⁻⁴ so the name
    /// has no second dot; e.g. 0.87314 → `dice8731`.
    pub fn file_name(&self, epoch: usize, score: f64) -> String {
        let scaled = (score.clamp(0.0, 1.0) * 1e4).round() as u32;
        format!("{}_epoch{epoch}_dice{scaled:04}.{CHECKPOINT_EXT}", self.prefix)
    }

    /// Save `model` if `score` strictly beats the best so far.
    /// Returns the new file, or `None` when nothing was written.
    pub fn consider<B: Backend, M: Module<B>>(
        &mut self,
        model: &M,
        epoch: usize,
        score: f64,
    ) -> Result<Option<PathBuf>> {
        if !score.is_finite() || score <= self.best {
            return Ok(None);
        }
        let path = save_model(model, &self.dir.join(self.file_name(epoch, score)))?;
        self.best = score;
        self.saved.push((score, path.clone()));
        self.saved.sort_by(|a, b| b.0.total_cmp(&a.0));

        while self.saved.len() > self.keep {
            if let Some((old_score, old)) = self.saved.pop() {
                fs::remove_file(&old)
                    .with_context(|| format!("Cannot remove old checkpoint '{}'", old.display()))?;
                tracing::debug!("Evicted checkpoint '{}' (dice={:.4})", old.display(), old_score);
            }
        }

        tracing::info!("Saved checkpoint '{}' (dice={:.4})", path.display(), score);
        Ok(Some(path))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::NdArray,
        nn::{Linear, LinearConfig},
    };

    type TestBackend = NdArray<f32>;

    fn model() -> Linear<TestBackend> {
        LinearConfig::new(3, 2).init(&Default::default())
    }

    fn files_with_prefix(dir: &Path, prefix: &str) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(prefix))
            .count()
    }

    #[test]
    fn test_round_trip_is_exact() {
        let dir   = tempfile::tempdir().unwrap();
        let saved = model();
        let path  = save_model(&saved, &dir.path().join("net")).unwrap();
        assert!(path.ends_with("net.mpk"));

        let loaded = load_model(model(), &dir.path().join("net"), &Default::default()).unwrap();
        let a: Vec<f32> = saved.weight.val().into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.weight.val().into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_saves_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = CheckpointSaver::new(dir.path(), "m_fold0", 20).unwrap();
        let net = model();
        assert!(saver.consider(&net, 1, 0.5).unwrap().is_some());
        assert!(saver.consider(&net, 2, 0.5).unwrap().is_none());
        assert!(saver.consider(&net, 3, 0.4).unwrap().is_none());
        assert!(saver.consider(&net, 4, f64::NAN).unwrap().is_none());
        assert!(saver.consider(&net, 5, 0.6).unwrap().is_some());
        assert_eq!(files_with_prefix(dir.path(), "m_fold0"), 2);
    }

    #[test]
    fn test_keeps_top_twenty() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = CheckpointSaver::new(dir.path(), "m_fold1", 20).unwrap();
        let net = model();
        for epoch in 1..=25 {
            saver.consider(&net, epoch, epoch as f64 / 100.0).unwrap();
        }
        assert_eq!(files_with_prefix(dir.path(), "m_fold1"), 20);
        // epochs 6..=25 survive
        assert!(!dir.path().join(saver.file_name(5, 0.05)).exists());
        assert!(dir.path().join(saver.file_name(6, 0.06)).exists());
        assert_eq!(saver.best_path().unwrap(), dir.path().join(saver.file_name(25, 0.25)));
    }

    #[test]
    fn test_file_name_format() {
        let dir   = tempfile::tempdir().unwrap();
        let saver = CheckpointSaver::new(dir.path(), "SegResNet_fold2", 20).unwrap();
        assert_eq!(saver.file_name(7, 0.87314), "SegResNet_fold2_epoch7_dice8731.mpk");
    }

    #[test]
    fn test_extension_appended_not_replaced() {
        assert_eq!(with_extension(Path::new("w/model.v2_fold0")), PathBuf::from("w/model.v2_fold0.mpk"));
        assert_eq!(with_extension(Path::new("w/a.mpk")), PathBuf::from("w/a.mpk"));
    }
}
