// ============================================================
// Layer 2 — Run Configuration
// ============================================================
// Everything a run needs, read once from a .toml or .json file
// and never mutated afterwards (except the CLI's --output
// override, applied before anything else runs).
//
//   model_id, workdir, seed, epochs, amp, batch_size,
//   num_workers, imgsize          scalars
//   loss / optimizer / model /
//   scheduler                     { name, params } registry entries
//   data.{train,valid,test}       { imgdir, imgsize, batch_size, loader }
//   tta, augment                  optional tables with defaults
//
// Serialisable so the effective config is written next to the
// checkpoints at the start of training.

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::data::transforms::AugmentConfig;
use crate::ml::{
    factory::{model_config, LossSpec, ModelSpec, OptimizerSpec, SchedulerSpec},
    tta::TtaConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Read { path: String, source: io::Error },

    #[error("cannot parse config '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("unsupported config format '{path}' (expected .toml or .json)")]
    Format { path: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ─── Data sections ────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub shuffle:     bool,
    /// Falls back to the top-level `num_workers`
    pub num_workers: Option<usize>,
    /// Accepted for compatibility; host/device transfers are
    /// managed by the backend
    pub pin_memory:  bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSection {
    pub imgdir:     PathBuf,
    #[serde(default)]
    pub imgsize:    Option<[usize; 3]>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub loader:     LoaderConfig,
}

impl DataSection {
    pub fn imgsize(&self, cfg: &RunConfig) -> [usize; 3] {
        self.imgsize.unwrap_or(cfg.imgsize)
    }

    pub fn batch_size(&self, cfg: &RunConfig) -> usize {
        self.batch_size.unwrap_or(cfg.batch_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train: DataSection,
    #[serde(default)]
    pub valid: Option<DataSection>,
    #[serde(default)]
    pub test:  Option<DataSection>,
}

// ─── RunConfig ────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model_id:    String,
    pub workdir:     PathBuf,
    #[serde(default = "default_seed")]
    pub seed:        u64,
    pub epochs:      usize,
    #[serde(default)]
    pub amp:         bool,
    #[serde(default = "default_batch_size")]
    pub batch_size:  usize,
    #[serde(default)]
    pub num_workers: usize,
    pub imgsize:     [usize; 3],

    pub loss:      LossSpec,
    pub optimizer: OptimizerSpec,
    pub model:     ModelSpec,
    #[serde(default)]
    pub scheduler: Option<SchedulerSpec>,

    pub data: DataConfig,

    #[serde(default = "default_num_classes")]
    pub num_classes:       usize,
    #[serde(default = "default_folds")]
    pub folds:             usize,
    #[serde(default = "default_checkpoints_kept")]
    pub checkpoints_kept:  usize,
    #[serde(default)]
    pub prediction_folder: Option<PathBuf>,
    /// Target voxel spacing; absent keeps each volume's own spacing
    #[serde(default)]
    pub pixdim:            Option<[f32; 3]>,
    #[serde(default)]
    pub tta:               TtaConfig,
    #[serde(default)]
    pub augment:           AugmentConfig,
}

fn default_seed() -> u64 { 42 }
fn default_batch_size() -> usize { 1 }
fn default_num_classes() -> usize { 2 }
fn default_folds() -> usize { 5 }
fn default_checkpoints_kept() -> usize { 20 }

impl RunConfig {
    /// Parse `path` (by extension) and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let name = path.display().to_string();
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: name.clone(), source })?;

        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)
                .map_err(|e| ConfigError::Parse { path: name.clone(), message: e.to_string() })?,
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| ConfigError::Parse { path: name.clone(), message: e.to_string() })?,
            _ => return Err(ConfigError::Format { path: name }),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the values serde cannot: positive counts, probabilities in
    /// [0, 1], a model that can be built, and window sizes the network
    /// can take without a shape mismatch in its skip connections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.model_id.trim().is_empty() {
            return invalid("model_id is empty".into());
        }
        if self.epochs == 0 {
            return invalid("epochs must be positive".into());
        }
        if self.num_classes < 2 {
            return invalid(format!("num_classes must be at least 2, got {}", self.num_classes));
        }
        if self.checkpoints_kept == 0 {
            return invalid("checkpoints_kept must be positive".into());
        }
        if !self.uses_holdout() && self.folds < 2 {
            return invalid(format!("k-fold training needs folds >= 2, got {}", self.folds));
        }

        let sections = [Some(&self.data.train), self.data.valid.as_ref(), self.data.test.as_ref()];
        for section in sections.into_iter().flatten() {
            if section.batch_size(self) == 0 {
                return invalid(format!("batch_size for '{}' must be positive", section.imgdir.display()));
            }
            if section.imgsize(self).contains(&0) {
                return invalid(format!("imgsize for '{}' has a zero entry", section.imgdir.display()));
            }
        }

        let model = model_config(&self.model).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if model.out_channels != self.num_classes {
            return invalid(format!(
                "model out_channels={} but num_classes={}",
                model.out_channels, self.num_classes,
            ));
        }
        // every section's imgsize is a crop / window fed straight to the network
        let divisor = model.size_divisor();
        if self.imgsize.iter().any(|s| s % divisor != 0) {
            return invalid(format!("imgsize {:?} must be divisible by {}", self.imgsize, divisor));
        }
        for section in sections.into_iter().flatten() {
            let size = section.imgsize(self);
            if size.iter().any(|s| s % divisor != 0) {
                return invalid(format!(
                    "imgsize {:?} for '{}' must be divisible by {}",
                    size, section.imgdir.display(), divisor,
                ));
            }
        }

        if self.augment.crop_samples == 0 {
            return invalid("augment.crop_samples must be positive".into());
        }
        for (key, p) in [
            ("pos_ratio", self.augment.pos_ratio),
            ("noise_prob", self.augment.noise_prob),
            ("flip_prob", self.augment.flip_prob),
            ("affine_prob", self.augment.affine_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("augment.{key}={p} is not a probability"));
            }
        }
        if self.augment.rotate_range.iter().chain(&self.augment.scale_range).any(|r| *r < 0.0) {
            return invalid("augment rotate_range / scale_range must not be negative".into());
        }
        if self.augment.scale_range.iter().any(|r| *r >= 1.0) {
            return invalid("augment.scale_range entries must be below 1".into());
        }
        if self.tta.noise_std < 0.0 || self.augment.noise_std < 0.0 {
            return invalid("noise_std must not be negative".into());
        }
        if let Some(p) = self.pixdim {
            if p.iter().any(|v| *v <= 0.0) {
                return invalid(format!("pixdim {p:?} must be positive"));
            }
        }
        Ok(())
    }

    /// True when `data.valid` names its own directory: one fold,
    /// trained on `data.train` and validated on `data.valid`.
    pub fn uses_holdout(&self) -> bool {
        self.data
            .valid
            .as_ref()
            .is_some_and(|v| v.imgdir != self.data.train.imgdir)
    }

    /// Section the validation loader is built from.
    pub fn valid_section(&self) -> &DataSection {
        self.data.valid.as_ref().unwrap_or(&self.data.train)
    }

    /// `data.test`, which only the test modes require.
    pub fn test_section(&self) -> Result<&DataSection, ConfigError> {
        self.data
            .test
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("data.test is required for this mode".into()))
    }

    pub fn prediction_folder(&self) -> PathBuf {
        self.prediction_folder
            .clone()
            .unwrap_or_else(|| self.workdir.join("output"))
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::nifti::{write_volume, NiftiHeader, VoxelKind};
    use crate::domain::volume::Volume;
    use tempfile::TempDir;

    /// A tiny labelled dataset plus a config that trains on it.
    pub(crate) struct Fixture {
        pub dir:    TempDir,
        pub config: RunConfig,
    }

    const SHAPE: [usize; 3] = [8, 8, 4];

    fn write_case(root: &Path, id: &str, with_mask: bool) {
        let header = NiftiHeader::for_shape(SHAPE, [1.0; 3]);
        let mut image = Volume::zeros(SHAPE, [1.0; 3]);
        let mut mask  = Volume::zeros(SHAPE, [1.0; 3]);
        for x in 2..6 {
            for y in 2..6 {
                for z in 1..3 {
                    image.set(x, y, z, 100.0);
                    mask.set(x, y, z, 1.0);
                }
            }
        }
        write_volume(&root.join("mri").join(format!("{id}.nii.gz")), &header, &image, VoxelKind::Float32)
            .unwrap();
        if with_mask {
            write_volume(&root.join("masks").join(format!("{id}.nii")), &header, &mask, VoxelKind::UInt8)
                .unwrap();
        }
    }

    pub(crate) fn fixture_toml(root: &Path, epochs: usize) -> String {
        format!(
            r#"
model_id = "SegResNet_DiceCELoss_test"
workdir  = '{work}'
seed     = 7
epochs   = {epochs}
batch_size  = 1
num_workers = 0
imgsize  = [4, 4, 4]
checkpoints_kept = 20

[loss]
name   = "DiceCELoss"
params = {{ include_background = false, to_onehot_y = true, softmax = true }}

[optimizer]
name   = "Adam"
params = {{ lr = 3e-4 }}

[model]
name   = "SegResNet"
params = {{ init_filters = 4, num_groups = 2, blocks_down = [1, 1], blocks_up = [1] }}

[scheduler]
name   = "CosineAnnealingScheduler"
params = {{ param_name = "lr", start_value = 3e-5, end_value = 3e-3 }}

[data.train]
imgdir = '{train}'

[data.valid]
imgdir     = '{train}'
batch_size = 1

[data.test]
imgdir     = '{test}'
batch_size = 1

[tta]
noise_passes = 1

[augment]
crop_samples = 1
"#,
            work  = root.join("work").display(),
            train = root.join("train").display(),
            test  = root.join("test").display(),
        )
    }

    pub(crate) fn write_fixture(epochs: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        write_case(&dir.path().join("train"), "case_001", true);
        write_case(&dir.path().join("test"), "case_101", true);

        let path = dir.path().join("run.toml");
        fs::write(&path, fixture_toml(dir.path(), epochs)).unwrap();
        let config = RunConfig::load(&path).unwrap();
        Fixture { dir, config }
    }

    #[test]
    fn test_fixture_parses_with_defaults() {
        let fixture = write_fixture(2);
        let cfg = &fixture.config;
        assert_eq!(cfg.epochs, 2);
        assert_eq!(cfg.num_classes, 2);
        assert_eq!(cfg.folds, 5);
        assert_eq!(cfg.loss.name(), "DiceCELoss");
        assert_eq!(cfg.optimizer.lr(), 3e-4);
        assert!(cfg.augment.pad_to_roi);
        assert_eq!(cfg.tta.noise_passes, 1);
        assert!(!cfg.uses_holdout());
        assert_eq!(cfg.prediction_folder(), cfg.workdir.join("output"));
    }

    #[test]
    fn test_unknown_loss_is_a_parse_error() {
        let dir  = tempfile::tempdir().unwrap();
        let text = fixture_toml(dir.path(), 1).replace("DiceCELoss\"\nparams", "TverskyLoss\"\nparams");
        let path = dir.path().join("bad.toml");
        fs::write(&path, text).unwrap();
        assert!(matches!(RunConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_json_round_trip() {
        let fixture = write_fixture(1);
        let path = fixture.dir.path().join("run.json");
        fs::write(&path, serde_json::to_string_pretty(&fixture.config).unwrap()).unwrap();
        let back = RunConfig::load(&path).unwrap();
        assert_eq!(back.model_id, fixture.config.model_id);
        assert_eq!(back.loss, fixture.config.loss);
    }

    #[test]
    fn test_unknown_extension() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(&path, "epochs: 1").unwrap();
        assert!(matches!(RunConfig::load(&path), Err(ConfigError::Format { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let fixture = write_fixture(1);

        let mut cfg = fixture.config.clone();
        cfg.epochs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = fixture.config.clone();
        cfg.imgsize = [3, 4, 4];
        assert!(cfg.validate().is_err());

        let mut cfg = fixture.config.clone();
        cfg.num_classes = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = fixture.config.clone();
        cfg.folds = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = fixture.config.clone();
        cfg.augment.affine_prob = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = fixture.config.clone();
        cfg.augment.scale_range = [0.2, -0.1, 0.0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_section_imgsize_must_fit_network_depth() {
        let fixture = write_fixture(1);

        let mut cfg = fixture.config.clone();
        cfg.data.train.imgsize = Some([5, 4, 4]);
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("divisible by 2"), "{err}");

        let mut cfg = fixture.config.clone();
        if let Some(test) = cfg.data.test.as_mut() {
            test.imgsize = Some([4, 4, 3]);
        }
        assert!(cfg.validate().is_err());

        let mut cfg = fixture.config.clone();
        cfg.data.train.imgsize = Some([6, 4, 8]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_separate_valid_dir_is_holdout() {
        let fixture = write_fixture(1);
        let mut cfg = fixture.config.clone();
        if let Some(valid) = cfg.data.valid.as_mut() {
            valid.imgdir = fixture.dir.path().join("test");
        }
        assert!(cfg.uses_holdout());
        cfg.folds = 1;
        assert!(cfg.validate().is_ok());
    }
}
