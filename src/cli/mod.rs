// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
//   mri-seg <mode> <config> [--gpu N] [--snapshot PATH]
//           [--output PATH] [--backend ndarray|wgpu]
//
//   mode: train | test | test-segment
//
// Order of work: parse args → load config → logging → Ctrl-C
// handler → backend dispatch.
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

// Declare the commands submodule
pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{dispatch, BackendKind, Invocation, Mode};
use std::path::PathBuf;

use crate::application::config::RunConfig;
use crate::infra::{
    logging::{init_logging, log_file_name},
    runtime::install_interrupt_handler,
};

#[derive(Parser, Debug)]
#[command(
    name = "mri-seg",
    version = "0.1.0",
    about = "Train and evaluate a 3D SegResNet on MRI volumes."
)]
pub struct Cli {
    /// What to do: train, test or test-segment
    #[arg(value_enum)]
    pub mode: Mode,

    /// Run configuration (.toml or .json)
    pub config: PathBuf,

    /// Index of the GPU to run on
    #[arg(long, default_value_t = 0)]
    pub gpu: usize,

    /// Checkpoint to load in test modes
    #[arg(long)]
    pub snapshot: Option<PathBuf>,

    /// Overrides the config's prediction_folder
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Tensor backend
    #[arg(long, value_enum, default_value_t = BackendKind::default())]
    pub backend: BackendKind,
}

impl Cli {
    /// Reads the config file and applies the command-line overrides.
    ///
    /// Nothing is logged here: the subscriber only exists once the
    /// workdir (and with it the log file path) is known.
    pub fn load_config(&self) -> Result<RunConfig> {
        let mut config = RunConfig::load(&self.config)?;
        if let Some(output) = &self.output {
            config.prediction_folder = Some(output.clone());
        }
        Ok(config)
    }

    pub fn run(self) -> Result<()> {
        let config = self.load_config()?;

        let log_file = config
            .workdir
            .join(log_file_name(self.mode.as_str(), config.model_name()));
        init_logging(Some(&log_file))?;
        tracing::info!("Mode: {} | config: '{}'", self.mode.as_str(), self.config.display());
        tracing::info!(
            "Loaded config (model_id={}, model={}, epochs={})",
            config.model_id, config.model_name(), config.epochs,
        );

        let interrupt = install_interrupt_handler()?;
        let invocation = Invocation {
            mode:     self.mode,
            config,
            gpu:      self.gpu,
            snapshot: self.snapshot,
            interrupt,
        };

        if dispatch(self.backend, invocation)? {
            tracing::warn!("Keyboard interrupted");
        }
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_parses_positional_mode_and_flags() {
        let cli = Cli::try_parse_from([
            "mri-seg", "test-segment", "run.toml", "--gpu", "1", "--snapshot", "m.mpk", "--backend", "ndarray",
        ])
        .unwrap();
        assert_eq!(cli.mode, Mode::TestSegment);
        assert_eq!(cli.gpu, 1);
        assert_eq!(cli.snapshot, Some(PathBuf::from("m.mpk")));
        assert_eq!(cli.backend, BackendKind::Ndarray);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["mri-seg", "predict", "run.toml"]).is_err());
    }

    #[test]
    fn test_output_flag_overrides_prediction_folder() {
        let fixture = crate::application::config::tests::write_fixture(1);
        let config  = fixture.dir.path().join("run.toml");
        let out     = fixture.dir.path().join("preds");

        let cli = Cli::try_parse_from([
            OsStr::new("mri-seg"), OsStr::new("test"), config.as_os_str(), OsStr::new("--output"), out.as_os_str(),
        ])
        .unwrap();
        assert_eq!(cli.load_config().unwrap().prediction_folder(), out);

        let cli = Cli::try_parse_from([OsStr::new("mri-seg"), OsStr::new("test"), config.as_os_str()]).unwrap();
        let loaded = cli.load_config().unwrap();
        assert_eq!(loaded.prediction_folder(), loaded.workdir.join("output"));
    }
}
