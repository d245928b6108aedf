// ============================================================
// Layer 6 — Logging Setup
// ============================================================
// One tracing subscriber for the whole process:
//
//   stderr                 always, with ANSI colours
//   <workdir>/<file>.log   plain text copy of the same events
//
// The filter defaults to `mri_seg=info`; RUST_LOG adds to it
// (e.g. RUST_LOG=mri_seg=debug).

use anyhow::{Context, Result};
use std::{
    fs::{self, File},
    path::Path,
    sync::Mutex,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: human-readable events on stderr and,
/// when `log_file` is given, the same events without colour in that file.
///
/// `RUST_LOG` directives apply on top of `mri_seg=info`.
pub fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("mri_seg=info".parse()?);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(path)
                .with_context(|| format!("Cannot create log file '{}'", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Logging was already initialised")?;

    if let Some(path) = log_file {
        tracing::info!("Logging to '{}'", path.display());
    }
    Ok(())
}

/// `<workdir>/<mode>_model_<model>.log`
pub fn log_file_name(mode: &str, model_name: &str) -> String {
    format!("{mode}_model_{model_name}.log")
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name("train", "SegResNet"), "train_model_SegResNet.log");
    }
}
