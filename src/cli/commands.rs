// ============================================================
// Layer 1 — CLI Modes and Backend Dispatch
// ============================================================
// Defines the three run modes and the backend choice, and
// monomorphises the use cases over a concrete Burn backend:
//
//   --backend ndarray       Autodiff<NdArray>          (CPU, f32)
//   --backend wgpu          Autodiff<Wgpu>             (GPU --gpu N)
//   --backend wgpu + amp    Autodiff<Wgpu<f16>>        (GPU, f16)
//
// Reference: Rust Book §12 (Building a CLI Program)
//            Burn Book §2 (Backends)

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    tensor::backend::AutodiffBackend,
};
use clap::ValueEnum;
use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use crate::application::{
    config::RunConfig,
    test_use_case::{TestMode, TestUseCase},
    train_use_case::TrainUseCase,
};
use crate::infra::{progress::ProgressObserver, runtime::RunContext};

/// What the program does with the config
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Train every fold and keep the best checkpoints
    Train,
    /// Segment the labelled test set and score it
    Test,
    /// Segment images without masks
    TestSegment,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train       => "train",
            Mode::Test        => "test",
            Mode::TestSegment => "test-segment",
        }
    }
}

/// Tensor backend the run is compiled against
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// CPU (ndarray)
    Ndarray,
    /// GPU through wgpu
    #[cfg(feature = "wgpu")]
    Wgpu,
}

impl Default for BackendKind {
    fn default() -> Self {
        #[cfg(feature = "wgpu")]
        return BackendKind::Wgpu;
        #[cfg(not(feature = "wgpu"))]
        return BackendKind::Ndarray;
    }
}

/// Everything a mode needs once the CLI has been parsed.
pub struct Invocation {
    pub mode:      Mode,
    pub config:    RunConfig,
    pub gpu:       usize,
    pub snapshot:  Option<PathBuf>,
    pub interrupt: Arc<AtomicBool>,
}

/// Returns true if the run was stopped by Ctrl-C.
pub fn dispatch(backend: BackendKind, inv: Invocation) -> Result<bool> {
    match backend {
        BackendKind::Ndarray => {
            if inv.config.amp {
                tracing::warn!("amp is not supported on the ndarray backend, running in f32");
            }
            run::<Autodiff<NdArray<f32>>>(inv, NdArrayDevice::Cpu)
        }
        #[cfg(feature = "wgpu")]
        BackendKind::Wgpu => {
            use burn::{
                backend::{wgpu::WgpuDevice, Wgpu},
                tensor::f16,
            };

            let device = WgpuDevice::DiscreteGpu(inv.gpu);
            if inv.config.amp {
                tracing::info!("Using WGPU device {:?} with f16 (amp)", device);
                run::<Autodiff<Wgpu<f16>>>(inv, device)
            } else {
                tracing::info!("Using WGPU device {:?}", device);
                run::<Autodiff<Wgpu>>(inv, device)
            }
        }
    }
}

fn run<B: AutodiffBackend>(inv: Invocation, device: B::Device) -> Result<bool> {
    let observer = ProgressObserver::new();

    match inv.mode {
        Mode::Train => {
            let ctx = RunContext::<B>::new(device, inv.config.seed, inv.config.amp)
                .with_interrupt(inv.interrupt);
            let summary = TrainUseCase::new(inv.config).execute(&ctx, &observer)?;
            for fold in &summary.folds {
                match &fold.best_checkpoint {
                    Some(path) => println!("fold {}: best dice {:.4} → {}", fold.fold, fold.best_dice, path.display()),
                    None       => println!("fold {}: no checkpoint saved", fold.fold),
                }
            }
            Ok(summary.interrupted)
        }
        Mode::Test | Mode::TestSegment => {
            let snapshot = inv
                .snapshot
                .with_context(|| format!("--snapshot is required in {} mode", inv.mode.as_str()))?;
            let test_mode = if inv.mode == Mode::Test { TestMode::Evaluate } else { TestMode::SegmentOnly };

            let ctx = RunContext::<B::InnerBackend>::new(device, inv.config.seed, inv.config.amp)
                .with_interrupt(inv.interrupt);
            let summary = TestUseCase::new(inv.config, snapshot, test_mode).execute(&ctx, &observer)?;
            if let Some(table) = &summary.results {
                println!("mean dice over {} samples: {:.4}", table.rows().len(), table.mean_dice());
            }
            println!("{} predictions written", summary.predictions.len());
            Ok(summary.interrupted)
        }
    }
}
