// ============================================================
// Layer 5 — Learning-Rate Schedules
// ============================================================
// Stepped once per training iteration, never per epoch. Each
// `step()` returns the LR to use for the current iteration and
// then advances the internal counter, so the first call yields
// the schedule's value at t = 0.
//
//   CosineAnnealingScheduler   cyclic half-cosine from
//                              start_value to end_value over
//                              cycle_size iterations, restarting
//                              (cycle_size *= cycle_mult)
//   CosineAnnealingLR          eta_min + (base − eta_min)·(1 + cos(π·t/T))/2
//   StepLR                     base · gamma^⌊t / step_size⌋
//   Constant                   base (used when no schedule is configured)
//
// Reference: Loshchilov & Hutter (2017) SGDR

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Learning-rate schedule stepped once per training iteration.
///
/// `step` is called before every optimizer update and returns the
/// rate to use for it, so the first iteration sees the initial value.
pub trait LrSchedule: Send {
    /// LR for the current iteration; advances to the next one.
    fn step(&mut self) -> f64;

    fn name(&self) -> &'static str;
}

// ─── Parameters ───────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CosineCycleParams {
    /// Optimiser field being scheduled; only "lr" is supported
    pub param_name:  String,
    pub start_value: f64,
    pub end_value:   f64,
    /// Iterations per cycle; defaults to one epoch
    pub cycle_size:  Option<usize>,
    pub cycle_mult:  f64,
}

impl Default for CosineCycleParams {
    fn default() -> Self {
        Self {
            param_name:  "lr".to_string(),
            start_value: 1e-3,
            end_value:   1e-5,
            cycle_size:  None,
            cycle_mult:  1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CosineAnnealingLrParams {
    #[serde(alias = "T_max")]
    pub t_max:   usize,
    #[serde(default)]
    pub eta_min: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepLrParams {
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma:     f64,
}

fn default_gamma() -> f64 {
    0.1
}

// ─── Schedules ────────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct CosineCycle {
    start:      f64,
    end:        f64,
    cycle_size: usize,
    cycle_mult: f64,
    index:      usize,
}

impl CosineCycle {
    pub fn new(p: &CosineCycleParams, iterations_per_epoch: usize) -> Self {
        Self {
            start:      p.start_value,
            end:        p.end_value,
            cycle_size: p.cycle_size.unwrap_or(iterations_per_epoch).max(1),
            cycle_mult: p.cycle_mult.max(1.0),
            index:      0,
        }
    }
}

impl LrSchedule for CosineCycle {
    fn step(&mut self) -> f64 {
        if self.index >= self.cycle_size {
            self.index = 0;
            self.cycle_size = ((self.cycle_size as f64) * self.cycle_mult).round() as usize;
        }
        let progress = self.index as f64 / self.cycle_size as f64;
        self.index += 1;
        self.start + (self.end - self.start) * (1.0 - (PI * progress).cos()) / 2.0
    }

    fn name(&self) -> &'static str {
        "CosineAnnealingScheduler"
    }
}

#[derive(Debug, Clone)]
pub struct CosineAnnealingLr {
    base:    f64,
    eta_min: f64,
    t_max:   usize,
    t:       usize,
}

impl CosineAnnealingLr {
    pub fn new(p: &CosineAnnealingLrParams, base: f64) -> Self {
        Self { base, eta_min: p.eta_min, t_max: p.t_max.max(1), t: 0 }
    }
}

impl LrSchedule for CosineAnnealingLr {
    fn step(&mut self) -> f64 {
        let t = self.t as f64 / self.t_max as f64;
        self.t += 1;
        self.eta_min + (self.base - self.eta_min) * (1.0 + (PI * t).cos()) / 2.0
    }

    fn name(&self) -> &'static str {
        "CosineAnnealingLR"
    }
}

#[derive(Debug, Clone)]
pub struct StepLr {
    base:      f64,
    step_size: usize,
    gamma:     f64,
    t:         usize,
}

impl StepLr {
    pub fn new(p: &StepLrParams, base: f64) -> Self {
        Self { base, step_size: p.step_size.max(1), gamma: p.gamma, t: 0 }
    }
}

impl LrSchedule for StepLr {
    fn step(&mut self) -> f64 {
        let decays = (self.t / self.step_size) as i32;
        self.t += 1;
        self.base * self.gamma.powi(decays)
    }

    fn name(&self) -> &'static str {
        "StepLR"
    }
}

#[derive(Debug, Clone)]
pub struct Constant(pub f64);

impl LrSchedule for Constant {
    fn step(&mut self) -> f64 {
        self.0
    }

    fn name(&self) -> &'static str {
        "Constant"
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_cosine_cycle_rises_then_restarts() {
        let p = CosineCycleParams { start_value: 3e-5, end_value: 3e-3, ..Default::default() };
        let mut s = CosineCycle::new(&p, 4);
        let lrs: Vec<f64> = (0..5).map(|_| s.step()).collect();
        assert!(close(lrs[0], 3e-5));
        assert!(close(lrs[2], (3e-5 + 3e-3) / 2.0));
        assert!(lrs[1] < lrs[2] && lrs[2] < lrs[3]);
        assert!(close(lrs[4], 3e-5));
    }

    #[test]
    fn test_cosine_cycle_mult_grows_cycle() {
        let p = CosineCycleParams { cycle_size: Some(2), cycle_mult: 2.0, ..Default::default() };
        let mut s = CosineCycle::new(&p, 100);
        let lrs: Vec<f64> = (0..7).map(|_| s.step()).collect();
        // restarts at t = 2 and t = 2 + 4
        assert!(close(lrs[2], p.start_value));
        assert!(close(lrs[6], p.start_value));
        assert!(!close(lrs[4], p.start_value));
    }

    #[test]
    fn test_cosine_annealing_lr_endpoints() {
        let mut s = CosineAnnealingLr::new(&CosineAnnealingLrParams { t_max: 10, eta_min: 0.0 }, 1.0);
        let lrs: Vec<f64> = (0..11).map(|_| s.step()).collect();
        assert!(close(lrs[0], 1.0));
        assert!(close(lrs[5], 0.5));
        assert!(lrs[10].abs() < 1e-12);
    }

    #[test]
    fn test_step_lr_decays() {
        let mut s = StepLr::new(&StepLrParams { step_size: 2, gamma: 0.5 }, 1.0);
        let lrs: Vec<f64> = (0..5).map(|_| s.step()).collect();
        assert_eq!(lrs, vec![1.0, 1.0, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn test_t_max_alias() {
        let p: CosineAnnealingLrParams = serde_json::from_str(r#"{"T_max": 50}"#).unwrap();
        assert_eq!(p.t_max, 50);
        assert_eq!(p.eta_min, 0.0);
    }
}
