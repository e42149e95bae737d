//! Canary evaluation and live parameter reload.
//!
//! A keyed cohort (`fnv1a64(key) mod 100 < pct`) runs the candidate
//! parameters while the complement stays on control. Both cohorts record
//! hit/miss counts and a 2048-sample latency ring. At most once per second,
//! after a five-second warm-up, the evaluator checks the guardrails:
//!
//! - candidate p99 latency  > 1.5 × control p99
//! - candidate hit rate     < control hit rate − 0.05
//! - evictions since start  > 1000
//!
//! Any breach rolls the engine back to the last-known-good parameter file
//! and disables the canary.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;

use tracing::{info, warn};

use kumora_core::error::Result;
use kumora_core::hash::fnv1a_64;
use kumora_core::types::{seconds_since, TimePoint};

use crate::params;

use super::Engine;

const LATENCY_RING_SAMPLES: usize = 2048;
const WARMUP_SECS: f64 = 5.0;
const EVAL_INTERVAL_SECS: f64 = 1.0;
const P99_LATENCY_FACTOR: f64 = 1.5;
const HIT_RATE_MARGIN: f64 = 0.05;
const EVICTION_BUDGET: u64 = 1000;

/// Per-cohort counters and latency ring.
#[derive(Debug, Clone, Default)]
pub(crate) struct CohortStats {
    pub gets: u64,
    pub hits: u64,
    pub latency_us: VecDeque<u64>,
}

impl CohortStats {
    pub fn push_latency(&mut self, micros: u64) {
        self.latency_us.push_back(micros);
        if self.latency_us.len() > LATENCY_RING_SAMPLES {
            self.latency_us.pop_front();
        }
    }

    /// Hit rate, or `default` when no gets were recorded.
    pub fn hit_rate(&self, default: f64) -> f64 {
        if self.gets == 0 {
            default
        } else {
            self.hits as f64 / self.gets as f64
        }
    }
}

/// p99 over an unsorted sample ring; 0 when empty.
pub(crate) fn p99_from_samples(samples: &VecDeque<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    sorted[(sorted.len() - 1) * 99 / 100]
}

impl Engine {
    /// Load a parameter file. Under an armed canary percentage the values
    /// become the candidate cohort; otherwise they replace control and are
    /// mirrored to the last-known-good file. Failures leave the active
    /// configuration unchanged.
    pub fn reload_params(&mut self, path: &Path) -> Result<()> {
        let (parsed, text) = params::load_params_file(path, &self.control_params)?;
        if self.canary_pct > 0 {
            self.canary_params = parsed;
            self.canary_active = true;
            self.canary_start = std::time::SystemTime::now();
            self.baseline_evictions = self.stats.evictions;
            self.canary_stats = CohortStats::default();
            self.control_stats = CohortStats::default();
            self.last_canary_event = format!("canary_started:{}", self.canary_params.version);
            info!(
                version = %self.canary_params.version,
                pct = self.canary_pct,
                "canary parameters armed"
            );
        } else {
            self.control_params = parsed;
            self.policy.set_params(self.control_params.clone());
            self.last_canary_event = format!("params_loaded:{}", self.control_params.version);
            if let Err(e) = params::store_lkg(&self.cfg.data_dir, &text) {
                warn!(error = %e, "last-known-good mirror failed");
            }
            info!(version = %self.control_params.version, "control parameters loaded");
        }
        Ok(())
    }

    /// Select the candidate cohort size, 0..=100. Zero disarms the canary.
    pub fn set_canary_pct(&mut self, pct: u64) {
        self.canary_pct = pct.min(100);
        if self.canary_pct == 0 {
            self.canary_active = false;
        }
    }

    pub fn canary_pct(&self) -> u64 {
        self.canary_pct
    }

    /// Restore the last-known-good control parameters and disable the
    /// canary. The same clamps apply as on a live reload.
    pub fn rollback_to_lkg(&mut self) -> Result<()> {
        let parsed = params::load_lkg(&self.cfg.data_dir, &self.control_params)?;
        self.control_params = parsed;
        self.policy.set_params(self.control_params.clone());
        self.canary_active = false;
        self.rollback_events += 1;
        self.last_canary_event = format!("rollback_to_lkg:{}", self.control_params.version);
        info!(version = %self.control_params.version, "rolled back to last-known-good params");
        Ok(())
    }

    pub(crate) fn is_canary_key(&self, key: &str) -> bool {
        if !self.canary_active || self.canary_pct == 0 {
            return false;
        }
        fnv1a_64(key.as_bytes()) % 100 < self.canary_pct
    }

    pub(crate) fn cohort_mut(&mut self, canary: bool) -> &mut CohortStats {
        if canary {
            &mut self.canary_stats
        } else {
            &mut self.control_stats
        }
    }

    pub(crate) fn record_sample(&mut self, canary: bool, start: Instant) {
        let micros = start.elapsed().as_micros() as u64;
        self.cohort_mut(canary).push_latency(micros);
    }

    /// Guardrail evaluation; runs at most once per second and only after
    /// warm-up.
    pub(crate) fn maybe_evaluate_canary(&mut self, now: TimePoint) {
        if !self.canary_active {
            return;
        }
        if seconds_since(now, self.last_guardrail_eval) < EVAL_INTERVAL_SECS {
            return;
        }
        self.last_guardrail_eval = now;
        if seconds_since(now, self.canary_start) < WARMUP_SECS {
            return;
        }

        let control_hr = self.control_stats.hit_rate(1.0);
        let canary_hr = self.canary_stats.hit_rate(control_hr);
        let control_p99 = p99_from_samples(&self.control_stats.latency_us) as f64;
        let canary_p99 = p99_from_samples(&self.canary_stats.latency_us) as f64;
        let evictions_delta = self.stats.evictions - self.baseline_evictions;

        let latency_bad = control_p99 > 0.0 && canary_p99 > control_p99 * P99_LATENCY_FACTOR;
        let hit_bad = canary_hr + HIT_RATE_MARGIN < control_hr;
        let eviction_bad = evictions_delta > EVICTION_BUDGET;
        if latency_bad || hit_bad || eviction_bad {
            warn!(
                latency_bad,
                hit_bad, eviction_bad, "canary guardrail breached, rolling back"
            );
            if let Err(e) = self.rollback_to_lkg() {
                warn!(error = %e, "guardrail rollback failed");
                self.canary_active = false;
            }
            self.last_canary_event = "auto_rollback_guardrail".to_string();
        }
    }
}
