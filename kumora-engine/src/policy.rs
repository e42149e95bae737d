//! Eviction policies.
//!
//! A policy is a capability set: admission veto, victim selection, and
//! life-cycle hooks for implementations that keep their own structures.
//! Policies only ever see non-owning views of the entry table.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use kumora_core::types::{seconds_since, Entry, TimePoint};

/// Tunable policy parameters, reloadable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyParams {
    pub w_miss: f64,
    pub w_reuse: f64,
    pub w_mem: f64,
    pub w_risk: f64,
    pub admit_threshold: f64,
    pub evict_pressure: f64,
    pub max_evictions_per_second: u64,
    pub max_admissions_per_second: u64,
    /// 0 disables the per-owner byte cap.
    pub owner_cap_bytes: u64,
    pub version: String,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            w_miss: 1.0,
            w_reuse: 1.0,
            w_mem: 1.0,
            w_risk: 1.0,
            admit_threshold: 0.0,
            evict_pressure: 0.8,
            max_evictions_per_second: 10_000,
            max_admissions_per_second: 10_000,
            owner_cap_bytes: 0,
            version: "defaults-v1".to_string(),
        }
    }
}

/// Borrowed view of a write candidate handed to `should_admit`.
pub struct CandidateView<'a> {
    pub key: &'a str,
    pub entry: &'a Entry,
    pub miss_cost: f64,
}

pub trait EvictionPolicy: Send {
    fn name(&self) -> &'static str;
    fn should_admit(&mut self, candidate: &CandidateView<'_>) -> bool;
    fn on_insert(&mut self, key: &str, entry: &Entry);
    fn on_access(&mut self, key: &str, entry: &Entry);
    fn on_erase(&mut self, key: &str);
    /// Pick a key to evict, or `None` to fail open at capacity.
    fn pick_victim(
        &mut self,
        entries: &HashMap<String, Entry>,
        memory_used: usize,
        memory_limit: usize,
    ) -> Option<String>;
    fn params(&self) -> &PolicyParams;
    fn set_params(&mut self, params: PolicyParams);
}

/// Construct a policy from its wire name; unknown names get the cost policy.
pub fn policy_by_name(mode: &str) -> Box<dyn EvictionPolicy> {
    match mode {
        "lru" => Box::new(LruPolicy::default()),
        "lfu" => Box::new(LfuPolicy::default()),
        _ => Box::new(CostAwarePolicy::default()),
    }
}

/// Least-recently-used: admits everything, evicts the oldest access.
#[derive(Default)]
pub struct LruPolicy {
    params: PolicyParams,
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn should_admit(&mut self, _candidate: &CandidateView<'_>) -> bool {
        true
    }

    fn on_insert(&mut self, _key: &str, _entry: &Entry) {}
    fn on_access(&mut self, _key: &str, _entry: &Entry) {}
    fn on_erase(&mut self, _key: &str) {}

    fn pick_victim(
        &mut self,
        entries: &HashMap<String, Entry>,
        _memory_used: usize,
        _memory_limit: usize,
    ) -> Option<String> {
        entries
            .iter()
            .min_by(|a, b| {
                a.1.last_access
                    .cmp(&b.1.last_access)
                    .then_with(|| a.0.cmp(b.0))
            })
            .map(|(k, _)| k.clone())
    }

    fn params(&self) -> &PolicyParams {
        &self.params
    }

    fn set_params(&mut self, params: PolicyParams) {
        self.params = params;
    }
}

/// Least-frequently-used with recency and key tiebreaks.
#[derive(Default)]
pub struct LfuPolicy {
    params: PolicyParams,
}

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn should_admit(&mut self, _candidate: &CandidateView<'_>) -> bool {
        true
    }

    fn on_insert(&mut self, _key: &str, _entry: &Entry) {}
    fn on_access(&mut self, _key: &str, _entry: &Entry) {}
    fn on_erase(&mut self, _key: &str) {}

    fn pick_victim(
        &mut self,
        entries: &HashMap<String, Entry>,
        _memory_used: usize,
        _memory_limit: usize,
    ) -> Option<String> {
        entries
            .iter()
            .min_by(|a, b| {
                a.1.hit_count
                    .cmp(&b.1.hit_count)
                    .then_with(|| a.1.last_access.cmp(&b.1.last_access))
                    .then_with(|| a.0.cmp(b.0))
            })
            .map(|(k, _)| k.clone())
    }

    fn params(&self) -> &PolicyParams {
        &self.params
    }

    fn set_params(&mut self, params: PolicyParams) {
        self.params = params;
    }
}

/// Cost-aware policy ("pomai_cost" on the wire).
///
/// Benefit score:
///   w_miss·miss_cost + w_reuse·p_reuse − w_mem·mem_cost − w_risk·risk
/// where p_reuse = min(1, (hits+1)/(age_s+1)), mem_cost penalizes size and
/// bucket-unfriendly remainders, and risk flags oversized entries. Keeps
/// only rolling one-second admission/eviction counters; no auxiliary
/// index, so victim selection is a full O(n) scan.
pub struct CostAwarePolicy {
    params: PolicyParams,
    window_start: TimePoint,
    admissions_this_window: u64,
    evictions_this_window: u64,
}

impl Default for CostAwarePolicy {
    fn default() -> Self {
        Self {
            params: PolicyParams::default(),
            window_start: SystemTime::now(),
            admissions_this_window: 0,
            evictions_this_window: 0,
        }
    }
}

impl CostAwarePolicy {
    fn benefit(&self, entry: &Entry, miss_cost: f64) -> f64 {
        let now = SystemTime::now();
        let age_s = seconds_since(now, entry.last_access).max(1.0);
        let p_reuse = ((entry.hit_count as f64 + 1.0) / (age_s + 1.0)).min(1.0);
        let mem_cost =
            entry.size_bytes as f64 / 1024.0 + (entry.size_bytes % 64) as f64 * 0.01;
        let mut risk = if entry.size_bytes > 256 * 1024 { 1.0 } else { 0.0 };
        if age_s < 1.0 {
            risk += 0.5;
        }
        self.params.w_miss * miss_cost + self.params.w_reuse * p_reuse
            - self.params.w_mem * mem_cost
            - self.params.w_risk * risk
    }

    fn refresh_window(&mut self) {
        let now = SystemTime::now();
        if seconds_since(now, self.window_start) >= 1.0 {
            self.window_start = now;
            self.admissions_this_window = 0;
            self.evictions_this_window = 0;
        }
    }
}

impl EvictionPolicy for CostAwarePolicy {
    fn name(&self) -> &'static str {
        "pomai_cost"
    }

    fn should_admit(&mut self, candidate: &CandidateView<'_>) -> bool {
        self.refresh_window();
        if self.admissions_this_window >= self.params.max_admissions_per_second {
            return false;
        }
        let score = self.benefit(candidate.entry, candidate.miss_cost);
        if score <= self.params.admit_threshold {
            return false;
        }
        // The window counts successful admissions, not attempts.
        self.admissions_this_window += 1;
        true
    }

    fn on_insert(&mut self, _key: &str, _entry: &Entry) {}
    fn on_access(&mut self, _key: &str, _entry: &Entry) {}
    fn on_erase(&mut self, _key: &str) {}

    fn pick_victim(
        &mut self,
        entries: &HashMap<String, Entry>,
        memory_used: usize,
        memory_limit: usize,
    ) -> Option<String> {
        self.refresh_window();
        if self.evictions_this_window >= self.params.max_evictions_per_second {
            return None;
        }
        if entries.is_empty() {
            return None;
        }
        if memory_limit > 0
            && (memory_used as f64) < memory_limit as f64 * self.params.evict_pressure
        {
            return None;
        }
        let mut victim: Option<&String> = None;
        let mut worst = f64::INFINITY;
        for (key, entry) in entries {
            let score = self.benefit(entry, 1.0);
            let better = match victim {
                None => true,
                Some(current) => score < worst || (score == worst && key < current),
            };
            if better {
                worst = score;
                victim = Some(key);
            }
        }
        self.evictions_this_window += 1;
        victim.cloned()
    }

    fn params(&self) -> &PolicyParams {
        &self.params
    }

    fn set_params(&mut self, params: PolicyParams) {
        self.params = params;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn entry_with(last_access_ago: Duration, hits: u64, size: usize) -> Entry {
        let mut e = Entry::new(Bytes::from(vec![0u8; size]), "default".to_string(), None);
        e.last_access = SystemTime::now() - last_access_ago;
        e.hit_count = hits;
        e
    }

    #[test]
    fn lru_picks_oldest_access_with_key_tiebreak() {
        let mut entries = HashMap::new();
        entries.insert("b".to_string(), entry_with(Duration::from_secs(10), 0, 8));
        entries.insert("a".to_string(), entry_with(Duration::from_secs(5), 0, 8));
        let mut p = LruPolicy::default();
        assert_eq!(p.pick_victim(&entries, 0, 0).as_deref(), Some("b"));

        // Equal access times break ties lexicographically.
        let t = SystemTime::now();
        for e in entries.values_mut() {
            e.last_access = t;
        }
        assert_eq!(p.pick_victim(&entries, 0, 0).as_deref(), Some("a"));
    }

    #[test]
    fn lfu_prefers_fewest_hits_then_oldest() {
        let mut entries = HashMap::new();
        entries.insert("hot".to_string(), entry_with(Duration::from_secs(1), 50, 8));
        entries.insert("cold".to_string(), entry_with(Duration::from_secs(1), 1, 8));
        let mut p = LfuPolicy::default();
        assert_eq!(p.pick_victim(&entries, 0, 0).as_deref(), Some("cold"));
    }

    #[test]
    fn cost_policy_respects_pressure_floor() {
        let mut entries = HashMap::new();
        entries.insert("k".to_string(), entry_with(Duration::from_secs(5), 0, 64));
        let mut p = CostAwarePolicy::default();
        // Well below the 0.8 pressure floor: fail open.
        assert!(p.pick_victim(&entries, 10, 1000).is_none());
        // Above the floor: a victim appears.
        assert!(p.pick_victim(&entries, 900, 1000).is_some());
    }

    #[test]
    fn cost_policy_admission_threshold() {
        let mut p = CostAwarePolicy::default();
        let good = entry_with(Duration::from_secs(5), 3, 64);
        assert!(p.should_admit(&CandidateView {
            key: "k",
            entry: &good,
            miss_cost: 8.0,
        }));

        // Huge cold value with cheap misses scores below zero.
        let bad = entry_with(Duration::from_secs(3600), 0, 512 * 1024);
        assert!(!p.should_admit(&CandidateView {
            key: "k",
            entry: &bad,
            miss_cost: 0.0,
        }));
    }

    #[test]
    fn cost_policy_admission_rate_cap() {
        let mut p = CostAwarePolicy::default();
        p.set_params(PolicyParams {
            max_admissions_per_second: 2,
            ..PolicyParams::default()
        });
        let e = entry_with(Duration::from_secs(5), 3, 64);
        let cv = CandidateView {
            key: "k",
            entry: &e,
            miss_cost: 8.0,
        };
        assert!(p.should_admit(&cv));
        assert!(p.should_admit(&cv));
        assert!(!p.should_admit(&cv));
    }

    #[test]
    fn cost_policy_eviction_rate_cap() {
        let mut entries = HashMap::new();
        entries.insert("k".to_string(), entry_with(Duration::from_secs(5), 0, 64));
        let mut p = CostAwarePolicy::default();
        p.set_params(PolicyParams {
            max_evictions_per_second: 1,
            ..PolicyParams::default()
        });
        assert!(p.pick_victim(&entries, 900, 1000).is_some());
        assert!(p.pick_victim(&entries, 900, 1000).is_none());
    }

    #[test]
    fn policy_by_name_maps_modes() {
        assert_eq!(policy_by_name("lru").name(), "lru");
        assert_eq!(policy_by_name("lfu").name(), "lfu");
        assert_eq!(policy_by_name("pomai_cost").name(), "pomai_cost");
        assert_eq!(policy_by_name("anything-else").name(), "pomai_cost");
    }
}
