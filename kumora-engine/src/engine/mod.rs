//! The cache engine proper: entry table, RAM accounting, TTL expiry,
//! owner quotas, eviction, and the maintenance pass.
//!
//! Every public operation services a bounded maintenance pass first
//! (expiry sweep, tier queues, GC probe), then runs against the RAM table,
//! falling back to the SSD store on a miss when the tier is enabled.

mod canary;
mod tiering;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tracing::info;

use kumora_core::config::EngineConfig;
use kumora_core::error::{Error, Result};
use kumora_core::types::{now_ms, Entry, TimePoint};
use kumora_store::{SsdConfig, SsdStore};

use crate::policy::{CandidateView, EvictionPolicy, PolicyParams};
use canary::{p99_from_samples, CohortStats};

/// Monotone engine counters.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub admissions_rejected: u64,
}

/// Lazy expiry heap node. The heap is never decrement-keyed; stale nodes
/// are detected on pop via the per-key generation counter.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExpiryNode {
    deadline: TimePoint,
    key: String,
    generation: u64,
}

impl Ord for ExpiryNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for ExpiryNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Engine {
    cfg: EngineConfig,
    policy: Box<dyn EvictionPolicy>,
    entries: HashMap<String, Entry>,
    expiry_generation: HashMap<String, u64>,
    expiry_heap: BinaryHeap<Reverse<ExpiryNode>>,
    owner_usage: HashMap<String, usize>,
    stats: EngineStats,
    memory_used: usize,
    bucket_used: usize,
    expiration_backlog: usize,

    // Canary evaluation
    pub(crate) canary_pct: u64,
    pub(crate) canary_active: bool,
    pub(crate) control_params: PolicyParams,
    pub(crate) canary_params: PolicyParams,
    pub(crate) control_stats: CohortStats,
    pub(crate) canary_stats: CohortStats,
    pub(crate) canary_start: TimePoint,
    pub(crate) last_guardrail_eval: TimePoint,
    pub(crate) baseline_evictions: u64,
    pub(crate) rollback_events: u64,
    pub(crate) last_canary_event: String,

    // SSD tier
    ssd: Option<SsdStore>,
    promote_queue: VecDeque<String>,
    demote_queue: VecDeque<(String, Entry)>,
    ssd_hit_counts: HashMap<String, u64>,
    next_seq: u64,
}

impl Engine {
    /// Build the engine, opening (and recovering) the SSD store when the
    /// tier is enabled.
    pub fn new(cfg: EngineConfig, policy: Box<dyn EvictionPolicy>) -> Result<Self> {
        let ssd = if cfg.tier.ssd_enabled {
            Some(SsdStore::open(SsdConfig::from_engine(&cfg))?)
        } else {
            None
        };
        let next_seq = ssd.as_ref().map(|s| s.max_seq() + 1).unwrap_or(1);
        let control_params = policy.params().clone();
        let now = SystemTime::now();
        Ok(Self {
            cfg,
            policy,
            entries: HashMap::new(),
            expiry_generation: HashMap::new(),
            expiry_heap: BinaryHeap::new(),
            owner_usage: HashMap::new(),
            stats: EngineStats::default(),
            memory_used: 0,
            bucket_used: 0,
            expiration_backlog: 0,
            canary_pct: 0,
            canary_active: false,
            control_params,
            canary_params: PolicyParams::default(),
            control_stats: CohortStats::default(),
            canary_stats: CohortStats::default(),
            canary_start: now,
            last_guardrail_eval: now,
            baseline_evictions: 0,
            rollback_events: 0,
            last_canary_event: "none".to_string(),
            ssd,
            promote_queue: VecDeque::new(),
            demote_queue: VecDeque::new(),
            ssd_hit_counts: HashMap::new(),
            next_seq,
        })
    }

    /// Insert or replace a value. Large values write through to the SSD
    /// tier when it is enabled.
    pub fn set(&mut self, key: &str, value: Bytes, ttl_ms: Option<u64>, owner: &str) -> Result<()> {
        let start = Instant::now();
        self.tick();
        if key.is_empty() || key.len() > self.cfg.max_key_len {
            return Err(Error::InvalidKey);
        }
        if value.len() > self.cfg.max_value_size {
            return Err(Error::ValueTooLarge);
        }
        let owner = if owner.is_empty() { "default" } else { owner };
        let canary = self.is_canary_key(key);

        // Per-owner quota, with the replacement delta credited to the
        // previous entry's owner only when the owners match.
        let owner_cap = self.cohort_params(canary).owner_cap_bytes;
        if owner_cap > 0 {
            let mut owner_used = self.owner_usage.get(owner).copied().unwrap_or(0);
            if let Some(prev) = self.entries.get(key) {
                if prev.owner == owner {
                    owner_used = owner_used.saturating_sub(prev.size_bytes);
                }
            }
            if owner_used + value.len() > owner_cap as usize {
                return Err(Error::OwnerQuotaExceeded);
            }
        }

        let deadline = ttl_ms.map(|ms| SystemTime::now() + Duration::from_millis(ms));
        let candidate = Entry::new(value, owner.to_string(), deadline);

        // Admission runs under the candidate cohort's parameters before any
        // mutation; the previously applied parameters are restored after.
        let miss_cost = self.owner_miss_cost(owner);
        let applied = self.policy.params().clone();
        let cohort = self.cohort_params(canary).clone();
        self.policy.set_params(cohort);
        let admitted = self.policy.should_admit(&CandidateView {
            key,
            entry: &candidate,
            miss_cost,
        });
        self.policy.set_params(applied);
        if !admitted {
            self.stats.admissions_rejected += 1;
            return Err(Error::AdmissionRejected);
        }

        // A value still waiting on the demote queue is superseded by this
        // write; draining it later would resurrect stale data.
        self.demote_queue.retain(|(k, _)| k != key);

        if self.ssd.is_some() && candidate.size_bytes >= self.cfg.tier.ssd_value_min_bytes {
            self.write_through(key, &candidate)?;
            self.erase_internal(key, false, false);
            self.record_sample(canary, start);
            return Ok(());
        }

        self.erase_internal(key, false, false);
        self.insert_entry(key.to_string(), candidate);
        self.evict_until_fit();
        self.record_sample(canary, start);
        Ok(())
    }

    /// Read a value, updating access stats. Consults the SSD tier on a RAM
    /// miss and counts toward promotion.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        let start = Instant::now();
        self.tick();
        let canary = self.is_canary_key(key);
        self.cohort_mut(canary).gets += 1;

        let mut ram_hit = None;
        if self.exists_and_not_expired(key) {
            if let Some(e) = self.entries.get_mut(key) {
                e.last_access = SystemTime::now();
                e.hit_count += 1;
                ram_hit = Some(e.value.clone());
                self.policy.on_access(key, e);
            }
        }
        if let Some(value) = ram_hit {
            self.stats.hits += 1;
            self.cohort_mut(canary).hits += 1;
            self.record_sample(canary, start);
            return Some(value);
        }

        if let Some(value) = self.ssd_get(key) {
            self.stats.hits += 1;
            self.cohort_mut(canary).hits += 1;
            self.record_sample(canary, start);
            return Some(value);
        }

        self.stats.misses += 1;
        self.record_sample(canary, start);
        None
    }

    /// Remove keys from both tiers; returns how many existed in either.
    pub fn del(&mut self, keys: &[String]) -> usize {
        self.tick();
        let mut removed = 0;
        for key in keys {
            let in_ram = self.entries.contains_key(key);
            let on_ssd = self.ssd.as_ref().map(|s| s.contains(key)).unwrap_or(false);
            let queued = self.demote_queue.iter().any(|(k, _)| k == key);
            if in_ram {
                self.erase_internal(key, false, false);
            }
            if on_ssd {
                self.ssd_tombstone(key);
            }
            // Values parked on the tier queues count as existing too.
            self.demote_queue.retain(|(k, _)| k != key);
            self.promote_queue.retain(|k| k != key);
            if in_ram || on_ssd || queued {
                removed += 1;
            }
            self.ssd_hit_counts.remove(key);
        }
        removed
    }

    /// Replace the TTL deadline of a resident entry. Superseded heap nodes
    /// are invalidated by the generation bump.
    pub fn expire(&mut self, key: &str, ttl_seconds: u64) -> bool {
        self.tick();
        let deadline = SystemTime::now() + Duration::from_secs(ttl_seconds);
        match self.entries.get_mut(key) {
            Some(e) => {
                e.ttl_deadline = Some(deadline);
            }
            None => return false,
        }
        self.schedule_expiry(key, deadline);
        true
    }

    /// Remaining TTL in seconds: `-1` for no TTL, `-2` for no such key.
    pub fn ttl(&mut self, key: &str) -> i64 {
        self.tick();
        if self.exists_and_not_expired(key) {
            if let Some(e) = self.entries.get(key) {
                return match e.ttl_deadline {
                    None => -1,
                    Some(deadline) => deadline
                        .duration_since(SystemTime::now())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0),
                };
            }
        }
        if let Some(ssd) = self.ssd.as_ref() {
            if let Some(ttl_epoch_ms) = ssd.ttl_epoch_ms(key) {
                if ttl_epoch_ms < 0 {
                    return -1;
                }
                let remaining_ms = ttl_epoch_ms - now_ms();
                if remaining_ms > 0 {
                    return remaining_ms / 1000;
                }
                return -2;
            }
        }
        -2
    }

    pub fn mget(&mut self, keys: &[String]) -> Vec<Option<Bytes>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Bounded maintenance pass: TTL sweep, backlog snapshot, tier queues,
    /// pressure probe, GC probe and the canary evaluator. Safe to call
    /// frequently.
    pub fn tick(&mut self) {
        let now = SystemTime::now();

        let mut cleaned = 0;
        while cleaned < self.cfg.ttl_cleanup_per_tick {
            match self.expiry_heap.peek() {
                Some(Reverse(node)) if node.deadline <= now => {}
                _ => break,
            }
            if let Some(Reverse(node)) = self.expiry_heap.pop() {
                let live = self.expiry_generation.get(&node.key) == Some(&node.generation)
                    && matches!(
                        self.entries.get(&node.key),
                        Some(e) if e.ttl_deadline == Some(node.deadline)
                    );
                if !live {
                    // Stale node; skipping it does not consume the budget.
                    continue;
                }
                self.erase_internal(&node.key, false, true);
                cleaned += 1;
            }
        }

        self.expiration_backlog = self
            .expiry_heap
            .iter()
            .filter(|Reverse(node)| node.deadline <= now)
            .count();

        self.tier_tick(now);
        self.maybe_evaluate_canary(now);
    }

    /// Status report, one `key:value` per line.
    pub fn info(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("policy_mode:{}\n", self.policy.name()));
        out.push_str(&format!(
            "policy_params_version:{}\n",
            self.policy.params().version
        ));
        out.push_str(&format!("keys:{}\n", self.entries.len()));
        out.push_str(&format!("memory_used_bytes:{}\n", self.memory_used));
        out.push_str(&format!(
            "memory_limit_bytes:{}\n",
            self.cfg.memory_limit_bytes
        ));
        out.push_str(&format!(
            "memory_overhead_ratio:{}\n",
            self.memory_overhead_ratio()
        ));
        out.push_str(&format!("expiration_backlog:{}\n", self.expiration_backlog));
        out.push_str(&format!("hits:{}\n", self.stats.hits));
        out.push_str(&format!("misses:{}\n", self.stats.misses));
        out.push_str(&format!("evictions:{}\n", self.stats.evictions));
        out.push_str(&format!("expirations:{}\n", self.stats.expirations));
        out.push_str(&format!(
            "admissions_rejected:{}\n",
            self.stats.admissions_rejected
        ));
        out.push_str(&format!(
            "canary_enabled:{}\n",
            if self.canary_active { 1 } else { 0 }
        ));
        out.push_str(&format!("canary_pct:{}\n", self.canary_pct));
        out.push_str(&format!(
            "canary_control_hit_rate:{}\n",
            self.control_stats.hit_rate(0.0)
        ));
        out.push_str(&format!(
            "canary_candidate_hit_rate:{}\n",
            self.canary_stats.hit_rate(0.0)
        ));
        out.push_str(&format!(
            "canary_control_p99_us:{}\n",
            p99_from_samples(&self.control_stats.latency_us)
        ));
        out.push_str(&format!(
            "canary_candidate_p99_us:{}\n",
            p99_from_samples(&self.canary_stats.latency_us)
        ));
        out.push_str(&format!("canary_rollback_events:{}\n", self.rollback_events));
        out.push_str(&format!("canary_last_event:{}\n", self.last_canary_event));

        if let Some(ssd) = self.ssd.as_ref() {
            let s = ssd.stats();
            out.push_str(&format!("ssd_keys:{}\n", ssd.index_len()));
            out.push_str(&format!("ssd_bytes:{}\n", s.bytes));
            out.push_str(&format!("ssd_gets:{}\n", s.gets));
            out.push_str(&format!("ssd_hits:{}\n", s.hits));
            out.push_str(&format!("ssd_misses:{}\n", s.misses));
            out.push_str(&format!("ssd_promotions:{}\n", s.promotions));
            out.push_str(&format!("ssd_demotions:{}\n", s.demotions));
            out.push_str(&format!("ssd_read_mb:{}\n", s.read_mb));
            out.push_str(&format!("ssd_write_mb:{}\n", s.write_mb));
            out.push_str(&format!("ssd_gc_runs:{}\n", s.gc_runs));
            out.push_str(&format!("ssd_gc_bytes_reclaimed:{}\n", s.gc_bytes_reclaimed));
            out.push_str(&format!("ssd_gc_time_ms:{}\n", s.gc_time_ms));
            out.push_str(&format!(
                "ssd_fragmentation_estimate:{}\n",
                s.fragmentation_estimate
            ));
            out.push_str(&format!("ssd_index_rebuild_ms:{}\n", s.index_rebuild_ms));
            out.push_str(&format!("ssd_tail_repairs:{}\n", s.tail_repairs));
        }

        let mut counts: Vec<(&String, u64)> =
            self.entries.iter().map(|(k, e)| (k, e.hit_count)).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        out.push_str("topk_hits:");
        for (i, (key, hits)) in counts.iter().take(5).enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{}:{}", key, hits));
        }
        out.push('\n');
        out
    }

    /// Swap the eviction policy, preserving the current control parameters.
    pub fn set_policy(&mut self, mut policy: Box<dyn EvictionPolicy>) {
        policy.set_params(self.control_params.clone());
        self.policy = policy;
        info!(policy = self.policy.name(), "eviction policy swapped");
    }

    /// Write an operator-facing stats dump.
    pub fn dump_stats(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        out.push_str("config_hash:na\n");
        out.push_str(&format!(
            "policy_params_version:{}\n",
            self.control_params.version
        ));
        out.push_str(&format!("memory_used_bytes:{}\n", self.memory_used));
        out.push_str(&format!(
            "memory_limit_bytes:{}\n",
            self.cfg.memory_limit_bytes
        ));
        let mut owners: Vec<(&String, &usize)> = self.owner_usage.iter().collect();
        owners.sort_by(|a, b| a.0.cmp(b.0));
        out.push_str("owners:");
        for (i, (owner, bytes)) in owners.iter().take(5).enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{}:{}", owner, bytes));
        }
        out.push('\n');
        out.push_str(&format!(
            "eviction_reasons:memory_pressure={},expiry={}\n",
            self.stats.evictions, self.stats.expirations
        ));
        std::fs::write(path, out)?;
        Ok(())
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn expiration_backlog(&self) -> usize {
        self.expiration_backlog
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Version tag of the currently applied parameters.
    pub fn params_version(&self) -> &str {
        &self.policy.params().version
    }

    /// `bucket_used / memory_used`; 1.0 when the table is empty. Report
    /// only; limit enforcement uses exact sizes.
    pub fn memory_overhead_ratio(&self) -> f64 {
        if self.memory_used == 0 {
            1.0
        } else {
            self.bucket_used as f64 / self.memory_used as f64
        }
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn cohort_params(&self, canary: bool) -> &PolicyParams {
        if canary && self.canary_active {
            &self.canary_params
        } else {
            &self.control_params
        }
    }

    fn exists_and_not_expired(&mut self, key: &str) -> bool {
        let expired = match self.entries.get(key) {
            Some(e) => e.is_expired(SystemTime::now()),
            None => return false,
        };
        if expired {
            self.erase_internal(key, false, true);
            return false;
        }
        true
    }

    fn insert_entry(&mut self, key: String, entry: Entry) {
        let size = entry.size_bytes;
        *self.owner_usage.entry(entry.owner.clone()).or_insert(0) += size;
        self.memory_used += size;
        self.bucket_used += bucket_for(size);
        self.policy.on_insert(&key, &entry);
        let deadline = entry.ttl_deadline;
        self.entries.insert(key.clone(), entry);
        if let Some(deadline) = deadline {
            self.schedule_expiry(&key, deadline);
        }
    }

    fn schedule_expiry(&mut self, key: &str, deadline: TimePoint) {
        let generation = self
            .expiry_generation
            .entry(key.to_string())
            .and_modify(|g| *g += 1)
            .or_insert(1);
        self.expiry_heap.push(Reverse(ExpiryNode {
            deadline,
            key: key.to_string(),
            generation: *generation,
        }));
    }

    pub(crate) fn erase_internal(&mut self, key: &str, eviction: bool, expiration: bool) {
        if let Some(entry) = self.entries.remove(key) {
            if let Some(usage) = self.owner_usage.get_mut(&entry.owner) {
                *usage = usage.saturating_sub(entry.size_bytes);
            }
            self.memory_used -= entry.size_bytes;
            self.bucket_used -= bucket_for(entry.size_bytes);
            self.policy.on_erase(key);
            self.expiry_generation.remove(key);
            if eviction {
                self.stats.evictions += 1;
            }
            if expiration {
                self.stats.expirations += 1;
            }
        }
    }

    pub(crate) fn evict_until_fit(&mut self) {
        let mut safety = self.entries.len() + 1;
        let mut first = true;
        while self.memory_used > self.cfg.memory_limit_bytes && safety > 0 {
            safety -= 1;
            let victim = self.policy.pick_victim(
                &self.entries,
                self.memory_used,
                self.cfg.memory_limit_bytes,
            );
            let victim = match victim {
                Some(v) => v,
                // Fail open at capacity; admission rejects further growth.
                None => break,
            };
            if first && self.ssd.is_some() {
                self.queue_demotion(&victim);
            } else {
                self.erase_internal(&victim, true, false);
            }
            first = false;
        }
    }

    fn owner_miss_cost(&self, owner: &str) -> f64 {
        match owner {
            "premium" => 2.0,
            "vector" => 8.0,
            "prompt" => 2.0,
            "rag" => 3.0,
            "rerank" => 4.0,
            "response" => 5.0,
            _ => 1.0,
        }
    }

    pub(crate) fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Round a size up to its accounting bucket: the smallest of
/// {64, 128, 256, 512, 1024}, then 512-byte steps to 4096, then 4096-byte
/// steps.
fn bucket_for(size: usize) -> usize {
    match size {
        0..=64 => 64,
        65..=128 => 128,
        129..=256 => 256,
        257..=512 => 512,
        513..=1024 => 1024,
        1025..=4096 => (size + 511) / 512 * 512,
        _ => (size + 4095) / 4096 * 4096,
    }
}
