//! Promotion/demotion controller.
//!
//! Values move between RAM and SSD under access and pressure signals:
//! - SSD hits count toward promotion; sub-threshold values come back to RAM
//!   with their remaining TTL once they reach `promotion_hits`.
//! - The eviction path and a memory-pressure probe queue demotions; a
//!   demotion writes the value to SSD and erases it from RAM, counted as an
//!   eviction.
//!
//! All queue work is bounded by `tier_work_per_tick`, promotions first.

use bytes::Bytes;
use tracing::{debug, warn};

use kumora_core::error::Error;
use kumora_core::types::{from_epoch_ms, Entry, TimePoint};

use super::{bucket_for, Engine};

impl Engine {
    /// Tier slice of the maintenance pass.
    pub(crate) fn tier_tick(&mut self, now: TimePoint) {
        if self.ssd.is_none() {
            return;
        }
        let expiry_budget = self.cfg.ttl_cleanup_per_tick;
        if let Some(ssd) = self.ssd.as_mut() {
            ssd.erase_expired(expiry_budget, now);
        }

        let budget = self.cfg.tier_work_per_tick;
        let mut work = 0;
        while work < budget {
            let key = match self.promote_queue.pop_front() {
                Some(k) => k,
                None => break,
            };
            work += 1;
            self.promote_one(&key);
        }
        while work < budget {
            let (key, entry) = match self.demote_queue.pop_front() {
                Some(pair) => pair,
                None => break,
            };
            work += 1;
            if !self.demote_one(key, entry) {
                break;
            }
        }

        self.pressure_probe();

        if let Some(ssd) = self.ssd.as_mut() {
            ssd.maybe_compact();
        }
    }

    /// SSD side of a `get` miss: read, count toward promotion.
    pub(crate) fn ssd_get(&mut self, key: &str) -> Option<Bytes> {
        let promotion_hits = self.cfg.tier.promotion_hits.max(1);
        let min_bytes = self.cfg.tier.ssd_value_min_bytes;
        let (value, meta) = self.ssd.as_mut()?.get(key)?;
        let hits = self
            .ssd_hit_counts
            .entry(key.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        if *hits == promotion_hits && (meta.len as usize) < min_bytes {
            self.promote_queue.push_back(key.to_string());
        }
        Some(value)
    }

    /// Write-through for large values on `set`.
    pub(crate) fn write_through(&mut self, key: &str, entry: &Entry) -> kumora_core::Result<()> {
        let seq = self.alloc_seq();
        match self.ssd.as_mut() {
            Some(ssd) => ssd.put(key, &entry.value, entry.ttl_deadline, seq),
            None => Ok(()),
        }
    }

    /// Append a tombstone for a deleted key.
    pub(crate) fn ssd_tombstone(&mut self, key: &str) {
        let seq = self.alloc_seq();
        if let Some(ssd) = self.ssd.as_mut() {
            if let Err(e) = ssd.del(key, seq) {
                warn!(key, error = %e, "ssd tombstone append failed");
            }
        }
    }

    /// Move an entry out of RAM onto the demote queue, counted as an
    /// eviction. The queue owns the value until the drain writes it out.
    pub(crate) fn queue_demotion(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            if let Some(usage) = self.owner_usage.get_mut(&entry.owner) {
                *usage = usage.saturating_sub(entry.size_bytes);
            }
            self.memory_used -= entry.size_bytes;
            self.bucket_used -= bucket_for(entry.size_bytes);
            self.policy.on_erase(key);
            self.expiry_generation.remove(key);
            self.stats.evictions += 1;
            self.demote_queue.push_back((key.to_string(), entry));
        }
    }

    fn promote_one(&mut self, key: &str) {
        if self.entries.contains_key(key) {
            self.ssd_hit_counts.remove(key);
            return;
        }
        let fetched = match self.ssd.as_mut() {
            Some(ssd) => ssd.get(key),
            None => None,
        };
        let (value, meta) = match fetched {
            Some(pair) => pair,
            None => return,
        };
        let seq = self.alloc_seq();
        if let Some(ssd) = self.ssd.as_mut() {
            if let Err(e) = ssd.del(key, seq) {
                warn!(key, error = %e, "tombstone after promotion failed");
            }
            ssd.note_promotion();
        }
        // The record format carries no owner tag; promoted entries are
        // re-attributed to the default owner.
        let deadline = if meta.ttl_epoch_ms >= 0 {
            Some(from_epoch_ms(meta.ttl_epoch_ms))
        } else {
            None
        };
        let entry = Entry::new(value, "default".to_string(), deadline);
        debug!(key, size = entry.size_bytes, "promoted to ram");
        self.insert_entry(key.to_string(), entry);
        self.ssd_hit_counts.remove(key);
        self.evict_until_fit();
    }

    /// Returns false when the drain should stop for this tick (write budget
    /// exhausted; the pair is requeued).
    fn demote_one(&mut self, key: String, entry: Entry) -> bool {
        let seq = self.alloc_seq();
        let result = match self.ssd.as_mut() {
            Some(ssd) => ssd.put(&key, &entry.value, entry.ttl_deadline, seq),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                if let Some(ssd) = self.ssd.as_mut() {
                    ssd.note_demotion();
                }
                debug!(key = key.as_str(), size = entry.size_bytes, "demoted to ssd");
                true
            }
            Err(Error::SsdRateLimited) => {
                self.demote_queue.push_front((key, entry));
                false
            }
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "demotion dropped");
                true
            }
        }
    }

    fn pressure_probe(&mut self) {
        let limit = self.cfg.memory_limit_bytes;
        let pressure = self.cfg.tier.demotion_pressure;
        if limit == 0 || (self.memory_used as f64) < limit as f64 * pressure {
            return;
        }
        let victim = self
            .policy
            .pick_victim(&self.entries, self.memory_used, limit);
        if let Some(victim) = victim {
            self.queue_demotion(&victim);
        }
    }
}
