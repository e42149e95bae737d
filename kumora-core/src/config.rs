//! # Configuration
//!
//! Engine, tier and durability configuration for Kumora.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// When the SSD tier fsyncs appended records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsyncMode {
    /// Never fsync; durability trades for throughput.
    Never,
    /// Fsync at most once per wall-clock second, coalescing writes.
    EverySec,
    /// Fsync after every appended record.
    Always,
}

impl FromStr for FsyncMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(FsyncMode::Never),
            "everysec" | "every-second" => Ok(FsyncMode::EverySec),
            "always" => Ok(FsyncMode::Always),
            other => Err(crate::error::Error::Configuration {
                message: format!("unknown fsync mode: {}", other),
            }),
        }
    }
}

/// RAM/SSD tier placement knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub ssd_enabled: bool,
    /// Values at or above this size are written through to SSD on `set`.
    pub ssd_value_min_bytes: usize,
    pub ssd_max_bytes: usize,
    pub ram_max_bytes: usize,
    /// SSD hits before a sub-threshold value is promoted back to RAM.
    pub promotion_hits: u64,
    /// RAM fill ratio at which the pressure probe starts demoting.
    pub demotion_pressure: f64,
    pub ssd_max_read_mb_s: usize,
    pub ssd_max_write_mb_s: usize,
    /// Live records copied per compaction run.
    pub compaction_batch: usize,
    pub gc_fragmentation_threshold: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            ssd_enabled: false,
            ssd_value_min_bytes: 32 * 1024,
            ssd_max_bytes: 2 * 1024 * 1024 * 1024,
            ram_max_bytes: 64 * 1024 * 1024,
            promotion_hits: 3,
            demotion_pressure: 0.90,
            ssd_max_read_mb_s: 256,
            ssd_max_write_mb_s: 256,
            compaction_batch: 256,
            gc_fragmentation_threshold: 0.25,
        }
    }
}

/// Cache engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub memory_limit_bytes: usize,
    pub max_key_len: usize,
    pub max_value_size: usize,
    /// Expired heads popped from the expiry heap per `tick`.
    pub ttl_cleanup_per_tick: usize,
    /// Promote/demote operations drained per `tick`.
    pub tier_work_per_tick: usize,
    /// Root for SSD segments, manifest and the last-known-good params file.
    pub data_dir: PathBuf,
    pub tier: TierConfig,
    pub fsync: FsyncMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 64 * 1024 * 1024,
            max_key_len: 256,
            max_value_size: 1024 * 1024,
            ttl_cleanup_per_tick: 128,
            tier_work_per_tick: 64,
            data_dir: PathBuf::from("./data"),
            tier: TierConfig::default(),
            fsync: FsyncMode::EverySec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsync_mode_parses_aliases() {
        assert_eq!("never".parse::<FsyncMode>().unwrap(), FsyncMode::Never);
        assert_eq!("everysec".parse::<FsyncMode>().unwrap(), FsyncMode::EverySec);
        assert_eq!("every-second".parse::<FsyncMode>().unwrap(), FsyncMode::EverySec);
        assert_eq!("ALWAYS".parse::<FsyncMode>().unwrap(), FsyncMode::Always);
        assert!("sometimes".parse::<FsyncMode>().is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_key_len, 256);
        assert_eq!(cfg.ttl_cleanup_per_tick, 128);
        assert!(!cfg.tier.ssd_enabled);
        assert!(cfg.tier.demotion_pressure > 0.0 && cfg.tier.demotion_pressure <= 1.0);
    }
}
