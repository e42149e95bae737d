//! The manifest tracks the set of live segments and which one is active.
//!
//! Manifest File Format (`manifest.txt`)
//! ┌───────────────────────────────┐
//! │ active=<id>                   │
//! │ segment=<id>   (one per line) │
//! └───────────────────────────────┘
//!
//! The swap is atomic: write `manifest.tmp`, fsync it, rename over the
//! final name, fsync the directory. Readers tolerate a missing manifest
//! and fall back to a single segment with id 1.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use kumora_core::error::Result;
use tracing::{info, warn};

const MANIFEST_NAME: &str = "manifest.txt";
const MANIFEST_TMP: &str = "manifest.tmp";

/// Persistent segment roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub active: u32,
    pub segments: Vec<u32>,
}

impl Manifest {
    /// Fresh single-segment manifest.
    pub fn new() -> Self {
        Self {
            active: 1,
            segments: vec![1],
        }
    }

    /// Load the manifest, or `None` when the file is missing or unreadable
    /// (recovery then falls back to `active=1`).
    pub fn load(dir: &Path) -> Option<Self> {
        let file = File::open(dir.join(MANIFEST_NAME)).ok()?;
        let mut active = 1u32;
        let mut segments = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "manifest read failed mid-file, ignoring rest");
                    break;
                }
            };
            if let Some(id) = line.strip_prefix("active=") {
                if let Ok(id) = id.trim().parse::<u32>() {
                    active = id;
                }
            } else if let Some(id) = line.strip_prefix("segment=") {
                if let Ok(id) = id.trim().parse::<u32>() {
                    segments.push(id);
                }
            }
        }
        if segments.is_empty() {
            segments.push(active);
        }
        Some(Self { active, segments })
    }

    /// Atomically replace the on-disk manifest.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let tmp_path = dir.join(MANIFEST_TMP);
        let final_path = dir.join(MANIFEST_NAME);
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            writeln!(tmp, "active={}", self.active)?;
            for id in &self.segments {
                writeln!(tmp, "segment={}", id)?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        // Make the rename durable.
        File::open(dir)?.sync_all()?;
        info!(active = self.active, segments = self.segments.len(), "manifest saved");
        Ok(())
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}
