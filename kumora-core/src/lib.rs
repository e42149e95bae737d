//! # Kumora Core
//!
//! Fundamental building blocks shared by every Kumora crate:
//! - Cache entry and clock types
//! - Error types
//! - Engine and tier configuration
//! - FNV hashing primitives
//! - Server-level metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   kumora-core                   │
//! ├─────────────────────────────────────────────────┤
//! │  • types      - Entry record, time points       │
//! │  • error      - Error handling                  │
//! │  • config     - Engine/tier/fsync configuration │
//! │  • hash       - FNV-1a checksums & key hashes   │
//! │  • metrics    - Server counters                 │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod types;

// Re-export commonly used types
pub use config::{EngineConfig, FsyncMode, TierConfig};
pub use error::{Error, Result};
pub use types::{Entry, TimePoint};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u32 = 1;
