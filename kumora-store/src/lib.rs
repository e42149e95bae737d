//! # Kumora SSD Store
//!
//! Append-only overflow tier backing the RAM cache.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Write Path                            │
//! │                                                             │
//! │  put/del ──> token bucket ──> append record ──> fsync       │
//! │                                   │            (per policy) │
//! │                                   ▼                         │
//! │                       in-memory key index                   │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Read Path                             │
//! │                                                             │
//! │  get ──> index lookup ──> lazy TTL check ──> pread record   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are self-describing and checksummed; recovery scans every
//! segment, truncates a torn tail, and rebuilds the index with
//! last-writer-wins ordering on the record sequence number.

pub mod manifest;
pub mod record;
pub mod store;
pub mod throttle;

pub use manifest::Manifest;
pub use record::{RecordHeader, RECORD_HEADER_SIZE, RECORD_MAGIC};
pub use store::{SsdConfig, SsdMeta, SsdStats, SsdStore};
pub use throttle::TokenBucket;
