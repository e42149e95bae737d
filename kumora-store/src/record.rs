//! On-disk record codec.
//!
//! Record Layout (little-endian, packed)
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (56 bytes)                                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Magic (4 bytes): "PMC4"                             │    │
//! │  │ Checksum (4 bytes): FNV-1a 32, header w/o this      │    │
//! │  │         field, then key bytes, then value bytes     │    │
//! │  │ Key Hash (8 bytes): FNV-1a 64 of key                │    │
//! │  │ Sequence (8 bytes)                                  │    │
//! │  │ Offset Next (8 bytes, reserved, 0)                  │    │
//! │  │ TTL Epoch ms (8 bytes, -1 = no TTL)                 │    │
//! │  │ Key Len (4 bytes)                                   │    │
//! │  │ Value Len (4 bytes)                                 │    │
//! │  │ Tombstone (1 byte)                                  │    │
//! │  │ Reserved (7 bytes)                                  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │  Key (key_len bytes)                                        │
//! │  Value (value_len bytes)                                    │
//! └─────────────────────────────────────────────────────────────┘

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use kumora_core::error::Result;
use kumora_core::hash::{fnv1a_64, Fnv32};

pub const RECORD_MAGIC: u32 = 0x504d_3443; // "PMC4"
pub const RECORD_HEADER_SIZE: usize = 56;

const CHECKSUM_OFFSET: usize = 4;
const CHECKSUM_LEN: usize = 4;

/// Fixed-width header preceding every key/value record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub checksum: u32,
    pub key_hash: u64,
    pub seq: u64,
    pub offset_next: u64,
    pub ttl_epoch_ms: i64,
    pub key_len: u32,
    pub value_len: u32,
    pub tombstone: bool,
}

impl RecordHeader {
    /// Build a header for a record, computing the checksum over the header
    /// (checksum field excluded), the key and the value.
    pub fn for_record(
        key: &[u8],
        value: &[u8],
        ttl_epoch_ms: i64,
        seq: u64,
        tombstone: bool,
    ) -> Self {
        let mut h = Self {
            checksum: 0,
            key_hash: fnv1a_64(key),
            seq,
            offset_next: 0,
            ttl_epoch_ms,
            key_len: key.len() as u32,
            value_len: value.len() as u32,
            tombstone,
        };
        h.checksum = h.compute_checksum(key, value);
        h
    }

    /// Total record length on disk for this header.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.key_len as usize + self.value_len as usize
    }

    pub fn encode_into<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(RECORD_MAGIC)?;
        w.write_u32::<LittleEndian>(self.checksum)?;
        w.write_u64::<LittleEndian>(self.key_hash)?;
        w.write_u64::<LittleEndian>(self.seq)?;
        w.write_u64::<LittleEndian>(self.offset_next)?;
        w.write_i64::<LittleEndian>(self.ttl_epoch_ms)?;
        w.write_u32::<LittleEndian>(self.key_len)?;
        w.write_u32::<LittleEndian>(self.value_len)?;
        w.write_u8(u8::from(self.tombstone))?;
        w.write_all(&[0u8; 7])?;
        Ok(())
    }

    /// Decode a header from a raw buffer. Returns `None` when the magic does
    /// not match (scan treats that as end-of-valid-data).
    pub fn decode(buf: &[u8; RECORD_HEADER_SIZE]) -> Result<Option<Self>> {
        let mut r = &buf[..];
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != RECORD_MAGIC {
            return Ok(None);
        }
        let checksum = r.read_u32::<LittleEndian>()?;
        let key_hash = r.read_u64::<LittleEndian>()?;
        let seq = r.read_u64::<LittleEndian>()?;
        let offset_next = r.read_u64::<LittleEndian>()?;
        let ttl_epoch_ms = r.read_i64::<LittleEndian>()?;
        let key_len = r.read_u32::<LittleEndian>()?;
        let value_len = r.read_u32::<LittleEndian>()?;
        let tombstone = r.read_u8()? != 0;
        let mut reserved = [0u8; 7];
        r.read_exact(&mut reserved)?;
        Ok(Some(Self {
            checksum,
            key_hash,
            seq,
            offset_next,
            ttl_epoch_ms,
            key_len,
            value_len,
            tombstone,
        }))
    }

    /// Recompute the checksum for `key`/`value` under this header.
    pub fn compute_checksum(&self, key: &[u8], value: &[u8]) -> u32 {
        let mut encoded = Vec::with_capacity(RECORD_HEADER_SIZE);
        // Encoding into a Vec cannot fail.
        let _ = self.encode_into(&mut encoded);
        let mut sum = Fnv32::new();
        sum.update(&encoded[..CHECKSUM_OFFSET]);
        sum.update(&encoded[CHECKSUM_OFFSET + CHECKSUM_LEN..]);
        sum.update(key);
        sum.update(value);
        sum.finish()
    }

    /// Verify the stored checksum against `key`/`value`.
    pub fn verify(&self, key: &[u8], value: &[u8]) -> bool {
        self.compute_checksum(key, value) == self.checksum
    }
}
