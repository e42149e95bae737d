//! FNV-1a hashing used for record checksums, key hashes, content addresses
//! and canary cohort selection. Non-cryptographic: corruption detection and
//! bucketing only.

const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// FNV-1a 64 of a byte slice.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut h = FNV64_OFFSET;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(FNV64_PRIME);
    }
    h
}

/// Lowercase hex rendering of the FNV-1a 64 digest, used as a blob address.
pub fn fnv1a_64_hex(data: &[u8]) -> String {
    format!("{:x}", fnv1a_64(data))
}

/// Incremental FNV-1a 32, for checksums computed over several slices.
#[derive(Debug, Clone)]
pub struct Fnv32 {
    state: u32,
}

impl Fnv32 {
    pub fn new() -> Self {
        Self { state: FNV32_OFFSET }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.state ^= b as u32;
            self.state = self.state.wrapping_mul(FNV32_PRIME);
        }
    }

    pub fn finish(&self) -> u32 {
        self.state
    }
}

impl Default for Fnv32 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
        let mut h = Fnv32::new();
        h.update(b"a");
        assert_eq!(h.finish(), 0xe40c292c);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut split = Fnv32::new();
        split.update(b"hello ");
        split.update(b"world");
        let mut whole = Fnv32::new();
        whole.update(b"hello world");
        assert_eq!(split.finish(), whole.finish());
    }

    #[test]
    fn hex_is_lowercase_and_stable() {
        let h = fnv1a_64_hex(&[1, 2, 3, 4]);
        assert_eq!(h, format!("{:x}", fnv1a_64(&[1, 2, 3, 4])));
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
