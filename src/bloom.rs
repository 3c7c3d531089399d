//! A per-StoreFile bloom oracle: `contains(row+column) -> bool`, where only
//! a `false` answer is actionable ("definitely absent"). Construction
//! internals are out of scope for this engine; this is the thin
//! persistence and query layer the flusher and read path touch.

use std::io::{self, Read, Write};

/// A bit-vector bloom filter with `k` independent hash functions, using
/// double hashing over two FNV-1a variants.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` at the given target false
    /// positive rate.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let m = (-n * false_positive_rate.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(8);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        let k = k.max(1);
        let byte_len = m.div_ceil(8) as usize;

        BloomFilter { bits: vec![0u8; byte_len], num_bits: m, num_hashes: k }
    }

    fn from_raw(bits: Vec<u8>, num_bits: u64, num_hashes: u32) -> Self {
        BloomFilter { bits, num_bits, num_hashes }
    }

    /// Records that `key` (typically `row` concatenated with `column`) was
    /// written into this StoreFile.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = self.hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.set_bit(idx);
        }
    }

    /// Returns `true` if `key` might be present, `false` if it is
    /// definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = self.hash_pair(key);
        (0..self.num_hashes).all(|i| self.get_bit(self.bit_index(h1, h2, i)))
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.num_bits.to_le_bytes())?;
        w.write_all(&self.num_hashes.to_le_bytes())?;
        w.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        w.write_all(&self.bits)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        r.read_exact(&mut buf8)?;
        let num_bits = u64::from_le_bytes(buf8);

        r.read_exact(&mut buf4)?;
        let num_hashes = u32::from_le_bytes(buf4);

        r.read_exact(&mut buf4)?;
        let bits_len = u32::from_le_bytes(buf4) as usize;

        const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;
        if bits_len > MAX_BLOOM_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bloom filter too large: {bits_len} bytes"),
            ));
        }

        let mut bits = vec![0u8; bits_len];
        r.read_exact(&mut bits)?;
        Ok(Self::from_raw(bits, num_bits, num_hashes))
    }

    fn hash_pair(&self, key: &[u8]) -> (u64, u64) {
        (fnv1a_64(key, 0xcbf29ce484222325), fnv1a_64(key, 0x517cc1b727220a95))
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    fn set_bit(&mut self, idx: u64) {
        let (byte, bit) = ((idx / 8) as usize, (idx % 8) as u8);
        self.bits[byte] |= 1 << bit;
    }

    fn get_bit(&self, idx: u64) -> bool {
        let (byte, bit) = ((idx / 8) as usize, (idx % 8) as u8);
        (self.bits[byte] >> bit) & 1 == 1
    }
}

/// Builds the `row+column` key a bloom filter is keyed on.
pub fn cell_key(row: &[u8], column: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(row.len() + column.len() + 1);
    k.extend_from_slice(row);
    k.push(0u8);
    k.extend_from_slice(column);
    k
}

fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_reported_present() {
        let mut bf = BloomFilter::new(100, 0.01);
        bf.insert(&cell_key(b"row1", b"col1"));
        assert!(bf.may_contain(&cell_key(b"row1", b"col1")));
    }

    #[test]
    fn absent_key_is_usually_reported_absent() {
        let mut bf = BloomFilter::new(100, 0.01);
        for i in 0..50u32 {
            bf.insert(&cell_key(format!("row{i}").as_bytes(), b"col"));
        }
        assert!(!bf.may_contain(&cell_key(b"definitely-not-inserted", b"col")));
    }

    #[test]
    fn round_trips_through_the_wire_format() {
        let mut bf = BloomFilter::new(64, 0.05);
        bf.insert(&cell_key(b"r", b"c"));
        let mut buf = Vec::new();
        bf.write_to(&mut buf).unwrap();
        let back = BloomFilter::read_from(&mut &buf[..]).unwrap();
        assert!(back.may_contain(&cell_key(b"r", b"c")));
        assert_eq!(back.num_bits, bf.num_bits);
        assert_eq!(back.num_hashes, bf.num_hashes);
    }
}
