//! # Bloom Filter
//!
//! Answers "is this key possibly in the file?" without touching the file.
//! A negative answer is exact; a positive one is wrong with probability about
//! [`FALSE_POSITIVE_RATE`].
//!
//! Every SSTable stores the filter of its keys in its bloom section, and each
//! level keeps the filters of its files in memory so a point lookup only
//! reads files whose filter says "maybe".
//!
//! ## Sizing
//!
//! `k` is fixed at [`NUM_HASHES`]. The bit count for `n` expected keys and a
//! target probability `p` is
//!
//! ```text
//! m = ceil(n * ln(p) / ln(1 / 2^ln2))
//! ```
//!
//! ## Encoding
//!
//! ```text
//! [num_bits: u64 LE][k: u8][words: u32 LE][word: u64 LE]*words
//! ```
//!
//! ```rust
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::for_items(1000);
//! bf.insert(b"user:42");
//! assert!(bf.may_contain(b"user:42"));
//! ```

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Number of probes per key (`k`).
pub const NUM_HASHES: u32 = 10;

/// Target false-positive probability used by [`BloomFilter::for_items`].
pub const FALSE_POSITIVE_RATE: f64 = 0.001;

/// Encoded size of everything before the words.
const PREFIX_BYTES: usize = 8 + 1 + 4;

/// Upper bound accepted when decoding, in 64-bit words (128 MiB).
const MAX_WORDS: usize = 16 * 1024 * 1024;

#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
}

impl BloomFilter {
    /// A filter for `expected_items` keys at [`FALSE_POSITIVE_RATE`].
    pub fn for_items(expected_items: usize) -> Self {
        Self::new(expected_items, FALSE_POSITIVE_RATE)
    }

    /// A filter for `expected_items` keys at `false_positive_rate`. Zero
    /// items are treated as one.
    ///
    /// # Panics
    ///
    /// If `false_positive_rate` is not in `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );
        let n = expected_items.max(1) as f64;
        let ln_half_pow = (1.0 / 2f64.powf(std::f64::consts::LN_2)).ln();
        let num_bits = ((n * false_positive_rate.ln() / ln_half_pow).ceil() as u64).max(64);
        Self {
            words: vec![0; words_for(num_bits)],
            num_bits,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        for bit in probes(key, self.num_bits) {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// `false` means `key` was never inserted.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        probes(key, self.num_bits).all(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        NUM_HASHES
    }

    /// Bytes written by [`write_to`](Self::write_to).
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        PREFIX_BYTES + self.words.len() * 8
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.num_bits)?;
        w.write_u8(NUM_HASHES as u8)?;
        w.write_u32::<LittleEndian>(self.words.len() as u32)?;
        for word in &self.words {
            w.write_u64::<LittleEndian>(*word)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let num_bits = r.read_u64::<LittleEndian>()?;
        let k = r.read_u8()?;
        let count = r.read_u32::<LittleEndian>()? as usize;

        if u32::from(k) != NUM_HASHES {
            return Err(invalid(format!("bloom filter uses {} hashes, expected {}", k, NUM_HASHES)));
        }
        if count > MAX_WORDS {
            return Err(invalid(format!("bloom filter too large: {} words", count)));
        }
        if num_bits == 0 || words_for(num_bits) != count {
            return Err(invalid(format!("bloom filter claims {} bits in {} words", num_bits, count)));
        }

        let mut words = vec![0u64; count];
        r.read_u64_into::<LittleEndian>(&mut words)?;
        Ok(Self { words, num_bits })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("words", &self.words.len())
            .finish()
    }
}

fn words_for(num_bits: u64) -> usize {
    ((num_bits + 63) / 64) as usize
}

/// The `k` bit positions of `key`: farmhash under `k` distinct seeds.
fn probes(key: &[u8], num_bits: u64) -> impl Iterator<Item = u64> + '_ {
    (0..NUM_HASHES).map(move |i| {
        let seed = 0x9e37_79b9_7f4a_7c15u64.wrapping_mul(u64::from(i) + 1);
        farmhash::hash64_with_seed(key, seed) % num_bits
    })
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
