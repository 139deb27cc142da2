//! Content splitters: cut an input stream into chunk-sized segments.
//!
//! The repository core never splits data itself (the snapshot walker
//! does), but the chosen splitter is part of the repository format:
//! two clients must cut identical streams identically or deduplication
//! degrades. Splitters are registered by name; the format blob records
//! the name chosen at create time.

use anyhow::{bail, Error};

/// Default splitter for new repositories.
pub const DEFAULT_SPLITTER: &str = "rolling-4m";

const WINDOW_SIZE: usize = 64;

// Derived once at compile time from a fixed seed; the table only has
// to be well mixed and identical everywhere, not secret.
const fn splitmix64(state: u64) -> u64 {
    let z = state.wrapping_mul(0x9e3779b97f4a7c15);
    let z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    let z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

const fn build_hash_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut state = 0x48424b5f53504c49u64; // arbitrary fixed seed
    let mut index = 0;
    while index < 256 {
        state = splitmix64(state);
        table[index] = (state >> 32) as u32;
        index += 1;
    }
    table
}

static HASH_TABLE: [u32; 256] = build_hash_table();

/// Scans a stream for segment boundaries.
///
/// `scan` returns the number of bytes up to and including the next
/// boundary, or 0 when the caller should feed more data. State carries
/// over between calls, so arbitrary buffering is fine.
pub trait Splitter: Send {
    fn scan(&mut self, data: &[u8]) -> usize;

    /// Largest segment this splitter can emit.
    fn max_segment_size(&self) -> usize;
}

/// Cuts every `size` bytes, for streams with stable block alignment.
pub struct FixedSplitter {
    size: usize,
    filled: usize,
}

impl FixedSplitter {
    pub fn new(size: usize) -> Self {
        Self { size, filled: 0 }
    }
}

impl Splitter for FixedSplitter {
    fn scan(&mut self, data: &[u8]) -> usize {
        let missing = self.size - self.filled;
        if data.len() >= missing {
            self.filled = 0;
            missing
        } else {
            self.filled += data.len();
            0
        }
    }

    fn max_segment_size(&self) -> usize {
        self.size
    }
}

/// Content-defined splitter over a rolling (cyclic polynomial) hash.
///
/// A boundary is cut where the rolled hash matches the mask derived
/// from the target average size, constrained to `avg/4 ..= avg*4` so
/// pathological inputs cannot produce degenerate segments. The window
/// never cuts on a zero hash, which constant streams would otherwise
/// hit on every byte.
pub struct RollingSplitter {
    hash: u32,
    window: [u8; WINDOW_SIZE],
    window_fill: usize,
    segment_len: usize,
    min_size: usize,
    max_size: usize,
    mask: u32,
}

impl RollingSplitter {
    /// `avg_size` must be a power of two.
    pub fn new(avg_size: usize) -> Result<Self, Error> {
        if avg_size.count_ones() != 1 || avg_size < WINDOW_SIZE * 4 {
            bail!("invalid average segment size {}", avg_size);
        }
        Ok(Self {
            hash: 0,
            window: [0u8; WINDOW_SIZE],
            window_fill: 0,
            segment_len: 0,
            min_size: avg_size >> 2,
            max_size: avg_size << 2,
            mask: (avg_size - 1) as u32,
        })
    }

    fn reset(&mut self) {
        self.hash = 0;
        self.window = [0u8; WINDOW_SIZE];
        self.window_fill = 0;
        self.segment_len = 0;
    }

    fn roll(&mut self, byte: u8) {
        let slot = self.segment_len % WINDOW_SIZE;
        let outgoing = self.window[slot];
        self.window[slot] = byte;

        // cyclic polynomial: rotate, add the new byte, remove the one
        // leaving the window (rotated by the full window width)
        self.hash = self.hash.rotate_left(1)
            ^ HASH_TABLE[byte as usize]
            ^ HASH_TABLE[outgoing as usize].rotate_left((WINDOW_SIZE % 32) as u32);
        if self.window_fill < WINDOW_SIZE {
            self.window_fill += 1;
        }
    }
}

impl Splitter for RollingSplitter {
    fn scan(&mut self, data: &[u8]) -> usize {
        for (pos, byte) in data.iter().enumerate() {
            self.roll(*byte);
            self.segment_len += 1;

            if self.segment_len >= self.max_size {
                self.reset();
                return pos + 1;
            }
            if self.segment_len < self.min_size || self.window_fill < WINDOW_SIZE {
                continue;
            }
            if self.hash != 0 && self.hash & self.mask == self.mask {
                self.reset();
                return pos + 1;
            }
        }
        0
    }

    fn max_segment_size(&self) -> usize {
        self.max_size
    }
}

/// Registered splitter names, deprecated ones last.
pub fn supported_splitters() -> &'static [&'static str] {
    &[
        "rolling-1m",
        "rolling-4m",
        "rolling-8m",
        "fixed-1m",
        "fixed-4m",
    ]
}

/// Instantiate a splitter by its registered name.
pub fn splitter_by_name(name: &str) -> Result<Box<dyn Splitter>, Error> {
    const MIB: usize = 1024 * 1024;
    Ok(match name {
        "rolling-1m" => Box::new(RollingSplitter::new(MIB)?),
        "rolling-4m" => Box::new(RollingSplitter::new(4 * MIB)?),
        "rolling-8m" => Box::new(RollingSplitter::new(8 * MIB)?),
        "fixed-1m" => Box::new(FixedSplitter::new(MIB)),
        "fixed-4m" => Box::new(FixedSplitter::new(4 * MIB)),
        other => bail!("unknown splitter '{}'", other),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn split_all(splitter: &mut dyn Splitter, mut data: &[u8]) -> Vec<usize> {
        let mut sizes = Vec::new();
        loop {
            let cut = splitter.scan(data);
            if cut == 0 {
                if !data.is_empty() {
                    sizes.push(data.len()); // trailing partial segment
                }
                return sizes;
            }
            sizes.push(cut);
            data = &data[cut..];
        }
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut state = 0x1234_5678_9abc_def0u64;
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            state = splitmix64(state);
            data.extend_from_slice(&state.to_le_bytes());
        }
        data.truncate(len);
        data
    }

    #[test]
    fn fixed_splitter_cuts_evenly() {
        let mut splitter = FixedSplitter::new(1024);
        let sizes = split_all(&mut splitter, &[0u8; 4096 + 100]);
        assert_eq!(sizes, [1024, 1024, 1024, 1024, 100]);

        // state carries across feeds
        let mut splitter = FixedSplitter::new(1024);
        assert_eq!(splitter.scan(&[0u8; 1000]), 0);
        assert_eq!(splitter.scan(&[0u8; 1000]), 24);
    }

    #[test]
    fn rolling_splitter_respects_bounds() -> Result<(), Error> {
        let avg = 4096;
        let mut splitter = RollingSplitter::new(avg)?;
        let data = pseudo_random(256 * 1024);
        let sizes = split_all(&mut splitter, &data);

        assert!(sizes.len() > 1);
        let (last, cuts) = sizes.split_last().unwrap();
        for size in cuts {
            assert!(*size >= avg / 4, "segment too small: {}", size);
            assert!(*size <= avg * 4, "segment too large: {}", size);
        }
        assert!(*last <= avg * 4);
        assert_eq!(sizes.iter().sum::<usize>(), data.len());
        Ok(())
    }

    #[test]
    fn rolling_splitter_is_deterministic() -> Result<(), Error> {
        let data = pseudo_random(128 * 1024);
        let mut first = RollingSplitter::new(4096)?;
        let mut second = RollingSplitter::new(4096)?;
        assert_eq!(split_all(&mut first, &data), split_all(&mut second, &data));
        Ok(())
    }

    #[test]
    fn constant_stream_hits_max_size() -> Result<(), Error> {
        // an all-zero stream never produces a mask match; the max
        // bound must cut anyway
        let mut splitter = RollingSplitter::new(4096)?;
        let sizes = split_all(&mut splitter, &vec![0u8; 64 * 1024]);
        assert!(sizes.iter().all(|size| *size <= 4096 * 4));
        Ok(())
    }

    #[test]
    fn registry_lookup() {
        assert!(splitter_by_name(DEFAULT_SPLITTER).is_ok());
        for name in supported_splitters() {
            assert!(splitter_by_name(name).is_ok());
        }
        assert!(splitter_by_name("rolling-3m").is_err());
        assert!(RollingSplitter::new(1000).is_err());
    }
}
