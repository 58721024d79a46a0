//! Content-defined chunking.
//!
//! Boundaries are chosen by a Rabin fingerprint over a 64-byte sliding
//! window. A cut happens once the chunk is at least `min_size` long and the
//! low `avg_bits` bits of the fingerprint are zero, or unconditionally at
//! `max_size`. Because boundaries depend only on nearby content, an insertion
//! in the middle of a file changes the chunks around the edit and nothing
//! else.

use crate::error::{FilesError, IoContext, Result};
use crate::{DEFAULT_AVG_BITS, DEFAULT_MAX_CHUNK, DEFAULT_MIN_CHUNK};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::OnceLock;

/// Rolling window size in bytes.
pub const WINDOW_SIZE: usize = 64;

/// Irreducible polynomial of degree 53 over GF(2).
pub const POLYNOMIAL: u64 = 0x3DA3358B4DC173;

const POLYNOMIAL_DEGREE: u32 = 53;
const POLYNOMIAL_SHIFT: u32 = POLYNOMIAL_DEGREE - 8;
const READ_BUFFER: usize = 256 * 1024;

/// Chunk size parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// No cut before this many bytes
    pub min_size: usize,
    /// Forced cut at this many bytes
    pub max_size: usize,
    /// Expected chunk size is roughly `2^avg_bits` past `min_size`
    pub avg_bits: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_CHUNK,
            max_size: DEFAULT_MAX_CHUNK,
            avg_bits: DEFAULT_AVG_BITS,
        }
    }
}

impl ChunkerConfig {
    /// Check the parameters are usable.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::ChunkerConfig`] for zero sizes, `min > max`, or
    /// an average outside 1..=40 bits.
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 {
            return Err(FilesError::ChunkerConfig("min_size must be non-zero"));
        }
        if self.min_size > self.max_size {
            return Err(FilesError::ChunkerConfig("min_size exceeds max_size"));
        }
        if !(1..=40).contains(&self.avg_bits) {
            return Err(FilesError::ChunkerConfig("avg_bits must be in 1..=40"));
        }
        Ok(())
    }

    fn mask(&self) -> u64 {
        (1u64 << self.avg_bits) - 1
    }
}

struct Tables {
    out: [u64; 256],
    reduce: [u64; 256],
}

fn degree(p: u64) -> i32 {
    63 - p.leading_zeros() as i32
}

fn poly_mod(mut x: u64, p: u64) -> u64 {
    while x != 0 && degree(x) >= degree(p) {
        x ^= p << (degree(x) - degree(p));
    }
    x
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut out = [0u64; 256];
        let mut reduce = [0u64; 256];
        for b in 0..=255u64 {
            // Fingerprint of b followed by WINDOW_SIZE - 1 zero bytes, so
            // xoring it removes b from the window.
            let mut h = poly_mod(b, POLYNOMIAL);
            for _ in 0..WINDOW_SIZE - 1 {
                h = poly_mod(h << 8, POLYNOMIAL);
            }
            out[b as usize] = h;
            reduce[b as usize] =
                poly_mod(b << POLYNOMIAL_DEGREE, POLYNOMIAL) | (b << POLYNOMIAL_DEGREE);
        }
        Tables { out, reduce }
    })
}

/// Rabin rolling fingerprint over a fixed window.
struct Rabin {
    tables: &'static Tables,
    window: [u8; WINDOW_SIZE],
    pos: usize,
    digest: u64,
}

impl Rabin {
    fn new() -> Self {
        let mut r = Self {
            tables: tables(),
            window: [0u8; WINDOW_SIZE],
            pos: 0,
            digest: 0,
        };
        r.reset();
        r
    }

    fn reset(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.pos = 0;
        self.digest = 0;
        // The seed byte enters the window like any other so it slides out
        // after WINDOW_SIZE bytes.
        self.slide(1);
    }

    fn append(&mut self, b: u8) {
        let index = (self.digest >> POLYNOMIAL_SHIFT) as u8;
        self.digest = ((self.digest << 8) | u64::from(b)) ^ self.tables.reduce[index as usize];
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.pos];
        self.window[self.pos] = b;
        self.digest ^= self.tables.out[out as usize];
        self.pos = (self.pos + 1) % WINDOW_SIZE;
        self.append(b);
    }
}

/// Splits byte streams into content-defined chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Create a chunker.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::ChunkerConfig`] for invalid parameters.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Parameters in use.
    #[must_use]
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk an in-memory buffer, returning chunk lengths.
    #[must_use]
    pub fn cut_points(&self, data: &[u8]) -> Vec<usize> {
        let mut cutter = Cutter::new(self.config);
        let mut lengths = Vec::new();
        let mut start = 0;
        while start < data.len() {
            match cutter.feed(&data[start..]) {
                Some(len) => {
                    lengths.push(len);
                    start += len;
                }
                None => {
                    lengths.push(data.len() - start);
                    break;
                }
            }
        }
        lengths
    }

    /// Iterate the chunks of a reader.
    pub fn chunks<R: Read>(&self, reader: R) -> ChunkIter<R> {
        ChunkIter {
            reader,
            cutter: Cutter::new(self.config),
            buf: vec![0u8; READ_BUFFER],
            start: 0,
            end: 0,
            current: Vec::new(),
            done: false,
        }
    }

    /// Iterate the chunks of a file.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Io`] if the file cannot be opened.
    pub fn chunk_file(&self, path: &Path) -> Result<ChunkIter<File>> {
        let file = File::open(path).at(path)?;
        Ok(self.chunks(file))
    }
}

/// Boundary detector carrying state across buffer refills.
struct Cutter {
    config: ChunkerConfig,
    mask: u64,
    rabin: Rabin,
    count: usize,
}

impl Cutter {
    fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            mask: config.mask(),
            rabin: Rabin::new(),
            count: 0,
        }
    }

    /// Consume bytes until a boundary. Returns how many bytes of `data`
    /// complete the current chunk, or `None` if all of it was absorbed.
    fn feed(&mut self, data: &[u8]) -> Option<usize> {
        for (i, &b) in data.iter().enumerate() {
            self.rabin.slide(b);
            self.count += 1;
            if (self.count >= self.config.min_size && self.rabin.digest & self.mask == 0)
                || self.count >= self.config.max_size
            {
                self.rabin.reset();
                self.count = 0;
                return Some(i + 1);
            }
        }
        None
    }
}

/// Streaming chunk iterator.
pub struct ChunkIter<R> {
    reader: R,
    cutter: Cutter,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    current: Vec<u8>,
    done: bool,
}

impl<R: Read> Iterator for ChunkIter<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.start == self.end {
                match self.reader.read(&mut self.buf) {
                    Ok(0) => {
                        self.done = true;
                        if self.current.is_empty() {
                            return None;
                        }
                        return Some(Ok(std::mem::take(&mut self.current)));
                    }
                    Ok(n) => {
                        self.start = 0;
                        self.end = n;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            let window = &self.buf[self.start..self.end];
            match self.cutter.feed(window) {
                Some(len) => {
                    self.current.extend_from_slice(&window[..len]);
                    self.start += len;
                    return Some(Ok(std::mem::take(&mut self.current)));
                }
                None => {
                    self.current.extend_from_slice(window);
                    self.start = self.end;
                }
            }
        }
    }
}
