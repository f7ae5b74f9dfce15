// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded capture of a byte stream.
//!
//! [`PrefixSuffixSaver`] keeps the first `N` and the last `N` bytes written
//! to it and counts what fell in between, so arbitrarily chatty stderr can be
//! attached to an error value at a fixed memory cost.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::io;

/// Default bound used when capturing stderr for failure reports (32 KiB).
pub const DEFAULT_CAPTURE_LIMIT: usize = 32 << 10;

/// An [`io::Write`] sink retaining the head and tail of everything written.
#[derive(Debug, Clone)]
pub struct PrefixSuffixSaver {
    limit: usize,
    prefix: Vec<u8>,
    // Ring buffer once full; `suffix_off` is the oldest byte.
    suffix: Vec<u8>,
    suffix_off: usize,
    skipped: u64,
}

impl PrefixSuffixSaver {
    /// Create a saver keeping at most `limit` bytes of prefix and `limit` of suffix.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            prefix: Vec::new(),
            suffix: Vec::new(),
            suffix_off: 0,
            skipped: 0,
        }
    }

    /// Configured bound.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of bytes dropped between prefix and suffix.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Total bytes ever written.
    pub fn total_written(&self) -> u64 {
        (self.prefix.len() + self.suffix.len()) as u64 + self.skipped
    }

    /// Append bytes, returning how many were accepted (always all of them).
    pub fn push(&mut self, mut p: &[u8]) -> usize {
        let accepted = p.len();
        p = fill(&mut self.prefix, self.limit, p);

        // Only the last `limit` bytes can survive into the suffix.
        if let Some(overage) = p.len().checked_sub(self.limit).filter(|o| *o > 0) {
            p = &p[overage..];
            self.skipped += overage as u64;
        }
        p = fill(&mut self.suffix, self.limit, p);

        // Suffix is full if anything remains; overwrite the oldest bytes.
        while !p.is_empty() {
            let room = self.limit - self.suffix_off;
            let n = room.min(p.len());
            self.suffix[self.suffix_off..self.suffix_off + n].copy_from_slice(&p[..n]);
            p = &p[n..];
            self.skipped += n as u64;
            self.suffix_off += n;
            if self.suffix_off == self.limit {
                self.suffix_off = 0;
            }
        }
        accepted
    }

    /// Render prefix, an omission marker when bytes were dropped, and suffix
    /// in write order.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + self.suffix.len() + 40);
        out.extend_from_slice(&self.prefix);
        if self.skipped > 0 {
            out.extend_from_slice(format!("\n... omitting {} bytes ...\n", self.skipped).as_bytes());
        }
        out.extend_from_slice(&self.suffix[self.suffix_off..]);
        out.extend_from_slice(&self.suffix[..self.suffix_off]);
        out
    }
}

impl Default for PrefixSuffixSaver {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_LIMIT)
    }
}

impl io::Write for PrefixSuffixSaver {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.push(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn fill<'a>(dst: &mut Vec<u8>, limit: usize, p: &'a [u8]) -> &'a [u8] {
    let remain = limit.saturating_sub(dst.len());
    let add = remain.min(p.len());
    dst.extend_from_slice(&p[..add]);
    &p[add..]
}
