// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::VecDeque;

use bytes::Bytes;

/// Per-session scrollback byte budget.
pub const SCROLLBACK_LIMIT: usize = 2 * 1024 * 1024;

/// Ordered chunks of recent session output, oldest first, bounded by a byte
/// budget.
///
/// Eviction drops whole chunks from the front; the newest chunk is always
/// retained even when it alone exceeds the budget, so the tail of the output
/// survives a single oversized write.
#[derive(Debug)]
pub struct Scrollback {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    limit: usize,
    /// Chunk index where the current assistant reply began.
    assistant_start: usize,
}

impl Scrollback {
    pub fn new(limit: usize) -> Self {
        Self { chunks: VecDeque::new(), bytes: 0, limit, assistant_start: 0 }
    }

    /// Append a chunk, evicting from the front while over budget.
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.bytes += data.len();
        self.chunks.push_back(data);

        while self.bytes > self.limit && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.len();
                self.assistant_start = self.assistant_start.saturating_sub(1);
            }
        }
    }

    /// Begin a new assistant segment at the current end of the scrollback.
    pub fn mark_assistant_start(&mut self) {
        self.assistant_start = self.chunks.len();
    }

    /// Concatenated copy of the full scrollback.
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Concatenated copy of the current assistant segment.
    pub fn assistant_segment(&self) -> Vec<u8> {
        let start = self.assistant_start.min(self.chunks.len());
        let mut out = Vec::new();
        for chunk in self.chunks.iter().skip(start) {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Number of retained chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total retained bytes.
    pub fn byte_count(&self) -> usize {
        self.bytes
    }

    /// Size of the newest chunk, or 0 when empty.
    pub fn last_chunk_len(&self) -> usize {
        self.chunks.back().map(Bytes::len).unwrap_or(0)
    }

    pub fn assistant_start(&self) -> usize {
        self.assistant_start
    }
}

#[cfg(test)]
#[path = "scrollback_tests.rs"]
mod tests;
