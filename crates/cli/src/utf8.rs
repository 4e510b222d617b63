// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Incremental UTF-8 decoding for byte-chunked terminal streams.
//!
//! PTY reads and the tmux pipe poll deliver arbitrary byte windows, so a
//! multi-byte glyph can arrive split across two chunks. Decoding each chunk
//! in isolation would turn both halves into U+FFFD; this decoder holds the
//! incomplete trailing sequence back and prepends it to the next chunk.

/// Per-stream decode state: at most three carried bytes, the longest
/// possible truncated sequence.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    carry: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, prepending any bytes carried from the last
    /// call. Invalid interior bytes become U+FFFD; a truncated trailing
    /// sequence is withheld until the bytes that complete it arrive.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let owned;
        let mut rest: &[u8] = if self.carry.is_empty() {
            chunk
        } else {
            let mut bytes = std::mem::take(&mut self.carry);
            bytes.extend_from_slice(chunk);
            owned = bytes;
            &owned
        };

        let mut out = String::with_capacity(rest.len());
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        // Garbage in the middle of the stream.
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        // Truncated sequence at the end: wait for the rest.
                        None => {
                            self.carry = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Bytes currently held back waiting for a sequence to complete.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

#[cfg(test)]
#[path = "utf8_tests.rs"]
mod tests;
