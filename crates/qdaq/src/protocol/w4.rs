// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Slow-digitiser waveform banks, packed by channel group.
//!
//! ```text
//! w0: size in words (low 24 bits, includes the header)
//! w1: group mask (low 8 bits)
//! w2: event counter (preserved verbatim)
//! w3: trigger tag (preserved verbatim)
//! body: nChunks x 9 words per active group, group by group;
//!       each 9-word chunk packs 24 12-bit samples for the group's
//!       8 channels
//! ```
//!
//! `nChunks = (size - 4) / (9 * active_group_count)`.

use super::{CodecError, CodecResult, Words};

const SIZE_MASK: u32 = 0x00FF_FFFF;

/// Words per sample chunk (24 12-bit samples).
pub const CHUNK_WORDS: usize = 9;

/// Parsed view over a W4 bank payload.
#[derive(Debug, Clone, Copy)]
pub struct W4View<'a> {
    /// Raw size word, upper byte preserved on rewrite.
    pub raw_size: u32,
    /// Raw mask word, upper 24 bits preserved on rewrite.
    pub raw_mask: u32,
    pub event_counter: u32,
    pub trigger_tag: u32,
    pub group_mask: u8,
    /// Sample chunks per active group.
    pub n_chunks: usize,
    words: Words<'a>,
}

impl<'a> W4View<'a> {
    pub fn parse(payload: &'a [u8]) -> CodecResult<Self> {
        let words = Words::new(payload);
        let raw_size = words.require(0)?;
        let raw_mask = words.require(1)?;
        let event_counter = words.require(2)?;
        let trigger_tag = words.require(3)?;
        let size = (raw_size & SIZE_MASK) as usize;
        let group_mask = (raw_mask & 0xFF) as u8;
        let active = group_mask.count_ones() as usize;
        let n_chunks = if active == 0 || size < 4 {
            0
        } else {
            (size - 4) / (CHUNK_WORDS * active)
        };
        if 4 + active * n_chunks * CHUNK_WORDS > words.len() {
            return Err(CodecError::Truncated {
                offset: words.len() * 4,
                reason: "w4 size word exceeds payload",
            });
        }
        Ok(W4View {
            raw_size,
            raw_mask,
            event_counter,
            trigger_tag,
            group_mask,
            n_chunks,
            words,
        })
    }

    /// Active group indices in ascending order, paired with their
    /// position in the packed body.
    pub fn active_groups(&self) -> impl Iterator<Item = (u8, usize)> + '_ {
        let mask = self.group_mask;
        (0u8..8)
            .filter(move |g| mask & (1 << g) != 0)
            .enumerate()
            .map(|(nth, g)| (g, nth))
    }

    /// Byte slice of the `nth` active group's sample chunks.
    pub fn group_bytes(&self, nth: usize) -> CodecResult<&'a [u8]> {
        let words_per_group = self.n_chunks * CHUNK_WORDS;
        self.words.byte_range(4 + nth * words_per_group, words_per_group)
    }
}
