// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Zero-length-encoded waveform codec.
//!
//! # Layout (32-bit words)
//!
//! ```text
//! w0: total size in words (low 24 bits, includes the header)
//! w1: channel mask (low 8 bits)
//! w2: opaque
//! w3: opaque (carries the module timestamp)
//! per enabled channel, ascending bit order:
//!   size word (word count, includes itself)
//!   control words:
//!     bit 31 = 1 "good":  low 20 bits = N data words, N words follow
//!     bit 31 = 0 "skip":  low 20 bits = N suppressed words, no data
//! ```
//!
//! Two 12-bit samples per data word, so every control word advances the
//! sample position by `2 * N` regardless of kind.
//!
//! The edit primitive replaces a good block by a skip of the same
//! sample count: same low 20 bits, bit 31 cleared, data words omitted.

use super::bank::EventWriter;
use super::{CodecError, CodecResult, Words};

const SIZE_MASK: u32 = 0x00FF_FFFF;
const RUN_LEN_MASK: u32 = 0x000F_FFFF;
const GOOD_BIT: u32 = 1 << 31;

/// One control-word run inside a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZleRun {
    /// Kept samples: the data words following the control word.
    Good(Vec<u32>),
    /// Suppressed span, in 32-bit words.
    Skip(u32),
}

impl ZleRun {
    /// Words this run covers in the sample stream (not the wire).
    #[must_use]
    pub fn span_words(&self) -> u32 {
        match self {
            ZleRun::Good(data) => data.len() as u32,
            ZleRun::Skip(n) => *n,
        }
    }
}

/// Decoded per-channel run sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZleChannel {
    pub channel: u8,
    pub runs: Vec<ZleRun>,
}

impl ZleChannel {
    /// Total sample count covered by this channel's runs.
    #[must_use]
    pub fn sample_count(&self) -> u32 {
        self.runs.iter().map(|r| r.span_words() * 2).sum()
    }
}

/// Fully decoded ZLE payload. Used by tests and offline inspection;
/// the filter rewrite streams instead (see [`rewrite`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZleEvent {
    /// Upper byte of the size word, preserved verbatim.
    pub size_flags: u8,
    /// Upper 24 bits of the mask word, preserved verbatim.
    pub mask_flags: u32,
    pub extra: [u32; 2],
    pub channels: Vec<ZleChannel>,
}

impl ZleEvent {
    pub fn decode(payload: &[u8]) -> CodecResult<Self> {
        let words = Words::new(payload);
        let w0 = words.require(0)?;
        let w1 = words.require(1)?;
        let extra = [words.require(2)?, words.require(3)?];
        let total = (w0 & SIZE_MASK) as usize;
        if total > words.len() {
            return Err(CodecError::Truncated {
                offset: words.len() * 4,
                reason: "zle size word exceeds payload",
            });
        }
        let mask = w1 & 0xFF;

        let mut idx = 4usize;
        let mut channels = Vec::new();
        for channel in 0u8..8 {
            if mask & (1 << channel) == 0 {
                continue;
            }
            let ch_size = words.require(idx)?;
            idx += 1;
            let mut words_read = 1u32;
            let mut runs = Vec::new();
            while words_read < ch_size {
                let ctrl = words.require(idx)?;
                idx += 1;
                words_read += 1;
                let n = ctrl & RUN_LEN_MASK;
                if ctrl & GOOD_BIT != 0 {
                    let mut data = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        data.push(words.require(idx)?);
                        idx += 1;
                    }
                    words_read += n;
                    runs.push(ZleRun::Good(data));
                } else {
                    runs.push(ZleRun::Skip(n));
                }
            }
            if words_read != ch_size {
                return Err(CodecError::InvalidData {
                    reason: "zle channel runs overrun the channel size word",
                });
            }
            channels.push(ZleChannel { channel, runs });
        }
        if idx != total {
            return Err(CodecError::InvalidData {
                reason: "zle channel sizes disagree with total size word",
            });
        }
        Ok(ZleEvent {
            size_flags: (w0 >> 24) as u8,
            mask_flags: w1 & !0xFF,
            extra,
            channels,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u32> {
        let mut out = vec![0u32; 4];
        let mut mask = 0u32;
        for ch in &self.channels {
            mask |= 1 << ch.channel;
            let size_idx = out.len();
            out.push(0);
            for run in &ch.runs {
                match run {
                    ZleRun::Good(data) => {
                        out.push(GOOD_BIT | (data.len() as u32 & RUN_LEN_MASK));
                        out.extend_from_slice(data);
                    }
                    ZleRun::Skip(n) => out.push(n & RUN_LEN_MASK),
                }
            }
            out[size_idx] = (out.len() - size_idx) as u32;
        }
        out[0] = (u32::from(self.size_flags) << 24) | (out.len() as u32 & SIZE_MASK);
        out[1] = self.mask_flags | mask;
        out[2] = self.extra[0];
        out[3] = self.extra[1];
        out
    }
}

/// Stream a ZLE payload into the open bank of `out`, dropping every
/// good block whose starting sample offset `keep` rejects.
///
/// Header words are copied verbatim; the per-channel size words and the
/// low 24 bits of the total size are patched afterwards (upper byte
/// preserved). Skip blocks always copy through unchanged, so applying
/// the same drop set twice is a fixed point.
pub fn rewrite(
    payload: &[u8],
    out: &mut EventWriter,
    mut keep: impl FnMut(u8, u32) -> bool,
) -> CodecResult<()> {
    let src = Words::new(payload);
    let w0 = src.require(0)?;
    out.push_word(w0);
    let w1 = src.require(1)?;
    out.push_word(w1);
    out.push_word(src.require(2)?);
    out.push_word(src.require(3)?);

    let mask = w1 & 0xFF;
    let mut idx = 4usize;
    for channel in 0u8..8 {
        if mask & (1 << channel) == 0 {
            continue;
        }
        let ch_size = src.require(idx)?;
        idx += 1;
        let mut words_read = 1u32;
        let mut sample = 0u32;

        let size_slot = out.word_count();
        out.push_word(0);
        let mut dest_ch_words = 1u32;

        while words_read < ch_size {
            let ctrl = src.require(idx)?;
            let n = ctrl & RUN_LEN_MASK;
            if ctrl & GOOD_BIT != 0 {
                if keep(channel, sample) {
                    out.push_word(ctrl);
                    for k in 0..n as usize {
                        out.push_word(src.require(idx + 1 + k)?);
                    }
                    dest_ch_words += 1 + n;
                } else {
                    // Replaced by a skip of the same sample count. Runs
                    // of adjacent skips are not coalesced.
                    out.push_word(n);
                    dest_ch_words += 1;
                }
                idx += 1 + n as usize;
                words_read += 1 + n;
            } else {
                out.push_word(ctrl);
                idx += 1;
                words_read += 1;
                dest_ch_words += 1;
            }
            sample += n * 2;
        }
        out.set_payload_word(size_slot, dest_ch_words);
    }

    let total = out.word_count() as u32;
    out.set_payload_word(0, (w0 & !SIZE_MASK) | (total & SIZE_MASK));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::bank::{locate, EventWriter};
    use crate::protocol::event::{EventHeader, EVENT_HEADER_SIZE};
    use crate::protocol::KIND_DWORD;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn one_channel_event(runs: Vec<ZleRun>) -> ZleEvent {
        ZleEvent {
            size_flags: 0xA0,
            mask_flags: 0,
            extra: [7, 0x1234_5678],
            channels: vec![ZleChannel { channel: 0, runs }],
        }
    }

    fn rewrite_to_words(payload: &[u8], keep: impl FnMut(u8, u32) -> bool) -> Vec<u32> {
        let mut out = EventWriter::new(EventHeader {
            event_id: 1,
            trigger_mask: 0,
            serial_number: 0,
            time_stamp: 0,
            data_size: 0,
        });
        out.begin_bank(*b"ZL00", KIND_DWORD);
        rewrite(payload, &mut out, keep).expect("rewrite");
        out.end_bank();
        let event = out.finish();
        let bank = locate(&event[EVENT_HEADER_SIZE..], b"ZL00").expect("bank");
        bank.payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_decode_encode_roundtrip() {
        let event = one_channel_event(vec![
            ZleRun::Skip(10),
            ZleRun::Good(vec![0x0AAA_0BBB, 0x0CCC_0DDD]),
            ZleRun::Skip(3),
        ]);
        let wire = event.encode();
        let back = ZleEvent::decode(&words_to_bytes(&wire)).expect("decode");
        assert_eq!(back, event);
        // Total: 4 header + 1 size + 3 controls + 2 data = 10 words.
        assert_eq!(wire[0] & 0x00FF_FFFF, 10);
        assert_eq!(wire[0] >> 24, 0xA0);
        assert_eq!(wire[1] & 0xFF, 0x01);
    }

    #[test]
    fn test_roundtrip_randomized_runs() {
        fastrand::seed(0x5eed);
        for _ in 0..50 {
            let mut channels = Vec::new();
            for channel in 0u8..8 {
                if fastrand::bool() {
                    continue;
                }
                let runs = (0..fastrand::usize(1..6))
                    .map(|_| {
                        if fastrand::bool() {
                            ZleRun::Good(
                                (0..fastrand::usize(1..8)).map(|_| fastrand::u32(..)).collect(),
                            )
                        } else {
                            ZleRun::Skip(fastrand::u32(1..1000))
                        }
                    })
                    .collect();
                channels.push(ZleChannel { channel, runs });
            }
            let event = ZleEvent {
                size_flags: fastrand::u8(..),
                mask_flags: fastrand::u32(..) & !0xFF,
                extra: [fastrand::u32(..), fastrand::u32(..)],
                channels,
            };
            let wire = event.encode();
            assert_eq!(
                ZleEvent::decode(&words_to_bytes(&wire)).expect("decode"),
                event
            );
        }
    }

    #[test]
    fn test_decode_rejects_overrunning_channel() {
        let event = one_channel_event(vec![ZleRun::Good(vec![1, 2])]);
        let mut wire = event.encode();
        wire[4] = 2; // channel size now ends inside the good run
        assert!(ZleEvent::decode(&words_to_bytes(&wire)).is_err());
    }

    #[test]
    fn test_rewrite_keep_all_is_verbatim() {
        let event = one_channel_event(vec![
            ZleRun::Good(vec![1, 2, 3]),
            ZleRun::Skip(5),
            ZleRun::Good(vec![4]),
        ]);
        let wire = event.encode();
        let out = rewrite_to_words(&words_to_bytes(&wire), |_, _| true);
        assert_eq!(out, wire);
    }

    #[test]
    fn test_rewrite_drops_block_at_sample_offset() {
        // One good block of 4 data words at sample offset 0.
        let event = one_channel_event(vec![ZleRun::Good(vec![1, 2, 3, 4])]);
        let wire = event.encode();
        let out = rewrite_to_words(&words_to_bytes(&wire), |_, sample| sample != 0);

        // Expect: 4 header + size word + one bare skip control word.
        assert_eq!(out.len(), 6);
        assert_eq!(out[5], 4); // low 20 bits = 4, bit 31 clear
        assert_eq!(out[4], 2); // channel size: size word + control word
        assert_eq!(out[0] & 0x00FF_FFFF, 6);
        assert_eq!(out[0] >> 24, 0xA0); // upper byte preserved
        assert_eq!(wire.len() - out.len(), 4); // exactly the data words
    }

    #[test]
    fn test_rewrite_preserves_sample_counts() {
        let event = ZleEvent {
            size_flags: 0,
            mask_flags: 0,
            extra: [0, 0],
            channels: vec![
                ZleChannel {
                    channel: 1,
                    runs: vec![ZleRun::Skip(8), ZleRun::Good(vec![1, 2]), ZleRun::Skip(2)],
                },
                ZleChannel {
                    channel: 4,
                    runs: vec![ZleRun::Good(vec![9, 9, 9])],
                },
            ],
        };
        let wire = event.encode();
        let out = rewrite_to_words(&words_to_bytes(&wire), |_, _| false);
        let filtered = ZleEvent::decode(&words_to_bytes(&out)).expect("decode filtered");
        for (a, b) in filtered.channels.iter().zip(event.channels.iter()) {
            assert_eq!(a.sample_count(), b.sample_count());
            assert_eq!(a.channel, b.channel);
        }
        // Framing: channel sizes + header add up to the patched total.
        let sum: u32 = filtered
            .channels
            .iter()
            .map(|c| {
                1 + c
                    .runs
                    .iter()
                    .map(|r| match r {
                        ZleRun::Good(d) => 1 + d.len() as u32,
                        ZleRun::Skip(_) => 1,
                    })
                    .sum::<u32>()
            })
            .sum();
        assert_eq!(out[0] & 0x00FF_FFFF, sum + 4);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let event = one_channel_event(vec![
            ZleRun::Good(vec![1, 2]),
            ZleRun::Skip(6),
            ZleRun::Good(vec![3, 4, 5]),
        ]);
        let wire = event.encode();
        // Drop the block starting at sample 16 (after 2+6 words = 16 samples).
        let keep = |_: u8, sample: u32| sample != 16;
        let once = rewrite_to_words(&words_to_bytes(&wire), keep);
        let twice = rewrite_to_words(&words_to_bytes(&once), keep);
        assert_eq!(once, twice);
    }
}
