// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Smart-QT driven bank filtering.
//!
//! Two analysis passes over a fragment's banks, then a rewrite pass
//! into the output event:
//!
//! 1. **Retention set** (MN banks): any channel whose pulse minimum
//!    dropped below the save threshold saturated the waveform module,
//!    so the matching slow-digitiser channel must keep its waveform.
//! 2. **Drop lists** (SQ banks): isolated pulses with a
//!    single-photoelectron confidence above the threshold are fully
//!    described by their 5-word record; their ZLE block is dropped.
//!    A repeated (channel, offset) record marks a multi-pulse block,
//!    which must keep its waveform.
//!
//! The rewrite pass then streams ZL banks through the good-to-skip
//! edit, thins SQ records, drops unretained W4 groups, and copies
//! every other bank verbatim. Debug knobs keep the originals next to
//! renamed filtered banks (ZF/SF/F4).

use crate::config::{EbSettings, PMT_MAP_LEN};
use crate::protocol::bank::{Bank, BankIter, EventWriter};
use crate::protocol::sq::SqIter;
use crate::protocol::w4::W4View;
use crate::protocol::{zle, CodecResult};
use std::collections::HashSet;

/// SPE confidence values of 201 and above are reserved codes, never
/// single-photoelectron candidates.
const CONFIDENCE_CEILING: u32 = 201;

#[inline]
fn bank_name(prefix: &[u8; 2], module: u8) -> [u8; 4] {
    [
        prefix[0],
        prefix[1],
        b'0' + (module / 10) % 10,
        b'0' + module % 10,
    ]
}

/// Per-event bank filter. Owned by the collector; `reset` between
/// events, `analyze` once per participating fragment, then
/// `write_filtered` while appending that fragment's banks.
pub struct SmartFilter {
    enable_v1720: bool,
    enable_v1740: bool,
    spe_confidence_threshold: u32,
    save_v1740_threshold: u32,
    /// Waveform-module channel index -> slow-digitiser channel index.
    pmt_map: Box<[i32; PMT_MAP_LEN]>,
    debug_keep_zle_copy: bool,
    debug_keep_sq_copy: bool,
    debug_keep_w4_copy: bool,
    debug_keep_mn: bool,
    save_all_qt: bool,
    save_all_smart_qt: bool,
    save_smart_qt_even_if_saving_zle: bool,
    /// Per waveform channel: sample offsets whose ZLE block is dropped.
    zle_drop: Vec<Vec<u32>>,
    /// Slow-digitiser channel indices whose waveform group is kept.
    w4_keep: HashSet<u32>,
    events_analyzed: u64,
}

impl SmartFilter {
    #[must_use]
    pub fn latch(settings: &EbSettings) -> Self {
        SmartFilter {
            enable_v1720: settings.enable_v1720_filtering,
            enable_v1740: settings.enable_v1740_filtering,
            spe_confidence_threshold: settings.spe_confidence_threshold,
            save_v1740_threshold: settings.save_v1740_threshold,
            pmt_map: settings.pmt_map.clone(),
            debug_keep_zle_copy: settings.debug_keep_zle_copy,
            debug_keep_sq_copy: settings.debug_keep_sq_copy,
            debug_keep_w4_copy: settings.debug_keep_w4_copy,
            debug_keep_mn: settings.debug_keep_mn,
            save_all_qt: settings.save_all_qt,
            save_all_smart_qt: settings.save_all_smart_qt,
            save_smart_qt_even_if_saving_zle: settings.save_smart_qt_even_if_saving_zle,
            zle_drop: vec![Vec::new(); PMT_MAP_LEN],
            w4_keep: HashSet::new(),
            events_analyzed: 0,
        }
    }

    /// Clear the per-event drop lists and retention set.
    pub fn reset(&mut self) {
        for list in &mut self.zle_drop {
            list.clear();
        }
        self.w4_keep.clear();
    }

    #[must_use]
    pub fn events_analyzed(&self) -> u64 {
        self.events_analyzed
    }

    /// Run both analysis passes over one fragment's bank container.
    /// Malformed banks end the walk; the event itself survives.
    pub fn analyze(&mut self, container: &[u8]) {
        self.events_analyzed += 1;
        let iter = match BankIter::new(container) {
            Ok(iter) => iter,
            Err(e) => {
                log::warn!("[SmartFilter] unreadable container skipped in analysis: {}", e);
                return;
            }
        };
        for item in iter {
            let bank = match item {
                Ok(bank) => bank,
                Err(e) => {
                    log::warn!("[SmartFilter] malformed bank tail in analysis: {}", e);
                    break;
                }
            };
            match &bank.family() {
                b"MN" if self.enable_v1740 => self.analyze_minima(&bank),
                b"SQ" if self.enable_v1720 => self.analyze_pulses(&bank),
                _ => {}
            }
        }
    }

    /// Pass 1: flag saturated channels for slow-digitiser retention.
    /// Eight 16-bit minima packed into four words, even channel in the
    /// high half.
    fn analyze_minima(&mut self, bank: &Bank<'_>) {
        let module = bank.module().unwrap_or(0);
        let words = crate::protocol::Words::new(bank.payload);
        for i in 0..4u32 {
            let Some(word) = words.get(2 + i as usize) else { break };
            let minima = [(word >> 16) & 0xFFFF, word & 0xFFFF];
            for (half, &minimum) in minima.iter().enumerate() {
                let idx20 = usize::from(module) * 8 + (i as usize) * 2 + half;
                if idx20 >= PMT_MAP_LEN {
                    continue;
                }
                let idx40 = self.pmt_map[idx20];
                if minimum < self.save_v1740_threshold && idx40 >= 0 {
                    self.w4_keep.insert(idx40 as u32);
                }
            }
        }
    }

    /// Pass 2: build the per-channel ZLE drop lists from SQ records.
    fn analyze_pulses(&mut self, bank: &Bank<'_>) {
        let module = bank.module().unwrap_or(0);
        let iter = match SqIter::new(bank.payload) {
            Ok(iter) => iter,
            Err(e) => {
                log::warn!("[SmartFilter] bad SQ bank {}: {}", bank.name_str(), e);
                return;
            }
        };
        let mut prev: Option<(usize, u32)> = None;
        for record in iter {
            let pulse = record.pulse;
            let idx = usize::from(module) * 8 + usize::from(pulse.channel);
            let offset = u32::from(pulse.offset);
            if idx >= PMT_MAP_LEN {
                continue;
            }
            let list = &mut self.zle_drop[idx];
            if prev == Some((idx, offset)) && list.last() == Some(&offset) {
                // More than one pulse in this block: keep the waveform.
                list.pop();
            } else if u32::from(pulse.confidence) > self.spe_confidence_threshold
                && u32::from(pulse.confidence) < CONFIDENCE_CEILING
            {
                // Single-photoelectron candidate: the record suffices.
                list.push(offset);
            }
            prev = Some((idx, offset));
        }
    }

    /// Whether the ZLE block at `sample_offset` of (module, channel)
    /// keeps its samples.
    #[must_use]
    pub fn should_keep_zle(&self, module: u8, channel: u8, sample_offset: u32) -> bool {
        let idx = usize::from(module) * 8 + usize::from(channel);
        match self.zle_drop.get(idx) {
            Some(list) => !list.contains(&sample_offset),
            None => true,
        }
    }

    /// Whether any channel of the board's group is in the retention set.
    #[must_use]
    pub fn should_keep_w4(&self, board: u8, group: u8) -> bool {
        (0..8u32).any(|ch| {
            self.w4_keep
                .contains(&(u32::from(board) * 64 + u32::from(group) * 8 + ch))
        })
    }

    /// Rewrite pass: stream one fragment's banks into the output event.
    pub fn write_filtered(&self, container: &[u8], out: &mut EventWriter) -> CodecResult<()> {
        for item in BankIter::new(container)? {
            let bank = match item {
                Ok(bank) => bank,
                Err(e) => {
                    log::warn!("[SmartFilter] malformed bank tail in rewrite: {}", e);
                    break;
                }
            };
            match &bank.family() {
                b"ZL" => self.write_zle(&bank, out)?,
                b"SQ" => self.write_sq(&bank, out)?,
                b"W4" => self.write_w4(&bank, out)?,
                b"QT" => {
                    if self.save_all_qt {
                        out.copy_bank(&bank);
                    }
                }
                b"MN" => {
                    if self.debug_keep_mn {
                        out.copy_bank(&bank);
                    }
                }
                _ => out.copy_bank(&bank),
            }
        }
        Ok(())
    }

    fn write_zle(&self, bank: &Bank<'_>, out: &mut EventWriter) -> CodecResult<()> {
        if !self.enable_v1720 {
            out.copy_bank(bank);
            return Ok(());
        }
        let module = bank.module().unwrap_or(0);
        let name = if self.debug_keep_zle_copy {
            out.copy_bank(bank);
            bank_name(b"ZF", module)
        } else {
            bank_name(b"ZL", module)
        };
        out.begin_bank(name, bank.kind);
        zle::rewrite(bank.payload, out, |channel, sample| {
            self.should_keep_zle(module, channel, sample)
        })?;
        out.end_bank();
        Ok(())
    }

    fn write_sq(&self, bank: &Bank<'_>, out: &mut EventWriter) -> CodecResult<()> {
        if self.save_all_smart_qt {
            out.copy_bank(bank);
            return Ok(());
        }
        let module = bank.module().unwrap_or(0);
        let name = if self.debug_keep_sq_copy {
            out.copy_bank(bank);
            bank_name(b"SF", module)
        } else {
            bank_name(b"SQ", module)
        };

        let words = crate::protocol::Words::new(bank.payload);
        let iter = SqIter::new(bank.payload)?;
        out.begin_bank(name, bank.kind);
        out.push_word(words.require(0)?);
        out.push_word(words.require(1)?);
        let count_slot = out.word_count();
        out.push_word(0);
        let mut kept_words = 0u32;
        for record in iter {
            let pulse = record.pulse;
            let keep_record = self.save_smart_qt_even_if_saving_zle
                || !self.should_keep_zle(module, pulse.channel, u32::from(pulse.offset));
            if keep_record {
                // Keeping the ZLE block makes the record redundant
                // unless explicitly retained.
                let raw = words.byte_range(record.word_offset, crate::protocol::SQ_PULSE_WORDS)?;
                out.push_bytes(raw);
                kept_words += crate::protocol::SQ_PULSE_WORDS as u32;
            }
        }
        out.set_payload_word(count_slot, kept_words);
        out.end_bank();
        Ok(())
    }

    fn write_w4(&self, bank: &Bank<'_>, out: &mut EventWriter) -> CodecResult<()> {
        if !self.enable_v1740 {
            out.copy_bank(bank);
            return Ok(());
        }
        let board = bank.module().unwrap_or(0);
        let name = if self.debug_keep_w4_copy {
            out.copy_bank(bank);
            bank_name(b"F4", board)
        } else {
            bank_name(b"W4", board)
        };

        let view = W4View::parse(bank.payload)?;
        out.begin_bank(name, bank.kind);
        out.push_word(view.raw_size);
        out.push_word(view.raw_mask);
        out.push_word(view.event_counter);
        out.push_word(view.trigger_tag);
        if view.group_mask == 0 || view.n_chunks == 0 {
            out.end_bank();
            return Ok(());
        }

        let mut dest_mask = 0u32;
        for (group, nth) in view.active_groups() {
            if self.should_keep_w4(board, group) {
                dest_mask |= 1 << group;
                out.push_bytes(view.group_bytes(nth)?);
            }
        }
        let dest_words = out.word_count() as u32;
        // Patch the low byte of the mask and the low 24 bits of the
        // size, preserving the upper parts verbatim.
        out.set_payload_word(1, (view.raw_mask & !0xFF) | dest_mask);
        out.set_payload_word(0, (view.raw_size & !0x00FF_FFFF) | (dest_words & 0x00FF_FFFF));
        out.end_bank();
        Ok(())
    }
}
