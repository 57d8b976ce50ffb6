// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Producer half of a fragment: pull one upstream event, augment it,
//! commit it to the ring.
//!
//! For every event the ingest pass walks the bank container once,
//! accumulating the per-event Q-vs-T summary from QT pulses, tracking
//! the earliest/latest module timestamps, and capturing the preferred
//! "first module" timestamp of this fragment's group. The summary and
//! timestamps are appended after the event bytes, sealed by the
//! 0xDEADBEEF control word, and published with a single ring commit
//! followed by the event-count increment.

use super::{FragmentError, FragmentResult, FragmentShared, TRAILER_FIXED_WORDS};
use crate::protocol::bank::BankIter;
use crate::protocol::event::{EventHeader, EVENT_HEADER_SIZE};
use crate::protocol::{Words, CHARGE_SATURATION, COMMIT_WORD, QT_PULSE_WORDS, TIMESTAMP_MASK};
use crate::transport::ring::RingProducer;
use crate::transport::upstream::{EventSource, Receive};
use crate::transport::TransportError;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Module indices considered "first of the group" per trigger mask.
const FIRST_MODULE_PAIRS: [(u8, u16); 4] = [(0, 0x2), (8, 0x4), (16, 0x8), (24, 0x10)];

/// Quiescence thresholds for the upstream watchdog.
const QUIET_WARN: Duration = Duration::from_secs(40);
const QUIET_ERROR: Duration = Duration::from_secs(50);

#[inline]
fn is_first_module(module: u8, trigger_mask: u16) -> bool {
    FIRST_MODULE_PAIRS
        .iter()
        .any(|&(m, t)| module == m && trigger_mask == t)
}

#[inline]
fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Ingest-side fragment endpoint. Owned by exactly one worker thread.
pub struct FragmentProducer {
    shared: Arc<FragmentShared>,
    ring: RingProducer,
    rebin_factor: u32,
    /// Upstream watchdog: when we last received an event.
    last_read: Option<Instant>,
    quiet_warned: bool,
    quiet_errored: bool,
    /// Scratch histograms, reused across events.
    qvec: Vec<u32>,
    nvec: Vec<u32>,
}

impl FragmentProducer {
    pub(super) fn new(shared: Arc<FragmentShared>, ring: RingProducer, rebin_factor: u32) -> Self {
        FragmentProducer {
            shared,
            ring,
            rebin_factor: rebin_factor.max(1),
            last_read: None,
            quiet_warned: false,
            quiet_errored: false,
            qvec: Vec::new(),
            nvec: Vec::new(),
        }
    }

    /// Ring occupancy in percent, for the 75% back-pressure guard.
    #[must_use]
    pub fn fill_percent(&self) -> usize {
        self.ring.fill_percent()
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<FragmentShared> {
        &self.shared
    }

    /// Pull one event from `source` and publish it to the ring.
    ///
    /// Returns `Ok(false)` when no upstream event was available (after
    /// updating the quiescence watchdog), `Ok(true)` after a commit.
    pub fn read_one(&mut self, source: &mut dyn EventSource) -> FragmentResult<bool> {
        let Self {
            shared,
            ring,
            rebin_factor,
            last_read,
            quiet_warned,
            quiet_errored,
            qvec,
            nvec,
        } = self;

        let window = ring.reserve()?;
        match source.receive(window)? {
            Receive::Event(_advisory_len) => {}
            Receive::Pending => {
                note_quiescence(shared, last_read, quiet_warned, quiet_errored);
                return Ok(false);
            }
        }
        *last_read = Some(Instant::now());

        let header = EventHeader::parse(window)?;
        // The header size is authoritative; the transport-reported
        // length is only advisory.
        let event_size = header.total_size();
        if event_size > window.len() {
            return Err(FragmentError::Transport(TransportError::EventTooLarge {
                size: event_size,
                max: window.len(),
            }));
        }

        let mut tsmin = u32::MAX;
        let mut tsmax = 0u32;
        let mut first_module_ts = 0u32;
        let mut has_v1720 = false;
        qvec.clear();
        nvec.clear();

        {
            let container = &window[EVENT_HEADER_SIZE..event_size];
            let trigger_mask = shared.trigger_mask;
            for item in BankIter::new(container)? {
                let bank = match item {
                    Ok(bank) => bank,
                    Err(e) => {
                        log::warn!(
                            "[Fragment] skipping malformed bank tail in {}: {}",
                            shared.name,
                            e
                        );
                        break;
                    }
                };
                let words = Words::new(bank.payload);
                match &bank.family() {
                    b"ZL" | b"W2" => {
                        let Some(ts) = words.get(3) else { continue };
                        tsmin = tsmin.min(ts);
                        tsmax = tsmax.max(ts);
                        if bank.module().is_some_and(|m| is_first_module(m, trigger_mask)) {
                            first_module_ts = ts;
                        }
                    }
                    b"QT" => {
                        let Some(ts) = words.get(1) else { continue };
                        tsmin = tsmin.min(ts);
                        tsmax = tsmax.max(ts);
                        if bank.module().is_some_and(|m| is_first_module(m, trigger_mask)) {
                            first_module_ts = ts;
                        }
                        accumulate_qt(qvec, nvec, *rebin_factor, &words);
                        has_v1720 = true;
                    }
                    b"W4" => {
                        let Some(ts) = words.get(3) else { continue };
                        tsmin = tsmin.min(ts);
                        tsmax = tsmax.max(ts);
                        if bank.module() == Some(0) {
                            first_module_ts = ts;
                        }
                    }
                    b"VE" if &bank.name == b"VETO" => {
                        let Some(ts) = words.get(3) else { continue };
                        tsmin = tsmin.min(ts);
                        tsmax = tsmax.max(ts);
                    }
                    b"CA" if &bank.name == b"CALI" => {
                        let Some(ts) = words.get(3) else { continue };
                        tsmin = tsmin.min(ts);
                        tsmax = tsmax.max(ts);
                        has_v1720 = true;
                    }
                    _ => {}
                }
            }
        }

        // Prefer the first-module timestamp; fall back to the earliest.
        let best = if first_module_ts != 0 {
            first_module_ts
        } else {
            tsmin
        };
        // Waveform modules count in 8 ns: down-convert to the 16-ns
        // convention. Slow-digitiser counters are used as-is.
        let (best, tsmax) = if has_v1720 {
            ((best >> 1) & TIMESTAMP_MASK, (tsmax >> 1) & TIMESTAMP_MASK)
        } else {
            (best & TIMESTAMP_MASK, tsmax & TIMESTAMP_MASK)
        };

        let nbins = if has_v1720 { 2 * qvec.len() } else { 0 };
        let total = event_size + (TRAILER_FIXED_WORDS + nbins) * 4;
        if total > window.len() {
            return Err(FragmentError::Transport(TransportError::EventTooLarge {
                size: total,
                max: window.len(),
            }));
        }

        put_u32(window, event_size, best);
        put_u32(window, event_size + 4, tsmax);
        put_u32(window, event_size + 8, nbins as u32);
        put_u32(window, event_size + 12, COMMIT_WORD);
        if nbins > 0 {
            let half = qvec.len();
            for (i, &q) in qvec.iter().enumerate() {
                put_u32(window, event_size + (TRAILER_FIXED_WORDS + i) * 4, q);
            }
            for (i, &n) in nvec.iter().enumerate() {
                put_u32(window, event_size + (TRAILER_FIXED_WORDS + half + i) * 4, n);
            }
        }

        ring.commit(total)?;
        shared.increment_events();
        Ok(true)
    }
}

/// Fold one QT bank's pulses into the rebinned scratch histograms.
fn accumulate_qt(qvec: &mut Vec<u32>, nvec: &mut Vec<u32>, rebin: u32, words: &Words<'_>) {
    let Some(ndwords) = words.get(2) else { return };
    let mut idx = 3usize;
    let end = 3 + ndwords as usize;
    while idx + QT_PULSE_WORDS <= end {
        let (Some(integral_word), Some(ts_word)) = (words.get(idx + 2), words.get(idx + 3)) else {
            break;
        };
        let min_bin = (ts_word >> 16) & 0xFFFF;
        let integral = integral_word & 0xFF_FFFF;
        let bin = (min_bin / rebin) as usize;
        if bin >= qvec.len() {
            qvec.resize(bin + 1, 0);
            nvec.resize(bin + 1, 0);
        }
        // Saturating accumulation with a fixed ceiling.
        qvec[bin] = if qvec[bin] > CHARGE_SATURATION - integral {
            CHARGE_SATURATION
        } else {
            qvec[bin] + integral
        };
        nvec[bin] += 1;
        idx += QT_PULSE_WORDS;
    }
}

/// Track how long upstream has been silent; one warning past 40 s and
/// one error past 50 s per run.
fn note_quiescence(
    shared: &FragmentShared,
    last_read: &mut Option<Instant>,
    quiet_warned: &mut bool,
    quiet_errored: &mut bool,
) {
    let Some(last) = *last_read else {
        // Never saw an event yet: start the clock so front-ends that
        // never produce are caught too.
        *last_read = Some(Instant::now());
        return;
    };
    let quiet = last.elapsed();
    if quiet > QUIET_WARN && !*quiet_warned {
        log::warn!(
            "[Fragment] no event from {} (id {}) for more than 40 seconds",
            shared.name,
            shared.id
        );
        *quiet_warned = true;
    }
    if quiet > QUIET_ERROR && !*quiet_errored {
        log::error!(
            "[Fragment] no event from {} (id {}) for more than 50 seconds; \
             front-end probably died, the run is probably dead",
            shared.name,
            shared.id
        );
        *quiet_errored = true;
    }
}
