// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Per-upstream-stream fragment state.
//!
//! A fragment is one producer contributing to event assembly. Its
//! cross-thread state splits into three pieces:
//!
//! - [`FragmentShared`]: identity plus the event-count atomic, shared
//!   between the ingest worker and the collector;
//! - [`FragmentProducer`] (see [`ingest`]): owned by the worker thread,
//!   pulls upstream events, builds the Q-vs-T trailer, commits to the
//!   ring;
//! - [`FragmentConsumer`]: owned by the collector, verifies the commit
//!   fence and the timestamp baseline, merges histograms and appends
//!   banks to the output event.
//!
//! # Ring event layout
//!
//! ```text
//! | EVENT_HEADER | bank container | best_ts | tsmax | nBins |
//! | 0xDEADBEEF | Q[0..nBins/2) | N[0..nBins/2) |
//! ```
//!
//! The 0xDEADBEEF control word is the commit fence: a consumer that
//! observes it knows the whole trailer is visible. The event count is
//! sequentially consistent and is the only variable both sides mutate.

pub mod ingest;
pub mod worker;

pub use ingest::FragmentProducer;

use crate::protocol::event::{EventHeader, EVENT_HEADER_SIZE};
use crate::protocol::{bank, CodecError, Words, COMMIT_WORD, TIMESTAMP_MASK};
use crate::transport::ring::{ByteRing, RingConsumer};
use crate::transport::TransportError;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The fragment carrying this trigger mask is the trigger master; it
/// sorts first and is always present in every assembled event.
pub const MASTER_TRIGGER_MASK: u16 = 0x0001;

/// Fixed trailer words before the histogram: best_ts, tsmax, nBins,
/// control word.
pub const TRAILER_FIXED_WORDS: usize = 4;

/// How long a consumer spins on a not-yet-visible commit fence before
/// reporting it.
const FENCE_WAIT: Duration = Duration::from_secs(10);

/// Identity and cross-thread counters of one fragment.
#[derive(Debug)]
pub struct FragmentShared {
    /// Index in the trigger-mask-sorted fragment arena.
    pub id: usize,
    pub name: String,
    pub trigger_mask: u16,
    /// Trigger-master request bit for this fragment, -1 if none.
    pub dtm_mask: i32,
    /// Events currently in the ring: producer commits minus consumer
    /// releases, never negative.
    event_count: AtomicI64,
}

impl FragmentShared {
    #[must_use]
    pub fn new(id: usize, name: String, trigger_mask: u16, dtm_mask: i32) -> Self {
        FragmentShared {
            id,
            name,
            trigger_mask,
            dtm_mask,
            event_count: AtomicI64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn events_in_ring(&self) -> i64 {
        self.event_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn increment_events(&self) {
        self.event_count.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn decrement_events(&self) {
        self.event_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drain the counter at end of run; returns the residue.
    pub fn drain_events(&self) -> i64 {
        self.event_count.swap(0, Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.trigger_mask == MASTER_TRIGGER_MASK
    }
}

/// Errors on the fragment ingest/consume paths.
#[derive(Debug)]
pub enum FragmentError {
    Codec(CodecError),
    Transport(TransportError),
    /// Control word still wrong after the bounded fence wait.
    CommitFence { fragment: String },
    /// A bank the operation requires is absent from the event.
    MissingBank { name: [u8; 4] },
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentError::Codec(e) => write!(f, "codec: {}", e),
            FragmentError::Transport(e) => write!(f, "transport: {}", e),
            FragmentError::CommitFence { fragment } => {
                write!(f, "commit fence not visible for fragment {}", fragment)
            }
            FragmentError::MissingBank { name } => {
                write!(f, "bank {} not found", String::from_utf8_lossy(name))
            }
        }
    }
}

impl std::error::Error for FragmentError {}

impl From<CodecError> for FragmentError {
    fn from(e: CodecError) -> Self {
        FragmentError::Codec(e)
    }
}

impl From<TransportError> for FragmentError {
    fn from(e: TransportError) -> Self {
        FragmentError::Transport(e)
    }
}

pub type FragmentResult<T> = Result<T, FragmentError>;

/// Create the ring and both fragment endpoints for one run.
pub fn open_channel(
    shared: Arc<FragmentShared>,
    ring_capacity: usize,
    max_event: usize,
    rebin_factor: u32,
) -> Result<(FragmentProducer, FragmentConsumer), TransportError> {
    let (producer, consumer) = ByteRing::with_capacity(ring_capacity, max_event)?;
    Ok((
        FragmentProducer::new(shared.clone(), producer, rebin_factor),
        FragmentConsumer {
            shared,
            ring: consumer,
            baseline: None,
            ts_errors: 0,
        },
    ))
}

/// Trailer fields of a ring event.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Trailer {
    pub best_ts: u32,
    /// Word count of the histogram area (2 x bins per sequence).
    pub nbins: usize,
    /// Byte offset of the trailer within the ring event.
    pub offset: usize,
}

pub(crate) fn read_trailer(event: &[u8]) -> FragmentResult<Trailer> {
    let header = EventHeader::parse(event)?;
    let offset = header.total_size();
    let words = Words::new(event);
    let base = offset / 4;
    Ok(Trailer {
        best_ts: words.require(base)?,
        nbins: words.require(base + 2)? as usize,
        offset,
    })
}

pub(crate) fn control_word(event: &[u8]) -> FragmentResult<u32> {
    let header = EventHeader::parse(event)?;
    let words = Words::new(event);
    Ok(words.require(header.total_size() / 4 + 3)?)
}

/// Collector-side fragment endpoint.
pub struct FragmentConsumer {
    shared: Arc<FragmentShared>,
    ring: RingConsumer,
    /// (fragment_ts - master_ts) mod 2^30, latched on the first event
    /// of the run and never updated.
    baseline: Option<u32>,
    ts_errors: u64,
}

impl FragmentConsumer {
    #[must_use]
    pub fn shared(&self) -> &Arc<FragmentShared> {
        &self.shared
    }

    #[inline]
    #[must_use]
    pub fn events_in_ring(&self) -> i64 {
        self.shared.events_in_ring()
    }

    /// Spin until the control word of the oldest event reads
    /// 0xDEADBEEF. Returns false after the bounded wait; the producer
    /// was preempted mid-commit far longer than it ever should be.
    fn wait_commit_fence(&mut self) -> FragmentResult<bool> {
        let deadline = Instant::now() + FENCE_WAIT;
        loop {
            let event = self.ring.peek(Duration::from_millis(100))?;
            if control_word(event)? == COMMIT_WORD {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_micros(1));
        }
    }

    /// Trigger-master only: read which participants the next event
    /// requests, and the master timestamp.
    ///
    /// Returns `None` while no event is available or the DTRG bank is
    /// absent.
    pub fn trigger_request(&mut self) -> Option<(u8, u32)> {
        if !self.shared.is_master() || self.events_in_ring() == 0 {
            return None;
        }
        let name = self.shared.name.clone();
        let event = match self.ring.peek(Duration::from_millis(1000)) {
            Ok(event) => event,
            Err(e) => {
                log::error!("[Fragment] rp timeout reading trigger request from {}: {}", name, e);
                return None;
            }
        };
        match control_word(event) {
            Ok(word) if word == COMMIT_WORD => {}
            _ => {
                // Keep going: the header part of the event is already
                // visible, only the trailer may still be in flight.
                log::error!("[Fragment] control word not set on trigger master {}", name);
            }
        }
        let header = EventHeader::parse(event).ok()?;
        let container = event.get(EVENT_HEADER_SIZE..header.total_size())?;
        let bank = bank::locate(container, b"DTRG")?;
        let words = Words::new(bank.payload);
        let timestamp = words.get(0)?;
        let mask_word = words.get(3)?;
        Some((((mask_word >> 16) & 0xFF) as u8, timestamp))
    }

    /// Verify this fragment's timestamp against the master and merge
    /// its Q/N histogram into the aggregate.
    ///
    /// Returns `Ok(false)` on a timestamp mismatch (or when the event
    /// could not be read in time); the caller decides whether that
    /// stops the run.
    pub fn check_and_merge_qt(
        &mut self,
        qhisto: &mut Vec<u32>,
        nhisto: &mut Vec<u32>,
        master_ts: u32,
    ) -> FragmentResult<bool> {
        if let Err(e) = self.ring.peek(Duration::from_millis(100)) {
            log::error!(
                "[Fragment] rp timeout for {} ({}): {} ({} events in ring)",
                self.shared.name,
                self.shared.id,
                e,
                self.events_in_ring()
            );
            return Ok(false);
        }
        if !self.wait_commit_fence()? {
            log::error!(
                "[Fragment] control word not correct after 10 seconds for {}",
                self.shared.name
            );
        }

        let event = self.ring.peek(Duration::from_millis(100))?;
        let trailer = read_trailer(event)?;

        let master = master_ts & TIMESTAMP_MASK;
        let diff = trailer.best_ts.wrapping_sub(master) & TIMESTAMP_MASK;
        let baseline = *self.baseline.get_or_insert(diff);

        let bitdiff = i64::from(diff) - i64::from(baseline);
        let wrapdiff = 1 + i64::from(TIMESTAMP_MASK) - bitdiff;
        const MAX_DIFF: i64 = 2;
        let mut matched = true;
        if bitdiff.abs() > MAX_DIFF && wrapdiff.abs() > MAX_DIFF {
            matched = false;
            self.ts_errors += 1;
            if self.ts_errors < 5 || self.ts_errors % 50_000 == 0 {
                log::error!(
                    "[Fragment] timestamp mismatch for {}: difference to master is {} counts, \
                     expected {} ({:.3e} s off; raw ts {}, master {}, delta {}, wrap delta {}, \
                     {} errors so far)",
                    self.shared.name,
                    diff,
                    baseline,
                    bitdiff as f64 * 16.0 / 1e9,
                    trailer.best_ts,
                    master_ts,
                    bitdiff,
                    wrapdiff,
                    self.ts_errors
                );
            }
        }

        let bins = trailer.nbins / 2;
        qhisto.resize(bins, 0);
        nhisto.resize(bins, 0);
        if bins > 0 {
            let words = Words::new(event);
            let base = trailer.offset / 4 + TRAILER_FIXED_WORDS;
            for i in 0..bins {
                qhisto[i] = qhisto[i].saturating_add(words.require(base + i)?);
                nhisto[i] = nhisto[i].saturating_add(words.require(base + bins + i)?);
            }
        }
        Ok(matched)
    }

    /// Hand the event's bank container to `write` (the filter engine)
    /// and release the ring slot.
    ///
    /// The slot is released even if the fence never became visible or
    /// `write` failed: the event is dropped from consumer view rather
    /// than wedging the ring.
    pub fn append_banks<F>(&mut self, out: &mut crate::protocol::bank::EventWriter, write: F) -> FragmentResult<()>
    where
        F: FnOnce(&[u8], &mut crate::protocol::bank::EventWriter) -> FragmentResult<()>,
    {
        if let Err(e) = self.ring.peek(Duration::from_millis(1000)) {
            log::error!(
                "[Fragment] rp timeout appending banks from {} ({} events in ring): {}",
                self.shared.name,
                self.events_in_ring(),
                e
            );
            return Err(e.into());
        }
        let fence_ok = self.wait_commit_fence()?;
        if !fence_ok {
            log::error!(
                "[Fragment] dropping event from {}: commit fence never became visible",
                self.shared.name
            );
        }

        let mut write_result = Ok(());
        let advance_by = {
            let event = self.ring.peek(Duration::from_millis(100))?;
            let trailer = read_trailer(event)?;
            let container = &event[EVENT_HEADER_SIZE..trailer.offset];
            if fence_ok {
                write_result = write(container, out);
            } else {
                log::error!(
                    "[Fragment] dropped event banks: {}",
                    bank::bank_names(container)
                );
            }
            trailer.offset + (TRAILER_FIXED_WORDS + trailer.nbins) * 4
        };
        self.ring.advance(advance_by);
        self.shared.decrement_events();
        write_result
    }

    /// Serial number of the oldest unconsumed event.
    pub fn serial_number(&mut self) -> FragmentResult<u32> {
        let event = self.ring.peek(Duration::from_secs(5))?;
        Ok(EventHeader::parse(event)?.serial_number)
    }
}
