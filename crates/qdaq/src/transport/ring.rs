// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Single-producer/single-consumer byte ring for variable-length events.
//!
//! # Memory layout
//!
//! ```text
//! +------------------------------------------------------------+
//! | ... consumed ... | event | event | dead tail | ... free ...|
//! +------------------------------------------------------------+
//!                    ^ rpos                      ^ wpos (wrapped)
//! ```
//!
//! Events are always contiguous: `reserve()` hands out a window of
//! `max_event` bytes, and if the tail of the buffer is too short the
//! producer wraps early, accounting the dead tail into the fill level
//! so the consumer can skip it.
//!
//! # Synchronization protocol
//!
//! Producer:
//! 1. `reserve()` - check free space against the fill level (Acquire)
//! 2. write the event bytes into the window
//! 3. `commit(len)` - publish with a Release increment of `avail`
//!
//! Consumer:
//! 1. `peek()` - load `avail` (Acquire); skip a dead tail if `rpos`
//!    reached the wrap mark
//! 2. parse the event in place
//! 3. `advance(len)` - release the bytes (Release decrement)
//!
//! The ring orders whole-event publication; the finer-grained commit
//! fence inside the event trailer (the 0xDEADBEEF control word) stays
//! the contract between fragment producer and collector.

use super::{TransportError, TransportResult};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sentinel for "producer has not wrapped".
const NO_WRAP: usize = usize::MAX;

/// Counters for ring health, updated with relaxed atomics (consumers
/// only need monotonic snapshots).
#[derive(Debug, Default)]
pub struct RingMetrics {
    pub commits: AtomicU64,
    pub releases: AtomicU64,
    pub would_blocks: AtomicU64,
    pub wraps: AtomicU64,
    pub peek_timeouts: AtomicU64,
}

struct Buffer(UnsafeCell<Box<[u8]>>);

// SAFETY: access to disjoint regions of the buffer is coordinated by
// the fill/avail protocol below. The producer writes only inside its
// reserved window; the consumer reads only regions whose bytes were
// published through a Release increment of `avail` that it observed
// with an Acquire load. No byte is ever writable and readable at the
// same time.
unsafe impl Sync for Buffer {}

struct Shared {
    buf: Buffer,
    capacity: usize,
    max_event: usize,
    /// Occupied bytes including dead tails: bounds producer progress.
    fill: AtomicUsize,
    /// Committed-but-unconsumed event bytes: what the consumer may read.
    avail: AtomicUsize,
    /// Byte offset where the producer wrapped early, `NO_WRAP` if none.
    wrap_at: AtomicUsize,
    metrics: RingMetrics,
}

/// Factory for the ring's two endpoints.
pub struct ByteRing;

impl ByteRing {
    /// Create a ring of `capacity` bytes carrying events of at most
    /// `max_event` bytes.
    pub fn with_capacity(
        capacity: usize,
        max_event: usize,
    ) -> TransportResult<(RingProducer, RingConsumer)> {
        if max_event == 0 || capacity < 2 * max_event {
            return Err(TransportError::InvalidCapacity {
                capacity,
                max_event,
            });
        }
        let shared = Arc::new(Shared {
            buf: Buffer(UnsafeCell::new(vec![0u8; capacity].into_boxed_slice())),
            capacity,
            max_event,
            fill: AtomicUsize::new(0),
            avail: AtomicUsize::new(0),
            wrap_at: AtomicUsize::new(NO_WRAP),
            metrics: RingMetrics::default(),
        });
        Ok((
            RingProducer {
                shared: shared.clone(),
                wpos: 0,
            },
            RingConsumer { shared, rpos: 0 },
        ))
    }
}

/// Write side. Owned by exactly one ingest worker; not cloneable.
pub struct RingProducer {
    shared: Arc<Shared>,
    wpos: usize,
}

impl RingProducer {
    /// Reserve a contiguous window of `max_event` bytes, wrapping early
    /// if the buffer tail is too short. Returns `WouldBlock` when free
    /// space is insufficient.
    pub fn reserve(&mut self) -> TransportResult<&mut [u8]> {
        let s = &*self.shared;
        let fill = s.fill.load(Ordering::Acquire);
        let free = s.capacity - fill;

        let start = if s.capacity - self.wpos >= s.max_event {
            if free < s.max_event {
                s.metrics.would_blocks.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::WouldBlock);
            }
            self.wpos
        } else {
            let dead = s.capacity - self.wpos;
            if free < dead + s.max_event {
                s.metrics.would_blocks.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::WouldBlock);
            }
            // Account the dead tail before publishing the wrap mark;
            // the consumer skips it when rpos reaches the mark.
            s.fill.fetch_add(dead, Ordering::Release);
            s.wrap_at.store(self.wpos, Ordering::Release);
            s.metrics.wraps.fetch_add(1, Ordering::Relaxed);
            self.wpos = 0;
            0
        };

        // SAFETY: the window [start, start + max_event) is free: the
        // fill check above proved it does not overlap any committed or
        // dead region, and only this producer ever writes the buffer.
        let buf = unsafe { &mut *s.buf.0.get() };
        Ok(&mut buf[start..start + s.max_event])
    }

    /// Publish the first `len` bytes of the reserved window. This is
    /// the release fence for all prior writes into the window.
    pub fn commit(&mut self, len: usize) -> TransportResult<()> {
        let s = &*self.shared;
        if len > s.max_event {
            return Err(TransportError::EventTooLarge {
                size: len,
                max: s.max_event,
            });
        }
        self.wpos += len;
        s.fill.fetch_add(len, Ordering::Release);
        s.avail.fetch_add(len, Ordering::Release);
        s.metrics.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current occupancy in percent, dead tails included. Drives the
    /// 75% ingest back-pressure guard.
    #[must_use]
    pub fn fill_percent(&self) -> usize {
        self.shared.fill.load(Ordering::Relaxed) * 100 / self.shared.capacity
    }

    #[must_use]
    pub fn max_event_size(&self) -> usize {
        self.shared.max_event
    }

    #[must_use]
    pub fn metrics(&self) -> &RingMetrics {
        &self.shared.metrics
    }
}

/// Read side. Owned by the collector; not cloneable.
pub struct RingConsumer {
    shared: Arc<Shared>,
    rpos: usize,
}

impl RingConsumer {
    /// Bytes committed and not yet consumed.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.avail.load(Ordering::Acquire)
    }

    /// Borrow the committed bytes at the read position, waiting up to
    /// `timeout` for at least one committed event.
    ///
    /// The returned slice starts at the first byte of the oldest
    /// unconsumed event and extends over the full readable window; the
    /// caller parses the event length out of the content.
    pub fn peek(&mut self, timeout: Duration) -> TransportResult<&[u8]> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.available() > 0 {
                break;
            }
            if Instant::now() >= deadline {
                self.shared
                    .metrics
                    .peek_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::Timeout);
            }
            for _ in 0..1000 {
                std::hint::spin_loop();
            }
            std::thread::sleep(Duration::from_micros(10));
        }

        let s = &*self.shared;
        // Skip a dead tail: everything before the wrap mark is
        // consumed, the oldest event sits at offset 0.
        if self.rpos == s.wrap_at.load(Ordering::Acquire) {
            let dead = s.capacity - self.rpos;
            s.wrap_at.store(NO_WRAP, Ordering::Release);
            s.fill.fetch_sub(dead, Ordering::Release);
            self.rpos = 0;
        }

        let end = (self.rpos + s.max_event).min(s.capacity);
        // SAFETY: bytes in [rpos, end) up to `avail` were published by
        // a Release commit observed through the Acquire load in
        // `available()`; the producer never rewrites committed bytes
        // before `advance()` releases them.
        let buf = unsafe { &*s.buf.0.get() };
        Ok(&buf[self.rpos..end])
    }

    /// Release `len` consumed bytes back to the producer.
    pub fn advance(&mut self, len: usize) {
        let s = &*self.shared;
        debug_assert!(len <= s.avail.load(Ordering::Relaxed));
        self.rpos += len;
        s.avail.fetch_sub(len, Ordering::Release);
        s.fill.fetch_sub(len, Ordering::Release);
        s.metrics.releases.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn metrics(&self) -> &RingMetrics {
        &self.shared.metrics
    }
}
