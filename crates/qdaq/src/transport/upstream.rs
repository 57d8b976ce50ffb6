// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Seam to the external message-buffer middleware.
//!
//! The real transport (bounded shared-memory queues with a
//! publish/subscribe request API) lives outside this crate; the core
//! only sees one [`EventSource`] per fragment and one [`EventSink`]
//! for the assembled stream. The bounded in-memory implementations
//! below back the integration tests and demos.

use super::{TransportError, TransportResult};
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};
use std::time::Duration;

/// Outcome of a non-blocking upstream receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receive {
    /// An event of `len` bytes was copied into the caller's buffer.
    Event(usize),
    /// No event available yet; poll again.
    Pending,
}

/// One upstream event stream (per fragment).
pub trait EventSource: Send {
    /// Non-blocking receive into `buf`.
    fn receive(&mut self, buf: &mut [u8]) -> TransportResult<Receive>;
}

/// The assembled-event sink.
pub trait EventSink: Send {
    fn publish(&mut self, event: &[u8]) -> TransportResult<()>;
}

/// Feeding end of an in-memory upstream pipe.
pub struct MemoryFeeder {
    tx: Sender<Vec<u8>>,
}

impl MemoryFeeder {
    /// Queue one event, blocking while the pipe is full.
    pub fn push(&self, event: Vec<u8>) -> TransportResult<()> {
        self.tx
            .send(event)
            .map_err(|_| TransportError::Disconnected)
    }
}

/// In-memory [`EventSource`] fed by a [`MemoryFeeder`].
pub struct MemorySource {
    rx: Receiver<Vec<u8>>,
}

impl EventSource for MemorySource {
    fn receive(&mut self, buf: &mut [u8]) -> TransportResult<Receive> {
        match self.rx.try_recv() {
            Ok(event) => {
                if event.len() > buf.len() {
                    return Err(TransportError::EventTooLarge {
                        size: event.len(),
                        max: buf.len(),
                    });
                }
                buf[..event.len()].copy_from_slice(&event);
                Ok(Receive::Event(event.len()))
            }
            Err(TryRecvError::Empty) => Ok(Receive::Pending),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

/// Create a bounded in-memory upstream pipe.
#[must_use]
pub fn memory_pipe(capacity: usize) -> (MemoryFeeder, MemorySource) {
    let (tx, rx) = bounded(capacity);
    (MemoryFeeder { tx }, MemorySource { rx })
}

/// In-memory [`EventSink`] delivering into a [`MemoryOutlet`].
pub struct MemorySink {
    tx: Sender<Vec<u8>>,
}

impl EventSink for MemorySink {
    fn publish(&mut self, event: &[u8]) -> TransportResult<()> {
        self.tx
            .send(event.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Receiving end of an in-memory sink.
pub struct MemoryOutlet {
    rx: Receiver<Vec<u8>>,
}

impl MemoryOutlet {
    pub fn take(&self, timeout: Duration) -> TransportResult<Vec<u8>> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|_| TransportError::Timeout)
    }

    #[must_use]
    pub fn try_take(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

/// Create a bounded in-memory output sink.
#[must_use]
pub fn memory_sink(capacity: usize) -> (MemorySink, MemoryOutlet) {
    let (tx, rx) = bounded(capacity);
    (MemorySink { tx }, MemoryOutlet { rx })
}
