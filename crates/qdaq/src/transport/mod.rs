// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Byte transport between threads and toward the outside world.
//!
//! - [`ring`]: single-producer/single-consumer byte ring carrying
//!   variable-length events between an ingest worker and the collector.
//! - [`upstream`]: the seam to the external message-buffer middleware
//!   (one instance per fragment on the way in, one sink on the way
//!   out), plus bounded in-memory implementations.

pub mod ring;
pub mod upstream;

pub use ring::{ByteRing, RingConsumer, RingProducer};
pub use upstream::{EventSink, EventSource, Receive};

use std::fmt;

/// Errors surfaced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Not enough free ring space for a maximum-sized event.
    WouldBlock,
    /// Bounded wait elapsed without a committed event.
    Timeout,
    /// Committed length exceeds the reserved window.
    EventTooLarge { size: usize, max: usize },
    /// Ring capacity cannot hold two maximum-sized events.
    InvalidCapacity { capacity: usize, max_event: usize },
    /// The upstream producer or downstream consumer went away.
    Disconnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::WouldBlock => write!(f, "ring full, retry later"),
            TransportError::Timeout => write!(f, "timed out waiting for an event"),
            TransportError::EventTooLarge { size, max } => {
                write!(f, "event of {} bytes exceeds max event size {}", size, max)
            }
            TransportError::InvalidCapacity { capacity, max_event } => write!(
                f,
                "ring capacity {} too small for max event size {}",
                capacity, max_event
            ),
            TransportError::Disconnected => write!(f, "peer disconnected"),
        }
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = Result<T, TransportError>;
