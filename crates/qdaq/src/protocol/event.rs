// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Event header codec.
//!
//! Every event on the wire starts with a fixed 16-byte header followed
//! by a bank container. `data_size` counts the container bytes and is
//! authoritative; sizes reported by the upstream transport are only
//! advisory.

use super::{CodecError, CodecResult};

/// Byte size of the fixed event header.
pub const EVENT_HEADER_SIZE: usize = 16;

/// Fixed event header: id, trigger mask, serial, time, container size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub event_id: u16,
    pub trigger_mask: u16,
    pub serial_number: u32,
    pub time_stamp: u32,
    /// Byte length of the bank container following this header.
    pub data_size: u32,
}

impl EventHeader {
    pub fn parse(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < EVENT_HEADER_SIZE {
            return Err(CodecError::Truncated {
                offset: bytes.len(),
                reason: "event header needs 16 bytes",
            });
        }
        let u16_at = |o: usize| u16::from_le_bytes([bytes[o], bytes[o + 1]]);
        let u32_at =
            |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        Ok(EventHeader {
            event_id: u16_at(0),
            trigger_mask: u16_at(2),
            serial_number: u32_at(4),
            time_stamp: u32_at(8),
            data_size: u32_at(12),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.event_id.to_le_bytes());
        out.extend_from_slice(&self.trigger_mask.to_le_bytes());
        out.extend_from_slice(&self.serial_number.to_le_bytes());
        out.extend_from_slice(&self.time_stamp.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
    }

    /// Total event size on the wire: header plus container.
    #[inline]
    #[must_use]
    pub fn total_size(&self) -> usize {
        EVENT_HEADER_SIZE + self.data_size as usize
    }
}
