// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Nested bank container codec.
//!
//! # Layout
//!
//! ```text
//! +--------------------------------------------------+
//! | container header: data_size (u32) | flags (u32)  |
//! +--------------------------------------------------+
//! | bank: name[4] | kind (u32) | length (u32)        |
//! |       payload (32-bit aligned)                   |
//! | bank: ...                                        |
//! +--------------------------------------------------+
//! ```
//!
//! `data_size` counts the bank bytes after the container header. For
//! DWORD banks (`kind == KIND_DWORD`) the `length` field counts 32-bit
//! payload words; for any other kind it counts bytes and the payload is
//! padded up to the next word boundary.
//!
//! The writer mirrors the reader: `begin_bank` opens a bank under
//! construction, `push_word` appends payload, `end_bank` commits the
//! length, and `finish` patches the container and event sizes.

use super::event::{EventHeader, EVENT_HEADER_SIZE};
use super::{CodecError, CodecResult, KIND_DWORD};

/// Byte size of the container header preceding the first bank.
pub const CONTAINER_HEADER_SIZE: usize = 8;

/// Byte size of a single bank header.
pub const BANK_HEADER_SIZE: usize = 12;

/// One decoded bank: a borrowed view into the container.
#[derive(Debug, Clone, Copy)]
pub struct Bank<'a> {
    pub name: [u8; 4],
    pub kind: u32,
    /// Raw length field as found on the wire (words for DWORD banks).
    pub length: u32,
    pub payload: &'a [u8],
}

impl<'a> Bank<'a> {
    /// Two-character family prefix ("ZL", "QT", "SQ", ...).
    #[inline]
    #[must_use]
    pub fn family(&self) -> [u8; 2] {
        [self.name[0], self.name[1]]
    }

    /// Decimal module index encoded in the last two name characters
    /// ("ZL07" -> 7). `None` for names like "DTRG" or "VETO".
    #[must_use]
    pub fn module(&self) -> Option<u8> {
        let d1 = (self.name[2] as char).to_digit(10)?;
        let d2 = (self.name[3] as char).to_digit(10)?;
        Some((d1 * 10 + d2) as u8)
    }

    #[must_use]
    pub fn name_str(&self) -> &str {
        std::str::from_utf8(&self.name).unwrap_or("????")
    }
}

#[inline]
fn payload_bytes(kind: u32, length: u32) -> usize {
    if kind == KIND_DWORD {
        length as usize * 4
    } else {
        (length as usize + 3) & !3
    }
}

/// Iterator over the banks of a container.
///
/// Yields `Err(MalformedBank)` once and then ends if a bank declares a
/// length exceeding the remaining container bytes; the caller keeps
/// whatever it decoded so far (the event itself is not dropped).
pub struct BankIter<'a> {
    rest: &'a [u8],
    poisoned: bool,
}

impl<'a> BankIter<'a> {
    /// Start iterating the container that begins at `container[0]`.
    pub fn new(container: &'a [u8]) -> CodecResult<Self> {
        if container.len() < CONTAINER_HEADER_SIZE {
            return Err(CodecError::Truncated {
                offset: container.len(),
                reason: "container header needs 8 bytes",
            });
        }
        let data_size = u32::from_le_bytes([container[0], container[1], container[2], container[3]])
            as usize;
        let avail = container.len() - CONTAINER_HEADER_SIZE;
        if data_size > avail {
            return Err(CodecError::Truncated {
                offset: CONTAINER_HEADER_SIZE,
                reason: "container data_size exceeds buffer",
            });
        }
        Ok(BankIter {
            rest: &container[CONTAINER_HEADER_SIZE..CONTAINER_HEADER_SIZE + data_size],
            poisoned: false,
        })
    }
}

impl<'a> Iterator for BankIter<'a> {
    type Item = CodecResult<Bank<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.rest.len() < BANK_HEADER_SIZE {
            return None;
        }
        let name = [self.rest[0], self.rest[1], self.rest[2], self.rest[3]];
        let kind = u32::from_le_bytes([self.rest[4], self.rest[5], self.rest[6], self.rest[7]]);
        let length = u32::from_le_bytes([self.rest[8], self.rest[9], self.rest[10], self.rest[11]]);
        let body = payload_bytes(kind, length);
        let remaining = self.rest.len() - BANK_HEADER_SIZE;
        if body > remaining {
            self.poisoned = true;
            return Some(Err(CodecError::MalformedBank {
                name,
                declared: body,
                remaining,
            }));
        }
        let payload = &self.rest[BANK_HEADER_SIZE..BANK_HEADER_SIZE + body];
        self.rest = &self.rest[BANK_HEADER_SIZE + body..];
        Some(Ok(Bank {
            name,
            kind,
            length,
            payload,
        }))
    }
}

/// First bank with the given name, or `None`. Malformed tails are
/// treated as end-of-container.
#[must_use]
pub fn locate<'a>(container: &'a [u8], name: &[u8; 4]) -> Option<Bank<'a>> {
    let iter = BankIter::new(container).ok()?;
    iter.filter_map(Result::ok).find(|b| &b.name == name)
}

/// Space-separated bank listing, for log messages.
#[must_use]
pub fn bank_names(container: &[u8]) -> String {
    match BankIter::new(container) {
        Ok(iter) => iter
            .filter_map(Result::ok)
            .map(|b| b.name_str().to_owned())
            .collect::<Vec<_>>()
            .join(" "),
        Err(_) => String::new(),
    }
}

/// Output event under construction: event header + container + banks.
pub struct EventWriter {
    buf: Vec<u8>,
    /// Byte offset of the open bank's header, if any.
    open: Option<usize>,
}

impl EventWriter {
    /// Start an output event. `header.data_size` is ignored and patched
    /// by [`EventWriter::finish`].
    #[must_use]
    pub fn new(header: EventHeader) -> Self {
        let mut buf = Vec::with_capacity(4096);
        header.write(&mut buf);
        buf.extend_from_slice(&0u32.to_le_bytes()); // container data_size, patched later
        buf.extend_from_slice(&1u32.to_le_bytes()); // container flags
        EventWriter { buf, open: None }
    }

    /// Open a bank under construction. Payload is appended with
    /// [`EventWriter::push_word`] until [`EventWriter::end_bank`].
    pub fn begin_bank(&mut self, name: [u8; 4], kind: u32) {
        debug_assert!(self.open.is_none(), "previous bank still open");
        self.open = Some(self.buf.len());
        self.buf.extend_from_slice(&name);
        self.buf.extend_from_slice(&kind.to_le_bytes());
        self.buf.extend_from_slice(&0u32.to_le_bytes()); // length, patched by end_bank
    }

    #[inline]
    pub fn push_word(&mut self, word: u32) {
        debug_assert!(self.open.is_some(), "push_word outside a bank");
        self.buf.extend_from_slice(&word.to_le_bytes());
    }

    pub fn push_words(&mut self, words: &[u32]) {
        for &w in words {
            self.push_word(w);
        }
    }

    /// Raw payload bytes appended verbatim (already word-aligned input).
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.open.is_some(), "push_bytes outside a bank");
        debug_assert_eq!(bytes.len() % 4, 0, "payload must stay word aligned");
        self.buf.extend_from_slice(bytes);
    }

    /// Number of payload words written to the open bank so far.
    #[must_use]
    pub fn word_count(&self) -> usize {
        match self.open {
            Some(off) => (self.buf.len() - off - BANK_HEADER_SIZE) / 4,
            None => 0,
        }
    }

    /// Read back payload word `idx` of the open bank.
    #[must_use]
    pub fn payload_word(&self, idx: usize) -> u32 {
        let off = self.open.expect("no open bank") + BANK_HEADER_SIZE + idx * 4;
        u32::from_le_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    /// Patch payload word `idx` of the open bank (size words, masks).
    pub fn set_payload_word(&mut self, idx: usize, word: u32) {
        let off = self.open.expect("no open bank") + BANK_HEADER_SIZE + idx * 4;
        self.buf[off..off + 4].copy_from_slice(&word.to_le_bytes());
    }

    /// Commit the open bank's length field.
    pub fn end_bank(&mut self) {
        let off = self.open.take().expect("end_bank without begin_bank");
        let kind = u32::from_le_bytes([
            self.buf[off + 4],
            self.buf[off + 5],
            self.buf[off + 6],
            self.buf[off + 7],
        ]);
        let body = self.buf.len() - off - BANK_HEADER_SIZE;
        let length = if kind == KIND_DWORD {
            (body / 4) as u32
        } else {
            body as u32
        };
        self.buf[off + 8..off + 12].copy_from_slice(&length.to_le_bytes());
    }

    /// Append an existing bank verbatim, header and payload.
    pub fn copy_bank(&mut self, bank: &Bank<'_>) {
        debug_assert!(self.open.is_none(), "copy_bank while a bank is open");
        self.buf.extend_from_slice(&bank.name);
        self.buf.extend_from_slice(&bank.kind.to_le_bytes());
        self.buf.extend_from_slice(&bank.length.to_le_bytes());
        self.buf.extend_from_slice(bank.payload);
    }

    /// Locate `name` in `container` and append it verbatim. Returns
    /// whether the bank was found.
    pub fn copy_from(&mut self, container: &[u8], name: &[u8; 4]) -> bool {
        match locate(container, name) {
            Some(bank) => {
                self.copy_bank(&bank);
                true
            }
            None => false,
        }
    }

    /// Bytes of the assembled container so far (header excluded).
    #[must_use]
    pub fn container_bytes(&self) -> usize {
        self.buf.len() - EVENT_HEADER_SIZE
    }

    /// Patch the event and container sizes and return the event bytes.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        debug_assert!(self.open.is_none(), "finish with a bank still open");
        let container = (self.buf.len() - EVENT_HEADER_SIZE) as u32;
        let banks = container - CONTAINER_HEADER_SIZE as u32;
        self.buf[12..16].copy_from_slice(&container.to_le_bytes());
        self.buf[EVENT_HEADER_SIZE..EVENT_HEADER_SIZE + 4]
            .copy_from_slice(&banks.to_le_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> EventHeader {
        EventHeader {
            event_id: 1,
            trigger_mask: 0,
            serial_number: 7,
            time_stamp: 1000,
            data_size: 0,
        }
    }

    #[test]
    fn test_write_iterate_roundtrip() {
        let mut writer = EventWriter::new(sample_header());
        writer.begin_bank(*b"AAAA", KIND_DWORD);
        writer.push_words(&[1, 2, 3]);
        writer.end_bank();
        writer.begin_bank(*b"BBBB", KIND_DWORD);
        writer.push_word(0xFFFF_FFFF);
        writer.end_bank();
        let event = writer.finish();

        let header = EventHeader::parse(&event).expect("event header");
        assert_eq!(header.total_size(), event.len());

        let container = &event[EVENT_HEADER_SIZE..];
        let banks: Vec<_> = BankIter::new(container)
            .expect("container header")
            .map(|b| b.expect("well-formed bank"))
            .collect();
        assert_eq!(banks.len(), 2);
        assert_eq!(&banks[0].name, b"AAAA");
        assert_eq!(banks[0].length, 3);
        assert_eq!(banks[0].payload.len(), 12);
        assert_eq!(&banks[1].name, b"BBBB");
        assert_eq!(banks[1].payload, &0xFFFF_FFFFu32.to_le_bytes());
    }

    #[test]
    fn test_locate_and_copy() {
        let mut writer = EventWriter::new(sample_header());
        writer.begin_bank(*b"DTRG", KIND_DWORD);
        writer.push_words(&[10, 0, 0, 0x0004_0000]);
        writer.end_bank();
        let event = writer.finish();
        let container = &event[EVENT_HEADER_SIZE..];

        let bank = locate(container, b"DTRG").expect("present");
        assert_eq!(bank.length, 4);
        assert!(locate(container, b"ZL00").is_none());

        let mut copy = EventWriter::new(sample_header());
        assert!(copy.copy_from(container, b"DTRG"));
        let copied = copy.finish();
        let copied_bank =
            locate(&copied[EVENT_HEADER_SIZE..], b"DTRG").expect("copied verbatim");
        assert_eq!(copied_bank.payload, bank.payload);
    }

    #[test]
    fn test_malformed_bank_poisons_iteration() {
        let mut writer = EventWriter::new(sample_header());
        writer.begin_bank(*b"GOOD", KIND_DWORD);
        writer.push_word(1);
        writer.end_bank();
        let mut event = writer.finish();

        // Corrupt the length field of the only bank: claim 1000 words.
        let off = EVENT_HEADER_SIZE + CONTAINER_HEADER_SIZE + 8;
        event[off..off + 4].copy_from_slice(&1000u32.to_le_bytes());

        let container = &event[EVENT_HEADER_SIZE..];
        let mut iter = BankIter::new(container).expect("container header");
        assert!(matches!(
            iter.next(),
            Some(Err(CodecError::MalformedBank { .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_module_index_parse() {
        let mut writer = EventWriter::new(sample_header());
        writer.begin_bank(*b"ZL07", KIND_DWORD);
        writer.end_bank();
        writer.begin_bank(*b"VETO", KIND_DWORD);
        writer.end_bank();
        let event = writer.finish();
        let container = &event[EVENT_HEADER_SIZE..];
        let banks: Vec<_> = BankIter::new(container)
            .expect("container header")
            .map(Result::unwrap)
            .collect();
        assert_eq!(banks[0].module(), Some(7));
        assert_eq!(banks[0].family(), *b"ZL");
        assert_eq!(banks[1].module(), None);
    }

    #[test]
    fn test_bank_names_listing() {
        let mut writer = EventWriter::new(sample_header());
        for name in [b"ZL00", b"QT00", b"VETO"] {
            writer.begin_bank(*name, KIND_DWORD);
            writer.end_bank();
        }
        let event = writer.finish();
        assert_eq!(bank_names(&event[EVENT_HEADER_SIZE..]), "ZL00 QT00 VETO");
    }
}
