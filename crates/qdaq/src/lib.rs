// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! # qdaq - real-time event-building DAQ core
//!
//! Assembles physics events from multiple concurrent upstream
//! producers ("fragments") into a single coalesced binary event
//! stream, with per-event charge-vs-time summaries, timestamp
//! reconciliation and smart waveform filtering.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  upstream middleware (one EventSource per fragment)          |
//! +--------------------------------------------------------------+
//! |  Fragment ingest workers (one thread each)                   |
//! |    parse banks -> Q-vs-T summary -> timestamp -> trailer     |
//! +--------------------------------------------------------------+
//! |  SPSC byte rings (commit-word protocol, 75% back-pressure)   |
//! +--------------------------------------------------------------+
//! |  Assembler (collector thread)                                |
//! |    trigger-master mask -> wait participants -> verify        |
//! |    timestamps -> aggregate Q-vs-T -> filter -> emit          |
//! +--------------------------------------------------------------+
//! |  output EventSink (+ "EBSM" summary bank)                    |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`engine::EventBuilder`] | Run lifecycle: latch settings, spawn/join threads |
//! | [`engine::Assembler`] | The collector state machine |
//! | [`fragment::FragmentProducer`] | Per-fragment ingest pipeline |
//! | [`filter::SmartFilter`] | ZL/SQ/W4 bank rewriting |
//! | [`filter::FilterThresholds`] | Energy / prompt-fraction classification |
//! | [`transport::ByteRing`] | SPSC variable-length event ring |
//!
//! ## Modules overview
//!
//! - [`config`] - flat settings namespace, latched at begin-of-run
//! - [`protocol`] - event/bank/waveform wire codecs (pure)
//! - [`transport`] - rings and the middleware seam
//! - [`fragment`] - per-stream ingest and consume state
//! - [`filter`] - per-event classification and bank filtering
//! - [`engine`] - the collector and the run lifecycle

/// Flat settings namespace and the begin-of-run snapshot.
pub mod config;
/// Event assembly engine: collector state machine and run lifecycle.
pub mod engine;
/// Per-event filter engine: classification and bank rewriting.
pub mod filter;
/// Per-upstream-stream fragment state (ingest, merge, append).
pub mod fragment;
/// Wire-format codecs for events and their nested banks.
pub mod protocol;
/// SPSC rings and the upstream middleware seam.
pub mod transport;

pub use config::{AssemblyMode, EbSettings, SettingsStore};
pub use engine::{EventBuilder, TransitionStatus};
