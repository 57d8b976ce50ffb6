// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Event assembly engine.
//!
//! - [`assembler`]: the collector. Per event it reads the trigger
//!   master's request mask, waits for the requested participants,
//!   verifies timestamps, aggregates Q-vs-T histograms, runs the
//!   filter engine and emits the coalesced output event.
//! - [`run`]: run lifecycle. Latches settings, creates rings, spawns
//!   one ingest worker per fragment plus the collector thread, joins
//!   everything at end of run and publishes operator status strings.

pub mod assembler;
pub mod run;

pub use assembler::Assembler;
pub use run::{EventBuilder, LogStatusSink, RunState, StatusSink, TransitionStatus};
