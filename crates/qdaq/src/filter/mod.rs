// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Per-event filter engine.
//!
//! Two cooperating parts, both owned by the collector and reset per
//! event:
//!
//! - [`decision`]: classifies the aggregated Q-vs-T histogram into an
//!   (energy, prompt-fraction) box and appends the "EBSM" summary
//!   bank;
//! - [`smart`]: decides which ZLE blocks and waveform groups are
//!   uninteresting and rewrites the ZL/SQ/W4 bank families while
//!   copying everything else verbatim.

pub mod decision;
pub mod smart;

pub use decision::{append_summary_bank, Decision, EnergyBox, FilterThresholds};
pub use smart::SmartFilter;
