// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! The collector: assembles one output event per trigger.
//!
//! # Event cycle
//!
//! ```text
//! Idle -> WaitMaster:       trigger master has an event; read its
//!                           request mask + timestamp (DTRG bank)
//! WaitMaster -> WaitParticipants: every requested fragment must have
//!                           an event in its ring (100 us polls)
//! -> VerifyAndAggregate:    per participant, check the timestamp
//!                           baseline and merge Q/N histograms
//! -> Emit:                  master banks verbatim, participants
//!                           through the smart filter, then the EBSM
//!                           summary bank; advance all consumed rings
//! ```
//!
//! A timestamp mismatch under strict matching flags a run stop
//! (idempotently) and aborts the current event; otherwise assembly
//! continues with a rate-limited error.
//!
//! Serial-number mode skips the mask/timestamp machinery: it requires
//! one event from every enabled fragment, compares serial numbers and
//! concatenates all banks unfiltered.

use super::run::RunState;
use crate::config::{AssemblyMode, EbSettings};
use crate::filter::{append_summary_bank, FilterThresholds, SmartFilter};
use crate::fragment::{FragmentConsumer, FragmentError, FragmentResult};
use crate::protocol::bank::{BankIter, EventWriter};
use crate::protocol::event::EventHeader;
use crate::transport::EventSink;
use std::sync::Arc;
use std::time::Duration;

/// Poll interval while waiting for the master or its participants.
const POLL_SLEEP: Duration = Duration::from_micros(100);

/// Append every bank of `container` verbatim.
fn copy_all_banks(container: &[u8], out: &mut EventWriter) -> FragmentResult<()> {
    for item in BankIter::new(container)? {
        match item {
            Ok(bank) => out.copy_bank(&bank),
            Err(e) => {
                log::warn!("[Assembler] malformed bank tail skipped: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn unix_time() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// The collector. Owns the consumer half of every fragment ring and
/// the output sink; runs on its own thread for the run's duration.
pub struct Assembler {
    /// Trigger-mask sorted; index 0 is the trigger master.
    consumers: Vec<FragmentConsumer>,
    settings: Arc<EbSettings>,
    thresholds: FilterThresholds,
    filter: SmartFilter,
    run_state: Arc<RunState>,
    sink: Box<dyn EventSink>,
    serial: u32,
    qhisto: Vec<u32>,
    nhisto: Vec<u32>,
    events_built: u64,
}

impl Assembler {
    #[must_use]
    pub fn new(
        consumers: Vec<FragmentConsumer>,
        settings: Arc<EbSettings>,
        run_state: Arc<RunState>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        Assembler {
            thresholds: FilterThresholds::from_settings(&settings),
            filter: SmartFilter::latch(&settings),
            consumers,
            settings,
            run_state,
            sink,
            serial: 0,
            qhisto: Vec::new(),
            nhisto: Vec::new(),
            events_built: 0,
        }
    }

    #[must_use]
    pub fn events_built(&self) -> u64 {
        self.events_built
    }

    /// Collector loop: assemble until the run flag clears or a strict
    /// timestamp stop is flagged.
    pub fn run(&mut self) {
        log::info!("[Assembler] collector thread running");
        while self.run_state.is_running() {
            if self.run_state.stop_requested() {
                break;
            }
            let result = match self.settings.assembly_mode {
                AssemblyMode::Timestamp => self.assemble_next(),
                AssemblyMode::SerialNumber => self.assemble_next_serial(),
            };
            match result {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(POLL_SLEEP),
                Err(e) => {
                    log::error!("[Assembler] event assembly failed: {}", e);
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
        log::info!(
            "[Assembler] collector thread exiting after {} events",
            self.events_built
        );
    }

    /// One timestamp-mode event cycle. `Ok(false)` means the cycle is
    /// not ready (or was aborted) and should be retried.
    pub fn assemble_next(&mut self) -> FragmentResult<bool> {
        let Self {
            consumers,
            settings,
            thresholds,
            filter,
            run_state,
            sink,
            serial,
            qhisto,
            nhisto,
            events_built,
        } = self;

        // WaitMaster: the trigger master names the participants.
        let Some((mask_used, master_ts)) = consumers[0].trigger_request() else {
            return Ok(false);
        };

        // WaitParticipants: every requested fragment must have data.
        let participates = |consumer: &FragmentConsumer| {
            let dtm_mask = consumer.shared().dtm_mask;
            dtm_mask >= 0 && (dtm_mask as u32) & u32::from(mask_used) != 0
        };
        for consumer in consumers.iter().skip(1) {
            if participates(consumer) && consumer.events_in_ring() == 0 {
                return Ok(false);
            }
        }

        // VerifyAndAggregate.
        qhisto.clear();
        nhisto.clear();
        for consumer in consumers.iter_mut().skip(1) {
            if !participates(consumer) {
                continue;
            }
            let matched = consumer.check_and_merge_qt(qhisto, nhisto, master_ts)?;
            if !matched {
                run_state.note_timestamp_warning();
                if settings.strict_timestamp_matching {
                    if run_state.request_stop() {
                        log::error!(
                            "[Assembler] timestamp check failed for fragment {}; stopping run",
                            consumer.shared().name
                        );
                    }
                    // Abort the current event; the run is coming down.
                    return Ok(false);
                }
            }
        }

        // Emit.
        let mut out = EventWriter::new(EventHeader {
            event_id: 1,
            trigger_mask: u16::from(mask_used),
            serial_number: *serial,
            time_stamp: unix_time(),
            data_size: 0,
        });
        filter.reset();
        consumers[0].append_banks(&mut out, copy_all_banks)?;
        for consumer in consumers.iter_mut().skip(1) {
            if !participates(consumer) {
                continue;
            }
            consumer.append_banks(&mut out, |container, out| {
                filter.analyze(container);
                filter
                    .write_filtered(container, out)
                    .map_err(FragmentError::from)
            })?;
        }
        let decision = thresholds.decide(qhisto, nhisto);
        append_summary_bank(&mut out, &decision, settings.rebin_factor);

        sink.publish(&out.finish())?;
        *serial = serial.wrapping_add(1);
        *events_built += 1;
        Ok(true)
    }

    /// One serial-number-mode cycle: all enabled fragments contribute,
    /// serials are compared against the first one, banks are copied
    /// unfiltered.
    pub fn assemble_next_serial(&mut self) -> FragmentResult<bool> {
        let Self {
            consumers,
            sink,
            serial,
            events_built,
            ..
        } = self;

        for consumer in consumers.iter() {
            if consumer.events_in_ring() == 0 {
                return Ok(false);
            }
        }

        let mut reference: Option<u32> = None;
        for consumer in consumers.iter_mut() {
            let sn = consumer.serial_number()?;
            match reference {
                None => reference = Some(sn),
                Some(expect) if expect != sn => {
                    log::error!(
                        "[Assembler] serial number mismatch on fragment {}: {} vs reference {}",
                        consumer.shared().name,
                        sn,
                        expect
                    );
                }
                Some(_) => {}
            }
        }

        let mut out = EventWriter::new(EventHeader {
            event_id: 1,
            trigger_mask: 0,
            serial_number: *serial,
            time_stamp: unix_time(),
            data_size: 0,
        });
        for consumer in consumers.iter_mut() {
            consumer.append_banks(&mut out, copy_all_banks)?;
        }
        sink.publish(&out.finish())?;
        *serial = serial.wrapping_add(1);
        *events_built += 1;
        Ok(true)
    }
}
