// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Run lifecycle: begin-of-run latching and thread orchestration.
//!
//! At begin of run the builder latches one settings snapshot, reads
//! and sorts the fragment declarations, creates one ring per enabled
//! fragment, spawns one ingest worker each plus the collector thread,
//! and reports "Started run". End of run clears the run flag, joins
//! every thread, drains residual ring counters and reports
//! "Ended run". Settings are never re-read mid-run.
//!
//! Thread count is fixed for the run's duration; the run-state flag is
//! the only cancellation mechanism, polled at every loop top.

use crate::config::{
    fragment_configs, AssemblyMode, ConfigError, EbSettings, FragmentConfig, SettingsStore,
};
use crate::engine::assembler::Assembler;
use crate::fragment::{open_channel, worker, FragmentShared, MASTER_TRIGGER_MASK};
use crate::transport::upstream::{EventSink, EventSource};
use crate::transport::TransportResult;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Default per-fragment ring sizing, in bytes.
pub const DEFAULT_MAX_EVENT_SIZE: usize = 3_600_000;
pub const DEFAULT_RING_CAPACITY: usize = 25 * DEFAULT_MAX_EVENT_SIZE + 10_000;

/// Result of a state transition, reported to the operator surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStatus {
    Success,
    /// A fragment or buffer conflict: the transition is refused.
    Conflict,
    /// Resource setup failed mid-transition; everything was torn down.
    Abort,
}

/// Operator status surface. Status strings are published verbatim.
pub trait StatusSink: Send + Sync {
    fn set_status(&self, status: &str);
}

/// Default status sink: the log stream.
#[derive(Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn set_status(&self, status: &str) {
        log::info!("[Status] {}", status);
    }
}

/// Process-wide run state shared by every worker and the collector.
#[derive(Debug, Default)]
pub struct RunState {
    /// Shared as a plain flag with the ingest workers.
    running: Arc<AtomicBool>,
    stop_requested: AtomicBool,
    timestamp_warning: AtomicBool,
}

impl RunState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// The raw flag handed to ingest workers.
    #[must_use]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Flag an automatic run stop. Returns true for the first caller
    /// only, so the stop is reported exactly once.
    pub fn request_stop(&self) -> bool {
        !self.stop_requested.swap(true, Ordering::AcqRel)
    }

    #[inline]
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn note_timestamp_warning(&self) {
        self.timestamp_warning.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn had_timestamp_warning(&self) -> bool {
        self.timestamp_warning.load(Ordering::Acquire)
    }

    fn reset_for_run(&self) {
        self.stop_requested.store(false, Ordering::Release);
        self.timestamp_warning.store(false, Ordering::Release);
    }
}

struct ActiveRun {
    workers: Vec<JoinHandle<()>>,
    collector: JoinHandle<()>,
    fragments: Vec<Arc<FragmentShared>>,
}

/// The event builder: fragment arena, run state and thread lifecycle.
pub struct EventBuilder {
    status: Arc<dyn StatusSink>,
    run_state: Arc<RunState>,
    /// Snapshot latched at begin-of-run, swapped atomically.
    settings: ArcSwapOption<EbSettings>,
    active: Mutex<Option<ActiveRun>>,
    ring_capacity: usize,
    max_event_size: usize,
}

impl EventBuilder {
    #[must_use]
    pub fn new(status: Arc<dyn StatusSink>) -> Self {
        status.set_status("Initializing...");
        let builder = EventBuilder {
            status,
            run_state: Arc::new(RunState::new()),
            settings: ArcSwapOption::from(None),
            active: Mutex::new(None),
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_event_size: DEFAULT_MAX_EVENT_SIZE,
        };
        builder.status.set_status("Initialized");
        builder
    }

    /// Override the per-fragment ring sizing (tests, small setups).
    #[must_use]
    pub fn with_ring_sizing(mut self, ring_capacity: usize, max_event_size: usize) -> Self {
        self.ring_capacity = ring_capacity;
        self.max_event_size = max_event_size;
        self
    }

    #[must_use]
    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    /// Settings snapshot of the current (or last) run.
    #[must_use]
    pub fn settings(&self) -> Option<Arc<EbSettings>> {
        self.settings.load_full()
    }

    /// True when the collector flagged an automatic stop; the caller
    /// should bring the run down with [`EventBuilder::end_of_run`].
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.run_state.stop_requested()
    }

    /// Begin-of-run transition.
    ///
    /// `connect` opens the upstream source for each enabled fragment;
    /// `sink` receives the assembled events. Returns
    /// [`TransitionStatus::Success`] with all threads running, or
    /// tears everything down again.
    pub fn begin_of_run<C>(
        &self,
        store: &SettingsStore,
        mut connect: C,
        sink: Box<dyn EventSink>,
    ) -> TransitionStatus
    where
        C: FnMut(&FragmentConfig) -> TransportResult<Box<dyn EventSource>>,
    {
        let mut active = self.active.lock();
        if active.is_some() {
            log::error!("[Run] begin_of_run while a run is active");
            return TransitionStatus::Conflict;
        }
        self.status.set_status("Starting run...");

        let settings = match EbSettings::latch(store) {
            Ok(settings) => Arc::new(settings),
            Err(e) => return self.fail_transition(e, TransitionStatus::Abort),
        };
        let mut configs = match fragment_configs(store) {
            Ok(configs) => configs,
            Err(e) => return self.fail_transition(e, TransitionStatus::Abort),
        };
        // The fragment order is fixed here for the whole run: ascending
        // trigger mask, the trigger master first.
        configs.sort_by_key(|c| c.trigger_mask);

        if let Err(status) = validate_configs(&configs, &settings) {
            self.status.set_status("Ended run");
            return status;
        }

        self.settings.store(Some(settings.clone()));
        self.run_state.reset_for_run();
        self.run_state.set_running(true);

        let enabled: Vec<&FragmentConfig> = configs.iter().filter(|c| c.enable).collect();
        for config in configs.iter().filter(|c| !c.enable) {
            log::info!("[Run] fragment {} disabled", config.name);
        }

        let mut workers = Vec::with_capacity(enabled.len());
        let mut consumers = Vec::with_capacity(enabled.len());
        let mut fragments = Vec::with_capacity(enabled.len());
        for (id, config) in enabled.iter().copied().enumerate() {
            let shared = Arc::new(FragmentShared::new(
                id,
                config.name.clone(),
                config.trigger_mask,
                settings.dtm_mask_for(config.trigger_mask),
            ));
            let source = match connect(config) {
                Ok(source) => source,
                Err(e) => {
                    log::error!(
                        "[Run] cannot open upstream buffer {} for fragment {}: {}",
                        config.buffer,
                        config.name,
                        e
                    );
                    self.teardown(workers, None, fragments);
                    return TransitionStatus::Conflict;
                }
            };
            let (producer, consumer) = match open_channel(
                shared.clone(),
                self.ring_capacity,
                self.max_event_size,
                settings.rebin_factor,
            ) {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("[Run] cannot create ring for fragment {}: {}", config.name, e);
                    self.teardown(workers, None, fragments);
                    return TransitionStatus::Conflict;
                }
            };
            match worker::spawn(producer, source, self.run_state.running_flag()) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    log::error!(
                        "[Run] cannot spawn ingest thread for fragment {}: {}",
                        config.name,
                        e
                    );
                    self.teardown(workers, None, fragments);
                    return TransitionStatus::Abort;
                }
            }
            consumers.push(consumer);
            fragments.push(shared);
        }

        let mut assembler = Assembler::new(
            consumers,
            settings,
            self.run_state.clone(),
            sink,
        );
        let collector = match std::thread::Builder::new()
            .name("collector".into())
            .spawn(move || assembler.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("[Run] cannot spawn collector thread: {}", e);
                self.teardown(workers, None, fragments);
                return TransitionStatus::Abort;
            }
        };

        *active = Some(ActiveRun {
            workers,
            collector,
            fragments,
        });
        self.status.set_status("Started run");
        TransitionStatus::Success
    }

    /// End-of-run transition: stop, join, drain, report.
    pub fn end_of_run(&self) -> TransitionStatus {
        self.status.set_status("Ending run...");
        let taken = self.active.lock().take();
        if let Some(run) = taken {
            self.teardown(run.workers, Some(run.collector), run.fragments);
        }

        if self.run_state.stop_requested() {
            log::error!(
                "[Run] this run was stopped automatically because of timestamp \
                 mismatches in the event builder"
            );
        } else if self.run_state.had_timestamp_warning() {
            log::error!("[Run] this run had timestamp mismatches in the event builder");
        }

        self.status.set_status("Ended run");
        TransitionStatus::Success
    }

    /// Join threads and zero counters, used by both the failure path of
    /// begin-of-run and the regular end-of-run.
    fn teardown(
        &self,
        workers: Vec<JoinHandle<()>>,
        collector: Option<JoinHandle<()>>,
        fragments: Vec<Arc<FragmentShared>>,
    ) {
        self.run_state.set_running(false);
        if let Some(handle) = collector {
            if handle.join().is_err() {
                log::error!("[Run] collector thread panicked");
            }
        }
        for handle in workers {
            if handle.join().is_err() {
                log::error!("[Run] ingest thread panicked");
            }
        }
        for fragment in fragments {
            let residue = fragment.drain_events();
            if residue > 0 {
                log::warn!(
                    "[Run] fragment {} (id {}) had {} events left in its ring",
                    fragment.name,
                    fragment.id,
                    residue
                );
            }
        }
    }

    fn fail_transition(&self, error: ConfigError, status: TransitionStatus) -> TransitionStatus {
        log::error!("[Run] begin_of_run aborted: {}", error);
        self.status.set_status("Ended run");
        status
    }
}

/// Begin-of-run sanity checks that must refuse the transition.
fn validate_configs(
    configs: &[FragmentConfig],
    settings: &EbSettings,
) -> Result<(), TransitionStatus> {
    if configs.is_empty() {
        log::error!("[Run] no fragments declared");
        return Err(TransitionStatus::Conflict);
    }
    for config in configs {
        if config.buffer.is_empty() {
            log::error!("[Run] fragment {} has no upstream buffer name", config.name);
            return Err(TransitionStatus::Conflict);
        }
    }
    if settings.assembly_mode == AssemblyMode::Timestamp {
        let master = &configs[0];
        if master.trigger_mask != MASTER_TRIGGER_MASK || !master.enable {
            log::error!(
                "[Run] trigger master missing or disabled (first fragment {} has mask {:#x})",
                master.name,
                master.trigger_mask
            );
            return Err(TransitionStatus::Conflict);
        }
        for config in configs.iter().filter(|c| !c.enable) {
            if settings.dtm_mask_for(config.trigger_mask) >= 0 {
                log::error!(
                    "[Run] fragment {} is disabled but mapped to a trigger-master output; \
                     enable it or unmap it",
                    config.name
                );
                return Err(TransitionStatus::Conflict);
            }
        }
    }
    Ok(())
}
