// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Dedicated ingest thread per fragment.
//!
//! The loop is deliberately dumb: check the run flag, respect the ring
//! back-pressure guard, try to ingest one event, sleep briefly when
//! upstream is quiet. Everything stateful lives in the
//! [`FragmentProducer`].

use super::{FragmentError, FragmentProducer};
use crate::transport::upstream::EventSource;
use crate::transport::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Suspend ingest while the ring is at or above this occupancy. Better
/// to let the upstream buffers fill than the assembly ring.
const BACKPRESSURE_PERCENT: usize = 75;

/// Idle sleep when upstream has nothing or the ring is full.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Spawn the ingest worker for one fragment. The thread exits cleanly
/// when `run_flag` goes false, after finishing any in-progress ingest.
pub fn spawn(
    mut producer: FragmentProducer,
    mut source: Box<dyn EventSource>,
    run_flag: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let name = format!("ingest-{}", producer.shared().name);
    std::thread::Builder::new().name(name).spawn(move || {
        let fragment = producer.shared().clone();
        log::info!(
            "[Worker] started ingest thread for {} (id {})",
            fragment.name,
            fragment.id
        );
        let mut reported_error = false;
        while run_flag.load(Ordering::Acquire) {
            if producer.fill_percent() >= BACKPRESSURE_PERCENT {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            match producer.read_one(&mut *source) {
                Ok(true) => {
                    reported_error = false;
                }
                Ok(false) => std::thread::sleep(IDLE_SLEEP),
                Err(FragmentError::Transport(TransportError::WouldBlock)) => {
                    // Raced the back-pressure check; just retry.
                    std::thread::sleep(IDLE_SLEEP);
                }
                Err(e) => {
                    if !reported_error {
                        log::error!(
                            "[Worker] ingest error on fragment {}: {}",
                            fragment.name,
                            e
                        );
                        reported_error = true;
                    }
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
        }
        log::info!("[Worker] ingest thread for {} exiting", fragment.name);
    })
}
