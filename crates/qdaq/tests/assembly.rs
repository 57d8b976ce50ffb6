// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! End-to-end assembly: two fragments through real ingest workers and
//! the collector thread, memory pipes on both ends.

use qdaq::config::SettingsStore;
use qdaq::engine::{EventBuilder, LogStatusSink, TransitionStatus};
use qdaq::protocol::bank::{locate, EventWriter};
use qdaq::protocol::event::{EventHeader, EVENT_HEADER_SIZE};
use qdaq::protocol::zle::{ZleChannel, ZleEvent, ZleRun};
use qdaq::protocol::{Words, KIND_DWORD};
use qdaq::transport::upstream::{memory_pipe, memory_sink, MemoryFeeder, MemorySource};
use qdaq::transport::EventSource;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const MASTER_MASK: u16 = 0x1;
const WAVEFORM_MASK: u16 = 0x2;

fn settings_store() -> SettingsStore {
    let store = SettingsStore::new();
    store.set("QT summary rebin factor", "4");
    store.set("Energy thresh low", "50");
    store.set("Energy thresh med", "1000");
    store.set("Energy thresh high", "10000");
    store.set("Fprompt thresh low", "128");
    store.set("Fprompt thresh med", "154");
    store.set("Window start offset", "16");
    store.set("Narrow window width", "48");
    store.set("Wide window width", "80");
    store.set("Max N_QT to use Q histo", "1");
    store.set("Assembly mode", "2");
    store.set("Modulo", "0");
    store.set("DTM2FETriggerMaskMap", "-1 32 30 4 -1 -1 -1 -1");
    store.set("Enable V1720 Filtering", "y");
    store.set("Enable V1740 Filtering", "y");
    store.set("V1720 SPE Confidence Threshold", "100");
    store.set("V1720 Threshold To Save V1740", "3000");
    store.set("strictTimestampMatching", "n");
    let map: Vec<String> = (0..256).map(|i| i.to_string()).collect();
    store.set("V17202V1740", &map.join(" "));

    for (name, mask, enable) in [("dtm", MASTER_MASK, true), ("wfm0", WAVEFORM_MASK, true)] {
        let prefix = format!("Fragment/{}/", name);
        store.set(&format!("{}Buffer Name", prefix), &format!("BUF_{}", name));
        store.set(&format!("{}Event ID", prefix), "1");
        store.set(&format!("{}Trigger Mask", prefix), &format!("{}", mask));
        store.set(&format!("{}Enable", prefix), if enable { "y" } else { "n" });
    }
    store
}

fn master_event(serial: u32, mask_used: u8, ts_16ns: u32) -> Vec<u8> {
    let mut w = EventWriter::new(EventHeader {
        event_id: 1,
        trigger_mask: MASTER_MASK,
        serial_number: serial,
        time_stamp: 0,
        data_size: 0,
    });
    w.begin_bank(*b"DTRG", KIND_DWORD);
    w.push_words(&[ts_16ns, 0, 0, u32::from(mask_used) << 16]);
    w.end_bank();
    w.finish()
}

/// Waveform-fragment event: QT pulses, an SPE-flagged SQ record for
/// (channel 0, offset 0) and a ZL bank whose first good block that
/// record points at.
fn waveform_event(serial: u32, ts_8ns: u32) -> Vec<u8> {
    let mut w = EventWriter::new(EventHeader {
        event_id: 1,
        trigger_mask: WAVEFORM_MASK,
        serial_number: serial,
        time_stamp: 0,
        data_size: 0,
    });

    w.begin_bank(*b"ZL00", KIND_DWORD);
    let mut zle_words = ZleEvent {
        size_flags: 0,
        mask_flags: 0,
        extra: [0, 0],
        channels: vec![ZleChannel {
            channel: 0,
            runs: vec![ZleRun::Good(vec![0x0AAA_0BBB, 0x0CCC_0DDD]), ZleRun::Skip(6)],
        }],
    }
    .encode();
    zle_words[3] = ts_8ns;
    w.push_words(&zle_words);
    w.end_bank();

    w.begin_bank(*b"QT00", KIND_DWORD);
    w.push_word(0);
    w.push_word(ts_8ns);
    w.push_word(2 * 4);
    for &(bin, integral) in &[(4u32, 100u32), (16, 1)] {
        w.push_word(0);
        w.push_word(0);
        w.push_word(integral);
        w.push_word(bin << 16);
    }
    w.end_bank();

    w.begin_bank(*b"SQ00", KIND_DWORD);
    w.push_words(&[0, 0, 5]);
    // channel 0 (bits 28..31), peak 50 (bits 8..19).
    w.push_word(50 << 8);
    w.push_word(0);
    w.push_word(0); // offset 0 in bits 16..31
    w.push_word(150); // SPE confidence
    w.push_word(0);
    w.end_bank();

    w.finish()
}

struct Pipes {
    feeders: HashMap<String, MemoryFeeder>,
    sources: HashMap<String, MemorySource>,
}

fn pipes() -> Pipes {
    let mut feeders = HashMap::new();
    let mut sources = HashMap::new();
    for name in ["BUF_dtm", "BUF_wfm0"] {
        let (feeder, source) = memory_pipe(64);
        feeders.insert(name.to_string(), feeder);
        sources.insert(name.to_string(), source);
    }
    Pipes { feeders, sources }
}

#[test]
fn test_pipeline_assembles_and_filters_events() {
    let store = settings_store();
    let mut pipes = pipes();
    let (sink, outlet) = memory_sink(256);

    let builder =
        EventBuilder::new(Arc::new(LogStatusSink)).with_ring_sizing(1 << 22, 256 * 1024);
    let status = builder.begin_of_run(
        &store,
        |config| {
            let source = pipes
                .sources
                .remove(&config.buffer)
                .expect("one source per declared buffer");
            Ok(Box::new(source) as Box<dyn EventSource>)
        },
        Box::new(sink),
    );
    assert_eq!(status, TransitionStatus::Success);

    const N_EVENTS: u32 = 50;
    for i in 0..N_EVENTS {
        let ts_16ns = 1_000 + 40 * i;
        pipes.feeders["BUF_dtm"]
            .push(master_event(i, 0x4, ts_16ns))
            .expect("push master");
        pipes.feeders["BUF_wfm0"]
            .push(waveform_event(i, 2 * ts_16ns))
            .expect("push waveform");
    }

    for i in 0..N_EVENTS {
        let event = outlet
            .take(Duration::from_secs(10))
            .unwrap_or_else(|e| panic!("missing output event {}: {}", i, e));
        let header = EventHeader::parse(&event).expect("header");
        assert_eq!(header.serial_number, i);
        assert_eq!(header.total_size(), event.len());

        let container = &event[EVENT_HEADER_SIZE..];
        assert!(locate(container, b"DTRG").is_some(), "master bank copied");
        assert!(locate(container, b"QT00").is_some(), "QT kept by policy");
        assert!(locate(container, b"SQ00").is_some(), "SQ records kept");

        // The SPE-flagged good block became a skip of the same sample
        // count; the trailing skip run is untouched.
        let zl = locate(container, b"ZL00").expect("rewritten ZLE");
        let zle = ZleEvent::decode(zl.payload).expect("valid ZLE");
        assert_eq!(
            zle.channels[0].runs,
            vec![ZleRun::Skip(2), ZleRun::Skip(6)]
        );

        let ebsm = locate(container, b"EBSM").expect("summary bank");
        let words = Words::new(ebsm.payload);
        let word0 = words.require(0).expect("word0");
        assert_eq!(word0 & 0x3, 0x3, "saveZLE and saveQT");
        assert_eq!((word0 >> 2) & 0xF, 3, "low energy, high prompt fraction");
        assert_eq!(word0 >> 28, 0x1, "version nibble");
        assert_eq!(words.require(1).expect("narrow"), 100);
        assert_eq!(words.require(3).expect("total"), 101);
    }

    assert_eq!(builder.end_of_run(), TransitionStatus::Success);
    assert!(!builder.stop_requested());
}

#[test]
fn test_begin_of_run_refuses_disabled_master() {
    let store = settings_store();
    store.set("Fragment/dtm/Enable", "n");
    // The waveform fragment is mapped by the trigger-master table, so
    // unmap it to isolate the master check.
    store.set("DTM2FETriggerMaskMap", "-1 -1 -1 -1 -1 -1 -1 -1");

    let mut pipes = pipes();
    let (sink, _outlet) = memory_sink(4);
    let builder = EventBuilder::new(Arc::new(LogStatusSink)).with_ring_sizing(1 << 20, 64 * 1024);
    let status = builder.begin_of_run(
        &store,
        |config| {
            let source = pipes.sources.remove(&config.buffer).expect("source");
            Ok(Box::new(source) as Box<dyn EventSource>)
        },
        Box::new(sink),
    );
    assert_eq!(status, TransitionStatus::Conflict);
    // End of run on a never-started run is still clean.
    assert_eq!(builder.end_of_run(), TransitionStatus::Success);
}

#[test]
fn test_missing_setting_aborts_transition() {
    let store = settings_store();
    store.set("QT summary rebin factor", "not a number");
    let mut pipes = pipes();
    let (sink, _outlet) = memory_sink(4);
    let builder = EventBuilder::new(Arc::new(LogStatusSink));
    let status = builder.begin_of_run(
        &store,
        |config| {
            let source = pipes.sources.remove(&config.buffer).expect("source");
            Ok(Box::new(source) as Box<dyn EventSource>)
        },
        Box::new(sink),
    );
    assert_eq!(status, TransitionStatus::Abort);
}
