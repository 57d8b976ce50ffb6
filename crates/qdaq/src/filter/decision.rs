// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Energy / prompt-fraction classification of an assembled event.
//!
//! The peak time is found on the non-charge-weighted histogram (large
//! afterpulses fool a charge-weighted argmax); below `nq_thresh`
//! pulses per bin the charge histogram is used instead. Narrow and
//! wide windows are integrated from just before the peak, and the
//! prompt fraction is kept as the integer comparison
//! `256 * narrow` vs `threshold * wide`.

use crate::config::EbSettings;
use crate::protocol::bank::EventWriter;
use crate::protocol::KIND_DWORD;

/// EBSM bank version nibble.
const BANK_VERSION: u32 = 0x1;

/// The seven (energy, prompt-fraction) classification cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyBox {
    NotSet = 0,
    VeryLowE = 1,
    LowELowFp = 2,
    LowEHighFp = 3,
    MedELowFp = 4,
    MedEHighFp = 5,
    HighE = 6,
}

impl EnergyBox {
    #[inline]
    #[must_use]
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Classification thresholds, latched from settings at begin-of-run.
/// Window fields are in summary-histogram bins.
#[derive(Debug, Clone)]
pub struct FilterThresholds {
    pub low_e: u32,
    pub med_e: u32,
    pub high_e: u32,
    pub fprompt_low_e: u32,
    pub fprompt_med_e: u32,
    pub start_offset: u32,
    pub narrow_window: u32,
    pub wide_window: u32,
    pub nq_thresh: u32,
    pub rebin_factor: u32,
}

impl FilterThresholds {
    #[must_use]
    pub fn from_settings(settings: &EbSettings) -> Self {
        FilterThresholds {
            low_e: settings.low_e,
            med_e: settings.med_e,
            high_e: settings.high_e,
            fprompt_low_e: settings.fprompt_low_e,
            fprompt_med_e: settings.fprompt_med_e,
            start_offset: settings.start_offset_bins,
            narrow_window: settings.narrow_window_bins,
            wide_window: settings.wide_window_bins,
            nq_thresh: settings.nq_thresh,
            rebin_factor: settings.rebin_factor,
        }
    }

    /// Classify one event from its aggregated histograms.
    #[must_use]
    pub fn decide(&self, qhisto: &[u32], nhisto: &[u32]) -> Decision {
        let mut decision = Decision {
            energy_box: EnergyBox::NotSet,
            peak_bin: 0,
            narrow: 0,
            wide: 0,
            total: 0,
            // Classification is observational for now: both bank
            // families are always kept.
            save_zle: true,
            save_qt: true,
        };
        if qhisto.is_empty() || nhisto.is_empty() {
            return decision;
        }

        let mut peak_bin = argmax(nhisto);
        if nhisto[peak_bin] <= self.nq_thresh {
            // Low statistics: afterpulse bias is no longer the concern,
            // the charge histogram finds the peak better.
            peak_bin = argmax(qhisto);
        }

        let start = peak_bin.saturating_sub(self.start_offset as usize);
        // A window ending exactly on the histogram edge still covers
        // the last bin; only an overshoot is pulled back.
        let mut end_narrow = start + self.narrow_window as usize;
        if end_narrow > qhisto.len() {
            end_narrow = qhisto.len() - 1;
        }
        let mut end_wide = start + self.wide_window as usize;
        if end_wide > qhisto.len() {
            end_wide = qhisto.len() - 1;
        }

        let mut narrow = 0u32;
        let mut wide = 0u32;
        let mut total = 0u32;
        for (i, &q) in qhisto.iter().enumerate() {
            if i >= start && i < end_wide {
                wide = wide.saturating_add(q);
            }
            if i >= start && i < end_narrow {
                narrow = narrow.saturating_add(q);
            }
            total = total.saturating_add(q);
        }

        let narrow_scaled = u64::from(narrow) * 256;
        decision.energy_box = if narrow < self.low_e {
            EnergyBox::VeryLowE
        } else if narrow < self.med_e {
            if narrow_scaled > u64::from(self.fprompt_low_e) * u64::from(wide) {
                EnergyBox::LowEHighFp
            } else {
                EnergyBox::LowELowFp
            }
        } else if narrow < self.high_e {
            if narrow_scaled > u64::from(self.fprompt_med_e) * u64::from(wide) {
                EnergyBox::MedEHighFp
            } else {
                EnergyBox::MedELowFp
            }
        } else {
            EnergyBox::HighE
        };

        decision.peak_bin = peak_bin;
        decision.narrow = narrow;
        decision.wide = wide;
        decision.total = total;
        decision
    }
}

fn argmax(histo: &[u32]) -> usize {
    let mut best = 0usize;
    let mut peak = 0u32;
    for (i, &v) in histo.iter().enumerate() {
        if v > peak {
            best = i;
            peak = v;
        }
    }
    best
}

/// Outcome of the filter decision for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub energy_box: EnergyBox,
    pub peak_bin: usize,
    pub narrow: u32,
    pub wide: u32,
    pub total: u32,
    pub save_zle: bool,
    pub save_qt: bool,
}

/// Append the "EBSM" summary bank.
///
/// Word 0 bit layout: `VVVV00TTTTTTTTTTTTTTTTTTTTBBBBQZ` with V the
/// version nibble, T the peak time in 4-ns bins, B the box id, Q/Z the
/// save flags. Words 1..3 are the narrow, wide and total integrals.
pub fn append_summary_bank(out: &mut EventWriter, decision: &Decision, rebin_factor: u32) {
    out.begin_bank(*b"EBSM", KIND_DWORD);
    let mut word = 0u32;
    if decision.save_zle {
        word |= 0x1;
    }
    if decision.save_qt {
        word |= 0x2;
    }
    word |= u32::from(decision.energy_box.id() & 0xF) << 2;
    let time_4ns = decision.peak_bin as u32 * rebin_factor;
    word |= (time_4ns & 0xF_FFFF) << 6;
    word |= BANK_VERSION << 28;
    out.push_word(word);
    out.push_word(decision.narrow);
    out.push_word(decision.wide);
    out.push_word(decision.total);
    out.end_bank();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::bank::locate;
    use crate::protocol::event::{EventHeader, EVENT_HEADER_SIZE};

    fn thresholds() -> FilterThresholds {
        FilterThresholds {
            low_e: 50,
            med_e: 1000,
            high_e: 10000,
            fprompt_low_e: 128,
            fprompt_med_e: 154,
            start_offset: 1,
            narrow_window: 3,
            wide_window: 5,
            nq_thresh: 1,
            rebin_factor: 4,
        }
    }

    #[test]
    fn test_peak_by_pulse_count() {
        let q = [0, 0, 10, 200, 10, 0];
        let n = [0, 0, 1, 3, 1, 0];
        let decision = thresholds().decide(&q, &n);
        assert_eq!(decision.peak_bin, 3);
        assert_eq!(decision.narrow, 220);
        assert_eq!(decision.wide, 220);
        assert_eq!(decision.total, 220);
        // 256 * 220 > 128 * 220: high prompt fraction at low energy.
        assert_eq!(decision.energy_box, EnergyBox::LowEHighFp);
        assert!(decision.save_zle && decision.save_qt);
    }

    #[test]
    fn test_peak_by_charge_fallback() {
        let mut t = thresholds();
        t.nq_thresh = 5;
        let q = [100, 0, 0];
        let n = [0, 1, 0];
        let decision = t.decide(&q, &n);
        // max(N) = 1 <= 5: fall back to the charge histogram.
        assert_eq!(decision.peak_bin, 0);
    }

    #[test]
    fn test_box_ladder_is_total_order() {
        let t = thresholds();
        // narrow below low_e.
        let d = t.decide(&[10, 0, 0, 0, 0, 0], &[1, 0, 0, 0, 0, 0]);
        assert_eq!(d.energy_box, EnergyBox::VeryLowE);

        // Low energy, low prompt fraction: charge spread far past the
        // narrow window. peak = 0, start = 0, narrow sums bins 0..3,
        // wide sums 0..5.
        let d = t.decide(&[60, 0, 0, 200, 200, 0], &[5, 0, 0, 5, 5, 0]);
        assert_eq!(d.narrow, 60);
        assert_eq!(d.wide, 460);
        // 256*60 = 15360 < 128*460 = 58880.
        assert_eq!(d.energy_box, EnergyBox::LowELowFp);

        // Medium energy, high prompt fraction.
        let d = t.decide(&[5000, 0, 0, 0, 0, 0], &[9, 0, 0, 0, 0, 0]);
        assert_eq!(d.energy_box, EnergyBox::MedEHighFp);

        // High energy.
        let d = t.decide(&[20000, 0, 0, 0, 0, 0], &[9, 0, 0, 0, 0, 0]);
        assert_eq!(d.energy_box, EnergyBox::HighE);
    }

    #[test]
    fn test_window_ending_on_edge_keeps_last_bin() {
        let t = thresholds();
        let q = [0, 10, 20, 30];
        let n = [0, 1, 2, 1];
        let d = t.decide(&q, &n);
        assert_eq!(d.peak_bin, 2);
        // start = 1; the narrow window ends exactly at the histogram
        // edge (1 + 3 = 4) and must still cover bin 3. The wide window
        // overshoots (1 + 5 = 6) and is pulled back to bin 3 exclusive.
        assert_eq!(d.narrow, 60);
        assert_eq!(d.wide, 30);
        assert_eq!(d.total, 60);
    }

    #[test]
    fn test_identical_inputs_identical_boxes() {
        let t = thresholds();
        let q = [0, 30, 400, 90, 3, 0];
        let n = [0, 2, 6, 3, 1, 0];
        assert_eq!(t.decide(&q, &n), t.decide(&q, &n));
    }

    #[test]
    fn test_empty_histogram_is_not_set() {
        let d = thresholds().decide(&[], &[]);
        assert_eq!(d.energy_box, EnergyBox::NotSet);
        assert_eq!(d.total, 0);
        assert!(d.save_zle && d.save_qt);
    }

    #[test]
    fn test_summary_bank_packing() {
        let decision = Decision {
            energy_box: EnergyBox::MedELowFp,
            peak_bin: 10,
            narrow: 111,
            wide: 222,
            total: 333,
            save_zle: true,
            save_qt: true,
        };
        let mut out = EventWriter::new(EventHeader {
            event_id: 1,
            trigger_mask: 0,
            serial_number: 0,
            time_stamp: 0,
            data_size: 0,
        });
        append_summary_bank(&mut out, &decision, 4);
        let event = out.finish();
        let bank = locate(&event[EVENT_HEADER_SIZE..], b"EBSM").expect("EBSM");
        let words: Vec<u32> = bank
            .payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words.len(), 4);
        let word = words[0];
        assert_eq!(word & 0x1, 1); // saveZLE
        assert_eq!((word >> 1) & 0x1, 1); // saveQT
        assert_eq!((word >> 2) & 0xF, 4); // box id
        assert_eq!((word >> 6) & 0xF_FFFF, 40); // peak time: bin 10 x rebin 4
        assert_eq!(word >> 28, 0x1); // version nibble
        assert_eq!(&words[1..], &[111, 222, 333]);
    }
}
