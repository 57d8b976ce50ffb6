// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 qdaq developers

//! Flat settings namespace and the latched begin-of-run snapshot.
//!
//! The control database is outside this crate; it is mirrored here as
//! a flat string key/value store. At begin-of-run the builder latches
//! one typed [`EbSettings`] snapshot from the store; nothing is
//! re-read until the next run start.
//!
//! Window widths and offsets arrive in nanoseconds and are converted
//! to summary-histogram bins (4 ns x rebin factor) during latching.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Number of channels covered by the waveform-to-slow-digitiser map.
pub const PMT_MAP_LEN: usize = 256;

/// Flat key/value settings store.
///
/// Keys and values are interned as `Arc<str>`; reads are lock-free.
#[derive(Default)]
pub struct SettingsStore {
    map: DashMap<Arc<str>, Arc<str>>,
}

impl SettingsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(Arc::from(key), Arc::from(value));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// All entries whose key starts with `prefix`.
    #[must_use]
    pub fn search_prefix(&self, prefix: &str) -> Vec<(Arc<str>, Arc<str>)> {
        let mut hits: Vec<_> = self
            .map
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        hits
    }
}

/// Configuration failure at begin-of-run. Always fatal for the
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing { key: String },
    Invalid { key: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing { key } => write!(f, "setting \"{}\" not found", key),
            ConfigError::Invalid { key, reason } => {
                write!(f, "setting \"{}\" invalid: {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn get_raw(store: &SettingsStore, key: &str) -> Result<Arc<str>, ConfigError> {
    store.get(key).ok_or_else(|| ConfigError::Missing {
        key: key.to_owned(),
    })
}

fn parse_u32(store: &SettingsStore, key: &str) -> Result<u32, ConfigError> {
    let raw = get_raw(store, key)?;
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_owned(),
        reason: format!("not an integer: \"{}\"", raw),
    })
}

fn parse_u16(store: &SettingsStore, key: &str) -> Result<u16, ConfigError> {
    let raw = get_raw(store, key)?;
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| ConfigError::Invalid {
        key: key.to_owned(),
        reason: format!("not a 16-bit integer: \"{}\"", raw),
    })
}

fn parse_bool(store: &SettingsStore, key: &str) -> Result<bool, ConfigError> {
    let raw = get_raw(store, key)?;
    match raw.trim() {
        "y" | "yes" | "true" | "1" => Ok(true),
        "n" | "no" | "false" | "0" => Ok(false),
        other => Err(ConfigError::Invalid {
            key: key.to_owned(),
            reason: format!("not a boolean: \"{}\"", other),
        }),
    }
}

fn parse_bool_or(store: &SettingsStore, key: &str, default: bool) -> Result<bool, ConfigError> {
    match store.get(key) {
        Some(_) => parse_bool(store, key),
        None => Ok(default),
    }
}

fn parse_i32_list(store: &SettingsStore, key: &str, expect: usize) -> Result<Vec<i32>, ConfigError> {
    let raw = get_raw(store, key)?;
    let values: Result<Vec<i32>, _> = raw
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().parse())
        .collect();
    let values = values.map_err(|_| ConfigError::Invalid {
        key: key.to_owned(),
        reason: "not an integer list".to_owned(),
    })?;
    if values.len() != expect {
        return Err(ConfigError::Invalid {
            key: key.to_owned(),
            reason: format!("expected {} entries, found {}", expect, values.len()),
        });
    }
    Ok(values)
}

/// How the collector matches fragments into one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyMode {
    /// Compare event serial numbers across all enabled fragments.
    SerialNumber,
    /// Trigger-master mask + timestamp verification.
    Timestamp,
}

/// One upstream fragment as declared in settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentConfig {
    pub name: String,
    pub buffer: String,
    pub event_id: u16,
    pub trigger_mask: u16,
    pub enable: bool,
}

/// Typed settings snapshot, latched once at begin-of-run.
#[derive(Debug, Clone)]
pub struct EbSettings {
    /// 4-ns bins combined into one summary histogram bin.
    pub rebin_factor: u32,
    pub low_e: u32,
    pub med_e: u32,
    pub high_e: u32,
    /// Prompt-fraction thresholds in 1/256 units.
    pub fprompt_low_e: u32,
    pub fprompt_med_e: u32,
    /// Window geometry, already converted to bins.
    pub start_offset_bins: u32,
    pub narrow_window_bins: u32,
    pub wide_window_bins: u32,
    pub nq_thresh: u32,
    pub assembly_mode: AssemblyMode,
    /// Latched but unused by the present assembly logic.
    pub modulo: u32,
    /// Trigger-master bit i -> participant mask required when bit i is
    /// set; -1 marks an unconnected output.
    pub dtm_trigger_map: [i32; 8],
    pub enable_v1720_filtering: bool,
    pub enable_v1740_filtering: bool,
    pub spe_confidence_threshold: u32,
    pub save_v1740_threshold: u32,
    pub strict_timestamp_matching: bool,
    /// Waveform-module channel index -> slow-digitiser channel index.
    pub pmt_map: Box<[i32; PMT_MAP_LEN]>,
    // Filter debug knobs, defaulted as the filter has always shipped.
    pub debug_keep_zle_copy: bool,
    pub debug_keep_sq_copy: bool,
    pub debug_keep_w4_copy: bool,
    pub debug_keep_mn: bool,
    pub save_all_qt: bool,
    pub save_all_smart_qt: bool,
    pub save_smart_qt_even_if_saving_zle: bool,
}

impl EbSettings {
    /// Read and validate every setting the run needs. Any missing or
    /// unparsable key aborts the begin-of-run transition.
    pub fn latch(store: &SettingsStore) -> Result<Self, ConfigError> {
        let rebin_factor = parse_u32(store, "QT summary rebin factor")?;
        if rebin_factor == 0 {
            return Err(ConfigError::Invalid {
                key: "QT summary rebin factor".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let ns_per_bin = 4 * rebin_factor;

        let assembly_mode = match parse_u32(store, "Assembly mode")? {
            1 => AssemblyMode::SerialNumber,
            2 => AssemblyMode::Timestamp,
            other => {
                return Err(ConfigError::Invalid {
                    key: "Assembly mode".to_owned(),
                    reason: format!("unknown mode {}", other),
                })
            }
        };

        let map = parse_i32_list(store, "DTM2FETriggerMaskMap", 8)?;
        let mut dtm_trigger_map = [0i32; 8];
        dtm_trigger_map.copy_from_slice(&map);

        let pmt = parse_i32_list(store, "V17202V1740", PMT_MAP_LEN)?;
        let mut pmt_map = Box::new([0i32; PMT_MAP_LEN]);
        pmt_map.copy_from_slice(&pmt);

        Ok(EbSettings {
            rebin_factor,
            low_e: parse_u32(store, "Energy thresh low")?,
            med_e: parse_u32(store, "Energy thresh med")?,
            high_e: parse_u32(store, "Energy thresh high")?,
            fprompt_low_e: parse_u32(store, "Fprompt thresh low")?,
            fprompt_med_e: parse_u32(store, "Fprompt thresh med")?,
            start_offset_bins: parse_u32(store, "Window start offset")? / ns_per_bin,
            narrow_window_bins: parse_u32(store, "Narrow window width")? / ns_per_bin,
            wide_window_bins: parse_u32(store, "Wide window width")? / ns_per_bin,
            nq_thresh: parse_u32(store, "Max N_QT to use Q histo")?,
            assembly_mode,
            modulo: parse_u32(store, "Modulo")?,
            dtm_trigger_map,
            enable_v1720_filtering: parse_bool(store, "Enable V1720 Filtering")?,
            enable_v1740_filtering: parse_bool(store, "Enable V1740 Filtering")?,
            spe_confidence_threshold: parse_u32(store, "V1720 SPE Confidence Threshold")?,
            save_v1740_threshold: parse_u32(store, "V1720 Threshold To Save V1740")?,
            strict_timestamp_matching: parse_bool(store, "strictTimestampMatching")?,
            pmt_map,
            debug_keep_zle_copy: parse_bool_or(store, "Debug keep ZLE copy", false)?,
            debug_keep_sq_copy: parse_bool_or(store, "Debug keep SQ copy", false)?,
            debug_keep_w4_copy: parse_bool_or(store, "Debug keep W4 copy", false)?,
            debug_keep_mn: parse_bool_or(store, "Debug keep MN", false)?,
            save_all_qt: parse_bool_or(store, "Save all QT", true)?,
            save_all_smart_qt: parse_bool_or(store, "Save all smart QT", false)?,
            save_smart_qt_even_if_saving_zle: parse_bool_or(
                store,
                "Save smart QT even if saving ZLE",
                true,
            )?,
        })
    }

    /// Participant mask bit for a fragment's trigger mask, per the
    /// trigger-master map; -1 when no master output requests it.
    #[must_use]
    pub fn dtm_mask_for(&self, trigger_mask: u16) -> i32 {
        let mut id = -1;
        for (i, &fe_mask) in self.dtm_trigger_map.iter().enumerate() {
            if fe_mask >= 0 && (fe_mask as u32) & u32::from(trigger_mask) != 0 {
                id = 1 << i;
            }
        }
        id
    }
}

/// Read the per-fragment declarations under `Fragment/<name>/`.
pub fn fragment_configs(store: &SettingsStore) -> Result<Vec<FragmentConfig>, ConfigError> {
    let mut names: Vec<String> = store
        .search_prefix("Fragment/")
        .into_iter()
        .filter_map(|(key, _)| {
            let rest = key.strip_prefix("Fragment/")?;
            let (name, _) = rest.split_once('/')?;
            Some(name.to_owned())
        })
        .collect();
    names.sort();
    names.dedup();

    let mut configs = Vec::with_capacity(names.len());
    for name in names {
        let prefix = format!("Fragment/{}/", name);
        configs.push(FragmentConfig {
            buffer: get_raw(store, &format!("{}Buffer Name", prefix))?.to_string(),
            event_id: parse_u16(store, &format!("{}Event ID", prefix))?,
            trigger_mask: parse_u16(store, &format!("{}Trigger Mask", prefix))?,
            enable: parse_bool(store, &format!("{}Enable", prefix))?,
            name,
        });
    }
    Ok(configs)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A store holding a workable default for every mandatory key.
    #[must_use]
    pub fn populated_store() -> SettingsStore {
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
        let map: Vec<String> = (0..PMT_MAP_LEN).map(|i| i.to_string()).collect();
        store.set("V17202V1740", &map.join(" "));
        store
    }

    pub fn add_fragment(store: &SettingsStore, name: &str, mask: u16, enable: bool) {
        let prefix = format!("Fragment/{}/", name);
        store.set(&format!("{}Buffer Name", prefix), &format!("BUF_{}", name));
        store.set(&format!("{}Event ID", prefix), "1");
        store.set(&format!("{}Trigger Mask", prefix), &format!("0x{:x}", mask));
        store.set(
            &format!("{}Enable", prefix),
            if enable { "y" } else { "n" },
        );
    }
}
