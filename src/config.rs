/*!
 # Settings and channel-data persistence

 Flat JSON documents hold everything the controller persists: one settings
 object (device identity, channel count, default data file) and one
 channel-data array (label plus schedule window per channel).

 Loading settings never fails; a missing or corrupt file yields the
 documented defaults and is logged as a recoverable condition. Field-level
 oddities are normalized exactly once here — vendor/device id text becomes a
 [`UsbId`], an out-of-range channel count is clamped — so the rest of the
 system never re-derives them.
*/

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::schedule::ScheduleError;

/// Default number of relay channels when the settings omit one.
pub const DEFAULT_CHANNEL_COUNT: u8 = 8;

/// Largest channel count a single board supports.
pub const MAX_CHANNELS: u8 = 8;

/// Settings file name used when the caller does not provide one.
pub const DEFAULT_SETTINGS_FILE: &str = "settings.json";

/// Channel-data file name used when the settings leave it empty.
pub const DEFAULT_DATA_FILE: &str = "relay_data.json";

/// Save/load failures surfaced to the caller for user-visible reporting.
/// In-memory channel state is never affected by these.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Recoverable conditions found while applying persisted channel data.
///
/// These never abort a load; the offending schedule is disabled in place
/// and the condition is surfaced so the caller can report it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("channel {channel}: {source}")]
    InvalidSchedule {
        channel: u8,
        #[source]
        source: ScheduleError,
    },
}

/// A parsed vendor or device id.
///
/// Empty input is the distinct "unset" state and unparseable input the
/// distinct "invalid" state; neither is ever coerced to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbId {
    Unset,
    Invalid,
    Value(u16),
}

impl UsbId {
    /// Parses id text: empty → unset, `0x`/`0X` prefix → hexadecimal,
    /// otherwise decimal, anything else → invalid.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return UsbId::Unset;
        }
        let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => text.parse::<u16>(),
        };
        match parsed {
            Ok(value) => UsbId::Value(value),
            Err(_) => UsbId::Invalid,
        }
    }

    pub fn value(self) -> Option<u16> {
        match self {
            UsbId::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbId::Unset => write!(f, "unset"),
            UsbId::Invalid => write!(f, "invalid"),
            UsbId::Value(value) => write!(f, "{:#06x}", value),
        }
    }
}

/// Application settings as persisted on disk.
///
/// Unknown keys are ignored and missing keys take the documented defaults,
/// so hand-edited files stay loadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub vendor_id: String,
    pub device_id: String,
    #[serde(deserialize_with = "lenient_channel_count")]
    pub channel_count: u8,
    pub default_data_file: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            vendor_id: String::new(),
            device_id: String::new(),
            channel_count: DEFAULT_CHANNEL_COUNT,
            default_data_file: String::new(),
        }
    }
}

impl AppSettings {
    /// Normalizes the raw persisted fields into their checked forms.
    pub fn materialize(&self) -> Settings {
        Settings {
            vendor_id: UsbId::parse(&self.vendor_id),
            product_id: UsbId::parse(&self.device_id),
            channel_count: self.channel_count,
            data_file: if self.default_data_file.is_empty() {
                PathBuf::from(DEFAULT_DATA_FILE)
            } else {
                PathBuf::from(&self.default_data_file)
            },
        }
    }
}

/// Accepts any JSON value for `channel_count`, clamping out-of-range and
/// defaulting non-numeric input to [`DEFAULT_CHANNEL_COUNT`] instead of
/// rejecting the whole file.
fn lenient_channel_count<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(normalize_channel_count(&raw))
}

fn normalize_channel_count(raw: &serde_json::Value) -> u8 {
    match raw.as_u64() {
        Some(count @ 1..=8) => count as u8,
        Some(count) => {
            warn!(count, "channel count out of range, using {DEFAULT_CHANNEL_COUNT}");
            DEFAULT_CHANNEL_COUNT
        }
        None => {
            warn!(?raw, "channel count not numeric, using {DEFAULT_CHANNEL_COUNT}");
            DEFAULT_CHANNEL_COUNT
        }
    }
}

/// Settings after one-time normalization.
#[derive(Debug, Clone)]
pub struct Settings {
    pub vendor_id: UsbId,
    pub product_id: UsbId,
    pub channel_count: u8,
    pub data_file: PathBuf,
}

/// One element of the channel-data array, index = channel id − 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelRecord {
    pub label: String,
    pub schedule_enabled: bool,
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
}

/// Loads and saves the two persisted documents.
pub struct ConfigStore {
    settings_path: PathBuf,
}

impl ConfigStore {
    pub fn new(settings_path: impl Into<PathBuf>) -> Self {
        ConfigStore {
            settings_path: settings_path.into(),
        }
    }

    /// Reads the settings file. Never fails: a missing or corrupt file
    /// yields defaults and logs the condition.
    pub fn load_settings(&self) -> AppSettings {
        match fs::read_to_string(&self.settings_path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => {
                    info!(path = %self.settings_path.display(), "settings loaded");
                    settings
                }
                Err(err) => {
                    warn!(
                        path = %self.settings_path.display(),
                        %err,
                        "settings file malformed, using defaults"
                    );
                    AppSettings::default()
                }
            },
            Err(err) => {
                info!(
                    path = %self.settings_path.display(),
                    %err,
                    "settings file not readable, using defaults"
                );
                AppSettings::default()
            }
        }
    }

    pub fn save_settings(&self, settings: &AppSettings) -> Result<(), PersistenceError> {
        let text = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_path, text)?;
        info!(path = %self.settings_path.display(), "settings saved");
        Ok(())
    }

    pub fn load_channel_data(&self, path: &Path) -> Result<Vec<ChannelRecord>, PersistenceError> {
        let text = fs::read_to_string(path)?;
        let records = serde_json::from_str(&text)?;
        info!(path = %path.display(), "channel data loaded");
        Ok(records)
    }

    pub fn save_channel_data(
        &self,
        path: &Path,
        records: &[ChannelRecord],
    ) -> Result<(), PersistenceError> {
        let text = serde_json::to_string_pretty(records)?;
        fs::write(path, text)?;
        info!(path = %path.display(), "channel data saved");
        Ok(())
    }

    /// Channel records for a board that has no data file yet.
    pub fn default_channel_data(channel_count: u8) -> Vec<ChannelRecord> {
        (0..channel_count).map(|_| ChannelRecord::default()).collect()
    }
}
