//! Configuration types
//!
//! The JSON shapes follow the files the monitor has always read: a static
//! roster under `"static"`, dynamic control intents under `"dynamic"` and
//! weekly schedules as seven rows of 96 quarter-hour values. Booleans may
//! arrive as JSON booleans or as text such as `"True"`, `"yes"` or `"on"`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime};
use log::LevelFilter;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

use crate::circle::SwitchState;
use crate::error::{PlugwiseError, PlugwiseResult};
use crate::history::{LogCursor, DEFAULT_BATCH_SLOTS};
use crate::logging::CommLogger;
use crate::protocol::Mac;
use crate::schedule::SCHEDULE_SLOTS;
use crate::transaction::{ChannelConfig, DEFAULT_READ_TIMEOUT, DEFAULT_RETRIES};
use crate::transport::{SerialTransport, DEFAULT_BAUD_RATE};

/// Interpret a textual flag; `None` when it is not recognised
pub fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" | "y" => Some(true),
        "false" | "no" | "off" | "0" | "n" | "" => Some(false),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(i64),
    Text(String),
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Loose::deserialize(deserializer)? {
        Loose::Bool(b) => Ok(b),
        Loose::Int(i) => Ok(i != 0),
        Loose::Text(s) => {
            parse_flag(&s).ok_or_else(|| de::Error::custom(format!("not a boolean: '{}'", s)))
        }
    }
}

fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    match Loose::deserialize(deserializer)? {
        Loose::Int(i) => u32::try_from(i).map_err(de::Error::custom),
        Loose::Text(s) => s.trim().parse().map_err(de::Error::custom),
        Loose::Bool(_) => Err(de::Error::custom("expected a number")),
    }
}

/// Parse any of the configuration documents
pub fn from_json_str<T: DeserializeOwned>(json: &str) -> PlugwiseResult<T> {
    Ok(serde_json::from_str(json)?)
}

/// Read and parse a configuration document from disk
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> PlugwiseResult<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        PlugwiseError::configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    from_json_str(&text)
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_backoff_ms() -> u64 {
    1000
}

/// Serial connection to the Stick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout per attempt
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Extra read attempts per frame
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default, deserialize_with = "flag")]
    pub log_comm: bool,
    /// Log every raw line written to or read from the port
    #[serde(default, deserialize_with = "flag")]
    pub packet_trace: bool,
}

impl StickConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: default_read_timeout_ms(),
            retries: DEFAULT_RETRIES,
            reconnect_backoff_ms: default_backoff_ms(),
            log_comm: false,
            packet_trace: false,
        }
    }

    /// Open the configured serial port
    pub fn open_serial(&self) -> PlugwiseResult<SerialTransport> {
        SerialTransport::new_with_packet_logging(&self.port, self.baud_rate, self.packet_trace)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// Channel settings with a communication log routed to the `log` facade
    pub fn channel_config(&self) -> ChannelConfig {
        let logger = CommLogger::log_facade();
        logger.set_enabled(self.log_comm);
        ChannelConfig {
            read_timeout: self.read_timeout(),
            retries: self.retries,
            logger,
        }
    }
}

fn default_loginterval() -> u32 {
    60
}

/// One entry of the static device roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleConfig {
    pub mac: Mac,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    /// The relay must never be switched off
    #[serde(default, deserialize_with = "flag")]
    pub always_on: bool,
    /// The device also meters production
    #[serde(default, deserialize_with = "flag")]
    pub production: bool,
    /// Log interval in minutes
    #[serde(default = "default_loginterval", deserialize_with = "number")]
    pub loginterval: u32,
    #[serde(default, deserialize_with = "flag")]
    pub reverse_pol: bool,
}

impl CircleConfig {
    pub fn new(mac: Mac, name: impl Into<String>) -> Self {
        Self {
            mac,
            name: name.into(),
            location: String::new(),
            always_on: false,
            production: false,
            loginterval: default_loginterval(),
            reverse_pol: false,
        }
    }
}

/// The static roster document: `{"static": [...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(rename = "static", default)]
    pub circles: Vec<CircleConfig>,
}

impl StaticConfig {
    pub fn from_json_str(json: &str) -> PlugwiseResult<Self> {
        from_json_str(json)
    }
}

fn default_on() -> SwitchState {
    SwitchState::On
}

fn default_off() -> SwitchState {
    SwitchState::Off
}

/// Desired state of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub mac: Mac,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_on")]
    pub switch_state: SwitchState,
    #[serde(default = "default_off")]
    pub schedule_state: SwitchState,
    /// Schedule name; empty for none
    #[serde(default)]
    pub schedule: String,
    /// Sample power every tick
    #[serde(default, deserialize_with = "flag")]
    pub monitor: bool,
    /// Pull and publish history
    #[serde(default, deserialize_with = "flag")]
    pub savelog: bool,
}

impl Control {
    pub fn new(mac: Mac) -> Self {
        Self {
            mac,
            name: String::new(),
            switch_state: SwitchState::On,
            schedule_state: SwitchState::Off,
            schedule: String::new(),
            monitor: false,
            savelog: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The control document: `{"dynamic": [...], "log_comm": ..., "log_level": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFile {
    #[serde(default)]
    pub dynamic: Vec<Control>,
    #[serde(default, deserialize_with = "flag")]
    pub log_comm: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ControlFile {
    fn default() -> Self {
        Self {
            dynamic: Vec::new(),
            log_comm: false,
            log_level: default_log_level(),
        }
    }
}

impl ControlFile {
    pub fn from_json_str(json: &str) -> PlugwiseResult<Self> {
        from_json_str(json)
    }

    /// Log level as a filter, `Info` when not recognised
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.trim().parse().unwrap_or(LevelFilter::Info)
    }
}

/// Schedules by name, 672 watt values each
pub type ScheduleTable = BTreeMap<String, Vec<i32>>;

/// A weekly schedule document: `{"schedule": [[96 values] x 7]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFile {
    pub schedule: Vec<Vec<i32>>,
}

impl ScheduleFile {
    pub fn from_json_str(json: &str) -> PlugwiseResult<Self> {
        from_json_str(json)
    }

    /// Flatten to one value per quarter hour, Monday first
    pub fn into_watts(self) -> PlugwiseResult<Vec<i32>> {
        if self.schedule.len() != 7 || self.schedule.iter().any(|day| day.len() != 96) {
            return Err(PlugwiseError::configuration(format!(
                "schedule needs 7 days of 96 values, got {:?}",
                self.schedule.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }
        let watts: Vec<i32> = self.schedule.into_iter().flatten().collect();
        debug_assert_eq!(watts.len(), SCHEDULE_SLOTS);
        Ok(watts)
    }
}

/// Schedules available without any schedule file
pub fn builtin_schedules() -> ScheduleTable {
    let mut table = ScheduleTable::new();
    table.insert(
        "__PW2PY__test-alternate".to_string(),
        (0..SCHEDULE_SLOTS).map(|i| if i % 2 == 0 { -1 } else { 0 }).collect(),
    );
    table.insert("__PW2PY__test-10".to_string(), vec![10; SCHEDULE_SLOTS]);
    table
}

fn default_tick_secs() -> u64 {
    10
}

fn default_history_batch() -> u32 {
    DEFAULT_BATCH_SLOTS
}

fn default_join_interval() -> u32 {
    60
}

fn default_clock_sync_hour() -> u32 {
    4
}

fn default_relay_refresh() -> u32 {
    15
}

/// Cadence of the polling loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Log slots read per history pull
    #[serde(default = "default_history_batch")]
    pub history_batch: u32,
    /// Minutes between join windows
    #[serde(default = "default_join_interval")]
    pub join_interval_minutes: u32,
    /// Local hour of the daily clock sync
    #[serde(default = "default_clock_sync_hour")]
    pub clock_sync_hour: u32,
    /// Minutes between relay refreshes of schedule-driven devices
    #[serde(default = "default_relay_refresh")]
    pub relay_refresh_minutes: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            history_batch: default_history_batch(),
            join_interval_minutes: default_join_interval(),
            clock_sync_hour: default_clock_sync_hour(),
            relay_refresh_minutes: default_relay_refresh(),
        }
    }
}

impl ControllerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

/// Durable history position of one device
///
/// Stored as one line: `mac, index, sub_index, timestamp, cum_energy`,
/// with the timestamp in Unix seconds of device-local time and 0 for none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub mac: Mac,
    pub index: u32,
    pub sub_index: u8,
    pub timestamp: Option<NaiveDateTime>,
    pub cum_energy: f64,
}

impl CursorRecord {
    pub fn from_cursor(mac: Mac, cursor: &LogCursor, cum_energy: f64) -> Self {
        Self {
            mac,
            index: cursor.index,
            sub_index: cursor.sub_index,
            timestamp: cursor.timestamp,
            cum_energy,
        }
    }

    pub fn to_cursor(&self) -> LogCursor {
        LogCursor {
            index: self.index,
            sub_index: self.sub_index,
            timestamp: self.timestamp,
        }
    }

    pub fn to_line(&self) -> String {
        let ts = self.timestamp.map(|t| t.and_utc().timestamp()).unwrap_or(0);
        format!(
            "{}, {}, {}, {}, {:.4}",
            self.mac, self.index, self.sub_index, ts, self.cum_energy
        )
    }

    /// Parse a stored line; older files carry only the first two or four fields
    pub fn from_line(line: &str) -> PlugwiseResult<Self> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if !matches!(parts.len(), 2 | 4 | 5) {
            return Err(PlugwiseError::configuration(format!(
                "cursor line has {} fields: '{}'",
                parts.len(),
                line.trim()
            )));
        }
        let field = |s: &str| {
            PlugwiseError::configuration(format!("bad cursor field '{}' in '{}'", s, line.trim()))
        };

        let mac: Mac = parts[0].parse()?;
        let index: u32 = parts[1].parse().map_err(|_| field(parts[1]))?;
        let mut record = Self {
            mac,
            index,
            sub_index: 0,
            timestamp: None,
            cum_energy: 0.0,
        };
        if parts.len() >= 4 {
            record.sub_index = parts[2].parse().map_err(|_| field(parts[2]))?;
            let ts: i64 = parts[3].parse().map_err(|_| field(parts[3]))?;
            if ts != 0 {
                record.timestamp = DateTime::from_timestamp(ts, 0).map(|t| t.naive_utc());
            }
        }
        if parts.len() == 5 {
            record.cum_energy = parts[4].parse().map_err(|_| field(parts[4]))?;
        }
        Ok(record)
    }
}
