//! Circle and Circle+ device model
//!
//! A [`Circle`] caches what is known about one device: relay and schedule
//! state, calibration, the history cursor and the attached schedule. Every
//! exchange goes through one path that owns the online/offline transitions:
//! a timeout or channel failure takes the device offline, any good reply
//! brings it back.
//!
//! Callers treat every error as "device unavailable this cycle"; nothing
//! here is fatal.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::CircleConfig;
use crate::error::{PlugwiseError, PlugwiseResult};
use crate::history::{collect_history, detect_interval, plan_slots, slot_rows, HistoryRow, LogCursor};
use crate::power::{Calibration, PowerReading};
use crate::protocol::{
    AckStatus, ClockInfo, DeviceInfo, DeviceType, LogSlot, Mac, PulseCounters, Request, Response,
    ResponseBody, ResponseKind,
};
use crate::schedule::{encode_watt, Schedule, COMMIT_CHUNKS};
use crate::transaction::Channel;
use crate::utils::validation::validate_log_interval;

/// Replies examined per exchange before giving up on the device
const EXPECT_ATTEMPTS: usize = 2;

/// Log interval assumed until the device log says otherwise, in minutes
pub const DEFAULT_LOG_INTERVAL: u32 = 60;

/// Entries in the Circle+ node table
pub const NODE_TABLE_SIZE: u8 = 64;

/// Readings above this are treated as corrupt counters
const MAX_PLAUSIBLE_WATTS: f64 = 10_000.0;

/// Relay or schedule state as last known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SwitchState {
    On,
    Off,
    #[default]
    Unknown,
}

impl SwitchState {
    pub fn from_bool(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            SwitchState::On => Some(true),
            SwitchState::Off => Some(false),
            SwitchState::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwitchState::On => "on",
            SwitchState::Off => "off",
            SwitchState::Unknown => "?",
        }
    }
}

impl From<String> for SwitchState {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => SwitchState::On,
            "off" => SwitchState::Off,
            _ => SwitchState::Unknown,
        }
    }
}

impl From<SwitchState> for String {
    fn from(state: SwitchState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to status consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleStatus {
    pub mac: Mac,
    #[serde(rename = "type")]
    pub device_type: Option<DeviceType>,
    pub name: String,
    pub location: String,
    pub online: bool,
    /// Unix time of the last good reply, 0 if never seen
    pub lastseen: i64,
    pub readonly: bool,
    pub reverse_pol: bool,
    pub switch: SwitchState,
    pub switchreq: SwitchState,
    pub schedule: SwitchState,
    pub schedname: String,
    pub power1s: f64,
    pub power8s: f64,
    /// Net hourly average: usage minus production
    pub power1h: f64,
    pub powerts: i64,
    pub production: bool,
    pub interval: u32,
    pub cum_energy: f64,
}

/// Link quality reported by a synchronous ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReport {
    pub rssi_in: u8,
    pub rssi_out: u8,
    pub ping_ms: u16,
}

/// One Circle or Circle+ on the shared channel
pub struct Circle {
    channel: Arc<Channel>,
    config: CircleConfig,
    device_type: Option<DeviceType>,
    calibration: Option<Calibration>,
    schedule: Option<Schedule>,
    /// Schedule checksum last read from the device
    schedule_crc: Option<u16>,
    online: bool,
    online_changed: bool,
    pong: bool,
    initialized: bool,
    relay_state: SwitchState,
    switch_state: SwitchState,
    schedule_state: SwitchState,
    last_seen: Option<DateTime<Utc>>,
    cursor: LogCursor,
    cum_energy: f64,
    power: PowerReading,
    power_ts: Option<DateTime<Utc>>,
    /// Log interval in minutes, as detected from the device log
    interval: u32,
    /// Whether the device log interleaves production entries
    production: bool,
}

impl Circle {
    /// Create the model; nothing is sent until [`Circle::reinit`]
    pub fn new(config: CircleConfig, channel: Arc<Channel>) -> Self {
        let schedule_state = if config.always_on { SwitchState::Off } else { SwitchState::Unknown };
        Self {
            channel,
            config,
            device_type: None,
            calibration: None,
            schedule: None,
            schedule_crc: None,
            online: false,
            online_changed: false,
            pong: false,
            initialized: false,
            relay_state: SwitchState::Unknown,
            switch_state: SwitchState::Unknown,
            schedule_state,
            last_seen: None,
            cursor: LogCursor::default(),
            cum_energy: 0.0,
            power: PowerReading::default(),
            power_ts: None,
            interval: DEFAULT_LOG_INTERVAL,
            production: false,
        }
    }

    pub fn mac(&self) -> &Mac {
        &self.config.mac
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircleConfig {
        &self.config
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        self.device_type
    }

    pub fn is_circle_plus(&self) -> bool {
        self.device_type == Some(DeviceType::CirclePlus)
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Relay must stay closed and the schedule untouched
    pub fn is_always_on(&self) -> bool {
        self.config.always_on
    }

    /// Whether the online flag flipped since the last call
    pub fn take_online_changed(&mut self) -> bool {
        std::mem::take(&mut self.online_changed)
    }

    pub fn relay_state(&self) -> SwitchState {
        self.relay_state
    }

    pub fn switch_state(&self) -> SwitchState {
        self.switch_state
    }

    /// Record the requested switch state without touching the relay
    pub fn set_switch_state(&mut self, state: SwitchState) {
        self.switch_state = state;
    }

    pub fn schedule_state(&self) -> SwitchState {
        self.schedule_state
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn schedule_crc(&self) -> Option<u16> {
        self.schedule_crc
    }

    pub fn power(&self) -> PowerReading {
        self.power
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn logs_production(&self) -> bool {
        self.production
    }

    pub fn cursor(&self) -> LogCursor {
        self.cursor
    }

    pub fn cum_energy(&self) -> f64 {
        self.cum_energy
    }

    /// Restore a stored history cursor
    pub fn set_cursor(&mut self, cursor: LogCursor, cum_energy: f64) {
        self.cursor = cursor;
        self.cum_energy = cum_energy;
    }

    /// Promote the device after a pong; a successful exchange has to follow
    pub fn set_online(&mut self) {
        self.online = true;
        self.online_changed = true;
        self.pong = false;
    }

    fn mark_online(&mut self) {
        if !self.online {
            info!("ONLINE Circle '{}' ({})", self.config.name, self.config.mac);
            self.online_changed = true;
        }
        self.online = true;
        self.pong = false;
        self.last_seen = Some(Utc::now());
    }

    fn mark_offline(&mut self) {
        if self.online {
            info!("OFFLINE Circle '{}' ({})", self.config.name, self.config.mac);
            self.online_changed = true;
        }
        self.online = false;
    }

    /// Send a request to this device and wait for its reply
    async fn exchange(&mut self, request: Request) -> PlugwiseResult<Response> {
        let result = expect_reply(&self.channel, &self.config.mac, &request).await;
        match &result {
            Ok(_) => self.mark_online(),
            Err(e) if e.marks_offline() => {
                debug!("Circle '{}': {}", self.config.name, e);
                self.mark_offline();
            }
            Err(_) => {}
        }
        result
    }

    fn unexpected(&self, operation: &str, body: &ResponseBody) -> PlugwiseError {
        PlugwiseError::value(format!(
            "{} on Circle '{}': unexpected reply {:?}",
            operation, self.config.name, body
        ))
    }

    fn check_status(&self, operation: &str, response: &Response, expected: AckStatus) {
        if response.ack_status() != Some(expected) {
            error!(
                "{} on Circle '{}' answered with {:?}, expected {:?}",
                operation,
                self.config.name,
                response.ack_status(),
                expected
            );
        }
    }

    /// Fetch relay state, log position, device type and firmware
    pub async fn get_info(&mut self) -> PlugwiseResult<DeviceInfo> {
        let response = self.exchange(Request::Info { mac: self.config.mac.clone() }).await?;
        match response.body {
            ResponseBody::Info(info) => {
                self.relay_state = SwitchState::from_bool(info.relay_on);
                self.device_type = Some(info.device_type);
                Ok(info)
            }
            other => Err(self.unexpected("info", &other)),
        }
    }

    /// Fetch the calibration coefficients and cache them
    pub async fn calibrate(&mut self) -> PlugwiseResult<Calibration> {
        let response = self.exchange(Request::Calibration { mac: self.config.mac.clone() }).await?;
        match response.body {
            ResponseBody::Calibration(calibration) => {
                debug!("Circle '{}' calibration {:?}", self.config.name, calibration);
                self.calibration = Some(calibration);
                Ok(calibration)
            }
            other => Err(self.unexpected("calibration", &other)),
        }
    }

    /// Cached calibration, fetched on first use
    pub async fn calibration(&mut self) -> PlugwiseResult<Calibration> {
        match self.calibration {
            Some(calibration) => Ok(calibration),
            None => self.calibrate().await,
        }
    }

    /// Raw counters; production pulses are zeroed unless configured
    pub async fn get_pulse_counters(&mut self) -> PlugwiseResult<PulseCounters> {
        let response = self.exchange(Request::PowerUsage { mac: self.config.mac.clone() }).await?;
        match response.body {
            ResponseBody::PowerUsage(mut counters) => {
                if !self.config.production {
                    counters.pulse_prod_1h = 0;
                }
                Ok(counters)
            }
            other => Err(self.unexpected("power usage", &other)),
        }
    }

    /// Calibrated power over the last second, 8 seconds and hour
    pub async fn get_power_usage(&mut self) -> PlugwiseResult<PowerReading> {
        let calibration = self.calibration().await?;
        let counters = self.get_pulse_counters().await?;
        let reading = PowerReading::from_counters(
            &counters,
            &calibration,
            self.config.reverse_pol,
            self.config.production,
        );
        if reading.watts_1s.abs() > MAX_PLAUSIBLE_WATTS || reading.watts_8s.abs() > MAX_PLAUSIBLE_WATTS {
            return Err(PlugwiseError::value(format!(
                "Circle '{}' reported implausible counters {:?}",
                self.config.name, counters
            )));
        }
        debug!(
            "POWER {} 1s {:.3} 8s {:.3} 1h {:.3} prod 1h {:.3}",
            self.config.mac, reading.watts_1s, reading.watts_8s, reading.watts_1h, reading.watts_prod_1h
        );
        self.power = reading;
        self.power_ts = Some(Utc::now());
        Ok(reading)
    }

    /// Switch the relay
    ///
    /// The cached state follows the request even when the device answers
    /// with an unexpected status.
    pub async fn switch(&mut self, on: bool) -> PlugwiseResult<()> {
        if self.config.always_on && !on {
            return Err(PlugwiseError::value(format!(
                "Circle '{}' is always on and cannot be switched off",
                self.config.name
            )));
        }
        info!("switch Circle '{}' {}", self.config.name, if on { "on" } else { "off" });
        let response = self.exchange(Request::Switch { mac: self.config.mac.clone(), on }).await?;
        let expected = if on { AckStatus::SwitchedOn } else { AckStatus::SwitchedOff };
        self.check_status("switch", &response, expected);
        let state = SwitchState::from_bool(on);
        self.switch_state = state;
        self.relay_state = state;
        Ok(())
    }

    pub async fn switch_on(&mut self) -> PlugwiseResult<()> {
        self.switch(true).await
    }

    pub async fn switch_off(&mut self) -> PlugwiseResult<()> {
        self.switch(false).await
    }

    /// Enable or disable the on-device schedule
    pub async fn schedule_onoff(&mut self, on: bool) -> PlugwiseResult<()> {
        if self.config.always_on {
            return Err(PlugwiseError::value(format!(
                "Circle '{}' is always on, its schedule cannot be changed",
                self.config.name
            )));
        }
        let response = self
            .exchange(Request::ScheduleEnable { mac: self.config.mac.clone(), on })
            .await?;
        let expected = if on { AckStatus::ScheduleOn } else { AckStatus::ScheduleOff };
        self.check_status("schedule", &response, expected);
        self.schedule_state = SwitchState::from_bool(on);
        if on {
            // the schedule may have moved the relay
            self.get_info().await?;
        }
        Ok(())
    }

    pub async fn schedule_on(&mut self) -> PlugwiseResult<()> {
        self.schedule_onoff(true).await
    }

    pub async fn schedule_off(&mut self) -> PlugwiseResult<()> {
        self.schedule_onoff(false).await
    }

    /// Fire-and-forget ping; the pong is picked up later
    pub async fn ping(&mut self) -> PlugwiseResult<()> {
        let seq = self.channel.send(&Request::Ping { mac: self.config.mac.clone() }).await?;
        debug!("ping {} sent with seq {:04X}", self.config.mac, seq);
        Ok(())
    }

    /// Collect a pong seen on the channel since the last check
    pub fn check_pong(&mut self) -> bool {
        if self.channel.take_pong(&self.config.mac) {
            self.pong = true;
        }
        self.pong
    }

    pub fn has_pong(&self) -> bool {
        self.pong
    }

    /// Ping and wait for the reply
    pub async fn ping_synchronous(&mut self) -> PlugwiseResult<PingReport> {
        let response = self.exchange(Request::Ping { mac: self.config.mac.clone() }).await?;
        match response.body {
            ResponseBody::PingReply { rssi_in, rssi_out, ping_ms } => Ok(PingReport { rssi_in, rssi_out, ping_ms }),
            other => Err(self.unexpected("ping", &other)),
        }
    }

    /// Device time and the checksum of its stored schedule
    pub async fn get_clock(&mut self) -> PlugwiseResult<ClockInfo> {
        let response = self.exchange(Request::Clock { mac: self.config.mac.clone() }).await?;
        match response.body {
            ResponseBody::Clock(clock) => {
                self.schedule_crc = Some(clock.schedule_crc);
                Ok(clock)
            }
            other => Err(self.unexpected("clock", &other)),
        }
    }

    pub async fn set_clock(&mut self, at: NaiveDateTime) -> PlugwiseResult<()> {
        let response = self.exchange(Request::SetClock { mac: self.config.mac.clone(), at }).await?;
        self.check_status("set clock", &response, AckStatus::ClockSet);
        Ok(())
    }

    /// Real-time clock of a Circle+
    pub async fn get_circleplus_datetime(&mut self) -> PlugwiseResult<NaiveDateTime> {
        let response = self
            .exchange(Request::CirclePlusClock { mac: self.config.mac.clone() })
            .await?;
        match response.body {
            ResponseBody::CirclePlusClock { at, .. } => Ok(at),
            other => Err(self.unexpected("Circle+ clock", &other)),
        }
    }

    /// Set the Circle+ real-time clock; returns whether the device accepted
    pub async fn set_circleplus_datetime(&mut self, at: NaiveDateTime) -> PlugwiseResult<bool> {
        let response = self
            .exchange(Request::SetCirclePlusClock { mac: self.config.mac.clone(), at })
            .await?;
        match response.ack_status() {
            Some(AckStatus::CirclePlusClockAccepted) => Ok(true),
            Some(AckStatus::CirclePlusClockRejected) => {
                warn!("Circle+ '{}' rejected the new time", self.config.name);
                Ok(false)
            }
            other => {
                error!("set Circle+ clock on '{}' answered with {:?}", self.config.name, other);
                Ok(false)
            }
        }
    }

    /// Set the usage log interval, optionally logging production as well
    pub async fn set_log_interval(&mut self, minutes: u32, production: bool) -> PlugwiseResult<()> {
        let usage = validate_log_interval(minutes)?;
        let request = Request::LogInterval {
            mac: self.config.mac.clone(),
            usage,
            production: if production { usage } else { 0 },
        };
        let response = self.exchange(request).await?;
        self.check_status("log interval", &response, AckStatus::LogIntervalSet);
        self.interval = minutes;
        self.production = production;
        Ok(())
    }

    /// Fill the whole on-device schedule with one value
    ///
    /// Negative values are sent as they are; `-1` keeps the relay on.
    pub async fn set_schedule_value(&mut self, watts: i32) -> PlugwiseResult<()> {
        let calibration = if watts > 0 { self.calibration().await? } else { Calibration::identity() };
        let value = encode_watt(watts, &calibration)?;
        let response = self
            .exchange(Request::ScheduleValue { mac: self.config.mac.clone(), value })
            .await?;
        self.check_status("schedule value", &response, AckStatus::ScheduleValueSet);
        self.schedule_crc = None;
        Ok(())
    }

    /// Addresses registered in the Circle+ node table
    pub async fn read_node_table(&mut self) -> PlugwiseResult<Vec<Mac>> {
        let mut nodes = Vec::new();
        for index in 0..NODE_TABLE_SIZE {
            let response = self
                .exchange(Request::NodeTable { mac: self.config.mac.clone(), index })
                .await?;
            match response.body {
                ResponseBody::NodeTable { node: Some(node), .. } => {
                    debug!("node table {:2}: {}", index, node);
                    nodes.push(node);
                }
                ResponseBody::NodeTable { node: None, .. } => {}
                other => return Err(self.unexpected("node table", &other)),
            }
        }
        Ok(nodes)
    }

    /// Remove a node from the Circle+ network; returns whether it was removed
    pub async fn remove_node(&mut self, node: &Mac) -> PlugwiseResult<bool> {
        let request = Request::RemoveNode { mac: self.config.mac.clone(), node: node.clone() };
        let response = self.exchange(request).await?;
        match response.body {
            ResponseBody::RemoveNode { removed, .. } => Ok(removed),
            other => Err(self.unexpected("remove node", &other)),
        }
    }

    /// Read one log buffer slot
    pub async fn read_log_slot(&mut self, index: u32) -> PlugwiseResult<LogSlot> {
        let response = self
            .exchange(Request::LogBuffer { mac: self.config.mac.clone(), index })
            .await?;
        match response.body {
            ResponseBody::LogBuffer(slot) if slot.index == index => Ok(slot),
            ResponseBody::LogBuffer(slot) => Err(PlugwiseError::value(format!(
                "Circle '{}' returned log slot {} for {}",
                self.config.name, slot.index, index
            ))),
            other => Err(self.unexpected("log buffer", &other)),
        }
    }

    /// Log interval and production mode judged from the newest log slots
    async fn detect_log_settings(&mut self, last_logaddr: u32) -> PlugwiseResult<(u32, bool)> {
        if last_logaddr < 1 {
            return Ok((DEFAULT_LOG_INTERVAL, false));
        }
        let calibration = self.calibration().await?;
        let reverse = self.config.reverse_pol;
        let current = self.read_log_slot(last_logaddr).await?;
        let mut rows: Vec<HistoryRow> = slot_rows(&current, None, &calibration, reverse)
            .into_iter()
            .map(|e| e.row)
            .collect();
        if rows.len() < 3 {
            let previous = self.read_log_slot(last_logaddr - 1).await?;
            let mut earlier: Vec<HistoryRow> = slot_rows(&previous, None, &calibration, reverse)
                .into_iter()
                .map(|e| e.row)
                .collect();
            earlier.append(&mut rows);
            rows = earlier;
        }
        Ok(detect_interval(&rows).unwrap_or((DEFAULT_LOG_INTERVAL, false)))
    }

    /// Bring the device to a known state after start-up or recovery
    ///
    /// On failure the device is left offline and uninitialized.
    pub async fn reinit(&mut self) -> PlugwiseResult<()> {
        let result = self.try_reinit().await;
        self.pong = false;
        match &result {
            Ok(()) => self.initialized = true,
            Err(e) => {
                error!("reinit of Circle '{}' failed: {}", self.config.name, e);
                self.mark_offline();
                self.initialized = false;
            }
        }
        result
    }

    async fn try_reinit(&mut self) -> PlugwiseResult<()> {
        let info = self.get_info().await?;
        let (interval, production) = self.detect_log_settings(info.last_logaddr).await?;
        self.interval = interval;
        self.production = production;
        debug!(
            "Circle '{}' logs every {} minutes, production {}",
            self.config.name, interval, production
        );
        if self.config.always_on && !info.relay_on {
            info!("Circle '{}' is always on but its relay is off", self.config.name);
            self.switch(true).await?;
        }
        self.set_log_interval(self.config.loginterval, self.config.production).await
    }

    /// Attach a schedule, encoded with this device's calibration
    pub async fn define_schedule(&mut self, name: &str, watts: &[i32], dst: bool) -> PlugwiseResult<()> {
        let calibration = self.calibration().await?;
        self.schedule = Some(Schedule::define(name, watts, &calibration, dst)?);
        Ok(())
    }

    pub fn undefine_schedule(&mut self) {
        self.schedule = None;
    }

    /// Upload the attached schedule, rotated for `dst`
    ///
    /// Any failure detaches the schedule so the next cycle starts over.
    pub async fn load_schedule(&mut self, dst: bool) -> PlugwiseResult<()> {
        let result = self.upload_schedule(dst).await;
        if let Err(e) = &result {
            error!("schedule upload to Circle '{}' failed: {}", self.config.name, e);
            self.schedule = None;
        }
        result
    }

    async fn upload_schedule(&mut self, dst: bool) -> PlugwiseResult<()> {
        let schedule = self
            .schedule
            .as_mut()
            .ok_or_else(|| PlugwiseError::value("no schedule defined"))?;
        schedule.dst_shift(dst);
        let crc = schedule.crc();
        let chunks: Vec<_> = schedule.chunks().collect();
        info!(
            "uploading schedule '{}' (CRC {}) to Circle '{}'",
            schedule.name(),
            crc,
            self.config.name
        );

        for (chunk, values) in chunks {
            self.channel.send(&Request::PrepareSchedule { chunk, values }).await?;
        }
        for chunk in 1..=COMMIT_CHUNKS {
            let response = self
                .exchange(Request::CommitSchedule { mac: self.config.mac.clone(), chunk })
                .await?;
            match response.body {
                ResponseBody::CommitSchedule { chunk: got } if got == chunk as u16 => {}
                other => return Err(self.unexpected("commit schedule", &other)),
            }
        }

        let clock = self.get_clock().await?;
        if clock.schedule_crc != crc {
            return Err(PlugwiseError::value(format!(
                "Circle '{}' reports schedule CRC {} after upload, expected {}",
                self.config.name, clock.schedule_crc, crc
            )));
        }
        Ok(())
    }

    /// Pull new log entries, at most `batch` slots
    ///
    /// The cursor and cumulative energy only move once every slot of the
    /// batch has been read.
    pub async fn read_history(&mut self, batch: u32) -> PlugwiseResult<Vec<HistoryRow>> {
        let info = self.get_info().await?;
        let plan = plan_slots(&self.cursor, info.last_logaddr, batch);
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        let calibration = self.calibration().await?;
        let mut slots = Vec::with_capacity(plan.len());
        for index in plan {
            slots.push(self.read_log_slot(index).await?);
        }

        let (rows, cursor) = collect_history(
            &self.cursor,
            &slots,
            &calibration,
            self.production,
            self.config.reverse_pol,
        );
        self.cum_energy += rows.iter().map(|r| r.watt_hours).sum::<f64>();
        debug!(
            "Circle '{}': {} history rows from {} slots, cursor {:?}",
            self.config.name,
            rows.len(),
            slots.len(),
            cursor
        );
        self.cursor = cursor;
        Ok(rows)
    }

    pub fn get_status(&self) -> CircleStatus {
        CircleStatus {
            mac: self.config.mac.clone(),
            device_type: self.device_type,
            name: self.config.name.clone(),
            location: self.config.location.clone(),
            online: self.online,
            lastseen: self.last_seen.map(|t| t.timestamp()).unwrap_or(0),
            readonly: self.config.always_on,
            reverse_pol: self.config.reverse_pol,
            switch: self.relay_state,
            switchreq: self.switch_state,
            schedule: self.schedule_state,
            schedname: self.schedule.as_ref().map(|s| s.name().to_string()).unwrap_or_default(),
            power1s: self.power.watts_1s,
            power8s: self.power.watts_8s,
            power1h: self.power.net_1h(),
            powerts: self.power_ts.map(|t| t.timestamp()).unwrap_or(0),
            production: self.production,
            interval: self.interval,
            cum_energy: self.cum_energy,
        }
    }
}

impl fmt::Debug for Circle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circle")
            .field("mac", &self.config.mac)
            .field("name", &self.config.name)
            .field("online", &self.online)
            .field("initialized", &self.initialized)
            .field("relay_state", &self.relay_state)
            .field("schedule_state", &self.schedule_state)
            .finish()
    }
}

/// Run one request against `mac` and return its reply
///
/// `00E1` means the node did not answer and counts as a timeout. Other
/// acknowledgements arriving in place of a data reply are given one more
/// chance.
async fn expect_reply(channel: &Channel, mac: &Mac, request: &Request) -> PlugwiseResult<Response> {
    let kind = request.expected_reply();
    let wants_ack = matches!(kind, ResponseKind::Ack | ResponseKind::AckMac);
    let budget_ms = channel.config().frame_budget().as_millis() as u64;
    let operation = format!("{} to {}", request.function_code(), mac);

    let mut exchange = channel.begin(request).await?;
    for _ in 0..EXPECT_ATTEMPTS {
        let response = exchange.expect(kind, Some(mac)).await?;
        match response.ack_status() {
            Some(AckStatus::Unreachable) => {
                return Err(PlugwiseError::timeout(format!("{}: node unreachable", operation), budget_ms));
            }
            Some(status) if !wants_ack => {
                warn!("{}: got status {:?} while waiting for {:?}", operation, status, kind);
            }
            _ => return Ok(response),
        }
    }
    Err(PlugwiseError::timeout(operation, budget_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LogEntry;
    use crate::schedule::{ALWAYS_ON_CRC, SCHEDULE_SLOTS};
    use crate::simulator::{Reachability, SimulatedCircle, SimulatedStick};
    use crate::transaction::ChannelConfig;
    use crate::transport::StreamTransport;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use std::time::Duration;
    use tokio::io::duplex;

    fn mac(s: &str) -> Mac {
        s.parse().unwrap()
    }

    fn clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_hms_opt(9, 15, 0).unwrap()
    }

    fn setup(config: CircleConfig) -> (Circle, SimulatedStick) {
        crate::utils::logging::init_test_logger();
        let (host, device) = duplex(64 * 1024);
        let stick = SimulatedStick::new(mac("000D6F0000AAAAAA"));
        stick.add_circle(SimulatedCircle::new(config.mac.clone(), clock()));
        stick.spawn(device);
        let channel_config = ChannelConfig {
            read_timeout: Duration::from_millis(50),
            retries: 1,
            ..ChannelConfig::default()
        };
        let channel = Arc::new(Channel::new(Box::new(StreamTransport::new(host)), channel_config));
        (Circle::new(config, channel), stick)
    }

    fn lamp() -> CircleConfig {
        CircleConfig::new(mac("000D6F0000B1B64B"), "lamp")
    }

    #[tokio::test]
    async fn test_reinit_brings_device_online() {
        let (mut circle, stick) = setup(lamp());
        assert!(!circle.is_online());
        circle.reinit().await.unwrap();
        assert!(circle.is_online());
        assert!(circle.is_initialized());
        assert!(circle.take_online_changed());
        assert!(!circle.take_online_changed());
        assert_eq!(circle.relay_state(), SwitchState::On);
        assert_eq!(circle.interval(), DEFAULT_LOG_INTERVAL);
        assert_eq!(stick.circle(circle.mac()).unwrap().log_interval, (60, 0));
    }

    #[tokio::test]
    async fn test_switch_updates_relay() {
        let (mut circle, stick) = setup(lamp());
        circle.switch_off().await.unwrap();
        assert_eq!(circle.relay_state(), SwitchState::Off);
        assert_eq!(circle.switch_state(), SwitchState::Off);
        assert!(!stick.circle(circle.mac()).unwrap().relay_on);
    }

    #[tokio::test]
    async fn test_always_on_refuses_switch_off() {
        let mut config = lamp();
        config.always_on = true;
        let (mut circle, stick) = setup(config);
        assert_eq!(circle.schedule_state(), SwitchState::Off);
        let err = circle.switch_off().await.unwrap_err();
        assert!(matches!(err, PlugwiseError::Value { .. }));
        assert!(circle.schedule_on().await.is_err());
        assert_eq!(stick.stats().requests(crate::protocol::FunctionCode::Switch), 0);
    }

    #[tokio::test]
    async fn test_unreachable_goes_offline_and_recovers() {
        let (mut circle, stick) = setup(lamp());
        circle.get_info().await.unwrap();
        assert!(circle.take_online_changed());

        stick.set_reachability(circle.mac(), Reachability::Unreachable);
        let err = circle.get_info().await.unwrap_err();
        assert!(err.marks_offline());
        assert!(!circle.is_online());
        assert!(circle.take_online_changed());

        stick.set_reachability(circle.mac(), Reachability::Online);
        circle.get_info().await.unwrap();
        assert!(circle.is_online());
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let (mut circle, stick) = setup(lamp());
        stick.set_reachability(circle.mac(), Reachability::Silent);
        let err = circle.get_pulse_counters().await.unwrap_err();
        assert!(matches!(err, PlugwiseError::Timeout { .. }));
        assert!(!circle.is_online());
    }

    #[tokio::test]
    async fn test_single_failed_exchange_marks_offline() {
        let (mut circle, stick) = setup(lamp());
        circle.get_info().await.unwrap();
        assert!(circle.is_online());
        circle.take_online_changed();

        stick.set_reachability(circle.mac(), Reachability::Silent);
        assert!(circle.get_pulse_counters().await.is_err());
        // one request on the wire, no retry of the exchange itself
        assert_eq!(stick.stats().requests(crate::protocol::FunctionCode::PowerUsage), 1);
        assert!(!circle.is_online());
        assert!(circle.take_online_changed());

        stick.set_reachability(circle.mac(), Reachability::Online);
        circle.get_pulse_counters().await.unwrap();
        assert!(circle.is_online());
    }

    #[tokio::test]
    async fn test_power_usage_with_identity_calibration() {
        let (mut circle, stick) = setup(lamp());
        stick.with_circle(circle.mac(), |c| {
            c.counters = PulseCounters { pulse_1s: 469, pulse_8s: 8 * 469, pulse_1h: 0, pulse_prod_1h: 0 };
        });
        let reading = circle.get_power_usage().await.unwrap();
        assert!((reading.watts_1s - 1000.0).abs() < 0.5);
        assert!((reading.watts_8s - 1000.0).abs() < 0.5);
        assert!(circle.get_status().powerts > 0);
    }

    #[tokio::test]
    async fn test_implausible_counters_keep_device_online() {
        let (mut circle, stick) = setup(lamp());
        stick.with_circle(circle.mac(), |c| c.counters.pulse_1s = 30_000);
        let err = circle.get_power_usage().await.unwrap_err();
        assert!(matches!(err, PlugwiseError::Value { .. }));
        assert!(circle.is_online());
    }

    #[tokio::test]
    async fn test_schedule_upload_and_failure() {
        let (mut circle, stick) = setup(lamp());
        let watts: Vec<i32> = (0..SCHEDULE_SLOTS).map(|i| if i % 96 < 28 { 0 } else { -1 }).collect();

        circle.define_schedule("night-off", &watts, false).await.unwrap();
        circle.load_schedule(false).await.unwrap();
        let crc = circle.schedule().unwrap().crc();
        assert_eq!(stick.circle(circle.mac()).unwrap().schedule_crc(), crc);
        assert_eq!(circle.schedule_crc(), Some(crc));

        circle.set_schedule_value(-1).await.unwrap();
        assert_eq!(stick.circle(circle.mac()).unwrap().schedule_crc(), ALWAYS_ON_CRC);

        stick.set_reachability(circle.mac(), Reachability::Unreachable);
        assert!(circle.load_schedule(true).await.is_err());
        assert!(circle.schedule().is_none());
    }

    #[tokio::test]
    async fn test_history_advances_cursor() {
        let (mut circle, stick) = setup(lamp());
        let base = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let hour = |h: i64| Some(base + ChronoDuration::hours(h));
        stick.with_circle(circle.mac(), |c| {
            c.set_log_slot(
                0,
                [
                    LogEntry { timestamp: hour(1), pulses: 1_688_179 },
                    LogEntry { timestamp: hour(2), pulses: 1_688_179 },
                    LogEntry { timestamp: hour(3), pulses: 844_090 },
                    LogEntry { timestamp: hour(4), pulses: 0 },
                ],
            );
            let empty = LogEntry { timestamp: None, pulses: 0 };
            c.set_log_slot(1, [LogEntry { timestamp: hour(5), pulses: 1_688_179 }, empty, empty, empty]);
        });

        let rows = circle.read_history(100).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!((rows[1].watts - 1000.0).abs() < 0.5);
        assert!((rows[2].watt_hours - 500.0).abs() < 0.5);
        assert_eq!(circle.cursor(), LogCursor { index: 1, sub_index: 1, timestamp: hour(5) });
        assert!(circle.cum_energy() > 3400.0);

        // nothing new: cursor and energy stay put
        let energy = circle.cum_energy();
        assert!(circle.read_history(100).await.unwrap().is_empty());
        assert_eq!(circle.cursor().index, 1);
        assert_eq!(circle.cum_energy(), energy);
    }

    #[tokio::test]
    async fn test_history_failure_leaves_cursor() {
        let (mut circle, stick) = setup(lamp());
        stick.with_circle(circle.mac(), |c| c.last_logaddr = 3);
        let before = circle.cursor();
        stick.set_reachability(circle.mac(), Reachability::Unreachable);
        assert!(circle.read_history(100).await.is_err());
        assert_eq!(circle.cursor(), before);
    }

    #[tokio::test]
    async fn test_detects_production_logging() {
        let (mut circle, stick) = setup(lamp());
        let base = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let at = |m: i64| Some(base + ChronoDuration::minutes(m));
        stick.with_circle(circle.mac(), |c| {
            c.set_log_slot(
                5,
                [
                    LogEntry { timestamp: at(0), pulses: 100 },
                    LogEntry { timestamp: at(0), pulses: -20 },
                    LogEntry { timestamp: at(15), pulses: 100 },
                    LogEntry { timestamp: at(15), pulses: -20 },
                ],
            );
        });
        assert_eq!(circle.detect_log_settings(5).await.unwrap(), (15, true));
        assert_eq!(circle.detect_log_settings(0).await.unwrap(), (DEFAULT_LOG_INTERVAL, false));

        // the configured interval is applied after detection
        circle.reinit().await.unwrap();
        assert_eq!(circle.interval(), 60);
        assert!(!circle.logs_production());
        assert_eq!(circle.get_status().interval, 60);
    }

    #[tokio::test]
    async fn test_ping_and_pong() {
        let (mut circle, _stick) = setup(lamp());
        circle.ping().await.unwrap();
        assert!(!circle.check_pong());
        circle.channel.drain_unsolicited().await.unwrap();
        assert!(circle.check_pong());
        let report = circle.ping_synchronous().await.unwrap();
        assert!(report.rssi_in > 0);
        assert!(!circle.has_pong());
    }

    #[tokio::test]
    async fn test_circle_plus_node_table() {
        let (mut circle, stick) = setup(lamp());
        let node = mac("000D6F0000C3D4E5");
        stick.with_circle(circle.mac(), |c| {
            c.device_type = DeviceType::CirclePlus;
            c.node_table = vec![node.clone()];
        });
        circle.get_info().await.unwrap();
        assert!(circle.is_circle_plus());
        assert_eq!(circle.read_node_table().await.unwrap(), vec![node.clone()]);
        assert!(circle.remove_node(&node).await.unwrap());
        assert!(circle.read_node_table().await.unwrap().is_empty());
        assert!(circle.set_circleplus_datetime(clock()).await.unwrap());
        assert_eq!(circle.get_circleplus_datetime().await.unwrap(), clock());
    }

    #[test]
    fn test_switch_state_text() {
        assert_eq!(SwitchState::from("ON".to_string()), SwitchState::On);
        assert_eq!(SwitchState::from(" off ".to_string()), SwitchState::Off);
        assert_eq!(SwitchState::from("maybe".to_string()), SwitchState::Unknown);
        assert_eq!(serde_json::to_string(&SwitchState::Unknown).unwrap(), "\"?\"");
    }
}
