//! Cooperative polling loop
//!
//! The [`Controller`] owns the Stick and every Circle and is the only code
//! that touches device state. Each tick recovers offline devices, samples
//! power and then does one unit of slower work, so a long operation such as
//! a schedule upload delays the cadence once instead of starving it.
//!
//! Commands from the outside arrive over an mpsc channel and are drained
//! between channel operations; results leave as [`ControllerEvent`]s.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDateTime, Offset, TimeZone, Timelike};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::circle::{Circle, CircleStatus, SwitchState};
use crate::config::{builtin_schedules, CircleConfig, Control, ControlFile, ControllerConfig, CursorRecord, ScheduleTable};
use crate::error::{PlugwiseError, PlugwiseResult};
use crate::history::HistoryRow;
use crate::protocol::Mac;
use crate::schedule::ALWAYS_ON_CRC;
use crate::stick::Stick;
use crate::utils::{OperationTimer, TickMetrics};

/// Requests from an external control surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Switch { mac: Mac, on: bool },
    ScheduleState { mac: Mac, on: bool },
    /// Refresh power and publish the status
    RequestState { mac: Mac },
}

/// Output of the controller
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Status(CircleStatus),
    Power { mac: Mac, ts: NaiveDateTime, watts: f64 },
    History { mac: Mac, rows: Vec<HistoryRow> },
    /// Must be persisted and handed back through [`Controller::restore_cursors`]
    Cursor(CursorRecord),
}

/// The caller's side of a controller
pub struct ControllerHandle {
    pub commands: mpsc::Sender<Command>,
    pub events: mpsc::UnboundedReceiver<ControllerEvent>,
}

/// Command queue depth
const COMMAND_QUEUE: usize = 64;

/// Wall-clock inputs of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTime {
    /// Local standard time, never shifted for daylight saving
    pub local: NaiveDateTime,
    /// Whether daylight saving is in effect
    pub dst: bool,
}

impl TickTime {
    pub fn new(local: NaiveDateTime, dst: bool) -> Self {
        Self { local, dst }
    }

    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            local: standard_time(at),
            dst: is_dst(at),
        }
    }

    fn minute_key(&self) -> (i32, u32, u32, u32) {
        (self.local.year(), self.local.ordinal(), self.local.hour(), self.local.minute())
    }
}

/// Offset of standard time in the zone of `at`, in seconds east of UTC
fn standard_offset<Tz: TimeZone>(at: &DateTime<Tz>) -> i32 {
    let tz = at.timezone();
    [1, 7]
        .iter()
        .filter_map(|&month| tz.with_ymd_and_hms(at.year(), month, 1, 12, 0, 0).single())
        .map(|d| d.offset().fix().local_minus_utc())
        .min()
        .unwrap_or_else(|| at.offset().fix().local_minus_utc())
}

/// Whether `at` falls in daylight saving time
pub fn is_dst<Tz: TimeZone>(at: &DateTime<Tz>) -> bool {
    at.offset().fix().local_minus_utc() > standard_offset(at)
}

/// Local time of `at` without the daylight saving shift
///
/// Devices keep standard time all year; schedules are rotated instead.
pub fn standard_time<Tz: TimeZone>(at: &DateTime<Tz>) -> NaiveDateTime {
    at.naive_utc() + ChronoDuration::seconds(standard_offset(at) as i64)
}

/// Round-robin queue of pending work items
#[derive(Debug, Clone)]
pub struct WorkQueue<T> {
    pending: VecDeque<T>,
}

impl<T: PartialEq> WorkQueue<T> {
    pub fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    /// Add an item unless it is already waiting
    pub fn push(&mut self, item: T) {
        if !self.pending.contains(&item) {
            self.pending.push_back(item);
        }
    }

    /// Start a new round, but only once the previous one is done
    pub fn refill(&mut self, items: impl IntoIterator<Item = T>) {
        if self.pending.is_empty() {
            items.into_iter().for_each(|item| self.push(item));
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T: PartialEq> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Controller {
    config: ControllerConfig,
    stick: Stick,
    circles: Vec<Circle>,
    by_mac: HashMap<Mac, usize>,
    controls: HashMap<Mac, Control>,
    schedules: ScheduleTable,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    history: WorkQueue<usize>,
    last_tick: Option<TickTime>,
    last_join: Option<NaiveDateTime>,
    last_relay_refresh: Option<(i32, u32, u32, u32)>,
    dst: bool,
    metrics: TickMetrics,
}

impl Controller {
    pub fn new(config: ControllerConfig, stick: Stick, roster: Vec<CircleConfig>) -> (Self, ControllerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut circles = Vec::with_capacity(roster.len());
        let mut by_mac = HashMap::new();
        for entry in roster {
            if by_mac.contains_key(&entry.mac) {
                warn!("duplicate roster entry for {} ignored", entry.mac);
                continue;
            }
            by_mac.insert(entry.mac.clone(), circles.len());
            circles.push(Circle::new(entry, stick.channel().clone()));
        }

        let controller = Self {
            config,
            stick,
            circles,
            by_mac,
            controls: HashMap::new(),
            schedules: builtin_schedules(),
            commands: command_rx,
            events: event_tx,
            history: WorkQueue::new(),
            last_tick: None,
            last_join: None,
            last_relay_refresh: None,
            dst: false,
            metrics: TickMetrics::new(),
        };
        let handle = ControllerHandle { commands: command_tx, events: event_rx };
        (controller, handle)
    }

    pub fn stick(&self) -> &Stick {
        &self.stick
    }

    pub fn circles(&self) -> &[Circle] {
        &self.circles
    }

    pub fn circle(&self, mac: &Mac) -> Option<&Circle> {
        self.by_mac.get(mac).map(|&idx| &self.circles[idx])
    }

    pub fn control(&self, mac: &Mac) -> Option<&Control> {
        self.controls.get(mac)
    }

    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    fn emit(&self, event: ControllerEvent) {
        if self.events.send(event).is_err() {
            debug!("event dropped, nobody is listening");
        }
    }

    fn publish_status(&self, idx: usize) {
        self.emit(ControllerEvent::Status(self.circles[idx].get_status()));
    }

    /// Resume history where a previous run stopped
    pub fn restore_cursors(&mut self, records: impl IntoIterator<Item = CursorRecord>) {
        for record in records {
            match self.by_mac.get(&record.mac) {
                Some(&idx) => self.circles[idx].set_cursor(record.to_cursor(), record.cum_energy),
                None => debug!("cursor for unknown device {} ignored", record.mac),
            }
        }
    }

    /// Bring up the Stick and every device, then apply the controls
    ///
    /// Only a Stick that cannot be initialised is an error; device failures
    /// leave that device offline for [`Controller::tick`] to recover.
    pub async fn startup(&mut self, now: TickTime) -> PlugwiseResult<()> {
        self.dst = now.dst;
        self.last_tick = Some(now);
        self.stick.init().await?;

        for circle in &mut self.circles {
            if let Err(e) = circle.reinit().await {
                debug!("Circle '{}' not available at start-up: {}", circle.name(), e);
            }
        }
        self.sync_time(now).await;

        for circle in self.circles.iter_mut().filter(|c| c.is_online() && c.is_circle_plus()) {
            match circle.read_node_table().await {
                Ok(nodes) => {
                    debug!("joined node table: {:?}", nodes);
                    for node in nodes.iter().filter(|n| !self.by_mac.contains_key(*n)) {
                        info!("node {} is joined but not configured", node);
                    }
                }
                Err(e) => error!("reading the node table failed: {}", e),
            }
        }

        self.enable_joining(now).await;
        for idx in 0..self.circles.len() {
            self.apply_control(idx).await;
            self.publish_status(idx);
        }
        info!("🚀 controller started with {} devices", self.circles.len());
        Ok(())
    }

    /// Replace the control intents and apply them
    pub async fn update_controls(&mut self, controls: Vec<Control>) {
        self.controls = controls.into_iter().map(|c| (c.mac.clone(), c)).collect();
        for mac in self.controls.keys().filter(|m| !self.by_mac.contains_key(*m)) {
            info!("control for {} has no device in the roster", mac);
        }
        for idx in 0..self.circles.len() {
            if self.controls.contains_key(self.circles[idx].mac()) {
                self.apply_control(idx).await;
            }
        }
    }

    /// Apply a control document including its logging settings
    pub async fn update_control_file(&mut self, file: ControlFile) {
        self.stick.channel().logger().set_enabled(file.log_comm);
        log::set_max_level(file.level_filter());
        self.update_controls(file.dynamic).await;
    }

    /// Replace the schedule table; built-in schedules stay available
    ///
    /// Devices whose schedule changed get it uploaded again.
    pub async fn update_schedules(&mut self, schedules: ScheduleTable) {
        let mut table = builtin_schedules();
        table.extend(schedules);
        self.schedules = table;

        for idx in 0..self.circles.len() {
            let circle = &self.circles[idx];
            let Some(schedule) = circle.schedule().filter(|_| circle.is_online()) else {
                continue;
            };
            let name = schedule.name().to_string();
            let changed = self.schedules.get(&name).map(|watts| watts.as_slice() != schedule.watts());
            match changed {
                Some(true) => {
                    info!("schedule '{}' changed, updating Circle '{}'", name, circle.name());
                    let Some(control) = self.controls.get(circle.mac()).cloned() else { continue };
                    if self.apply_schedule_to_circle(idx, &control).await {
                        self.publish_status(idx);
                    }
                }
                Some(false) => {}
                None => error!("schedule '{}' of Circle '{}' no longer exists", name, circle.name()),
            }
        }
    }

    /// Run ticks at the configured cadence until the task is dropped
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick(TickTime::now()).await;
        }
    }

    /// One pass of the polling loop
    pub async fn tick(&mut self, now: TickTime) {
        let timer = OperationTimer::start("tick");
        self.run_tick(now).await;
        let period = self.config.tick();
        self.metrics.record(timer.stop(period), period);
    }

    async fn run_tick(&mut self, now: TickTime) {
        if !self.stick.channel().is_connected().await {
            if let Err(e) = self.stick.reconnect().await {
                error!("Stick reconnect failed: {}", e);
                return;
            }
        }

        let prev = self.last_tick.replace(now).unwrap_or(now);
        let new_minute = prev.minute_key() != now.minute_key();
        let new_hour = new_minute && (prev.local.hour() != now.local.hour() || prev.local.date() != now.local.date());
        self.dst = now.dst;

        self.test_offline().await;
        self.drain_commands().await;

        if new_minute {
            let savelog: Vec<usize> = (0..self.circles.len()).filter(|&i| self.saves_log(i)).collect();
            self.history.refill(savelog);
            self.connect_unknown_nodes().await;
        }

        let refresh = self.config.relay_refresh_minutes.max(1);
        if now.local.minute() % refresh == 0
            && now.local.second() > 8
            && self.last_relay_refresh != Some(now.minute_key())
        {
            self.last_relay_refresh = Some(now.minute_key());
            self.refresh_relays().await;
        }

        self.sample_power(now).await;

        if new_hour && now.local.hour() == self.config.clock_sync_hour {
            self.sync_time(now).await;
            info!("daily clock sync done");
        }
        let join_every = ChronoDuration::minutes(self.config.join_interval_minutes.max(1) as i64);
        if self.last_join.map_or(true, |t| now.local - t >= join_every) {
            self.enable_joining(now).await;
        }

        if let Some(idx) = self.history.pop() {
            self.pull_history(idx).await;
        }
        self.reapply_for_dst(now).await;
    }

    fn monitors(&self, idx: usize) -> bool {
        self.controls.get(self.circles[idx].mac()).is_some_and(|c| c.monitor)
    }

    fn saves_log(&self, idx: usize) -> bool {
        self.controls.get(self.circles[idx].mac()).is_some_and(|c| c.savelog)
    }

    /// Ping offline devices and promote the ones that answered
    async fn test_offline(&mut self) {
        for circle in self.circles.iter_mut().filter(|c| !c.is_online()) {
            if let Err(e) = circle.ping().await {
                debug!("ping of '{}' failed: {}", circle.name(), e);
            }
        }
        if let Err(e) = self.stick.channel().drain_unsolicited().await {
            debug!("draining unsolicited frames failed: {}", e);
        }

        for idx in 0..self.circles.len() {
            let circle = &mut self.circles[idx];
            if !circle.check_pong() {
                continue;
            }
            info!("Circle '{}' answered a ping, bringing it online", circle.name());
            circle.set_online();
            // Relay and log state may have changed while the device was away
            if circle.reinit().await.is_err() {
                continue;
            }
            self.apply_control(idx).await;
        }

        for idx in 0..self.circles.len() {
            if self.circles[idx].take_online_changed() {
                self.publish_status(idx);
            }
        }
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        info!("command {:?}", command);
        let mac = match &command {
            Command::Switch { mac, .. } | Command::ScheduleState { mac, .. } | Command::RequestState { mac } => mac.clone(),
        };
        let Some(&idx) = self.by_mac.get(&mac) else {
            error!("command for unknown device {}", mac);
            return;
        };

        match command {
            Command::Switch { on, .. } => {
                let Some(mut control) = self.controls.get(&mac).cloned() else {
                    error!("no control entry for {}", mac);
                    return;
                };
                control.switch_state = SwitchState::from_bool(on);
                self.apply_switch(idx, &control, false).await;
                self.controls.insert(mac, control);
            }
            Command::ScheduleState { on, .. } => {
                let Some(mut control) = self.controls.get(&mac).cloned() else {
                    error!("no control entry for {}", mac);
                    return;
                };
                control.schedule_state = SwitchState::from_bool(on);
                self.apply_schedstate(idx, &mut control, false).await;
                self.controls.insert(mac, control);
            }
            Command::RequestState { .. } => {
                if let Err(e) = self.circles[idx].get_power_usage().await {
                    info!("power read for status update failed: {}", e);
                }
            }
        }
        self.publish_status(idx);
    }

    /// Re-apply schedule, schedule state and switch intent to one device
    pub async fn apply_control(&mut self, idx: usize) {
        let mac = self.circles[idx].mac().clone();
        let Some(mut control) = self.controls.get(&mac).cloned() else {
            return;
        };
        let mut updated = self.apply_schedule_to_circle(idx, &control).await;
        updated |= self.apply_schedstate(idx, &mut control, false).await;
        if control.schedule_state != SwitchState::On {
            updated |= self.apply_switch(idx, &control, false).await;
        }
        self.controls.insert(mac, control);
        if updated {
            self.publish_status(idx);
        }
    }

    /// Make the device's stored schedule match the control; true if it changed
    async fn apply_schedule_to_circle(&mut self, idx: usize, control: &Control) -> bool {
        let dst = self.dst;
        let circle = &mut self.circles[idx];
        if !circle.is_online() {
            return false;
        }
        if let Err(e) = circle.get_clock().await {
            error!("reading the clock of '{}' failed: {}", circle.name(), e);
            return false;
        }

        if control.schedule.is_empty() {
            if circle.is_always_on() {
                circle.undefine_schedule();
                return false;
            }
            if let Err(e) = circle.schedule_off().await {
                error!("switching the schedule of '{}' off failed: {}", circle.name(), e);
            }
            circle.undefine_schedule();
            if circle.schedule_crc() == Some(ALWAYS_ON_CRC) {
                return false;
            }
            info!("Circle '{}' needs its schedule cleared", circle.name());
            if let Err(e) = circle.set_schedule_value(-1).await {
                error!("clearing the schedule of '{}' failed: {}", circle.name(), e);
                return false;
            }
            return true;
        }

        let Some(watts) = self.schedules.get(&control.schedule) else {
            error!("schedule '{}' not found in the schedule table", control.schedule);
            return false;
        };
        let stale = circle
            .schedule()
            .map_or(true, |s| s.name() != control.schedule || s.watts() != watts.as_slice());
        if stale {
            info!("Circle '{}' needs schedule '{}' defined", circle.name(), control.schedule);
            if let Err(e) = circle.define_schedule(&control.schedule, watts, dst).await {
                error!("defining schedule '{}' failed: {}", control.schedule, e);
                return false;
            }
        }

        let Some(schedule) = circle.schedule() else { return false };
        debug!("schedule CRC local {} device {:?}", schedule.crc(), circle.schedule_crc());
        if circle.schedule_crc() == Some(schedule.crc()) && schedule.dst() == dst {
            return false;
        }
        info!("Circle '{}' needs schedule '{}' uploaded", circle.name(), control.schedule);
        if let Err(e) = upload_schedule(circle, dst).await {
            error!("uploading the schedule to '{}' failed: {}", circle.name(), e);
            return false;
        }
        true
    }

    async fn apply_switch(&mut self, idx: usize, control: &Control, force: bool) -> bool {
        let circle = &mut self.circles[idx];
        if !circle.is_online() {
            return false;
        }
        let Some(on) = control.switch_state.as_bool() else {
            error!("invalid switch state for {}", circle.mac());
            return false;
        };
        let wanted = control.switch_state;
        if !force && wanted == circle.relay_state() && wanted == circle.switch_state() {
            return false;
        }
        info!("Circle '{}' needs to be switched {}", circle.name(), wanted);
        match circle.switch(on).await {
            Ok(()) => true,
            Err(e) => {
                error!("switching '{}' failed: {}", circle.name(), e);
                false
            }
        }
    }

    async fn apply_schedstate(&mut self, idx: usize, control: &mut Control, force: bool) -> bool {
        let circle = &mut self.circles[idx];
        if !circle.is_online() {
            return false;
        }
        if control.schedule.is_empty() && control.schedule_state == SwitchState::On {
            info!("Circle '{}' has no schedule, schedule state forced off", circle.name());
            control.schedule_state = SwitchState::Off;
        }
        let Some(on) = control.schedule_state.as_bool() else {
            error!("invalid schedule state for {}", circle.mac());
            return false;
        };
        if !force && control.schedule_state == circle.schedule_state() {
            return false;
        }
        info!("Circle '{}' needs its schedule switched {}", circle.name(), control.schedule_state);
        if let Err(e) = circle.schedule_onoff(on).await {
            error!("switching the schedule of '{}' failed: {}", circle.name(), e);
            return false;
        }
        if on {
            // the schedule drives the relay from now on
            circle.set_switch_state(circle.relay_state());
            control.switch_state = circle.relay_state();
        }
        true
    }

    async fn sample_power(&mut self, now: TickTime) {
        for idx in 0..self.circles.len() {
            if !self.monitors(idx) || !self.circles[idx].is_online() {
                continue;
            }
            let circle = &mut self.circles[idx];
            match circle.get_power_usage().await {
                Ok(reading) => {
                    let event = ControllerEvent::Power {
                        mac: circle.mac().clone(),
                        ts: now.local,
                        watts: reading.watts_8s,
                    };
                    self.emit(event);
                }
                Err(e @ PlugwiseError::Value { .. }) => debug!("power sample skipped: {}", e),
                Err(e) => error!("power sample of '{}' failed: {}", circle.name(), e),
            }
            self.drain_commands().await;
        }
    }

    /// Re-read relays of devices whose schedule may have switched them
    async fn refresh_relays(&mut self) {
        for idx in 0..self.circles.len() {
            let circle = &mut self.circles[idx];
            if !circle.is_online() || circle.schedule_state() != SwitchState::On {
                continue;
            }
            if let Err(e) = circle.get_info().await {
                debug!("relay refresh of '{}' failed: {}", circle.name(), e);
                continue;
            }
            self.publish_status(idx);
        }
    }

    /// Accept advertising nodes that are in the roster, reject the others
    async fn connect_unknown_nodes(&mut self) {
        for node in self.stick.take_unjoined() {
            let known = self.by_mac.contains_key(&node);
            if known {
                info!("joining configured node {}", node);
            } else {
                info!("not joining node {}: not configured", node);
            }
            if let Err(e) = self.stick.join_node(&node, known).await {
                error!("join request for {} failed: {}", node, e);
            }
        }
    }

    async fn enable_joining(&mut self, now: TickTime) {
        self.last_join = Some(now.local);
        if let Err(e) = self.stick.enable_joining(true).await {
            error!("enable joining failed: {}", e);
        }
    }

    /// Set every online device, and the Circle+ real-time clock, to standard time
    pub async fn sync_time(&mut self, now: TickTime) {
        for circle in self.circles.iter_mut().filter(|c| c.is_online()) {
            let result: PlugwiseResult<()> = async {
                let clock = circle.get_clock().await?;
                info!("Circle '{}' time is {}", circle.name(), clock.time);
                if circle.is_circle_plus() {
                    circle.set_circleplus_datetime(now.local).await?;
                }
                circle.set_clock(now.local).await
            }
            .await;
            if let Err(e) = result {
                error!("clock sync of '{}' failed: {}", circle.name(), e);
            }
        }
    }

    async fn pull_history(&mut self, idx: usize) {
        if !self.saves_log(idx) {
            return;
        }
        let batch = self.config.history_batch;
        let circle = &mut self.circles[idx];
        if !circle.is_online() {
            return;
        }
        match circle.read_history(batch).await {
            Ok(rows) => {
                let mac = circle.mac().clone();
                let record = CursorRecord::from_cursor(mac.clone(), &circle.cursor(), circle.cum_energy());
                if !rows.is_empty() {
                    self.emit(ControllerEvent::History { mac, rows });
                }
                self.emit(ControllerEvent::Cursor(record));
            }
            Err(e) => error!("history pull of '{}' failed: {}", circle.name(), e),
        }
    }

    /// Rotate one schedule per tick after a daylight saving change
    async fn reapply_for_dst(&mut self, now: TickTime) {
        let pending = self.circles.iter().position(|c| {
            c.is_online() && c.schedule().is_some_and(|s| s.dst() != now.dst)
        });
        if let Some(idx) = pending {
            info!("Circle '{}' schedule shifts for daylight saving", self.circles[idx].name());
            self.apply_control(idx).await;
        }
    }
}

/// Replace the stored schedule while it is switched off, then restore its state
async fn upload_schedule(circle: &mut Circle, dst: bool) -> PlugwiseResult<()> {
    let previous = circle.schedule_state();
    circle.schedule_off().await?;
    circle.load_schedule(dst).await?;
    circle.get_clock().await?;
    if previous == SwitchState::On {
        circle.schedule_on().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FunctionCode, LogEntry, PulseCounters};
    use crate::simulator::{Reachability, SimulatedCircle, SimulatedStick};
    use crate::transaction::{Channel, ChannelConfig};
    use crate::transport::{StickTransport, StreamTransport, TransportStats};
    use async_trait::async_trait;
    use chrono::{FixedOffset, NaiveDate};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    const PLUS: &str = "000D6F0000B1B64B";
    const LAMP: &str = "000D6F0000C3D4E5";

    fn mac(s: &str) -> Mac {
        s.parse().unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> TickTime {
        let local = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_hms_opt(h, m, s).unwrap();
        TickTime::new(local, false)
    }

    fn network() -> SimulatedStick {
        crate::utils::logging::init_test_logger();
        let sim = SimulatedStick::new(mac("000D6F0000AAAAAA"));
        let clock = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        sim.add_circle(SimulatedCircle::circle_plus(mac(PLUS), clock, vec![mac(LAMP)]));
        sim.add_circle(SimulatedCircle::new(mac(LAMP), clock));
        sim
    }

    fn controller_on(transport: Box<dyn StickTransport>, roster: Vec<CircleConfig>) -> (Controller, ControllerHandle) {
        let channel_config = ChannelConfig {
            read_timeout: Duration::from_millis(50),
            retries: 1,
            ..ChannelConfig::default()
        };
        let channel = Arc::new(Channel::new(transport, channel_config));
        let stick = Stick::new(channel, Duration::from_millis(10));
        Controller::new(ControllerConfig::default(), stick, roster)
    }

    fn roster() -> Vec<CircleConfig> {
        vec![CircleConfig::new(mac(PLUS), "plus"), CircleConfig::new(mac(LAMP), "lamp")]
    }

    fn setup_with(roster: Vec<CircleConfig>) -> (Controller, ControllerHandle, SimulatedStick) {
        let sim = network();
        let (host, device) = duplex(64 * 1024);
        sim.spawn(device);
        let (controller, handle) = controller_on(Box::new(StreamTransport::new(host)), roster);
        (controller, handle, sim)
    }

    fn setup() -> (Controller, ControllerHandle, SimulatedStick) {
        setup_with(roster())
    }

    /// A Stick that can be unplugged and comes back on reopen
    struct Replug {
        line: StreamTransport<DuplexStream>,
        sim: SimulatedStick,
        task: Arc<Mutex<Option<JoinHandle<()>>>>,
    }

    impl Replug {
        fn plug(sim: SimulatedStick, task: Arc<Mutex<Option<JoinHandle<()>>>>) -> Self {
            let (host, device) = duplex(64 * 1024);
            *task.lock().unwrap() = Some(sim.spawn(device));
            Self { line: StreamTransport::new(host), sim, task }
        }
    }

    #[async_trait]
    impl StickTransport for Replug {
        async fn write_frame(&mut self, frame: &[u8]) -> PlugwiseResult<()> {
            self.line.write_frame(frame).await
        }

        async fn read_line(&mut self, wait: Duration) -> PlugwiseResult<Vec<u8>> {
            self.line.read_line(wait).await
        }

        async fn reopen(&mut self) -> PlugwiseResult<()> {
            *self = Replug::plug(self.sim.clone(), self.task.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.line.is_connected()
        }

        async fn close(&mut self) -> PlugwiseResult<()> {
            self.line.close().await
        }

        fn get_stats(&self) -> TransportStats {
            self.line.get_stats()
        }
    }

    fn monitored(m: &str) -> Control {
        Control { monitor: true, ..Control::new(mac(m)) }
    }

    fn drain(handle: &mut ControllerHandle) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = handle.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn statuses(events: &[ControllerEvent], m: &str) -> Vec<CircleStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::Status(s) if s.mac.as_str() == m => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_work_queue_round_robin() {
        let mut queue = WorkQueue::new();
        queue.refill([0, 1, 2]);
        queue.push(1);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(0));
        // a round in progress is not restarted
        queue.refill([5]);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
        queue.refill([5]);
        assert_eq!(queue.pop(), Some(5));
    }

    #[test]
    fn test_standard_time_in_fixed_zone() {
        let zone = FixedOffset::east_opt(3600).unwrap();
        let when = zone.with_ymd_and_hms(2024, 7, 1, 14, 30, 0).unwrap();
        let tick = TickTime::from_datetime(&when);
        assert!(!tick.dst);
        assert_eq!(tick.local, NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(14, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn test_startup_syncs_clocks_and_opens_network() {
        let (mut controller, mut handle, sim) = setup();
        controller.startup(at(9, 15, 0)).await.unwrap();

        assert_eq!(controller.stick().circle_plus(), Some(&mac(PLUS)));
        assert!(sim.joining_enabled());
        assert!(controller.circle(&mac(PLUS)).unwrap().is_circle_plus());
        for m in [PLUS, LAMP] {
            assert_eq!(sim.circle(&mac(m)).unwrap().clock, at(9, 15, 0).local);
            assert!(controller.circle(&mac(m)).unwrap().is_online());
        }
        let events = drain(&mut handle);
        assert_eq!(statuses(&events, LAMP).len(), 1);
        assert!(statuses(&events, LAMP)[0].online);
    }

    #[tokio::test]
    async fn test_tick_samples_monitored_devices() {
        let (mut controller, mut handle, sim) = setup();
        sim.with_circle(&mac(LAMP), |c| {
            c.counters = PulseCounters { pulse_1s: 469, pulse_8s: 8 * 469, pulse_1h: 0, pulse_prod_1h: 0 };
        });
        controller.startup(at(9, 15, 0)).await.unwrap();
        controller.update_controls(vec![monitored(LAMP), Control::new(mac(PLUS))]).await;
        drain(&mut handle);

        controller.tick(at(9, 15, 10)).await;
        let power: Vec<_> = drain(&mut handle)
            .into_iter()
            .filter_map(|e| match e {
                ControllerEvent::Power { mac, watts, .. } => Some((mac, watts)),
                _ => None,
            })
            .collect();
        assert_eq!(power.len(), 1);
        assert_eq!(power[0].0, mac(LAMP));
        assert!((power[0].1 - 1000.0).abs() < 0.5);
        assert_eq!(controller.metrics().total_ticks, 1);
        assert_eq!(controller.metrics().overruns, 0);
    }

    #[tokio::test]
    async fn test_offline_device_recovers_after_pong() {
        let (mut controller, mut handle, sim) = setup();
        controller.startup(at(9, 15, 0)).await.unwrap();
        controller.update_controls(vec![monitored(LAMP)]).await;
        drain(&mut handle);

        sim.set_reachability(&mac(LAMP), Reachability::Unreachable);
        controller.tick(at(9, 15, 10)).await;
        assert!(!controller.circle(&mac(LAMP)).unwrap().is_online());

        // the ping goes out while the device is still unreachable
        controller.tick(at(9, 15, 20)).await;
        let events = drain(&mut handle);
        assert!(statuses(&events, LAMP).iter().any(|s| !s.online));

        sim.set_reachability(&mac(LAMP), Reachability::Online);
        controller.tick(at(9, 15, 30)).await;
        assert!(controller.circle(&mac(LAMP)).unwrap().is_online());
        let events = drain(&mut handle);
        assert!(statuses(&events, LAMP).iter().any(|s| s.online));
        assert!(events.iter().any(|e| matches!(e, ControllerEvent::Power { .. })));
    }

    #[tokio::test]
    async fn test_recovered_device_gets_switch_intent_again() {
        let (mut controller, mut handle, sim) = setup();
        controller.startup(at(9, 15, 0)).await.unwrap();
        let lamp = Control { switch_state: SwitchState::Off, ..monitored(LAMP) };
        controller.update_controls(vec![lamp]).await;
        assert!(!sim.circle(&mac(LAMP)).unwrap().relay_on);
        drain(&mut handle);

        sim.set_reachability(&mac(LAMP), Reachability::Unreachable);
        controller.tick(at(9, 15, 10)).await;
        assert!(!controller.circle(&mac(LAMP)).unwrap().is_online());

        // someone pressed the button while the device was unreachable
        sim.with_circle(&mac(LAMP), |c| c.relay_on = true);
        sim.set_reachability(&mac(LAMP), Reachability::Online);
        controller.tick(at(9, 15, 20)).await;

        assert!(controller.circle(&mac(LAMP)).unwrap().is_online());
        assert!(!sim.circle(&mac(LAMP)).unwrap().relay_on);
        assert_eq!(controller.circle(&mac(LAMP)).unwrap().relay_state(), SwitchState::Off);
    }

    #[tokio::test]
    async fn test_lost_stick_is_reopened_on_next_tick() {
        let sim = network();
        let task = Arc::new(Mutex::new(None));
        let stick = Replug::plug(sim.clone(), task.clone());
        let (mut controller, mut handle) = controller_on(Box::new(stick), roster());
        controller.startup(at(9, 15, 0)).await.unwrap();
        controller.update_controls(vec![monitored(LAMP)]).await;
        drain(&mut handle);
        assert_eq!(sim.stats().requests(FunctionCode::StickInit), 1);

        // unplug the Stick
        let running = task.lock().unwrap().take().unwrap();
        running.abort();
        assert!(running.await.is_err());

        controller.tick(at(9, 15, 10)).await;
        assert!(!controller.stick().channel().is_connected().await);
        assert!(!controller.circle(&mac(LAMP)).unwrap().is_online());

        controller.tick(at(9, 15, 20)).await;
        assert!(controller.stick().channel().is_connected().await);
        assert_eq!(sim.stats().requests(FunctionCode::StickInit), 2);
        assert!(controller.circle(&mac(LAMP)).unwrap().is_online());
    }

    #[tokio::test]
    async fn test_always_on_device_keeps_its_schedule_state() {
        let mut roster = roster();
        roster[1].always_on = true;
        let (mut controller, mut handle, sim) = setup_with(roster);
        controller.startup(at(9, 15, 0)).await.unwrap();
        let enables = sim.stats().requests(FunctionCode::ScheduleEnable);
        let values = sim.stats().requests(FunctionCode::ScheduleValue);

        controller.update_controls(vec![Control::new(mac(LAMP))]).await;
        controller.tick(at(9, 15, 10)).await;

        assert_eq!(sim.stats().requests(FunctionCode::ScheduleEnable), enables);
        assert_eq!(sim.stats().requests(FunctionCode::ScheduleValue), values);
        assert!(sim.circle(&mac(LAMP)).unwrap().relay_on);
        drain(&mut handle);
    }

    #[tokio::test]
    async fn test_switch_command_is_applied() {
        let (mut controller, mut handle, sim) = setup();
        controller.startup(at(9, 15, 0)).await.unwrap();
        controller.update_controls(vec![Control::new(mac(LAMP))]).await;
        drain(&mut handle);

        handle.commands.send(Command::Switch { mac: mac(LAMP), on: false }).await.unwrap();
        controller.tick(at(9, 15, 10)).await;

        assert!(!sim.circle(&mac(LAMP)).unwrap().relay_on);
        assert_eq!(controller.control(&mac(LAMP)).unwrap().switch_state, SwitchState::Off);
        let events = drain(&mut handle);
        let last = statuses(&events, LAMP).pop().unwrap();
        assert_eq!(last.switch, SwitchState::Off);
        assert_eq!(last.switchreq, SwitchState::Off);
    }

    #[tokio::test]
    async fn test_schedule_uploaded_once() {
        let (mut controller, _handle, sim) = setup();
        controller.startup(at(9, 15, 0)).await.unwrap();
        let control = Control { schedule: "__PW2PY__test-10".into(), ..Control::new(mac(LAMP)) };

        controller.update_controls(vec![control.clone()]).await;
        let commits = sim.stats().requests(FunctionCode::CommitSchedule);
        assert_eq!(commits, 42);
        let crc = controller.circle(&mac(LAMP)).unwrap().schedule().unwrap().crc();
        assert_eq!(sim.circle(&mac(LAMP)).unwrap().schedule_crc(), crc);

        // same schedule, same checksum: nothing to upload
        controller.update_controls(vec![control]).await;
        assert_eq!(sim.stats().requests(FunctionCode::CommitSchedule), commits);

        // removing it restores the always-on schedule
        controller.update_controls(vec![Control::new(mac(LAMP))]).await;
        assert_eq!(sim.circle(&mac(LAMP)).unwrap().schedule_crc(), ALWAYS_ON_CRC);
        assert!(controller.circle(&mac(LAMP)).unwrap().schedule().is_none());
    }

    #[tokio::test]
    async fn test_schedule_state_without_schedule_is_forced_off() {
        let (mut controller, _handle, sim) = setup();
        controller.startup(at(9, 15, 0)).await.unwrap();
        let control = Control { schedule_state: SwitchState::On, ..Control::new(mac(LAMP)) };
        controller.update_controls(vec![control]).await;
        assert_eq!(controller.control(&mac(LAMP)).unwrap().schedule_state, SwitchState::Off);
        assert!(!sim.circle(&mac(LAMP)).unwrap().schedule_on);
    }

    #[tokio::test]
    async fn test_unjoined_nodes_checked_against_roster() {
        let (mut controller, _handle, sim) = setup();
        controller.startup(at(9, 15, 0)).await.unwrap();
        let stranger = mac("000D6F0000FFFFFF");
        sim.advertise(mac(LAMP));
        sim.advertise(stranger.clone());

        // advertisements arrive with the next exchange, joins go out on the next minute
        controller.update_controls(vec![Control::new(mac(LAMP))]).await;
        controller.tick(at(9, 15, 10)).await;
        assert!(sim.joined().is_empty());
        controller.tick(at(9, 16, 0)).await;
        assert_eq!(sim.joined(), vec![mac(LAMP)]);
        assert_eq!(sim.stats().requests(FunctionCode::JoinNode), 2);
    }

    #[tokio::test]
    async fn test_history_pulled_on_new_minute() {
        let (mut controller, mut handle, sim) = setup();
        let base = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let hour = |h: i64| Some(base + ChronoDuration::hours(h));
        sim.with_circle(&mac(LAMP), |c| {
            c.set_log_slot(
                0,
                [
                    LogEntry { timestamp: hour(1), pulses: 1_688_179 },
                    LogEntry { timestamp: hour(2), pulses: 1_688_179 },
                    LogEntry { timestamp: None, pulses: 0 },
                    LogEntry { timestamp: None, pulses: 0 },
                ],
            );
        });
        controller.startup(at(9, 15, 0)).await.unwrap();
        controller
            .update_controls(vec![Control { savelog: true, ..Control::new(mac(LAMP)) }])
            .await;
        drain(&mut handle);

        controller.tick(at(9, 15, 10)).await;
        assert!(!drain(&mut handle).iter().any(|e| matches!(e, ControllerEvent::History { .. })));

        controller.tick(at(9, 16, 0)).await;
        let events = drain(&mut handle);
        let rows = events
            .iter()
            .find_map(|e| match e {
                ControllerEvent::History { rows, .. } => Some(rows.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(rows.len(), 2);
        let cursor = events
            .iter()
            .find_map(|e| match e {
                ControllerEvent::Cursor(record) => Some(record.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cursor.mac, mac(LAMP));
        assert_eq!((cursor.index, cursor.sub_index), (0, 2));
        assert!((cursor.cum_energy - 2000.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_restored_cursor_is_used() {
        let (mut controller, _handle, _sim) = setup();
        let record = CursorRecord::from_line(&format!("{}, 17, 2, 0, 12.5", LAMP)).unwrap();
        controller.restore_cursors(vec![record]);
        let lamp = controller.circle(&mac(LAMP)).unwrap();
        assert_eq!(lamp.cursor().index, 17);
        assert_eq!(lamp.cum_energy(), 12.5);
    }
}
