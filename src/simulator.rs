/// Simulated Stick with a network of Circles behind it
///
/// Answers request frames the way a real Stick does: a `00C1` acceptance
/// carrying a fresh sequence number, followed by the device reply with the
/// same number. Circles can be made unreachable (`00E1`) or silent to
/// exercise the offline paths. Used by the integration tests and by the
/// monitor binary when no serial port is given.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use chrono::{Datelike, NaiveDateTime};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use crate::codec::LOG_BUFFER_SLOTS;
use crate::error::PlugwiseResult;
use crate::power::Calibration;
use crate::protocol::{
    AckStatus, ClockInfo, DeviceInfo, DeviceType, FunctionCode, LogEntry, LogSlot, Mac,
    PulseCounters, Request, Response, ResponseBody,
};
use crate::schedule::{schedule_checksum, CHUNK_VALUES, SCHEDULE_SLOTS, STAGED_CHUNKS};

/// Highest sequence number handed out before wrapping
const MAX_SEQ: u16 = 0xFFFC;

/// How a simulated Circle answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// Answers every request
    Online,
    /// The Stick reports `00E1` for every request
    Unreachable,
    /// The Stick accepts requests but no reply ever arrives
    Silent,
}

/// State of one simulated Circle
#[derive(Debug, Clone)]
pub struct SimulatedCircle {
    pub mac: Mac,
    pub reachability: Reachability,
    pub device_type: DeviceType,
    pub relay_on: bool,
    pub calibration: Calibration,
    pub counters: PulseCounters,
    pub clock: NaiveDateTime,
    /// Encoded on-device schedule
    pub schedule: Vec<i16>,
    pub schedule_on: bool,
    /// Usage and production log intervals in minutes
    pub log_interval: (u16, u16),
    pub log: BTreeMap<u32, LogSlot>,
    pub last_logaddr: u32,
    /// Circle+ only: joined nodes by table position
    pub node_table: Vec<Mac>,
}

impl SimulatedCircle {
    pub fn new(mac: Mac, clock: NaiveDateTime) -> Self {
        Self {
            mac,
            reachability: Reachability::Online,
            device_type: DeviceType::Circle,
            relay_on: true,
            calibration: Calibration::identity(),
            counters: PulseCounters::default(),
            clock,
            schedule: vec![-1; SCHEDULE_SLOTS],
            schedule_on: false,
            log_interval: (60, 0),
            log: BTreeMap::new(),
            last_logaddr: 0,
            node_table: Vec::new(),
        }
    }

    /// A Circle+ coordinating the given nodes
    pub fn circle_plus(mac: Mac, clock: NaiveDateTime, nodes: Vec<Mac>) -> Self {
        Self {
            device_type: DeviceType::CirclePlus,
            node_table: nodes,
            ..Self::new(mac, clock)
        }
    }

    /// Checksum of the schedule as the device reports it
    pub fn schedule_crc(&self) -> u16 {
        schedule_checksum(&self.schedule)
    }

    /// Store a log buffer slot and make it the one currently written
    pub fn set_log_slot(&mut self, index: u32, entries: [LogEntry; 4]) {
        let index = index % LOG_BUFFER_SLOTS;
        self.log.insert(index, LogSlot { entries, index });
        self.last_logaddr = index;
    }

    fn log_slot(&self, index: u32) -> LogSlot {
        self.log.get(&index).copied().unwrap_or(LogSlot {
            entries: [LogEntry { timestamp: None, pulses: 0 }; 4],
            index,
        })
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            datetime: Some(self.clock),
            last_logaddr: self.last_logaddr,
            relay_on: self.relay_on,
            hz: Some(50),
            hw_version: "000000730007".to_string(),
            fw_version: 0x4E08_44C2,
            device_type: self.device_type,
        }
    }

    /// Answer a request addressed to this Circle
    fn respond(&mut self, request: &Request, staging: &[i16]) -> Option<ResponseBody> {
        let ack = |status| Some(ResponseBody::AckMac { status });
        match request {
            Request::Ping { .. } => Some(ResponseBody::PingReply { rssi_in: 72, rssi_out: 69, ping_ms: 14 }),
            Request::PowerUsage { .. } => Some(ResponseBody::PowerUsage(self.counters)),
            Request::SetClock { at, .. } => {
                self.clock = *at;
                ack(AckStatus::ClockSet)
            }
            Request::Switch { on, .. } => {
                self.relay_on = *on;
                ack(if *on { AckStatus::SwitchedOn } else { AckStatus::SwitchedOff })
            }
            Request::NodeTable { index, .. } => Some(ResponseBody::NodeTable {
                node: self.node_table.get(*index as usize).cloned(),
                index: *index,
            }),
            Request::RemoveNode { node, .. } => {
                let before = self.node_table.len();
                self.node_table.retain(|n| n != node);
                Some(ResponseBody::RemoveNode { node: node.clone(), removed: self.node_table.len() < before })
            }
            Request::Info { .. } => Some(ResponseBody::Info(self.info())),
            Request::Calibration { .. } => Some(ResponseBody::Calibration(self.calibration)),
            Request::SetCirclePlusClock { at, .. } => {
                if self.device_type != DeviceType::CirclePlus {
                    return ack(AckStatus::CirclePlusClockRejected);
                }
                self.clock = *at;
                ack(AckStatus::CirclePlusClockAccepted)
            }
            Request::CirclePlusClock { .. } => Some(ResponseBody::CirclePlusClock {
                at: self.clock,
                day_of_week: self.clock.weekday().num_days_from_monday() as u8,
            }),
            Request::CommitSchedule { chunk, .. } => {
                // each commit copies two staged groups
                let start = (*chunk as usize).saturating_sub(1) * 2 * CHUNK_VALUES;
                let end = (start + 2 * CHUNK_VALUES).min(SCHEDULE_SLOTS);
                if start < end {
                    self.schedule[start..end].copy_from_slice(&staging[start..end]);
                }
                Some(ResponseBody::CommitSchedule { chunk: *chunk as u16 })
            }
            Request::Clock { .. } => Some(ResponseBody::Clock(ClockInfo {
                time: self.clock.time(),
                day_of_week: self.clock.weekday().num_days_from_monday() as u8,
                schedule_crc: self.schedule_crc(),
            })),
            Request::LogBuffer { index, .. } => Some(ResponseBody::LogBuffer(self.log_slot(*index))),
            Request::LogInterval { usage, production, .. } => {
                self.log_interval = (*usage, *production);
                ack(AckStatus::LogIntervalSet)
            }
            Request::ScheduleEnable { on, .. } => {
                self.schedule_on = *on;
                ack(if *on { AckStatus::ScheduleOn } else { AckStatus::ScheduleOff })
            }
            Request::ScheduleValue { value, .. } => {
                self.schedule.iter_mut().for_each(|v| *v = *value);
                ack(AckStatus::ScheduleValueSet)
            }
            Request::StickInit
            | Request::EnableJoining { .. }
            | Request::JoinNode { .. }
            | Request::PrepareSchedule { .. } => None,
        }
    }
}

/// Counters kept by the simulator
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bad_frames: u64,
    requests: HashMap<FunctionCode, u64>,
}

impl SimulatorStats {
    /// Number of requests seen with the given function code
    pub fn requests(&self, function: FunctionCode) -> u64 {
        self.requests.get(&function).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct NetworkState {
    circles: BTreeMap<Mac, SimulatedCircle>,
    staging: Vec<i16>,
    seq: u16,
    unsolicited: Vec<Response>,
    joining_enabled: bool,
    joined: Vec<Mac>,
    stats: SimulatorStats,
}

impl NetworkState {
    fn next_seq(&mut self) -> u16 {
        self.seq = if self.seq >= MAX_SEQ { 0 } else { self.seq + 1 };
        self.seq
    }
}

/// A Stick and its Circles, shared between the serving task and the test
#[derive(Debug, Clone)]
pub struct SimulatedStick {
    mac: Mac,
    state: Arc<RwLock<NetworkState>>,
}

impl SimulatedStick {
    pub fn new(mac: Mac) -> Self {
        Self {
            mac,
            state: Arc::new(RwLock::new(NetworkState {
                circles: BTreeMap::new(),
                staging: vec![0; STAGED_CHUNKS * CHUNK_VALUES],
                seq: 0,
                unsolicited: Vec::new(),
                joining_enabled: false,
                joined: Vec::new(),
                stats: SimulatorStats::default(),
            })),
        }
    }

    pub fn mac(&self) -> &Mac {
        &self.mac
    }

    fn lock(&self) -> RwLockWriteGuard<'_, NetworkState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_circle(&self, circle: SimulatedCircle) {
        self.lock().circles.insert(circle.mac.clone(), circle);
    }

    /// Inspect or change one Circle; `None` if it does not exist
    pub fn with_circle<T>(&self, mac: &Mac, f: impl FnOnce(&mut SimulatedCircle) -> T) -> Option<T> {
        self.lock().circles.get_mut(mac).map(f)
    }

    /// Snapshot of one Circle
    pub fn circle(&self, mac: &Mac) -> Option<SimulatedCircle> {
        self.lock().circles.get(mac).cloned()
    }

    pub fn set_reachability(&self, mac: &Mac, reachability: Reachability) {
        self.with_circle(mac, |c| c.reachability = reachability);
    }

    /// Queue a node advertisement, written ahead of the next reply
    pub fn advertise(&self, node: Mac) {
        let mut state = self.lock();
        let seq = state.next_seq();
        state.unsolicited.push(Response { seq, mac: Some(node), body: ResponseBody::NodeAdvertise });
    }

    pub fn joining_enabled(&self) -> bool {
        self.lock().joining_enabled
    }

    /// Nodes accepted through join requests
    pub fn joined(&self) -> Vec<Mac> {
        self.lock().joined.clone()
    }

    pub fn stats(&self) -> SimulatorStats {
        self.lock().stats.clone()
    }

    /// Serve the host side of `stream` on a background task
    pub fn spawn<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let stick = self.clone();
        tokio::spawn(async move {
            if let Err(e) = stick.serve(stream).await {
                debug!("simulated Stick stopped: {}", e);
            }
        })
    }

    /// Answer request frames until the host closes the line
    pub async fn serve<S>(&self, stream: S) -> PlugwiseResult<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        info!("🚀 simulated Stick {} serving", self.mac);
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                info!("🔌 host closed the simulated Stick line");
                return Ok(());
            }
            for frame in self.handle_frame(&line) {
                writer.write_all(&frame).await?;
            }
            writer.flush().await?;
        }
    }

    /// Encoded frames written in answer to one request frame
    pub fn handle_frame(&self, raw: &[u8]) -> Vec<Vec<u8>> {
        let mut state = self.lock();
        state.stats.frames_received += 1;

        let request = match Request::decode(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!("simulated Stick rejecting frame: {}", e);
                state.stats.bad_frames += 1;
                let seq = state.next_seq();
                state.stats.frames_sent += 1;
                return vec![Self::ack(seq, AckStatus::Error).encode()];
            }
        };
        *state.stats.requests.entry(request.function_code()).or_default() += 1;

        let seq = state.next_seq();
        let mut replies = std::mem::take(&mut state.unsolicited);
        replies.push(Self::ack(seq, AckStatus::Success));
        replies.extend(self.answer(&mut state, seq, &request));

        state.stats.frames_sent += replies.len() as u64;
        replies.iter().map(Response::encode).collect()
    }

    fn ack(seq: u16, status: AckStatus) -> Response {
        Response { seq, mac: None, body: ResponseBody::Ack { status } }
    }

    fn answer(&self, state: &mut NetworkState, seq: u16, request: &Request) -> Option<Response> {
        match request {
            Request::StickInit => {
                let network_id = state
                    .circles
                    .values()
                    .find(|c| c.device_type == DeviceType::CirclePlus)
                    .and_then(|c| u64::from_str_radix(c.mac.as_str(), 16).ok());
                let body = ResponseBody::StickStatus {
                    network_online: network_id.is_some(),
                    network_id,
                    short_id: network_id.map(|id| id as u16),
                };
                Some(Response { seq, mac: Some(self.mac.clone()), body })
            }
            Request::EnableJoining { enabled } => {
                state.joining_enabled = *enabled;
                Some(Response {
                    seq,
                    mac: Some(self.mac.clone()),
                    body: ResponseBody::AckMac { status: AckStatus::Success },
                })
            }
            Request::JoinNode { node, accept } => {
                if *accept {
                    state.joined.push(node.clone());
                    if let Some(plus) = state
                        .circles
                        .values_mut()
                        .find(|c| c.device_type == DeviceType::CirclePlus)
                    {
                        plus.node_table.push(node.clone());
                    }
                }
                None
            }
            Request::PrepareSchedule { chunk, values } => {
                let start = *chunk as usize * CHUNK_VALUES;
                if let Some(slot) = state.staging.get_mut(start..start + CHUNK_VALUES) {
                    slot.copy_from_slice(values);
                }
                None
            }
            _ => {
                let mac = request.target()?;
                let NetworkState { circles, staging, .. } = state;
                let Some(circle) = circles.get_mut(mac) else {
                    return Some(Self::ack(seq, AckStatus::Unreachable));
                };
                match circle.reachability {
                    Reachability::Unreachable => Some(Self::ack(seq, AckStatus::Unreachable)),
                    Reachability::Silent => None,
                    Reachability::Online => circle
                        .respond(request, staging)
                        .map(|body| Response { seq, mac: Some(mac.clone()), body }),
                }
            }
        }
    }
}
