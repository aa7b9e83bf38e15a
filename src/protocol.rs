/// Plugwise protocol definitions and message types
///
/// Requests and responses are closed enums with one variant per function
/// code. Encoding goes through [`FieldWriter`], decoding through
/// [`FieldReader`]; every response layout has a fixed length and anything
/// else is rejected as malformed.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::codec::{decode_frame, encode_frame, FieldReader, FieldWriter, LOGADDR_OFFSET};
use crate::error::{PlugwiseError, PlugwiseResult};
use crate::power::Calibration;

/// Number of hex digits in a device address
pub const MAC_LEN: usize = 16;

/// Hardware address of a Stick or Circle (16 upper-case hex digits)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mac(String);

impl Mac {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Mac {
    type Err = PlugwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != MAC_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PlugwiseError::value(format!(
                "MAC address is in unexpected format: '{}'",
                s
            )));
        }
        Ok(Mac(s.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for Mac {
    type Error = PlugwiseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Mac> for String {
    fn from(mac: Mac) -> Self {
        mac.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Plugwise function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FunctionCode {
    /// Acknowledgement, with or without address (0x0000)
    Ack = 0x0000,
    /// Unsolicited: unjoined node advertising itself (0x0006)
    NodeAdvertise = 0x0006,
    /// Accept or reject a joining node (0x0007)
    JoinNode = 0x0007,
    /// Open or close the network for joining (0x0008)
    EnableJoining = 0x0008,
    /// Stick initialisation (0x000A)
    StickInit = 0x000A,
    /// Ping (0x000D)
    Ping = 0x000D,
    /// Ping reply (0x000E)
    PingReply = 0x000E,
    /// Stick status (0x0011)
    StickStatus = 0x0011,
    /// Power usage request (0x0012)
    PowerUsage = 0x0012,
    /// Power usage reply (0x0013)
    PowerUsageReply = 0x0013,
    /// Set Circle clock (0x0016)
    ClockSet = 0x0016,
    /// Relay switch (0x0017)
    Switch = 0x0017,
    /// Read Circle+ node table entry (0x0018)
    NodeTable = 0x0018,
    /// Node table entry reply (0x0019)
    NodeTableReply = 0x0019,
    /// Remove node from network (0x001C)
    RemoveNode = 0x001C,
    /// Remove node reply (0x001D)
    RemoveNodeReply = 0x001D,
    /// Device info request (0x0023)
    Info = 0x0023,
    /// Device info reply (0x0024)
    InfoReply = 0x0024,
    /// Calibration request (0x0026)
    Calibration = 0x0026,
    /// Calibration reply (0x0027)
    CalibrationReply = 0x0027,
    /// Set Circle+ real time clock (0x0028)
    CirclePlusClockSet = 0x0028,
    /// Read Circle+ real time clock (0x0029)
    CirclePlusClock = 0x0029,
    /// Circle+ real time clock reply (0x003A)
    CirclePlusClockReply = 0x003A,
    /// Stage schedule values on the Stick (0x003B)
    PrepareSchedule = 0x003B,
    /// Commit staged schedule chunk to a Circle (0x003C)
    CommitSchedule = 0x003C,
    /// Commit reply (0x003D)
    CommitScheduleReply = 0x003D,
    /// Clock and schedule checksum request (0x003E)
    Clock = 0x003E,
    /// Clock reply (0x003F)
    ClockReply = 0x003F,
    /// Log buffer slot request (0x0048)
    LogBuffer = 0x0048,
    /// Log buffer slot reply (0x0049)
    LogBufferReply = 0x0049,
    /// Log interval (0x0057)
    LogInterval = 0x0057,
    /// Enable or disable the on-device schedule (0x0058)
    ScheduleEnable = 0x0058,
    /// Fill the on-device schedule with one value (0x0059)
    ScheduleValue = 0x0059,
    /// Unsolicited: node associating with the network (0x0061)
    NodeAssociate = 0x0061,
}

impl FunctionCode {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> PlugwiseResult<Self> {
        use FunctionCode::*;
        Ok(match value {
            0x0000 => Ack,
            0x0006 => NodeAdvertise,
            0x0007 => JoinNode,
            0x0008 => EnableJoining,
            0x000A => StickInit,
            0x000D => Ping,
            0x000E => PingReply,
            0x0011 => StickStatus,
            0x0012 => PowerUsage,
            0x0013 => PowerUsageReply,
            0x0016 => ClockSet,
            0x0017 => Switch,
            0x0018 => NodeTable,
            0x0019 => NodeTableReply,
            0x001C => RemoveNode,
            0x001D => RemoveNodeReply,
            0x0023 => Info,
            0x0024 => InfoReply,
            0x0026 => Calibration,
            0x0027 => CalibrationReply,
            0x0028 => CirclePlusClockSet,
            0x0029 => CirclePlusClock,
            0x003A => CirclePlusClockReply,
            0x003B => PrepareSchedule,
            0x003C => CommitSchedule,
            0x003D => CommitScheduleReply,
            0x003E => Clock,
            0x003F => ClockReply,
            0x0048 => LogBuffer,
            0x0049 => LogBufferReply,
            0x0057 => LogInterval,
            0x0058 => ScheduleEnable,
            0x0059 => ScheduleValue,
            0x0061 => NodeAssociate,
            other => return Err(PlugwiseError::unknown_function(other)),
        })
    }

    /// Convert to the wire value
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:04X})", self, *self as u16)
    }
}

/// Status carried by acknowledgement frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckStatus {
    /// 00C1: request accepted by the Stick
    Success,
    /// 00C2: request rejected by the Stick
    Error,
    /// 00E1: node unreachable, or a late status for an earlier request
    Unreachable,
    /// 00D7: Circle clock set
    ClockSet,
    /// 00D8: relay switched on
    SwitchedOn,
    /// 00DE: relay switched off
    SwitchedOff,
    /// 00DF: Circle+ clock accepted
    CirclePlusClockAccepted,
    /// 00E7: Circle+ clock rejected
    CirclePlusClockRejected,
    /// 00E4: schedule enabled
    ScheduleOn,
    /// 00E5: schedule disabled
    ScheduleOff,
    /// 00F8: log interval set
    LogIntervalSet,
    /// 00FA: schedule filled with a single value
    ScheduleValueSet,
    /// Any status without a known meaning
    Other(u16),
}

impl AckStatus {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x00C1 => AckStatus::Success,
            0x00C2 => AckStatus::Error,
            0x00E1 => AckStatus::Unreachable,
            0x00D7 => AckStatus::ClockSet,
            0x00D8 => AckStatus::SwitchedOn,
            0x00DE => AckStatus::SwitchedOff,
            0x00DF => AckStatus::CirclePlusClockAccepted,
            0x00E7 => AckStatus::CirclePlusClockRejected,
            0x00E4 => AckStatus::ScheduleOn,
            0x00E5 => AckStatus::ScheduleOff,
            0x00F8 => AckStatus::LogIntervalSet,
            0x00FA => AckStatus::ScheduleValueSet,
            other => AckStatus::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            AckStatus::Success => 0x00C1,
            AckStatus::Error => 0x00C2,
            AckStatus::Unreachable => 0x00E1,
            AckStatus::ClockSet => 0x00D7,
            AckStatus::SwitchedOn => 0x00D8,
            AckStatus::SwitchedOff => 0x00DE,
            AckStatus::CirclePlusClockAccepted => 0x00DF,
            AckStatus::CirclePlusClockRejected => 0x00E7,
            AckStatus::ScheduleOn => 0x00E4,
            AckStatus::ScheduleOff => 0x00E5,
            AckStatus::LogIntervalSet => 0x00F8,
            AckStatus::ScheduleValueSet => 0x00FA,
            AckStatus::Other(v) => v,
        }
    }
}

/// Device type reported in the info reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Stick,
    #[serde(rename = "circle+")]
    CirclePlus,
    Circle,
    Unknown,
}

impl DeviceType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => DeviceType::Stick,
            1 => DeviceType::CirclePlus,
            2 => DeviceType::Circle,
            _ => DeviceType::Unknown,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            DeviceType::Stick => 0,
            DeviceType::CirclePlus => 1,
            DeviceType::Circle => 2,
            DeviceType::Unknown => 0xFF,
        }
    }
}

/// Raw pulse counters from a power usage reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PulseCounters {
    pub pulse_1s: i64,
    pub pulse_8s: i64,
    pub pulse_1h: i64,
    pub pulse_prod_1h: i64,
}

/// Contents of the device info reply
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub datetime: Option<NaiveDateTime>,
    /// Slot currently being written in the circular log buffer
    pub last_logaddr: u32,
    pub relay_on: bool,
    /// Mains frequency in Hz, when recognised
    pub hz: Option<u8>,
    pub hw_version: String,
    /// Firmware build time as a Unix timestamp
    pub fw_version: u32,
    pub device_type: DeviceType,
}

/// Contents of the clock reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockInfo {
    pub time: chrono::NaiveTime,
    pub day_of_week: u8,
    /// Checksum of the schedule currently stored in the device
    pub schedule_crc: u16,
}

/// One timestamped pulse count inside a log buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// `None` for entries the device has not written yet
    pub timestamp: Option<NaiveDateTime>,
    pub pulses: i64,
}

/// A log buffer slot: four entries plus the slot address echoed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSlot {
    pub entries: [LogEntry; 4],
    pub index: u32,
}

/// Requests sent to the Stick
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    StickInit,
    EnableJoining { enabled: bool },
    JoinNode { node: Mac, accept: bool },
    Ping { mac: Mac },
    PowerUsage { mac: Mac },
    SetClock { mac: Mac, at: NaiveDateTime },
    Switch { mac: Mac, on: bool },
    NodeTable { mac: Mac, index: u8 },
    RemoveNode { mac: Mac, node: Mac },
    Info { mac: Mac },
    Calibration { mac: Mac },
    SetCirclePlusClock { mac: Mac, at: NaiveDateTime },
    CirclePlusClock { mac: Mac },
    /// Stage eight encoded schedule values in the Stick's buffer
    PrepareSchedule { chunk: u8, values: [i16; 8] },
    /// Copy two staged groups into the Circle; chunks run 1..=42
    CommitSchedule { mac: Mac, chunk: u8 },
    Clock { mac: Mac },
    LogBuffer { mac: Mac, index: u32 },
    LogInterval { mac: Mac, usage: u16, production: u16 },
    ScheduleEnable { mac: Mac, on: bool },
    ScheduleValue { mac: Mac, value: i16 },
}

/// Staging area address of schedule group 0 in the Stick
///
/// Staging shares its base with the log buffer addresses, 0x44000.
pub const SCHEDULE_STAGING_BASE: u32 = LOGADDR_OFFSET;

/// Bytes per staged schedule group: eight 16-bit values, packed
///
/// Two groups fill one 32 byte record, which is what each commit copies.
pub const SCHEDULE_STAGING_STRIDE: u32 = 16;

impl Request {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Request::StickInit => FunctionCode::StickInit,
            Request::EnableJoining { .. } => FunctionCode::EnableJoining,
            Request::JoinNode { .. } => FunctionCode::JoinNode,
            Request::Ping { .. } => FunctionCode::Ping,
            Request::PowerUsage { .. } => FunctionCode::PowerUsage,
            Request::SetClock { .. } => FunctionCode::ClockSet,
            Request::Switch { .. } => FunctionCode::Switch,
            Request::NodeTable { .. } => FunctionCode::NodeTable,
            Request::RemoveNode { .. } => FunctionCode::RemoveNode,
            Request::Info { .. } => FunctionCode::Info,
            Request::Calibration { .. } => FunctionCode::Calibration,
            Request::SetCirclePlusClock { .. } => FunctionCode::CirclePlusClockSet,
            Request::CirclePlusClock { .. } => FunctionCode::CirclePlusClock,
            Request::PrepareSchedule { .. } => FunctionCode::PrepareSchedule,
            Request::CommitSchedule { .. } => FunctionCode::CommitSchedule,
            Request::Clock { .. } => FunctionCode::Clock,
            Request::LogBuffer { .. } => FunctionCode::LogBuffer,
            Request::LogInterval { .. } => FunctionCode::LogInterval,
            Request::ScheduleEnable { .. } => FunctionCode::ScheduleEnable,
            Request::ScheduleValue { .. } => FunctionCode::ScheduleValue,
        }
    }

    /// Address written in the frame header, if any
    pub fn target(&self) -> Option<&Mac> {
        match self {
            Request::StickInit
            | Request::EnableJoining { .. }
            | Request::JoinNode { .. }
            | Request::PrepareSchedule { .. } => None,
            Request::Ping { mac }
            | Request::PowerUsage { mac }
            | Request::SetClock { mac, .. }
            | Request::Switch { mac, .. }
            | Request::NodeTable { mac, .. }
            | Request::RemoveNode { mac, .. }
            | Request::Info { mac }
            | Request::Calibration { mac }
            | Request::SetCirclePlusClock { mac, .. }
            | Request::CirclePlusClock { mac }
            | Request::CommitSchedule { mac, .. }
            | Request::Clock { mac }
            | Request::LogBuffer { mac, .. }
            | Request::LogInterval { mac, .. }
            | Request::ScheduleEnable { mac, .. }
            | Request::ScheduleValue { mac, .. } => Some(mac),
        }
    }

    /// Reply the device sends once the Stick has accepted the request
    pub fn expected_reply(&self) -> ResponseKind {
        match self {
            Request::StickInit => ResponseKind::StickStatus,
            Request::Ping { .. } => ResponseKind::PingReply,
            Request::PowerUsage { .. } => ResponseKind::PowerUsage,
            Request::NodeTable { .. } => ResponseKind::NodeTable,
            Request::RemoveNode { .. } => ResponseKind::RemoveNode,
            Request::Info { .. } => ResponseKind::Info,
            Request::Calibration { .. } => ResponseKind::Calibration,
            Request::CirclePlusClock { .. } => ResponseKind::CirclePlusClock,
            Request::CommitSchedule { .. } => ResponseKind::CommitSchedule,
            Request::Clock { .. } => ResponseKind::Clock,
            Request::LogBuffer { .. } => ResponseKind::LogBuffer,
            Request::PrepareSchedule { .. } | Request::JoinNode { .. } => ResponseKind::Ack,
            Request::EnableJoining { .. }
            | Request::SetClock { .. }
            | Request::Switch { .. }
            | Request::SetCirclePlusClock { .. }
            | Request::LogInterval { .. }
            | Request::ScheduleEnable { .. }
            | Request::ScheduleValue { .. } => ResponseKind::AckMac,
        }
    }

    /// Serialize into a complete wire frame
    ///
    /// Requests carry no sequence counter; the Stick assigns one and
    /// reports it in its acknowledgement.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(mac) = self.target() {
            w.string(mac.as_str(), MAC_LEN);
        }
        match self {
            Request::EnableJoining { enabled } => {
                w.uint(*enabled as u64, 2);
            }
            Request::JoinNode { node, accept } => {
                w.uint(*accept as u64, 2).string(node.as_str(), MAC_LEN);
            }
            Request::SetClock { at, .. } => {
                w.datetime(at).string("FFFFFFFF", 8).time(&at.time());
                w.uint(at.weekday().num_days_from_monday() as u64, 2);
            }
            Request::Switch { on, .. } | Request::ScheduleEnable { on, .. } => {
                w.uint(*on as u64, 2);
            }
            Request::NodeTable { index, .. } => {
                w.uint(*index as u64, 2);
            }
            Request::RemoveNode { node, .. } => {
                w.string(node.as_str(), MAC_LEN);
            }
            Request::SetCirclePlusClock { at, .. } => {
                w.clock_time(&at.time())
                    .uint(at.weekday().num_days_from_monday() as u64, 2)
                    .clock_date(&at.date());
            }
            Request::PrepareSchedule { chunk, values } => {
                w.uint(
                    (SCHEDULE_STAGING_BASE + *chunk as u32 * SCHEDULE_STAGING_STRIDE) as u64,
                    8,
                );
                for v in values {
                    w.sint(*v as i64, 4);
                }
            }
            Request::CommitSchedule { chunk, .. } => {
                w.uint(*chunk as u64, 4);
            }
            Request::LogBuffer { index, .. } => {
                w.log_addr(*index);
            }
            Request::LogInterval { usage, production, .. } => {
                w.uint(*usage as u64, 4).uint(*production as u64, 4);
            }
            Request::ScheduleValue { value, .. } => {
                w.sint(*value as i64, 4);
            }
            Request::StickInit
            | Request::Ping { .. }
            | Request::PowerUsage { .. }
            | Request::Info { .. }
            | Request::Calibration { .. }
            | Request::CirclePlusClock { .. }
            | Request::Clock { .. } => {}
        }
        encode_frame(self.function_code().to_u16(), w.as_str())
    }

    /// Parse a request frame, as a Stick would
    pub fn decode(raw: &[u8]) -> PlugwiseResult<Request> {
        let frame = decode_frame(raw)?;
        let function = FunctionCode::from_u16(frame.function)?;
        let mut r = FieldReader::new(&frame.body);

        let request = match function {
            FunctionCode::StickInit => Request::StickInit,
            FunctionCode::EnableJoining => Request::EnableJoining { enabled: r.uint(2)? == 1 },
            FunctionCode::JoinNode => {
                let accept = r.uint(2)? == 1;
                Request::JoinNode { node: r.string(MAC_LEN)?.parse()?, accept }
            }
            FunctionCode::PrepareSchedule => {
                let address = r.uint(8)? as u32;
                let offset = address
                    .checked_sub(SCHEDULE_STAGING_BASE)
                    .filter(|o| o % SCHEDULE_STAGING_STRIDE == 0)
                    .ok_or_else(|| {
                        PlugwiseError::protocol(format!("bad staging address {:08X}", address))
                    })?;
                let mut values = [0i16; 8];
                for v in values.iter_mut() {
                    *v = r.sint(4)? as i16;
                }
                Request::PrepareSchedule { chunk: (offset / SCHEDULE_STAGING_STRIDE) as u8, values }
            }
            _ => {
                let mac: Mac = r.string(MAC_LEN)?.parse()?;
                match function {
                    FunctionCode::Ping => Request::Ping { mac },
                    FunctionCode::PowerUsage => Request::PowerUsage { mac },
                    FunctionCode::ClockSet => {
                        let date = r
                            .datetime()?
                            .ok_or_else(|| PlugwiseError::protocol("clock set without a date"))?
                            .date();
                        let _reserved = r.string(8)?;
                        let time = r.time()?;
                        let _weekday = r.uint(2)?;
                        Request::SetClock { mac, at: date.and_time(time) }
                    }
                    FunctionCode::Switch => Request::Switch { mac, on: r.uint(2)? == 1 },
                    FunctionCode::NodeTable => Request::NodeTable { mac, index: r.uint(2)? as u8 },
                    FunctionCode::RemoveNode => {
                        Request::RemoveNode { mac, node: r.string(MAC_LEN)?.parse()? }
                    }
                    FunctionCode::Info => Request::Info { mac },
                    FunctionCode::Calibration => Request::Calibration { mac },
                    FunctionCode::CirclePlusClockSet => {
                        let time = r.clock_time()?;
                        let _weekday = r.uint(2)?;
                        let date = r.clock_date()?;
                        Request::SetCirclePlusClock { mac, at: date.and_time(time) }
                    }
                    FunctionCode::CirclePlusClock => Request::CirclePlusClock { mac },
                    FunctionCode::CommitSchedule => {
                        Request::CommitSchedule { mac, chunk: r.uint(4)? as u8 }
                    }
                    FunctionCode::Clock => Request::Clock { mac },
                    FunctionCode::LogBuffer => Request::LogBuffer { mac, index: r.log_addr()? },
                    FunctionCode::LogInterval => Request::LogInterval {
                        mac,
                        usage: r.uint(4)? as u16,
                        production: r.uint(4)? as u16,
                    },
                    FunctionCode::ScheduleEnable => Request::ScheduleEnable { mac, on: r.uint(2)? == 1 },
                    FunctionCode::ScheduleValue => Request::ScheduleValue { mac, value: r.sint(4)? as i16 },
                    other => {
                        return Err(PlugwiseError::protocol(format!(
                            "function {} is not a request",
                            other
                        )))
                    }
                }
            }
        };
        r.finish()?;
        Ok(request)
    }
}

/// Shape of a response, used to say what a caller is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Ack,
    AckMac,
    NodeAdvertise,
    NodeAssociate,
    StickStatus,
    PingReply,
    PowerUsage,
    NodeTable,
    RemoveNode,
    Info,
    Calibration,
    CirclePlusClock,
    CommitSchedule,
    Clock,
    LogBuffer,
}

impl ResponseKind {
    pub fn function_code(self) -> FunctionCode {
        match self {
            ResponseKind::Ack | ResponseKind::AckMac => FunctionCode::Ack,
            ResponseKind::NodeAdvertise => FunctionCode::NodeAdvertise,
            ResponseKind::NodeAssociate => FunctionCode::NodeAssociate,
            ResponseKind::StickStatus => FunctionCode::StickStatus,
            ResponseKind::PingReply => FunctionCode::PingReply,
            ResponseKind::PowerUsage => FunctionCode::PowerUsageReply,
            ResponseKind::NodeTable => FunctionCode::NodeTableReply,
            ResponseKind::RemoveNode => FunctionCode::RemoveNodeReply,
            ResponseKind::Info => FunctionCode::InfoReply,
            ResponseKind::Calibration => FunctionCode::CalibrationReply,
            ResponseKind::CirclePlusClock => FunctionCode::CirclePlusClockReply,
            ResponseKind::CommitSchedule => FunctionCode::CommitScheduleReply,
            ResponseKind::Clock => FunctionCode::ClockReply,
            ResponseKind::LogBuffer => FunctionCode::LogBufferReply,
        }
    }
}

/// Typed payload of a response
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Ack { status: AckStatus },
    AckMac { status: AckStatus },
    NodeAdvertise,
    NodeAssociate,
    StickStatus {
        network_online: bool,
        /// `None` in the short form sent when no Circle+ is connected
        network_id: Option<u64>,
        short_id: Option<u16>,
    },
    PingReply { rssi_in: u8, rssi_out: u8, ping_ms: u16 },
    PowerUsage(PulseCounters),
    NodeTable { node: Option<Mac>, index: u8 },
    RemoveNode { node: Mac, removed: bool },
    Info(DeviceInfo),
    Calibration(Calibration),
    CirclePlusClock { at: NaiveDateTime, day_of_week: u8 },
    CommitSchedule { chunk: u16 },
    Clock(ClockInfo),
    LogBuffer(LogSlot),
}

/// A decoded response frame
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub seq: u16,
    /// Source address; absent on plain acknowledgements
    pub mac: Option<Mac>,
    pub body: ResponseBody,
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match &self.body {
            ResponseBody::Ack { .. } => ResponseKind::Ack,
            ResponseBody::AckMac { .. } => ResponseKind::AckMac,
            ResponseBody::NodeAdvertise => ResponseKind::NodeAdvertise,
            ResponseBody::NodeAssociate => ResponseKind::NodeAssociate,
            ResponseBody::StickStatus { .. } => ResponseKind::StickStatus,
            ResponseBody::PingReply { .. } => ResponseKind::PingReply,
            ResponseBody::PowerUsage(_) => ResponseKind::PowerUsage,
            ResponseBody::NodeTable { .. } => ResponseKind::NodeTable,
            ResponseBody::RemoveNode { .. } => ResponseKind::RemoveNode,
            ResponseBody::Info(_) => ResponseKind::Info,
            ResponseBody::Calibration(_) => ResponseKind::Calibration,
            ResponseBody::CirclePlusClock { .. } => ResponseKind::CirclePlusClock,
            ResponseBody::CommitSchedule { .. } => ResponseKind::CommitSchedule,
            ResponseBody::Clock(_) => ResponseKind::Clock,
            ResponseBody::LogBuffer(_) => ResponseKind::LogBuffer,
        }
    }

    /// Acknowledgement status, for either acknowledgement shape
    pub fn ack_status(&self) -> Option<AckStatus> {
        match self.body {
            ResponseBody::Ack { status } | ResponseBody::AckMac { status } => Some(status),
            _ => None,
        }
    }

    /// Decode and validate a raw frame
    pub fn decode(raw: &[u8]) -> PlugwiseResult<Response> {
        let frame = decode_frame(raw)?;
        let function = FunctionCode::from_u16(frame.function)?;
        let mut r = FieldReader::new(&frame.body);
        let seq = r.uint(4)? as u16;

        if function == FunctionCode::Ack {
            let status = AckStatus::from_u16(r.uint(4)? as u16);
            return match r.remaining() {
                0 => Ok(Response { seq, mac: None, body: ResponseBody::Ack { status } }),
                MAC_LEN => {
                    let mac = r.string(MAC_LEN)?.parse()?;
                    Ok(Response { seq, mac: Some(mac), body: ResponseBody::AckMac { status } })
                }
                n => Err(PlugwiseError::protocol(format!(
                    "acknowledgement has unexpected length {}",
                    n
                ))),
            };
        }

        let mac: Mac = r.string(MAC_LEN)?.parse()?;
        let body = match function {
            FunctionCode::NodeAdvertise => ResponseBody::NodeAdvertise,
            FunctionCode::NodeAssociate => ResponseBody::NodeAssociate,
            FunctionCode::StickStatus => {
                let _unknown = r.uint(2)?;
                let network_online = r.uint(2)? == 1;
                if r.remaining() == 0 {
                    ResponseBody::StickStatus { network_online, network_id: None, short_id: None }
                } else {
                    let network_id = r.uint(16)?;
                    let short_id = r.uint(4)? as u16;
                    let _unknown = r.uint(2)?;
                    ResponseBody::StickStatus {
                        network_online,
                        network_id: Some(network_id),
                        short_id: Some(short_id),
                    }
                }
            }
            FunctionCode::PingReply => ResponseBody::PingReply {
                rssi_in: r.uint(2)? as u8,
                rssi_out: r.uint(2)? as u8,
                ping_ms: r.uint(4)? as u16,
            },
            FunctionCode::PowerUsageReply => {
                let counters = PulseCounters {
                    pulse_1s: r.sint(4)?,
                    pulse_8s: r.sint(4)?,
                    pulse_1h: r.sint(8)?,
                    pulse_prod_1h: r.sint(8)?,
                };
                let _unknown = r.uint(4)?;
                ResponseBody::PowerUsage(counters)
            }
            FunctionCode::NodeTableReply => {
                let raw = r.string(MAC_LEN)?;
                let node = if raw.bytes().all(|b| b == b'F') { None } else { Some(raw.parse()?) };
                ResponseBody::NodeTable { node, index: r.uint(2)? as u8 }
            }
            FunctionCode::RemoveNodeReply => ResponseBody::RemoveNode {
                node: r.string(MAC_LEN)?.parse()?,
                removed: r.uint(2)? == 1,
            },
            FunctionCode::InfoReply => {
                let datetime = r.datetime()?;
                let last_logaddr = r.log_addr()?;
                let relay_on = r.uint(2)? == 1;
                let hz = match r.uint(2)? {
                    133 => Some(50),
                    197 => Some(60),
                    _ => None,
                };
                ResponseBody::Info(DeviceInfo {
                    datetime,
                    last_logaddr,
                    relay_on,
                    hz,
                    hw_version: r.string(12)?,
                    fw_version: r.uint(8)? as u32,
                    device_type: DeviceType::from_u8(r.uint(2)? as u8),
                })
            }
            FunctionCode::CalibrationReply => ResponseBody::Calibration(Calibration {
                gain_a: r.float()? as f64,
                gain_b: r.float()? as f64,
                off_tot: r.float()? as f64,
                off_noise: r.float()? as f64,
            }),
            FunctionCode::CirclePlusClockReply => {
                let time = r.clock_time()?;
                let day_of_week = r.uint(2)? as u8;
                let date = r.clock_date()?;
                ResponseBody::CirclePlusClock { at: date.and_time(time), day_of_week }
            }
            FunctionCode::CommitScheduleReply => ResponseBody::CommitSchedule { chunk: r.uint(4)? as u16 },
            FunctionCode::ClockReply => {
                let time = r.time()?;
                let day_of_week = r.uint(2)? as u8;
                let _unknown = r.uint(2)?;
                ResponseBody::Clock(ClockInfo { time, day_of_week, schedule_crc: r.uint(4)? as u16 })
            }
            FunctionCode::LogBufferReply => {
                let mut entries = [LogEntry { timestamp: None, pulses: 0 }; 4];
                for entry in entries.iter_mut() {
                    entry.timestamp = r.datetime()?;
                    entry.pulses = r.sint(8)?;
                }
                ResponseBody::LogBuffer(LogSlot { entries, index: r.log_addr()? })
            }
            other => {
                return Err(PlugwiseError::protocol(format!(
                    "function {} is not a response",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(Response { seq, mac: Some(mac), body })
    }

    /// Serialize back into a wire frame
    ///
    /// Used by simulators and tests; the engine itself only decodes responses.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.uint(self.seq as u64, 4);
        let mac = self.mac.as_ref().map(Mac::as_str).unwrap_or("0000000000000000");
        match &self.body {
            ResponseBody::Ack { status } => {
                w.uint(status.to_u16() as u64, 4);
            }
            ResponseBody::AckMac { status } => {
                w.uint(status.to_u16() as u64, 4).string(mac, MAC_LEN);
            }
            body => {
                w.string(mac, MAC_LEN);
                encode_body(&mut w, body);
            }
        }
        encode_frame(self.kind().function_code().to_u16(), w.as_str())
    }
}

fn encode_body(w: &mut FieldWriter, body: &ResponseBody) {
    match body {
        ResponseBody::Ack { .. }
        | ResponseBody::AckMac { .. }
        | ResponseBody::NodeAdvertise
        | ResponseBody::NodeAssociate => {}
        ResponseBody::StickStatus { network_online, network_id, short_id } => {
            w.uint(0, 2).uint(*network_online as u64, 2);
            if let (Some(id), Some(short)) = (network_id, short_id) {
                w.uint(*id, 16).uint(*short as u64, 4).uint(0, 2);
            }
        }
        ResponseBody::PingReply { rssi_in, rssi_out, ping_ms } => {
            w.uint(*rssi_in as u64, 2).uint(*rssi_out as u64, 2).uint(*ping_ms as u64, 4);
        }
        ResponseBody::PowerUsage(c) => {
            w.sint(c.pulse_1s, 4)
                .sint(c.pulse_8s, 4)
                .sint(c.pulse_1h, 8)
                .sint(c.pulse_prod_1h, 8)
                .uint(0, 4);
        }
        ResponseBody::NodeTable { node, index } => {
            let node = node.as_ref().map(Mac::as_str).unwrap_or("FFFFFFFFFFFFFFFF");
            w.string(node, MAC_LEN).uint(*index as u64, 2);
        }
        ResponseBody::RemoveNode { node, removed } => {
            w.string(node.as_str(), MAC_LEN).uint(*removed as u64, 2);
        }
        ResponseBody::Info(info) => {
            match &info.datetime {
                Some(dt) => w.datetime(dt),
                None => w.string("FFFFFFFF", 8),
            };
            let hz = match info.hz {
                Some(50) => 133,
                Some(60) => 197,
                _ => 0,
            };
            w.log_addr(info.last_logaddr)
                .uint(info.relay_on as u64, 2)
                .uint(hz, 2)
                .string(&info.hw_version, 12)
                .uint(info.fw_version as u64, 8)
                .uint(info.device_type.to_u8() as u64, 2);
        }
        ResponseBody::Calibration(c) => {
            w.float(c.gain_a as f32)
                .float(c.gain_b as f32)
                .float(c.off_tot as f32)
                .float(c.off_noise as f32);
        }
        ResponseBody::CirclePlusClock { at, day_of_week } => {
            w.clock_time(&at.time()).uint(*day_of_week as u64, 2).clock_date(&at.date());
        }
        ResponseBody::CommitSchedule { chunk } => {
            w.uint(*chunk as u64, 4);
        }
        ResponseBody::Clock(c) => {
            w.time(&c.time)
                .uint(c.day_of_week as u64, 2)
                .uint(0, 2)
                .uint(c.schedule_crc as u64, 4);
        }
        ResponseBody::LogBuffer(slot) => {
            for entry in &slot.entries {
                match &entry.timestamp {
                    Some(dt) => w.datetime(dt),
                    None => w.string("FFFFFFFF", 8),
                };
                w.sint(entry.pulses, 8);
            }
            w.log_addr(slot.index);
        }
    }
}
