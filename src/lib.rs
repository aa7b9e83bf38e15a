//! # Plugwise - Async Circle/Stick Protocol Engine
//!
//! Control and monitoring of Plugwise Circle and Circle+ power plugs through
//! the USB Stick, in pure async Rust.
//!
//! ## Features
//!
//! - **🔌 Complete Wire Protocol**: ASCII-hex framing, CRC-16 checks and typed
//!   messages for every request the Circles understand
//! - **🔄 Request Correlation**: sequence matching on a noisy half-duplex line,
//!   with pongs and join announcements picked up on the way
//! - **📊 Calibrated Power**: 1 s, 8 s and hourly power with per-device
//!   calibration and polarity
//! - **🗓️ On-Device Schedules**: 672 quarter-hour weekly schedules with
//!   checksum-based change detection and daylight saving rotation
//! - **📜 History**: circular log buffer retrieval with a durable cursor
//! - **🛡️ Offline Recovery**: timeouts take devices offline, pings bring them back
//!
//! ## Supported Function Codes
//!
//! | Request | Reply | Operation |
//! |---------|-------|-----------|
//! | 000A | 0011 | Stick init |
//! | 0008 | 0000 | Enable joining |
//! | 0007 | - | Accept or reject a joining node |
//! | 000D | 000E | Ping |
//! | 0012 | 0013 | Power usage |
//! | 0016 | 0000 | Set clock |
//! | 0017 | 0000 | Switch relay |
//! | 0018 | 0019 | Node table entry |
//! | 001C | 001D | Remove node |
//! | 0023 | 0024 | Device info |
//! | 0026 | 0027 | Calibration |
//! | 0028 | 0000 | Set Circle+ clock |
//! | 0029 | 003A | Circle+ clock |
//! | 003B | - | Stage schedule values |
//! | 003C | 003D | Commit schedule chunk |
//! | 003E | 003F | Clock and schedule checksum |
//! | 0048 | 0049 | Log buffer slot |
//! | 0057 | 0000 | Log interval |
//! | 0058 | 0000 | Schedule on/off |
//! | 0059 | 0000 | Fill schedule with one value |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use plugwise::{Channel, ChannelConfig, Circle, CircleConfig, PlugwiseResult, SerialTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> PlugwiseResult<()> {
//!     let transport = SerialTransport::new("/dev/ttyUSB0", 115_200)?;
//!     let channel = Arc::new(Channel::new(Box::new(transport), ChannelConfig::default()));
//!
//!     let config = CircleConfig::new("000D6F0000B1B64B".parse()?, "fridge");
//!     let mut circle = Circle::new(config, channel);
//!     circle.reinit().await?;
//!
//!     let power = circle.get_power_usage().await?;
//!     println!("fridge uses {:.1} W", power.watts_8s);
//!
//!     circle.switch_off().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Controller (polling loop, commands,      │
//! │ events, schedules, history round-robin)  │
//! └──────────────────────────────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │     Stick       │    │ Circle / Circle+│
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌──────────────────────────────────────────┐
//! │ Channel (one exchange at a time)         │
//! └──────────────────────────────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Protocol      │◄──►│     Codec       │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌──────────────────────────────────────────┐
//! │ Transport (serial port or byte stream)   │
//! └──────────────────────────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Frame layout, checksums and field encodings
pub mod codec;

/// Typed requests and responses
pub mod protocol;

/// Serial and stream transports
pub mod transport;

/// Request/response correlation on the shared channel
pub mod transaction;

/// Communication log
pub mod logging;

/// Calibration and power conversion
pub mod power;

/// Weekly schedule encoding
pub mod schedule;

/// Log buffer history retrieval
pub mod history;

/// Circle and Circle+ device model
pub mod circle;

/// The Stick gateway
pub mod stick;

/// Configuration documents
pub mod config;

/// Polling loop
pub mod controller;

/// In-memory Stick and Circles for tests and demos
pub mod simulator;

/// Utility functions and tick metrics
pub mod utils;

// Re-export main types for convenience
pub use error::{PlugwiseError, PlugwiseResult};
pub use protocol::{AckStatus, DeviceType, FunctionCode, Mac, Request, Response, ResponseBody, ResponseKind};
pub use transport::{SerialTransport, StickTransport, StreamTransport, TransportStats};
pub use transaction::{Channel, ChannelConfig, Exchange};
pub use logging::{CommLogger, CommRecord, LogCallback, LogLevel, LoggingMode};
pub use power::{Calibration, PowerReading};
pub use schedule::Schedule;
pub use history::{HistoryRow, LogCursor};
pub use circle::{Circle, CircleStatus, PingReport, SwitchState};
pub use stick::{Stick, StickStatus};
pub use config::{CircleConfig, Control, ControlFile, ControllerConfig, CursorRecord, ScheduleFile, StaticConfig, StickConfig};
pub use controller::{Command, Controller, ControllerEvent, ControllerHandle, TickTime};
pub use utils::{OperationTimer, TickMetrics};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Plugwise v{} - async Circle/Stick protocol engine", VERSION)
}
