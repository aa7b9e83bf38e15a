use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::decode_frame;
use crate::protocol::FunctionCode;

/// Log levels for the communication log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// Logging mode for frame display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show the frame text only
    Raw,
    /// Show the decoded function and body
    Interpreted,
    /// Show both
    Both,
}

/// Kind of communication log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommRecord {
    /// Frame written to the Stick
    Send,
    /// Frame read from the Stick
    Recv,
    /// Frame that failed to decode
    Rerr,
    /// Bytes before the frame header
    Dstr,
    /// Fragment too short to be a frame
    Dshr,
    /// Firmware trace line
    Dtrc,
    /// Read budget exhausted
    Tout,
}

impl CommRecord {
    pub fn tag(&self) -> &'static str {
        match self {
            CommRecord::Send => "SEND",
            CommRecord::Recv => "RECV",
            CommRecord::Rerr => "RERR",
            CommRecord::Dstr => "DSTR",
            CommRecord::Dshr => "DSHR",
            CommRecord::Dtrc => "DTRC",
            CommRecord::Tout => "TOUT",
        }
    }

    fn level(&self) -> LogLevel {
        match self {
            CommRecord::Send | CommRecord::Recv => LogLevel::Info,
            CommRecord::Rerr | CommRecord::Tout => LogLevel::Warn,
            CommRecord::Dstr | CommRecord::Dshr | CommRecord::Dtrc => LogLevel::Debug,
        }
    }
}

impl fmt::Display for CommRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Communication log with a runtime on/off switch
///
/// Clones share the switch, so a controller can toggle logging for a
/// channel it has already handed its logger to.
#[derive(Clone)]
pub struct CommLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
    enabled: Arc<AtomicBool>,
}

impl CommLogger {
    /// Create a new communication logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Raw)
    }

    /// Create a new communication logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create a logger with timestamped console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}", timestamp, message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}", timestamp, message),
            }
        });
        Self::new(Some(callback), LogLevel::Debug)
    }

    /// Create a logger that forwards to the `log` facade under `plugwise::comm`
    pub fn log_facade() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            log::log!(target: "plugwise::comm", level.to_log(), "{}", message);
        });
        Self::new(Some(callback), LogLevel::Debug)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        let logger = Self::new(None, LogLevel::Error);
        logger.set_enabled(false);
        logger
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Switch logging on or off for this logger and all its clones
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && self.is_enabled() && level as u8 <= self.min_level as u8
    }

    /// Write one record for the bytes seen on the wire
    pub fn record(&self, kind: CommRecord, data: &[u8]) {
        let level = kind.level();
        if !self.should_log(level) {
            return;
        }
        let raw = format_frame_text(data);
        match (self.mode, kind) {
            (LoggingMode::Raw, _) => self.log(level, &format!("{} {}", kind, raw)),
            (_, CommRecord::Send | CommRecord::Recv) => {
                self.log(level, &format!("{} {}", kind, interpret_frame(data)));
                if self.mode == LoggingMode::Both {
                    self.log(LogLevel::Debug, &format!("{} raw {}", kind, raw));
                }
            }
            _ => self.log(level, &format!("{} {}", kind, raw)),
        }
    }

    /// Record a read that ran out of attempts
    pub fn timeout(&self, operation: &str) {
        if self.should_log(CommRecord::Tout.level()) {
            self.log(CommRecord::Tout.level(), &format!("{} {}", CommRecord::Tout, operation));
        }
    }
}

impl Default for CommLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for CommLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommLogger")
            .field("has_callback", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Render wire bytes as text, escaping control bytes and the line ending
pub fn format_frame_text(data: &[u8]) -> String {
    let mut text = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\r' | b'\n' => {}
            0x20..=0x7E => text.push(b as char),
            _ => text.push_str(&format!("\\x{:02X}", b)),
        }
    }
    text
}

fn interpret_frame(data: &[u8]) -> String {
    match decode_frame(data) {
        Ok(frame) => {
            let name = FunctionCode::from_u16(frame.function)
                .map(|f| format!("{:?}", f))
                .unwrap_or_else(|_| "Unknown".to_string());
            format!(
                "{} ({:04X}) {}",
                name,
                frame.function,
                String::from_utf8_lossy(&frame.body)
            )
        }
        Err(e) => format!("undecodable ({}) {}", e, format_frame_text(data)),
    }
}

/// Convenience macro for creating a console communication logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CommLogger::console()
    };
}

/// Convenience macro for creating a custom communication logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CommLogger::new(Some($callback), $crate::logging::LogLevel::Debug)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CommLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CommLogger::with_mode(Some($callback), $level, $mode)
    };
}
