use std::sync::OnceLock;

use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::bluetooth::MonitorEvent;

static LOGGER: OnceLock<HostLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Writes records to stderr and forwards them to the host as events
pub struct HostLogger {
    tx: UnboundedSender<MonitorEvent>,
    level: LevelFilter,
}

impl HostLogger {
    pub fn new(tx: UnboundedSender<MonitorEvent>, level: LevelFilter) -> Self {
        Self { tx, level }
    }

    /// Installs the logger globally. Fails if any logger is already set.
    pub fn init(tx: UnboundedSender<MonitorEvent>, level: LevelFilter) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| HostLogger::new(tx, level));
        log::set_logger(logger).map(|()| log::set_max_level(level))
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        // The host may already be gone during shutdown
        if let Err(e) = self.tx.send(MonitorEvent::Log(log_message)) {
            eprintln!("Failed to emit log message: {:?}", e.0);
        }
    }
}

impl log::Log for HostLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}
