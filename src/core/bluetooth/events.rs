//! Signals sent from the connection logic to its host

use log::error;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::bluetooth::types::ConnectionState;
use crate::logging::LogMessage;

/// Callbacks invoked by the monitor. Implementations must not block.
pub trait EventSink: Send + Sync {
    /// A heart-rate notification was decoded
    fn on_heart_rate_sample(&self, _bpm: u8) {}

    fn on_connected(&self) {}

    fn on_disconnected(&self) {}

    /// The device registry changed
    fn on_device_list_changed(&self) {}

    fn on_connection_state_changed(&self, _state: ConnectionState) {}
}

/// Event emitted to the host over a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum MonitorEvent {
    HeartRate(u8),
    Connected,
    Disconnected,
    DeviceListChanged,
    ConnectionState(ConnectionState),
    Log(LogMessage),
}

/// Forwards every callback as a [`MonitorEvent`]
#[derive(Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<MonitorEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<MonitorEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: MonitorEvent) {
        if let Err(e) = self.tx.send(event) {
            error!("Failed to emit {:?} event: receiver dropped", e.0);
        }
    }
}

impl EventSink for ChannelSink {
    fn on_heart_rate_sample(&self, bpm: u8) {
        self.emit(MonitorEvent::HeartRate(bpm));
    }

    fn on_connected(&self) {
        self.emit(MonitorEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.emit(MonitorEvent::Disconnected);
    }

    fn on_device_list_changed(&self) {
        self.emit(MonitorEvent::DeviceListChanged);
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        self.emit(MonitorEvent::ConnectionState(state));
    }
}
