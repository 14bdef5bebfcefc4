//! Bluetooth functionality for the heart-rate bridge
//! This module handles scanning for heart-rate sensors, naming them,
//! subscribing to their measurements and reconnecting after link loss.

mod bluest_transport;
mod connection;
mod constants;
mod error;
mod events;
mod guard;
mod manager;
mod notification;
mod registry;
mod resolver;
mod scanner;
mod subscription;
mod transport;
mod types;

#[cfg(test)]
mod mock;

// Re-export types that should be publicly accessible
pub use bluest_transport::BluestTransport;
pub use connection::{reconnect_delay, ConnectionStateMachine};
pub use constants::*; // Re-export all constants
pub use error::{Cancelled, OperationError, TransportError};
pub use events::{ChannelSink, EventSink, MonitorEvent};
pub use guard::{Generation, OperationGuard, OperationKind};
pub use manager::HeartrateMonitor;
pub use notification::{decode_heart_rate, NotificationHandler};
pub use registry::DeviceRegistry;
pub use resolver::DeviceNameResolver;
pub use scanner::BluetoothScanner;
pub use subscription::{DelayedTask, Subscription};
pub use transport::{BleTransport, ServiceBatch};
pub use types::{
    Advertisement, AdvertisementOutcome, CacheMode, ConnectionState, ConnectionStatus, DeviceRecord, GattStatus,
    SessionSnapshot,
};
