//! Defines shared data structures for the Bluetooth module.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Duration;

use crate::core::bluetooth::error::TransportError;

/// A single advertisement received from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Canonical radio address of the advertiser
    pub address: String,
    /// The local name embedded in the advertisement, if any
    pub local_name: Option<String>,
    /// The signal strength (RSSI), if reported
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(address: impl Into<String>, local_name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            local_name: local_name.map(str::to_string),
            rssi: None,
        }
    }
}

/// Whether a GATT query may be answered from the platform cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Uncached,
}

/// Result of a GATT write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Unreachable,
    ProtocolError,
}

/// Link status reported by a device handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Externally visible state of the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No target configured, advertisements are only recorded
    Idle,
    /// Target configured, watching for it
    Scanning,
    /// Discovery in progress for the matched address
    Connecting,
    /// Heart-rate notifications are subscribed
    Connected,
}

/// Metadata about one radio address that has been observed or selected
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    /// Canonical colon-separated radio address, unique key
    pub address: String,
    /// Best-effort resolved name, empty until resolved
    pub display_name: String,
    /// Manufacturer derived from the address prefix, if known
    pub manufacturer: Option<String>,
    /// Time of the last advertisement seen for this address
    pub last_seen_at: DateTime<Local>,
    /// Discovery found no heart-rate service on this device
    pub has_no_heart_rate_service: bool,
    /// Discovery found no heart-rate measurement characteristic on this device
    pub has_no_heart_rate_characteristic: bool,
    /// Synthetic record for a selected device that has not been seen yet
    pub is_placeholder: bool,
}

impl DeviceRecord {
    /// Creates a record for an address that has just advertised
    pub fn new(address: String, display_name: String, manufacturer: Option<String>) -> Self {
        Self {
            address,
            display_name,
            manufacturer,
            last_seen_at: Local::now(),
            has_no_heart_rate_service: false,
            has_no_heart_rate_characteristic: false,
            is_placeholder: false,
        }
    }

    /// Creates a placeholder for a selected address that is not visible
    pub fn placeholder(address: String, manufacturer: Option<String>) -> Self {
        Self {
            is_placeholder: true,
            ..Self::new(address, String::new(), manufacturer)
        }
    }

    /// Human readable label, "NAME (MAC)" when both are known
    pub fn label(&self) -> String {
        let mut parts = Vec::new();
        if !self.display_name.is_empty() {
            parts.push(self.display_name.clone());
        }
        if !self.address.is_empty() {
            if parts.is_empty() {
                parts.push(self.address.clone());
            } else {
                parts.push(format!("({})", self.address));
            }
        }
        if parts.is_empty() {
            return "Unknown device".to_string();
        }
        parts.join(" ")
    }

    pub fn seconds_since_last_seen(&self) -> i64 {
        (Local::now() - self.last_seen_at).num_seconds()
    }

    /// Whether the device has been silent for longer than `window`
    pub fn is_inactive(&self, window: Duration) -> bool {
        let silent_for = u64::try_from(self.seconds_since_last_seen()).unwrap_or(0);
        silent_for >= window.as_secs()
    }
}

/// Point-in-time view of the connection session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub target_address: Option<String>,
    pub processing_address: Option<String>,
    pub connected_address: Option<String>,
    pub has_device: bool,
    pub has_service: bool,
    pub has_characteristic: bool,
    pub missing_characteristic_addresses: usize,
    pub reconnect_attempt: u32,
    pub is_scanning: bool,
    pub restart_pending: bool,
    pub epoch: u64,
}

/// What handling one advertisement amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementOutcome {
    /// Another workflow holds the single-flight lock
    AlreadyProcessing,
    /// A name resolution for this address is already running
    ResolutionInFlight,
    /// Recorded in the registry, no connection attempt
    Observed,
    /// The heart-rate characteristic is already subscribed
    AlreadyConnected,
    /// Notifications were enabled and the session is connected
    Subscribed,
    /// No device handle could be acquired for the address
    DeviceUnavailable,
    NoHeartRateService { newly_reported: bool },
    NoHeartRateCharacteristic { newly_reported: bool },
    /// The notify descriptor write failed or timed out
    NotifyRejected,
    /// The transport raised an error, the session was torn down
    Failed(TransportError),
    /// The session generation changed while the workflow was suspended
    Cancelled,
}
