//! Heart-rate monitor facade
//! This module provides the main interface the host uses to run, retarget
//! and query the heart-rate connection.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{error, info, warn};

use crate::config::monitor_config::MonitorConfig;
use crate::core::bluetooth::connection::ConnectionStateMachine;
use crate::core::bluetooth::events::EventSink;
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::{ConnectionState, DeviceRecord, SessionSnapshot};
use crate::utils::normalize_address;

/// Manages the heart-rate connection for one host
pub struct HeartrateMonitor<T: BleTransport> {
    /// Every device seen while scanning
    registry: Arc<DeviceRegistry<T>>,
    /// Connection state machine
    machine: ConnectionStateMachine<T>,
    sink: Arc<dyn EventSink>,
    config: MonitorConfig,
}

impl<T: BleTransport> HeartrateMonitor<T> {
    pub fn new(transport: Arc<T>, config: MonitorConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_manufacturer_prefixes(transport, config, sink, HashMap::new())
    }

    /// Like [`new`](Self::new), naming manufacturers from a table keyed by
    /// the first three address octets.
    pub fn with_manufacturer_prefixes(
        transport: Arc<T>,
        config: MonitorConfig,
        sink: Arc<dyn EventSink>,
        prefixes: HashMap<String, String>,
    ) -> Self {
        let registry = Arc::new(
            DeviceRegistry::new(transport.clone(), sink.clone()).with_manufacturer_prefixes(prefixes),
        );
        let machine = ConnectionStateMachine::new(
            transport,
            registry.clone(),
            sink.clone(),
            config.connect_without_target,
        );
        Self {
            registry,
            machine,
            sink,
            config,
        }
    }

    /// Starts scanning for the configured device. Returns false if the
    /// watcher could not be started.
    pub async fn initialise(&self) -> bool {
        let target = self.config.target_address();
        match &target {
            Some(address) => {
                self.registry.add_placeholder(address);
            }
            None if !self.config.selected_device_mac.is_empty() => {
                warn!("Ignoring invalid device address {:?}", self.config.selected_device_mac);
            }
            None => {}
        }
        self.machine.set_target(target).await;

        match self.machine.start().await {
            Ok(()) => {
                info!("Heartrate monitor started");
                true
            }
            Err(e) => {
                error!("Failed to start scanning: {}", e);
                self.sink.on_disconnected();
                false
            }
        }
    }

    /// Disconnects, stops scanning and forgets every device
    pub async fn teardown(&self) {
        self.machine.stop().await;
        self.registry.clear();
        info!("Heartrate monitor stopped");
    }

    /// Selects the device to connect to
    pub async fn set_target_address(&self, address: &str) -> Result<()> {
        let address = normalize_address(address).ok_or_else(|| anyhow!("Invalid device address: {}", address))?;

        if let Some(previous) = self.machine.target_address().filter(|previous| *previous != address) {
            if self.registry.get(&previous).is_some_and(|record| record.is_placeholder) {
                self.registry.remove(&previous);
            }
        }
        self.registry.add_placeholder(&address);
        self.machine.set_target(Some(address.clone())).await;
        info!("Selected device {}", address);
        Ok(())
    }

    /// Forgets the selected device and the device list
    pub async fn clear_target(&self) {
        self.registry.clear();
        self.machine.set_target(None).await;
        info!("Device selection cleared");
    }

    pub fn is_connected(&self) -> bool {
        self.machine.connected_address().is_some()
    }

    pub fn connected_address(&self) -> Option<String> {
        self.machine.connected_address()
    }

    pub fn target_address(&self) -> Option<String> {
        self.machine.target_address()
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.machine.snapshot()
    }

    /// All known devices, most recently seen first
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.devices()
    }

    /// Devices that advertised within the inactivity window
    pub fn active_devices(&self) -> Vec<DeviceRecord> {
        let window = self.config.inactive_after();
        self.devices().into_iter().filter(|device| !device.is_inactive(window)).collect()
    }

    /// Devices that have been silent for longer than the inactivity window
    pub fn inactive_devices(&self) -> Vec<DeviceRecord> {
        let window = self.config.inactive_after();
        self.devices().into_iter().filter(|device| device.is_inactive(window)).collect()
    }
}
