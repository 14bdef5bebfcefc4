//! Scripted in-memory transport used by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_DEVICE_NAME, UUID_GENERIC_ACCESS_SERVICE, UUID_HEART_RATE_MEASUREMENT,
    UUID_HEART_RATE_SERVICE,
};
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::{Advertisement, CacheMode, ConnectionStatus, GattStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub id: u64,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockService {
    pub id: u64,
    pub address: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCharacteristic {
    pub id: u64,
    pub address: String,
    pub uuid: Uuid,
}

/// Behaviour of one simulated peripheral
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub info_name: Option<String>,
    pub gap_name: Option<String>,
    pub heart_rate_services: usize,
    pub heart_rate_characteristics: usize,
    pub write_status: GattStatus,
    pub connect_delay: Option<Duration>,
    pub connect_error: Option<TransportError>,
    pub info_error: Option<TransportError>,
    pub service_error: Option<TransportError>,
    pub write_delay: Option<Duration>,
    pub read_delay: Option<Duration>,
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self {
            info_name: None,
            gap_name: None,
            heart_rate_services: 1,
            heart_rate_characteristics: 1,
            write_status: GattStatus::Success,
            connect_delay: None,
            connect_error: None,
            info_error: None,
            service_error: None,
            write_delay: None,
            read_delay: None,
        }
    }
}

/// Counters of every transport call made
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub start_scanning: usize,
    pub stop_scanning: usize,
    pub connect: usize,
    pub device_info: usize,
    pub enumerate_services: usize,
    pub enumerate_characteristics: usize,
    pub write_descriptor: usize,
    pub read_value: usize,
    pub subscribe_values: usize,
    pub subscribe_status: usize,
    pub disposed_devices: usize,
    pub disposed_services: usize,
}

#[derive(Default)]
struct MockState {
    peripherals: HashMap<String, MockPeripheral>,
    next_id: u64,
    scan_tx: Option<UnboundedSender<Advertisement>>,
    scan_error: Option<TransportError>,
    status_tx: Vec<(String, UnboundedSender<ConnectionStatus>)>,
    value_tx: Vec<UnboundedSender<Vec<u8>>>,
    live_devices: HashSet<u64>,
    live_services: HashSet<u64>,
    calls: MockCalls,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_peripheral(&self, address: &str, peripheral: MockPeripheral) {
        self.state().peripherals.insert(address.to_string(), peripheral);
    }

    /// Makes every following `start_scanning` fail with `error`
    pub fn fail_scanning(&self, error: TransportError) {
        self.state().scan_error = Some(error);
    }

    pub fn calls(&self) -> MockCalls {
        self.state().calls.clone()
    }

    pub fn live_devices(&self) -> usize {
        self.state().live_devices.len()
    }

    pub fn live_services(&self) -> usize {
        self.state().live_services.len()
    }

    /// Delivers an advertisement to the current scan subscriber
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        match &self.state().scan_tx {
            Some(tx) => tx.send(advertisement).is_ok(),
            None => false,
        }
    }

    /// Closes the advertisement stream as a platform watcher stopping by itself would
    pub fn end_scan(&self) {
        self.state().scan_tx = None;
    }

    /// Pushes a value to every live value subscriber
    pub fn notify(&self, value: &[u8]) -> usize {
        let mut state = self.state();
        state.value_tx.retain(|tx| tx.send(value.to_vec()).is_ok());
        state.value_tx.len()
    }

    /// Reports a link loss for every device handle of `address`
    pub fn drop_connection(&self, address: &str) {
        let mut state = self.state();
        state
            .status_tx
            .retain(|(addr, tx)| addr != address || tx.send(ConnectionStatus::Disconnected).is_ok());
    }
}

#[async_trait::async_trait]
impl BleTransport for MockTransport {
    type Device = MockDevice;
    type Service = MockService;
    type Characteristic = MockCharacteristic;

    async fn start_scanning(&self) -> Result<UnboundedReceiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.calls.start_scanning += 1;
        if let Some(err) = &state.scan_error {
            return Err(err.clone());
        }
        state.scan_tx = Some(tx);
        Ok(rx)
    }

    async fn stop_scanning(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.calls.stop_scanning += 1;
        state.scan_tx = None;
        Ok(())
    }

    async fn connect_by_address(&self, address: &str) -> Result<MockDevice, TransportError> {
        let peripheral = {
            let mut state = self.state();
            state.calls.connect += 1;
            state.peripherals.get(address).cloned()
        };
        let peripheral = peripheral.ok_or_else(|| TransportError::DeviceNotFound {
            address: address.to_string(),
        })?;
        if let Some(delay) = peripheral.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = peripheral.connect_error {
            return Err(err);
        }
        let mut state = self.state();
        let id = state.next_id();
        state.live_devices.insert(id);
        Ok(MockDevice {
            id,
            address: address.to_string(),
        })
    }

    async fn device_info_name(&self, address: &str) -> Result<Option<String>, TransportError> {
        let mut state = self.state();
        state.calls.device_info += 1;
        match state.peripherals.get(address) {
            Some(peripheral) => match &peripheral.info_error {
                Some(err) => Err(err.clone()),
                None => Ok(peripheral.info_name.clone()),
            },
            None => Ok(None),
        }
    }

    async fn enumerate_services(
        &self,
        device: &MockDevice,
        service_uuid: Uuid,
        _cache_mode: CacheMode,
    ) -> Result<Vec<MockService>, TransportError> {
        let mut state = self.state();
        state.calls.enumerate_services += 1;
        let peripheral = state.peripherals.get(&device.address).cloned().unwrap_or_default();
        if let Some(err) = peripheral.service_error {
            return Err(err);
        }
        let count = if service_uuid == UUID_HEART_RATE_SERVICE {
            peripheral.heart_rate_services
        } else if service_uuid == UUID_GENERIC_ACCESS_SERVICE {
            usize::from(peripheral.gap_name.is_some())
        } else {
            0
        };
        let mut services = Vec::with_capacity(count);
        for _ in 0..count {
            let id = state.next_id();
            state.live_services.insert(id);
            services.push(MockService {
                id,
                address: device.address.clone(),
                uuid: service_uuid,
            });
        }
        Ok(services)
    }

    async fn enumerate_characteristics(
        &self,
        service: &MockService,
        characteristic_uuid: Uuid,
        _cache_mode: CacheMode,
    ) -> Result<Vec<MockCharacteristic>, TransportError> {
        let mut state = self.state();
        state.calls.enumerate_characteristics += 1;
        let peripheral = state.peripherals.get(&service.address).cloned().unwrap_or_default();
        let count = if service.uuid == UUID_HEART_RATE_SERVICE
            && characteristic_uuid == UUID_HEART_RATE_MEASUREMENT
        {
            peripheral.heart_rate_characteristics
        } else if service.uuid == UUID_GENERIC_ACCESS_SERVICE && characteristic_uuid == UUID_DEVICE_NAME {
            1
        } else {
            0
        };
        let mut characteristics = Vec::with_capacity(count);
        for _ in 0..count {
            let id = state.next_id();
            characteristics.push(MockCharacteristic {
                id,
                address: service.address.clone(),
                uuid: characteristic_uuid,
            });
        }
        Ok(characteristics)
    }

    async fn write_notify_descriptor(
        &self,
        characteristic: &MockCharacteristic,
    ) -> Result<GattStatus, TransportError> {
        let peripheral = {
            let mut state = self.state();
            state.calls.write_descriptor += 1;
            state.peripherals.get(&characteristic.address).cloned().unwrap_or_default()
        };
        if let Some(delay) = peripheral.write_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(peripheral.write_status)
    }

    async fn read_value(
        &self,
        characteristic: &MockCharacteristic,
        _cache_mode: CacheMode,
    ) -> Result<Vec<u8>, TransportError> {
        let peripheral = {
            let mut state = self.state();
            state.calls.read_value += 1;
            state.peripherals.get(&characteristic.address).cloned().unwrap_or_default()
        };
        if let Some(delay) = peripheral.read_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(peripheral.gap_name.unwrap_or_default().into_bytes())
    }

    async fn subscribe_values(
        &self,
        _characteristic: &MockCharacteristic,
    ) -> Result<UnboundedReceiver<Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.calls.subscribe_values += 1;
        state.value_tx.push(tx);
        Ok(rx)
    }

    async fn subscribe_connection_status(
        &self,
        device: &MockDevice,
    ) -> Result<UnboundedReceiver<ConnectionStatus>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.calls.subscribe_status += 1;
        state.status_tx.push((device.address.clone(), tx));
        Ok(rx)
    }

    fn dispose_device(&self, device: MockDevice) {
        let mut state = self.state();
        state.calls.disposed_devices += 1;
        state.live_devices.remove(&device.id);
    }

    fn dispose_service(&self, service: MockService) {
        let mut state = self.state();
        state.calls.disposed_services += 1;
        state.live_services.remove(&service.id);
    }
}
