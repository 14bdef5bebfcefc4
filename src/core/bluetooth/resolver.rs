//! Best-effort device naming
//! Tries the advertisement first, then the platform device information, then
//! the GAP Device Name characteristic. No stage failure aborts the chain.

use std::sync::Arc;

use log::debug;

use crate::core::bluetooth::constants::{UUID_DEVICE_NAME, UUID_GENERIC_ACCESS_SERVICE};
use crate::core::bluetooth::error::OperationError;
use crate::core::bluetooth::guard::{Generation, OperationGuard, OperationKind};
use crate::core::bluetooth::transport::{BleTransport, DeviceLease, ServiceBatch};
use crate::core::bluetooth::types::{Advertisement, CacheMode};

pub struct DeviceNameResolver<T: BleTransport> {
    transport: Arc<T>,
    guard: OperationGuard,
}

impl<T: BleTransport> DeviceNameResolver<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            guard: OperationGuard::new(),
        }
    }

    /// Resolves a name for the advertiser, empty if none could be found
    pub async fn resolve(&self, advertisement: &Advertisement, scope: &Generation) -> String {
        let address = advertisement.address.as_str();
        debug!("[MAC:{}] Getting device name", address);

        if let Some(name) = advertisement.local_name.as_deref().filter(|name| !name.is_empty()) {
            debug!("[MAC:{}] Device name picked from advertisement: {}", address, name);
            return name.to_string();
        }

        debug!("[MAC:{}] Advertisement missing device name, asking for device information", address);
        if let Some(name) = self.name_from_device_info(address, scope).await {
            debug!("[MAC:{}] Device name received from device information ({})", address, name);
            return name;
        }

        debug!("[MAC:{}] Could not read device name from device information, trying GenericAccess service", address);
        if let Some(name) = self.name_from_generic_access(address, scope).await {
            debug!("[MAC:{}] Read device name from GapDeviceName characteristic ({})", address, name);
            return name;
        }

        debug!("[MAC:{}] Device name not found", address);
        String::new()
    }

    async fn name_from_device_info(&self, address: &str, scope: &Generation) -> Option<String> {
        let lookup = self.transport.device_info_name(address);
        match self.guard.attempt(lookup, OperationKind::GetDeviceInfo, scope).await {
            Ok(Some(Some(name))) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(e) => {
                debug!("[MAC:{}] Device information lookup failed: {}", address, e);
                None
            }
        }
    }

    async fn name_from_generic_access(&self, address: &str, scope: &Generation) -> Option<String> {
        let lookup = self.transport.connect_by_address(address);
        let device = match self.guard.attempt(lookup, OperationKind::GetDeviceFromAddress, scope).await {
            Ok(Some(device)) => DeviceLease::new(self.transport.as_ref(), device),
            Ok(None) => {
                debug!("[MAC:{}] Could not get device object from address", address);
                return None;
            }
            Err(e) => {
                debug!("[MAC:{}] Could not get device object from address: {}", address, e);
                return None;
            }
        };

        match self.read_gap_device_name(&device, scope).await {
            Ok(name) => name,
            Err(e) => {
                debug!("[MAC:{}] Could not read GapDeviceName characteristic: {}", address, e);
                None
            }
        }
    }

    async fn read_gap_device_name(
        &self,
        device: &T::Device,
        scope: &Generation,
    ) -> Result<Option<String>, OperationError> {
        let lookup = self
            .transport
            .enumerate_services(device, UUID_GENERIC_ACCESS_SERVICE, CacheMode::Cached);
        let services = self
            .guard
            .attempt(lookup, OperationKind::GetGenericAccessService, scope)
            .await?
            .unwrap_or_default();
        let services = ServiceBatch::new(self.transport.as_ref(), services);
        let Some(service) = services.first() else {
            return Ok(None);
        };

        let lookup = self
            .transport
            .enumerate_characteristics(service, UUID_DEVICE_NAME, CacheMode::Cached);
        let characteristics = self
            .guard
            .attempt(lookup, OperationKind::GetDeviceNameCharacteristic, scope)
            .await?
            .unwrap_or_default();
        let Some(characteristic) = characteristics.first() else {
            return Ok(None);
        };

        let read = self.transport.read_value(characteristic, CacheMode::Uncached);
        let value = self
            .guard
            .attempt(read, OperationKind::ReadHeartRateValue, scope)
            .await?;
        Ok(value.map(|bytes| decode_name(&bytes)).filter(|name| !name.is_empty()))
    }
}

/// GAP names are UTF-8, some devices pad them with NULs
fn decode_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::error::TransportError;
    use crate::core::bluetooth::mock::{MockPeripheral, MockTransport};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn resolver(transport: &Arc<MockTransport>) -> DeviceNameResolver<MockTransport> {
        DeviceNameResolver::new(transport.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn advertised_name_wins_without_round_trip() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(
            ADDRESS,
            MockPeripheral {
                info_error: Some(TransportError::Platform("lookup exploded".into())),
                ..MockPeripheral::default()
            },
        );

        let name = resolver(&transport)
            .resolve(&Advertisement::new(ADDRESS, Some("X")), &Generation::new())
            .await;

        assert_eq!(name, "X");
        let calls = transport.calls();
        assert_eq!(calls.device_info, 0);
        assert_eq!(calls.connect, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn device_information_is_second_choice() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(
            ADDRESS,
            MockPeripheral {
                info_name: Some("Polar H10".into()),
                gap_name: Some("ignored".into()),
                ..MockPeripheral::default()
            },
        );

        let name = resolver(&transport)
            .resolve(&Advertisement::new(ADDRESS, Some("")), &Generation::new())
            .await;

        assert_eq!(name, "Polar H10");
        assert_eq!(transport.calls().connect, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_device_information_falls_through_to_gap_name() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(
            ADDRESS,
            MockPeripheral {
                info_error: Some(TransportError::Platform("no info".into())),
                gap_name: Some("HRM-Pro\0\0".into()),
                ..MockPeripheral::default()
            },
        );

        let name = resolver(&transport)
            .resolve(&Advertisement::new(ADDRESS, None), &Generation::new())
            .await;

        assert_eq!(name, "HRM-Pro");
        let calls = transport.calls();
        assert_eq!(calls.read_value, 1);
        assert_eq!(calls.disposed_services, 1);
        assert_eq!(transport.live_services(), 0);
        assert_eq!(transport.live_devices(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_resolves_to_empty_name() {
        let transport = Arc::new(MockTransport::new());

        let name = resolver(&transport)
            .resolve(&Advertisement::new(ADDRESS, None), &Generation::new())
            .await;

        assert!(name.is_empty());
        assert_eq!(transport.live_devices(), 0);
    }
}
