//! The BLE capability the connection logic is built on.
//!
//! Events (advertisements, value changes, link status) are delivered through
//! unbounded channels; dropping the receiver is the unsubscribe.

use std::ops::Deref;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::types::{Advertisement, CacheMode, ConnectionStatus, GattStatus};

/// Trait for BLE operations that must be implemented by the platform
#[async_trait::async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Handle to a device obtained by address
    type Device: Clone + Send + Sync + 'static;
    /// Handle to a GATT service
    type Service: Clone + Send + Sync + 'static;
    /// Handle to a GATT characteristic
    type Characteristic: Clone + Send + Sync + 'static;

    /// Starts the advertisement watcher
    async fn start_scanning(&self) -> Result<UnboundedReceiver<Advertisement>, TransportError>;

    /// Stops the advertisement watcher
    async fn stop_scanning(&self) -> Result<(), TransportError>;

    /// Acquires a device handle for a radio address
    async fn connect_by_address(&self, address: &str) -> Result<Self::Device, TransportError>;

    /// Looks up the platform's device information name for an address
    async fn device_info_name(&self, address: &str) -> Result<Option<String>, TransportError>;

    async fn enumerate_services(
        &self,
        device: &Self::Device,
        service_uuid: Uuid,
        cache_mode: CacheMode,
    ) -> Result<Vec<Self::Service>, TransportError>;

    async fn enumerate_characteristics(
        &self,
        service: &Self::Service,
        characteristic_uuid: Uuid,
        cache_mode: CacheMode,
    ) -> Result<Vec<Self::Characteristic>, TransportError>;

    /// Writes "Notify" to the client characteristic configuration descriptor
    async fn write_notify_descriptor(
        &self,
        characteristic: &Self::Characteristic,
    ) -> Result<GattStatus, TransportError>;

    async fn read_value(
        &self,
        characteristic: &Self::Characteristic,
        cache_mode: CacheMode,
    ) -> Result<Vec<u8>, TransportError>;

    /// Subscribes to value-changed events of a characteristic
    async fn subscribe_values(
        &self,
        characteristic: &Self::Characteristic,
    ) -> Result<UnboundedReceiver<Vec<u8>>, TransportError>;

    /// Subscribes to connection-status-changed events of a device
    async fn subscribe_connection_status(
        &self,
        device: &Self::Device,
    ) -> Result<UnboundedReceiver<ConnectionStatus>, TransportError>;

    /// Releases a device handle
    fn dispose_device(&self, device: Self::Device);

    /// Releases a service handle
    fn dispose_service(&self, service: Self::Service);
}

/// Owns a batch of enumerated services and disposes every one that was not
/// retained when it goes out of scope.
pub struct ServiceBatch<'a, T: BleTransport + ?Sized> {
    transport: &'a T,
    services: Vec<T::Service>,
}

impl<'a, T: BleTransport + ?Sized> ServiceBatch<'a, T> {
    pub fn new(transport: &'a T, services: Vec<T::Service>) -> Self {
        Self { transport, services }
    }

    pub fn first(&self) -> Option<&T::Service> {
        self.services.first()
    }

    /// Removes the first service from the batch so it outlives the batch
    pub fn retain_first(&mut self) -> Option<T::Service> {
        if self.services.is_empty() {
            None
        } else {
            Some(self.services.remove(0))
        }
    }
}

impl<T: BleTransport + ?Sized> Drop for ServiceBatch<'_, T> {
    fn drop(&mut self) {
        for service in self.services.drain(..) {
            self.transport.dispose_service(service);
        }
    }
}

/// A device handle that is disposed when the lease goes out of scope,
/// including when the future holding it is dropped mid-await.
pub struct DeviceLease<'a, T: BleTransport + ?Sized> {
    transport: &'a T,
    device: T::Device,
}

impl<'a, T: BleTransport + ?Sized> DeviceLease<'a, T> {
    pub fn new(transport: &'a T, device: T::Device) -> Self {
        Self { transport, device }
    }
}

impl<T: BleTransport + ?Sized> Deref for DeviceLease<'_, T> {
    type Target = T::Device;

    fn deref(&self) -> &T::Device {
        &self.device
    }
}

impl<T: BleTransport + ?Sized> Drop for DeviceLease<'_, T> {
    fn drop(&mut self) {
        self.transport.dispose_device(self.device.clone());
    }
}
