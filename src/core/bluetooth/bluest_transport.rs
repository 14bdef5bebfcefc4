//! Production transport on top of the bluest crate
//! Event streams of bluest borrow the adapter or characteristic they come
//! from, so each subscription runs in its own task owning a clone of the
//! handle and forwards events into a channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::{CCCD_NOTIFY_VALUE, UUID_CLIENT_CHARACTERISTIC_CONFIG};
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::{Advertisement, CacheMode, ConnectionStatus, GattStatus};
use crate::utils::extract_mac_address;

pub struct BluestTransport {
    adapter: Adapter,
    /// Devices seen while scanning, keyed by canonical address
    devices: Arc<Mutex<HashMap<String, Device>>>,
    scan_token: Mutex<Option<CancellationToken>>,
    disconnects: PendingDisconnects,
}

/// Disconnects started by `dispose_device`, keyed by address. A new
/// connection to the same address waits for them so a late disconnect
/// cannot drop the fresh link.
#[derive(Default)]
struct PendingDisconnects {
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl PendingDisconnects {
    fn track(&self, address: String, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|_, pending| {
            pending.retain(|task| !task.is_finished());
            !pending.is_empty()
        });
        tasks.entry(address).or_default().push(task);
    }

    async fn settle(&self, address: &str) {
        let pending = lock(&self.tasks).remove(address).unwrap_or_default();
        for task in pending {
            if let Err(e) = task.await {
                warn!("Disconnect task for {} failed: {}", address, e);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Address used as registry key for a bluest device
fn device_address(device: &Device) -> String {
    let id = device.id().to_string();
    extract_mac_address(&id).unwrap_or_else(|| id.to_uppercase())
}

impl BluestTransport {
    /// Opens the default adapter and waits until it is powered on
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterNotAvailable)?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            scan_token: Mutex::new(None),
            disconnects: PendingDisconnects::default(),
        })
    }

    fn known_device(&self, address: &str) -> Option<Device> {
        lock(&self.devices).get(address).cloned()
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        tx: mpsc::UnboundedSender<Advertisement>,
        cancel_token: CancellationToken,
        ready: oneshot::Sender<Result<(), TransportError>>,
    ) {
        let mut scan_stream = match adapter.scan(&[]).await {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };
        info!("Starting bluetooth scan");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tx.closed() => break,
                result = scan_stream.next() => match result {
                    Some(discovered) => {
                        let address = device_address(&discovered.device);
                        lock(&devices).insert(address.clone(), discovered.device);
                        let advertisement = Advertisement {
                            address,
                            local_name: discovered.adv_data.local_name,
                            rssi: discovered.rssi,
                        };
                        if tx.send(advertisement).is_err() {
                            break;
                        }
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    }
                }
            }
        }
        debug!("Scan task finished");
    }

    async fn internal_notify_task(
        characteristic: Characteristic,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        ready: oneshot::Sender<Result<(), TransportError>>,
    ) {
        let mut notification_stream = match characteristic.notify().await {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                result = notification_stream.next() => match result {
                    Some(Ok(value)) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    async fn internal_status_task(
        adapter: Adapter,
        device: Device,
        tx: mpsc::UnboundedSender<ConnectionStatus>,
        ready: oneshot::Sender<Result<(), TransportError>>,
    ) {
        let mut events = match adapter.device_connection_events(&device).await {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                event = events.next() => {
                    let status = match event {
                        Some(ConnectionEvent::Connected) => ConnectionStatus::Connected,
                        Some(ConnectionEvent::Disconnected) => ConnectionStatus::Disconnected,
                        None => break,
                    };
                    if tx.send(status).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Waits for a pump task to report whether its stream could be opened
async fn await_ready(ready: oneshot::Receiver<Result<(), TransportError>>) -> Result<(), TransportError> {
    ready
        .await
        .unwrap_or_else(|_| Err(TransportError::Platform("event task ended before starting".into())))
}

#[async_trait::async_trait]
impl BleTransport for BluestTransport {
    type Device = Device;
    type Service = Service;
    type Characteristic = Characteristic;

    async fn start_scanning(&self) -> Result<UnboundedReceiver<Advertisement>, TransportError> {
        let cancel_token = CancellationToken::new();
        if let Some(previous) = lock(&self.scan_token).replace(cancel_token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            self.devices.clone(),
            tx,
            cancel_token,
            ready_tx,
        ));
        await_ready(ready_rx).await?;
        Ok(rx)
    }

    async fn stop_scanning(&self) -> Result<(), TransportError> {
        info!("Stopping Bluetooth scan.");
        if let Some(token) = lock(&self.scan_token).take() {
            token.cancel();
        }
        Ok(())
    }

    async fn connect_by_address(&self, address: &str) -> Result<Device, TransportError> {
        let device = self
            .known_device(address)
            .ok_or_else(|| TransportError::DeviceNotFound {
                address: address.to_string(),
            })?;
        self.disconnects.settle(address).await;
        if !device.is_connected().await {
            info!("Initiating connection to {}...", address);
            self.adapter.connect_device(&device).await?;
        }
        Ok(device)
    }

    async fn device_info_name(&self, address: &str) -> Result<Option<String>, TransportError> {
        let Some(device) = self.known_device(address) else {
            return Ok(None);
        };
        let name = device.name_async().await?;
        Ok(Some(name).filter(|name| !name.is_empty()))
    }

    async fn enumerate_services(
        &self,
        device: &Device,
        service_uuid: Uuid,
        cache_mode: CacheMode,
    ) -> Result<Vec<Service>, TransportError> {
        let services = match cache_mode {
            CacheMode::Cached => device
                .services()
                .await?
                .into_iter()
                .filter(|service| service.uuid() == service_uuid)
                .collect(),
            CacheMode::Uncached => device.discover_services_with_uuid(service_uuid).await?,
        };
        Ok(services)
    }

    async fn enumerate_characteristics(
        &self,
        service: &Service,
        characteristic_uuid: Uuid,
        cache_mode: CacheMode,
    ) -> Result<Vec<Characteristic>, TransportError> {
        let characteristics = match cache_mode {
            CacheMode::Cached => service
                .characteristics()
                .await?
                .into_iter()
                .filter(|characteristic| characteristic.uuid() == characteristic_uuid)
                .collect(),
            CacheMode::Uncached => service.discover_characteristics_with_uuid(characteristic_uuid).await?,
        };
        Ok(characteristics)
    }

    async fn write_notify_descriptor(&self, characteristic: &Characteristic) -> Result<GattStatus, TransportError> {
        let properties = characteristic.properties().await?;
        if !properties.notify {
            warn!("Characteristic {} does not support notifications", characteristic.uuid());
            return Ok(GattStatus::ProtocolError);
        }

        let descriptor = characteristic
            .discover_descriptors()
            .await?
            .into_iter()
            .find(|descriptor| descriptor.uuid() == UUID_CLIENT_CHARACTERISTIC_CONFIG);
        match descriptor {
            Some(descriptor) => {
                descriptor.write(&CCCD_NOTIFY_VALUE).await?;
            }
            // Some platforms hide the descriptor and configure it when subscribing
            None => debug!("No configuration descriptor exposed for {}", characteristic.uuid()),
        }
        Ok(GattStatus::Success)
    }

    async fn read_value(&self, characteristic: &Characteristic, cache_mode: CacheMode) -> Result<Vec<u8>, TransportError> {
        let value = match cache_mode {
            CacheMode::Cached => characteristic.value().await?,
            CacheMode::Uncached => characteristic.read().await?,
        };
        Ok(value)
    }

    async fn subscribe_values(&self, characteristic: &Characteristic) -> Result<UnboundedReceiver<Vec<u8>>, TransportError> {
        info!("Subscribing to notifications...");
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Self::internal_notify_task(characteristic.clone(), tx, ready_tx));
        await_ready(ready_rx).await?;
        Ok(rx)
    }

    async fn subscribe_connection_status(&self, device: &Device) -> Result<UnboundedReceiver<ConnectionStatus>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Self::internal_status_task(self.adapter.clone(), device.clone(), tx, ready_tx));
        await_ready(ready_rx).await?;
        Ok(rx)
    }

    fn dispose_device(&self, device: Device) {
        let adapter = self.adapter.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let address = device_address(&device);
        let task = runtime.spawn(async move {
            if device.is_connected().await {
                info!("Disconnecting from device {}", device.id());
                match adapter.disconnect_device(&device).await {
                    Ok(()) => info!("Successfully disconnected"),
                    Err(e) => warn!("Failed to disconnect from {}: {}", device.id(), e),
                }
            }
        });
        self.disconnects.track(address, task);
    }

    fn dispose_service(&self, service: Service) {
        drop(service);
    }
}
