//! Bluetooth connection handling for the heart-rate sensor
//! This module turns advertisements of the configured target into a subscribed
//! Heart Rate Measurement characteristic, and restarts scanning with an
//! exponential backoff after the link drops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};

use crate::core::bluetooth::constants::{
    MAX_BACKOFF_ATTEMPT, MAX_RECONNECT_ATTEMPT, RECONNECT_BASE_DELAY_MS, UUID_HEART_RATE_MEASUREMENT,
    UUID_HEART_RATE_SERVICE,
};
use crate::core::bluetooth::error::{Cancelled, OperationError, TransportError};
use crate::core::bluetooth::events::EventSink;
use crate::core::bluetooth::guard::{Generation, OperationGuard, OperationKind};
use crate::core::bluetooth::notification::{watch_connection_status, NotificationHandler};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::subscription::{DelayedTask, Subscription};
use crate::core::bluetooth::transport::{BleTransport, ServiceBatch};
use crate::core::bluetooth::types::{
    Advertisement, AdvertisementOutcome, CacheMode, ConnectionState, GattStatus, SessionSnapshot,
};

/// Delay before scanning restarts after the `attempt`-th consecutive disconnect
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_millis(RECONNECT_BASE_DELAY_MS << (attempt.min(MAX_BACKOFF_ATTEMPT) + 1))
}

/// Handles owned by a live (or half-established) connection
struct ConnectionResources<T: BleTransport> {
    device: Option<T::Device>,
    service: Option<T::Service>,
    values: Option<Subscription>,
    link: Option<Subscription>,
}

struct ConnectionSession<T: BleTransport> {
    state: ConnectionState,
    target_address: Option<String>,
    /// Single-flight lock
    processing_address: Option<String>,
    connected_address: Option<String>,
    device_address: Option<String>,
    device: Option<T::Device>,
    service: Option<T::Service>,
    characteristic: Option<T::Characteristic>,
    missing_characteristic_addresses: HashSet<String>,
    reconnect_attempt: u32,
    generation: Generation,
    started: bool,
    scan: Option<Subscription>,
    values: Option<Subscription>,
    link: Option<Subscription>,
    restart: Option<DelayedTask>,
}

impl<T: BleTransport> ConnectionSession<T> {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            target_address: None,
            processing_address: None,
            connected_address: None,
            device_address: None,
            device: None,
            service: None,
            characteristic: None,
            missing_characteristic_addresses: HashSet::new(),
            reconnect_attempt: 0,
            generation: Generation::new(),
            started: false,
            scan: None,
            values: None,
            link: None,
            restart: None,
        }
    }

    /// State to fall back to when no connection is being made
    fn idle_state(&self, connect_without_target: bool) -> ConnectionState {
        if self.started && (self.target_address.is_some() || connect_without_target) {
            ConnectionState::Scanning
        } else {
            ConnectionState::Idle
        }
    }

    fn take_connection(&mut self) -> ConnectionResources<T> {
        self.characteristic = None;
        self.connected_address = None;
        self.device_address = None;
        ConnectionResources {
            device: self.device.take(),
            service: self.service.take(),
            values: self.values.take(),
            link: self.link.take(),
        }
    }
}

struct Shared<T: BleTransport> {
    transport: Arc<T>,
    registry: Arc<DeviceRegistry<T>>,
    notifications: NotificationHandler,
    guard: OperationGuard,
    sink: Arc<dyn EventSink>,
    connect_without_target: bool,
    session: Mutex<ConnectionSession<T>>,
}

/// Drives advertisement handling, GATT discovery and reconnection.
///
/// Cloning yields another handle to the same session.
pub struct ConnectionStateMachine<T: BleTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: BleTransport> Clone for ConnectionStateMachine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: BleTransport> ConnectionStateMachine<T> {
    pub fn new(
        transport: Arc<T>,
        registry: Arc<DeviceRegistry<T>>,
        sink: Arc<dyn EventSink>,
        connect_without_target: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                registry,
                notifications: NotificationHandler::new(sink.clone()),
                guard: OperationGuard::new(),
                sink,
                connect_without_target,
                session: Mutex::new(ConnectionSession::new()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionSession<T>> {
        self.shared.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry<T>> {
        &self.shared.registry
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn target_address(&self) -> Option<String> {
        self.lock().target_address.clone()
    }

    pub fn connected_address(&self) -> Option<String> {
        self.lock().connected_address.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.lock();
        SessionSnapshot {
            state: session.state,
            target_address: session.target_address.clone(),
            processing_address: session.processing_address.clone(),
            connected_address: session.connected_address.clone(),
            has_device: session.device.is_some(),
            has_service: session.service.is_some(),
            has_characteristic: session.characteristic.is_some(),
            missing_characteristic_addresses: session.missing_characteristic_addresses.len(),
            reconnect_attempt: session.reconnect_attempt,
            is_scanning: session.scan.as_ref().is_some_and(|scan| !scan.is_finished()),
            restart_pending: session.restart.is_some(),
            epoch: session.generation.epoch(),
        }
    }

    /// Starts watching advertisements
    pub async fn start(&self) -> Result<(), TransportError> {
        let state = {
            let mut session = self.lock();
            session.started = true;
            session.state = session.idle_state(self.shared.connect_without_target);
            session.state
        };
        self.shared.sink.on_connection_state_changed(state);
        self.ensure_scanning().await
    }

    /// Tears the session down and stops watching advertisements
    pub async fn stop(&self) {
        self.lock().started = false;
        self.reset().await;
    }

    /// Replaces the target address and resets the session
    pub async fn set_target(&self, address: Option<String>) {
        self.lock().target_address = address;
        self.reset().await;
    }

    /// Cancels everything in flight, releases the connection and starts over
    pub async fn reset(&self) {
        let (released, scan, state, started) = {
            let mut session = self.lock();
            session.generation.invalidate();
            if let Some(restart) = session.restart.take() {
                restart.cancel();
            }
            session.processing_address = None;
            session.missing_characteristic_addresses.clear();
            session.reconnect_attempt = 0;
            let released = session.take_connection();
            let scan = session.scan.take();
            session.state = session.idle_state(self.shared.connect_without_target);
            (released, scan, session.state, session.started)
        };
        debug!("Connection session reset");

        self.release(released);
        if let Some(scan) = scan {
            scan.unsubscribe();
            self.stop_watcher().await;
        }
        self.shared.sink.on_connection_state_changed(state);

        if started {
            if let Err(e) = self.ensure_scanning().await {
                warn!("Failed to start scanning: {}", e);
            }
        }
    }

    /// Processes one advertisement end to end
    pub async fn handle_advertisement(&self, advertisement: Advertisement) -> AdvertisementOutcome {
        let address = advertisement.address.clone();
        let scope = {
            let session = self.lock();
            if session.processing_address.as_deref() == Some(address.as_str()) {
                debug!("[MAC:{}] Already processing, ignoring advertisement", address);
                return AdvertisementOutcome::AlreadyProcessing;
            }
            session.generation.clone()
        };

        match self.shared.registry.add_or_resolve(&advertisement, &scope).await {
            Ok(Some(_)) => {}
            Ok(None) => return AdvertisementOutcome::ResolutionInFlight,
            Err(Cancelled) => return AdvertisementOutcome::Cancelled,
        }

        {
            let mut session = self.lock();
            if session.generation.epoch() != scope.epoch() {
                return AdvertisementOutcome::Cancelled;
            }
            let is_target = match &session.target_address {
                Some(target) => *target == address,
                None => self.shared.connect_without_target,
            };
            if !is_target {
                return AdvertisementOutcome::Observed;
            }
            if session.characteristic.is_some() {
                debug!("[MAC:{}] Already connected, ignoring advertisement", address);
                return AdvertisementOutcome::AlreadyConnected;
            }
            if session.processing_address.is_some() {
                debug!("[MAC:{}] Another device is being processed", address);
                return AdvertisementOutcome::AlreadyProcessing;
            }
            session.processing_address = Some(address.clone());
            session.state = ConnectionState::Connecting;
        }
        self.shared.sink.on_connection_state_changed(ConnectionState::Connecting);

        let outcome = match self.discover(&address, &scope).await {
            Ok(outcome) => outcome,
            Err(OperationError::Cancelled) => {
                debug!("[MAC:{}] Discovery cancelled", address);
                AdvertisementOutcome::Cancelled
            }
            Err(OperationError::Transport(e)) => {
                warn!("[MAC:{}] Failed to connect: {}", address, e);
                self.release_after_failure(&scope);
                AdvertisementOutcome::Failed(e)
            }
        };
        self.finish_processing(&address, &scope);
        outcome
    }

    async fn discover(&self, address: &str, scope: &Generation) -> Result<AdvertisementOutcome, OperationError> {
        let transport = self.shared.transport.as_ref();
        let guard = self.shared.guard;

        let Some(device) = self.acquire_device(address, scope).await? else {
            warn!("[MAC:{}] Could not get device", address);
            return Ok(AdvertisementOutcome::DeviceUnavailable);
        };

        debug!("[MAC:{}] Getting heartrate service", address);
        let services = guard
            .attempt(
                transport.enumerate_services(&device, UUID_HEART_RATE_SERVICE, CacheMode::Uncached),
                OperationKind::GetHeartRateService,
                scope,
            )
            .await?
            .unwrap_or_default();
        let mut services = ServiceBatch::new(transport, services);
        let Some(service) = services.first() else {
            return Ok(AdvertisementOutcome::NoHeartRateService {
                newly_reported: self.report_missing_service(address),
            });
        };

        debug!("[MAC:{}] Getting heartrate characteristic", address);
        let characteristics = guard
            .attempt(
                transport.enumerate_characteristics(service, UUID_HEART_RATE_MEASUREMENT, CacheMode::Uncached),
                OperationKind::GetHeartRateCharacteristic,
                scope,
            )
            .await?
            .unwrap_or_default();
        let Some(characteristic) = characteristics.into_iter().next() else {
            return Ok(AdvertisementOutcome::NoHeartRateCharacteristic {
                newly_reported: self.report_missing_characteristic(address),
            });
        };

        debug!("[MAC:{}] Writing characteristic configuration descriptor", address);
        let status = guard
            .attempt(
                transport.write_notify_descriptor(&characteristic),
                OperationKind::WriteCharacteristicConfigDescriptor,
                scope,
            )
            .await?;
        if status != Some(GattStatus::Success) {
            warn!("[MAC:{}] Failed to enable notifications: {:?}", address, status);
            return Ok(AdvertisementOutcome::NotifyRejected);
        }

        let Some(values) = guard
            .attempt(
                transport.subscribe_values(&characteristic),
                OperationKind::SubscribeValueChanged,
                scope,
            )
            .await?
        else {
            warn!("[MAC:{}] Failed to subscribe to heartrate values", address);
            return Ok(AdvertisementOutcome::NotifyRejected);
        };

        let retained = services.retain_first();
        let scan = {
            let mut session = self.lock();
            if session.generation.epoch() != scope.epoch() {
                Err(retained)
            } else {
                let subscription = self.shared.notifications.setup_notifications(values, address.to_string());
                session.service = retained;
                session.characteristic = Some(characteristic);
                session.values = Some(subscription);
                session.connected_address = Some(address.to_string());
                session.processing_address = None;
                session.reconnect_attempt = 0;
                session.state = ConnectionState::Connected;
                Ok(session.scan.take())
            }
        };
        let scan = match scan {
            Ok(scan) => scan,
            Err(retained) => {
                if let Some(service) = retained {
                    transport.dispose_service(service);
                }
                return Err(OperationError::Cancelled);
            }
        };
        self.shared.sink.on_connection_state_changed(ConnectionState::Connected);

        if let Some(scan) = scan {
            scan.unsubscribe();
            self.stop_watcher().await;
        }
        self.shared.registry.mark_missing_service(address, false);
        self.shared.registry.mark_missing_characteristic(address, false);
        info!("Connection successful");
        self.shared.sink.on_connected();
        Ok(AdvertisementOutcome::Subscribed)
    }

    /// Returns the device handle for `address`, reusing the held one
    async fn acquire_device(&self, address: &str, scope: &Generation) -> Result<Option<T::Device>, OperationError> {
        let transport = self.shared.transport.as_ref();
        let guard = self.shared.guard;

        let stale = {
            let mut session = self.lock();
            if session.device_address.as_deref() == Some(address) {
                if let Some(device) = &session.device {
                    debug!("[MAC:{}] Reusing device handle", address);
                    return Ok(Some(device.clone()));
                }
            }
            session.take_connection()
        };
        self.release(stale);

        debug!("[MAC:{}] Getting device from address", address);
        let Some(device) = guard
            .attempt(transport.connect_by_address(address), OperationKind::SetCurrentDevice, scope)
            .await?
        else {
            return Ok(None);
        };

        let status = match guard
            .attempt(
                transport.subscribe_connection_status(&device),
                OperationKind::SubscribeConnectionStatus,
                scope,
            )
            .await
        {
            Ok(Some(status)) => status,
            Ok(None) => {
                transport.dispose_device(device);
                return Ok(None);
            }
            Err(e) => {
                transport.dispose_device(device);
                return Err(e);
            }
        };

        let epoch = scope.epoch();
        let weak = Arc::downgrade(&self.shared);
        let link = watch_connection_status(status, move || async move {
            if let Some(shared) = weak.upgrade() {
                ConnectionStateMachine { shared }.handle_disconnect(epoch).await;
            }
        });

        let handle = device.clone();
        let rejected = {
            let mut session = self.lock();
            if session.generation.epoch() != epoch {
                Some((device, link))
            } else {
                session.device = Some(device);
                session.device_address = Some(address.to_string());
                session.link = Some(link);
                None
            }
        };
        if let Some((device, link)) = rejected {
            link.unsubscribe();
            transport.dispose_device(device);
            return Err(OperationError::Cancelled);
        }
        Ok(Some(handle))
    }

    fn report_missing_service(&self, address: &str) -> bool {
        let newly_reported = !self
            .shared
            .registry
            .get(address)
            .is_some_and(|record| record.has_no_heart_rate_service);
        if newly_reported {
            info!("No heartrate service found for {}", address);
            self.shared.registry.mark_missing_service(address, true);
        } else {
            debug!("[MAC:{}] Still no heartrate service", address);
        }
        newly_reported
    }

    fn report_missing_characteristic(&self, address: &str) -> bool {
        let newly_reported = self
            .lock()
            .missing_characteristic_addresses
            .insert(address.to_string());
        if newly_reported {
            info!("No heartrate characteristic found for {}", address);
            self.shared.registry.mark_missing_characteristic(address, true);
        } else {
            debug!("[MAC:{}] Still no heartrate characteristic", address);
        }
        newly_reported
    }

    fn release_after_failure(&self, scope: &Generation) {
        let released = {
            let mut session = self.lock();
            if session.generation.epoch() != scope.epoch() || session.characteristic.is_some() {
                return;
            }
            session.take_connection()
        };
        self.release(released);
    }

    /// Drops the single-flight lock taken for `address`
    fn finish_processing(&self, address: &str, scope: &Generation) {
        let state = {
            let mut session = self.lock();
            if session.generation.epoch() != scope.epoch() {
                return;
            }
            if session.processing_address.as_deref() == Some(address) {
                session.processing_address = None;
            }
            if session.state == ConnectionState::Connecting && session.characteristic.is_none() {
                session.state = session.idle_state(self.shared.connect_without_target);
                Some(session.state)
            } else {
                None
            }
        };
        if let Some(state) = state {
            self.shared.sink.on_connection_state_changed(state);
        }
    }

    async fn handle_disconnect(&self, epoch: u64) {
        let (released, scan, delay, state) = {
            let mut session = self.lock();
            if session.generation.epoch() != epoch {
                debug!("Ignoring disconnect from a previous session");
                return;
            }
            let released = session.take_connection();
            let scan = session.scan.take();
            session.missing_characteristic_addresses.clear();
            session.processing_address = None;
            session.generation.invalidate();

            let delay = reconnect_delay(session.reconnect_attempt);
            session.reconnect_attempt = (session.reconnect_attempt + 1).min(MAX_RECONNECT_ATTEMPT);
            session.state = session.idle_state(self.shared.connect_without_target);

            self.schedule_restart(&mut session, delay);
            (released, scan, delay, session.state)
        };

        info!("Device disconnected, scanning again in {}ms", delay.as_millis());
        self.release(released);
        if let Some(scan) = scan {
            scan.unsubscribe();
            self.stop_watcher().await;
        }
        self.shared.sink.on_disconnected();
        self.shared.registry.refresh();
        self.shared.sink.on_connection_state_changed(state);
    }

    /// Runs `ensure_scanning` after `delay`, replacing any pending restart
    fn schedule_restart(&self, session: &mut ConnectionSession<T>, delay: Duration) {
        let weak = Arc::downgrade(&self.shared);
        session.restart = Some(DelayedTask::schedule(delay, async move {
            if let Some(shared) = weak.upgrade() {
                let machine = ConnectionStateMachine { shared };
                machine.lock().restart = None;
                if let Err(e) = machine.ensure_scanning().await {
                    warn!("Failed to restart scanning: {}", e);
                }
            }
        }));
    }

    /// The watcher stream of generation `epoch` ended on its own
    fn handle_scan_ended(&self, epoch: u64) {
        let mut session = self.lock();
        if session.generation.epoch() != epoch {
            return;
        }
        session.scan = None;
        if session.started && session.characteristic.is_none() && session.restart.is_none() {
            let delay = reconnect_delay(session.reconnect_attempt);
            warn!("Advertisement watcher stopped, restarting in {}ms", delay.as_millis());
            self.schedule_restart(&mut session, delay);
        }
    }

    /// Starts the watcher unless it is running or not needed.
    ///
    /// Boxed because the scan handler spawns `handle_advertisement`, which
    /// can in turn schedule a restart that lands here again.
    fn ensure_scanning(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let machine = self.clone();
        async move {
            let (scope, target) = {
                let session = machine.lock();
                let watching = session.scan.as_ref().is_some_and(|scan| !scan.is_finished());
                if !session.started || watching || session.characteristic.is_some() {
                    return Ok(());
                }
                (session.generation.clone(), session.target_address.clone())
            };

            let advertisements = match machine
                .shared
                .guard
                .attempt(machine.shared.transport.start_scanning(), OperationKind::StartWatcher, &scope)
                .await
            {
                Ok(Some(advertisements)) => advertisements,
                Ok(None) => {
                    return Err(TransportError::Platform(format!("{} timed out", OperationKind::StartWatcher)));
                }
                Err(OperationError::Cancelled) => return Ok(()),
                Err(OperationError::Transport(e)) => return Err(e),
            };

            let weak = Arc::downgrade(&machine.shared);
            let ended = weak.clone();
            let epoch = scope.epoch();
            let scan = BluetoothScanner::start_scan(
                advertisements,
                move |advertisement| match weak.upgrade() {
                    Some(shared) => {
                        let machine = ConnectionStateMachine { shared };
                        tokio::spawn(async move {
                            machine.handle_advertisement(advertisement).await;
                        });
                        true
                    }
                    None => false,
                },
                move || {
                    if let Some(shared) = ended.upgrade() {
                        ConnectionStateMachine { shared }.handle_scan_ended(epoch);
                    }
                },
            );

            {
                let mut session = machine.lock();
                if session.generation.epoch() != scope.epoch() {
                    return Ok(());
                }
                session.scan = Some(scan);
            }
            match target {
                Some(target) => info!("Scanning for device with MAC {}", target),
                None => info!("Scanning for devices"),
            }
            Ok(())
        }
        .boxed()
    }

    async fn stop_watcher(&self) {
        let scope = self.lock().generation.clone();
        match self
            .shared
            .guard
            .attempt(self.shared.transport.stop_scanning(), OperationKind::StopWatcher, &scope)
            .await
        {
            Ok(Some(())) => debug!("Advertisement watcher stopped"),
            Ok(None) => warn!("Timed out stopping the advertisement watcher"),
            Err(e) => warn!("Failed to stop the advertisement watcher: {}", e),
        }
    }

    fn release(&self, resources: ConnectionResources<T>) {
        if let Some(values) = resources.values {
            values.unsubscribe();
        }
        if let Some(link) = resources.link {
            link.unsubscribe();
        }
        if let Some(service) = resources.service {
            self.shared.transport.dispose_service(service);
        }
        if let Some(device) = resources.device {
            self.shared.transport.dispose_device(device);
        }
    }
}
