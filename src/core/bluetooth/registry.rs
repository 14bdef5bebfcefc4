//! Registry of every radio address seen while scanning
//! Name resolution is deduplicated per address and every mutation is followed
//! by a device-list-changed notification.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use log::{debug, info};

use crate::core::bluetooth::error::Cancelled;
use crate::core::bluetooth::events::EventSink;
use crate::core::bluetooth::guard::{Generation, OperationGuard, OperationKind};
use crate::core::bluetooth::resolver::DeviceNameResolver;
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::{Advertisement, DeviceRecord};

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<String, DeviceRecord>,
    resolving: HashSet<String>,
}

pub struct DeviceRegistry<T: BleTransport> {
    resolver: DeviceNameResolver<T>,
    guard: OperationGuard,
    sink: Arc<dyn EventSink>,
    manufacturer_prefixes: HashMap<String, String>,
    inner: Mutex<RegistryInner>,
}

/// Marks an address as being resolved until dropped
struct ResolvingSlot<'a> {
    inner: &'a Mutex<RegistryInner>,
    address: String,
}

impl Drop for ResolvingSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.resolving.remove(&self.address);
    }
}

impl<T: BleTransport> DeviceRegistry<T> {
    pub fn new(transport: Arc<T>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            resolver: DeviceNameResolver::new(transport),
            guard: OperationGuard::new(),
            sink,
            manufacturer_prefixes: HashMap::new(),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Uses `prefixes` (first three octets, e.g. "A0:9E:1A") to fill in
    /// the manufacturer of new records.
    pub fn with_manufacturer_prefixes(mut self, prefixes: HashMap<String, String>) -> Self {
        self.manufacturer_prefixes = prefixes
            .into_iter()
            .map(|(prefix, name)| (prefix.to_uppercase(), name))
            .collect();
        self
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn manufacturer_for(&self, address: &str) -> Option<String> {
        address
            .get(..8)
            .and_then(|prefix| self.manufacturer_prefixes.get(prefix))
            .cloned()
    }

    fn changed(&self) {
        self.sink.on_device_list_changed();
    }

    pub fn get(&self, address: &str) -> Option<DeviceRecord> {
        self.lock().devices.get(address).cloned()
    }

    pub fn has(&self, address: &str) -> bool {
        self.lock().devices.contains_key(address)
    }

    /// All records, most recently seen first
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self.lock().devices.values().cloned().collect();
        devices.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        devices
    }

    /// Records an advertisement, resolving a name for addresses seen for the
    /// first time. Returns `Ok(None)` if a resolution for the address is
    /// already running.
    pub async fn add_or_resolve(
        &self,
        advertisement: &Advertisement,
        scope: &Generation,
    ) -> Result<Option<DeviceRecord>, Cancelled> {
        let address = advertisement.address.as_str();
        let slot = {
            let mut inner = self.lock();
            if inner.resolving.contains(address) {
                debug!("[MAC:{}] Name resolution already in flight", address);
                return Ok(None);
            }
            if let Some(record) = inner.devices.get_mut(address).filter(|r| !r.is_placeholder) {
                record.last_seen_at = Local::now();
                if let Some(name) = advertisement.local_name.as_deref().filter(|n| !n.is_empty()) {
                    record.display_name = name.to_string();
                }
                let record = record.clone();
                drop(inner);
                debug!("[MAC:{}] Found cached device name: {}", address, record.display_name);
                self.changed();
                return Ok(Some(record));
            }
            inner.resolving.insert(address.to_string());
            ResolvingSlot {
                inner: &self.inner,
                address: address.to_string(),
            }
        };

        debug!("[MAC:{}] Resolving device name", address);
        let resolution = self.resolver.resolve(advertisement, scope);
        let name = self
            .guard
            .wait(resolution, OperationKind::GetDeviceName, scope)
            .await?
            .unwrap_or_default();
        if scope.is_cancelled() {
            return Err(Cancelled);
        }

        let record = {
            let mut inner = self.lock();
            let manufacturer = self.manufacturer_for(address);
            let record = inner
                .devices
                .entry(address.to_string())
                .or_insert_with(|| DeviceRecord::new(address.to_string(), String::new(), manufacturer));
            record.display_name = name;
            record.last_seen_at = Local::now();
            record.is_placeholder = false;
            record.clone()
        };
        drop(slot);

        info!("Discovered device: {} (MAC: {})", record.display_name, address);
        self.changed();
        Ok(Some(record))
    }

    /// Adds a placeholder for a selected address that has not advertised yet
    pub fn add_placeholder(&self, address: &str) -> DeviceRecord {
        let record = {
            let mut inner = self.lock();
            let manufacturer = self.manufacturer_for(address);
            inner
                .devices
                .entry(address.to_string())
                .or_insert_with(|| DeviceRecord::placeholder(address.to_string(), manufacturer))
                .clone()
        };
        self.changed();
        record
    }

    pub fn remove(&self, address: &str) {
        self.lock().devices.remove(address);
        self.changed();
    }

    pub fn clear(&self) {
        self.lock().devices.clear();
        self.changed();
    }

    pub fn mark_missing_service(&self, address: &str, missing: bool) {
        if let Some(record) = self.lock().devices.get_mut(address) {
            record.has_no_heart_rate_service = missing;
        }
        self.changed();
    }

    pub fn mark_missing_characteristic(&self, address: &str, missing: bool) {
        if let Some(record) = self.lock().devices.get_mut(address) {
            record.has_no_heart_rate_characteristic = missing;
        }
        self.changed();
    }

    /// Notifies listeners without mutating, e.g. after a connection change
    pub fn refresh(&self) {
        self.changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::events::MonitorEvent;
    use crate::core::bluetooth::events::recording::RecordingSink;
    use crate::core::bluetooth::mock::{MockPeripheral, MockTransport};
    use std::time::Duration;
    use tokio::time::sleep;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn registry() -> (Arc<MockTransport>, Arc<RecordingSink>, Arc<DeviceRegistry<MockTransport>>) {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(DeviceRegistry::new(transport.clone(), sink.clone()));
        (transport, sink, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn first_advertisement_creates_named_record() {
        let (transport, sink, registry) = registry();

        let record = registry
            .add_or_resolve(&Advertisement::new(ADDRESS, Some("Polar H10")), &Generation::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.display_name, "Polar H10");
        assert!(!record.is_placeholder);
        assert!(registry.has(ADDRESS));
        assert_eq!(sink.count(&MonitorEvent::DeviceListChanged), 1);
        assert_eq!(transport.calls(), Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolutions_for_one_address_are_deduplicated() {
        let (transport, _sink, registry) = registry();
        transport.add_peripheral(
            ADDRESS,
            MockPeripheral {
                gap_name: Some("Slow Strap".into()),
                connect_delay: Some(Duration::from_secs(2)),
                ..MockPeripheral::default()
            },
        );
        let scope = Generation::new();

        let first = {
            let registry = registry.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                registry.add_or_resolve(&Advertisement::new(ADDRESS, None), &scope).await
            })
        };
        sleep(Duration::from_millis(10)).await;

        let second = registry.add_or_resolve(&Advertisement::new(ADDRESS, None), &scope).await;
        assert_eq!(second.unwrap().map(|r| r.address), None);

        let first = first.await.unwrap().unwrap().unwrap();
        assert_eq!(first.display_name, "Slow Strap");
        assert_eq!(transport.calls().connect, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_resolution_leaves_no_record_and_frees_the_address() {
        let (transport, sink, registry) = registry();
        transport.add_peripheral(
            ADDRESS,
            MockPeripheral {
                gap_name: Some("Strap".into()),
                connect_delay: Some(Duration::from_secs(2)),
                ..MockPeripheral::default()
            },
        );
        let mut generation = Generation::new();

        let pending = {
            let registry = registry.clone();
            let scope = generation.clone();
            tokio::spawn(async move {
                registry.add_or_resolve(&Advertisement::new(ADDRESS, None), &scope).await
            })
        };
        sleep(Duration::from_millis(10)).await;
        let fresh = generation.invalidate();

        assert_eq!(pending.await.unwrap().map(|r| r.is_some()), Err(Cancelled));
        assert!(!registry.has(ADDRESS));
        assert!(sink.events().is_empty());

        let record = registry
            .add_or_resolve(&Advertisement::new(ADDRESS, Some("Strap")), &fresh)
            .await
            .unwrap();
        assert!(record.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_gap_read_releases_the_device() {
        let (transport, _sink, registry) = registry();
        transport.add_peripheral(
            ADDRESS,
            MockPeripheral {
                gap_name: Some("Strap".into()),
                read_delay: Some(Duration::from_millis(800)),
                ..MockPeripheral::default()
            },
        );
        let mut generation = Generation::new();

        let pending = {
            let registry = registry.clone();
            let scope = generation.clone();
            tokio::spawn(async move {
                registry.add_or_resolve(&Advertisement::new(ADDRESS, None), &scope).await
            })
        };
        sleep(Duration::from_millis(400)).await;
        assert_eq!(transport.live_devices(), 1);
        generation.invalidate();

        assert_eq!(pending.await.unwrap().map(|r| r.is_some()), Err(Cancelled));
        let calls = transport.calls();
        assert_eq!(calls.connect, 1);
        assert_eq!(calls.disposed_devices, 1);
        assert_eq!(transport.live_devices(), 0);
        assert_eq!(transport.live_services(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_resolution_releases_the_device() {
        let (transport, _sink, registry) = registry();
        transport.add_peripheral(
            ADDRESS,
            MockPeripheral {
                gap_name: Some("Strap".into()),
                connect_delay: Some(Duration::from_millis(4500)),
                read_delay: Some(Duration::from_millis(800)),
                ..MockPeripheral::default()
            },
        );

        let record = registry
            .add_or_resolve(&Advertisement::new(ADDRESS, None), &Generation::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.display_name, "");
        assert_eq!(transport.calls().connect, 1);
        assert_eq!(transport.live_devices(), 0);
        assert_eq!(transport.live_services(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn known_address_is_refreshed_without_round_trip() {
        let (transport, sink, registry) = registry();
        transport.add_peripheral(ADDRESS, MockPeripheral::default());
        let scope = Generation::new();

        registry.add_or_resolve(&Advertisement::new(ADDRESS, None), &scope).await.unwrap();
        let calls = transport.calls();
        let record = registry
            .add_or_resolve(&Advertisement::new(ADDRESS, Some("Late Name")), &scope)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.display_name, "Late Name");
        assert_eq!(transport.calls(), calls);
        assert_eq!(sink.count(&MonitorEvent::DeviceListChanged), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_is_replaced_by_first_advertisement() {
        let (_transport, _sink, registry) = registry();

        let placeholder = registry.add_placeholder(ADDRESS);
        assert!(placeholder.is_placeholder);
        assert_eq!(placeholder.label(), ADDRESS);

        let record = registry
            .add_or_resolve(&Advertisement::new(ADDRESS, Some("Polar H10")), &Generation::new())
            .await
            .unwrap()
            .unwrap();
        assert!(!record.is_placeholder);
        assert_eq!(record.label(), "Polar H10 (AA:BB:CC:DD:EE:FF)");
    }

    #[test]
    fn sticky_flags_and_bulk_mutations_notify() {
        let (_transport, sink, registry) = registry();
        registry.add_placeholder(ADDRESS);

        registry.mark_missing_service(ADDRESS, true);
        registry.mark_missing_characteristic(ADDRESS, true);
        let record = registry.get(ADDRESS).unwrap();
        assert!(record.has_no_heart_rate_service);
        assert!(record.has_no_heart_rate_characteristic);

        registry.remove(ADDRESS);
        assert!(!registry.has(ADDRESS));
        registry.clear();
        assert!(registry.devices().is_empty());
        assert_eq!(sink.count(&MonitorEvent::DeviceListChanged), 5);
    }

    #[test]
    fn manufacturer_comes_from_address_prefix() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::default());
        let registry = DeviceRegistry::new(transport, sink).with_manufacturer_prefixes(
            [("aa:bb:cc".to_string(), "Polar Electro Oy".to_string())].into(),
        );

        let record = registry.add_placeholder(ADDRESS);
        assert_eq!(record.manufacturer.as_deref(), Some("Polar Electro Oy"));
        assert_eq!(registry.add_placeholder("11:22:33:44:55:66").manufacturer, None);
    }
}
