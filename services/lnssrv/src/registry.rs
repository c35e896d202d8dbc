//! Device registry and address cache
//!
//! Resolved devices are cached per network address with a sliding TTL so
//! the hot uplink path touches no external collaborator. Network addresses
//! are not unique across networks, so one address maps to a set of
//! candidate devices and the frame MIC disambiguates among them.
//!
//! A background sweeper evicts address entries that have been idle longer
//! than the TTL.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lorawan::{DataUpFrame, DevAddr, Eui64, JoinRequestFrame};

use crate::collaborators::{CounterService, DeviceSearch, IdentityStore};
use crate::device::fcnt::FcntStrategy;
use crate::device::Device;
use crate::error::{LnsError, Result};

/// Future returned by a device initializer
pub type InitFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Callback invoked for every newly constructed device, in registration
/// order, before the device becomes visible to lookups
pub type DeviceInitializer = Box<dyn Fn(Arc<Device>) -> InitFuture + Send + Sync>;

/// Standard initializer seeding the counters of a freshly constructed ABP
/// device through its frame-counter strategy. The downlink counter is
/// pre-advanced by `margin` so restarts that lost unpersisted in-flight
/// increments never reuse a counter value.
pub fn abp_counter_initializer(
    gateway_id: impl Into<String>,
    store: Arc<dyn IdentityStore>,
    counters: Arc<dyn CounterService>,
    persist_interval: u32,
    margin: u32,
) -> DeviceInitializer {
    let gateway_id = gateway_id.into();
    Box::new(move |device: Arc<Device>| -> InitFuture {
        let strategy = FcntStrategy::select(
            &device,
            &gateway_id,
            Arc::clone(&store),
            Arc::clone(&counters),
            persist_interval,
        );
        Box::pin(async move {
            if device.is_abp() {
                strategy.initialize(&device, margin).await?;
            }
            Ok(())
        })
    })
}

/// Candidate devices sharing one network address
struct AddressEntry {
    devices: DashMap<Eui64, Arc<Device>>,
    last_touch: Mutex<Instant>,
}

impl AddressEntry {
    fn new() -> Self {
        Self {
            devices: DashMap::new(),
            last_touch: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_touch.lock().elapsed()
    }
}

pub struct DeviceRegistry {
    gateway_id: String,
    search: Arc<dyn DeviceSearch>,
    store: Arc<dyn IdentityStore>,
    counters: Arc<dyn CounterService>,
    cache: DashMap<DevAddr, AddressEntry>,
    cache_ttl: Duration,
    persist_interval: u32,
    initializers: Vec<DeviceInitializer>,
}

impl DeviceRegistry {
    pub fn new(
        gateway_id: impl Into<String>,
        search: Arc<dyn DeviceSearch>,
        store: Arc<dyn IdentityStore>,
        counters: Arc<dyn CounterService>,
        cache_ttl: Duration,
        persist_interval: u32,
        initializers: Vec<DeviceInitializer>,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            search,
            store,
            counters,
            cache: DashMap::new(),
            cache_ttl,
            persist_interval,
            initializers,
        }
    }

    /// Counter strategy for a resolved device
    pub fn strategy_for(&self, device: &Device) -> FcntStrategy {
        FcntStrategy::select(
            device,
            &self.gateway_id,
            Arc::clone(&self.store),
            Arc::clone(&self.counters),
            self.persist_interval,
        )
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn cached_addresses(&self) -> usize {
        self.cache.len()
    }

    // ========== Data-path resolution ==========

    /// Resolve a data uplink to the unique device whose session key verifies
    /// the frame MIC. Cache miss falls back to the search collaborator and
    /// caches every candidate it returns.
    pub async fn resolve_by_address(
        &self,
        frame: &DataUpFrame,
    ) -> Result<Option<Arc<Device>>> {
        let dev_addr = frame.dev_addr;

        if let Some(entry) = self.cache.get(&dev_addr) {
            entry.touch();
            if let Some(device) = self.match_cached(&entry, frame) {
                return Ok(Some(device));
            }
        }

        let outcome = self
            .search
            .by_address(&self.gateway_id, dev_addr)
            .await
            .map_err(LnsError::collaborator)?;
        if outcome.devices.is_empty() {
            debug!(%dev_addr, "no devices registered under address");
            return Ok(None);
        }

        // Construct and initialize new devices before taking the map entry,
        // so no cache lock is held across collaborator calls
        let cached: Vec<Eui64> = self
            .cache
            .get(&dev_addr)
            .map(|entry| entry.devices.iter().map(|d| *d.key()).collect())
            .unwrap_or_default();
        let mut fresh = Vec::new();
        for identity in &outcome.devices {
            if cached.contains(&identity.dev_eui) {
                continue;
            }
            let device = Arc::new(Device::from_identity(identity));
            self.run_initializers(&device).await?;
            fresh.push(device);
        }

        let entry = self.cache.entry(dev_addr).or_insert_with(AddressEntry::new);
        entry.touch();
        for device in fresh {
            entry.devices.entry(device.dev_eui()).or_insert(device);
        }

        Ok(self.match_cached(&entry, frame))
    }

    /// Run every registered initializer against a newly constructed device,
    /// in registration order
    async fn run_initializers(&self, device: &Arc<Device>) -> Result<()> {
        for initializer in &self.initializers {
            initializer(Arc::clone(device)).await?;
        }
        Ok(())
    }

    /// Scan one address entry for the device that both serves this gateway
    /// and carries the session key the frame MIC was computed with
    fn match_cached(&self, entry: &AddressEntry, frame: &DataUpFrame) -> Option<Arc<Device>> {
        for device in entry.devices.iter() {
            if !device.serves_gateway(&self.gateway_id) {
                continue;
            }
            let Some(nwk_skey) = device.session().nwk_skey else {
                continue;
            };
            if frame.check_mic(&nwk_skey) {
                return Some(Arc::clone(&device));
            }
        }
        None
    }

    // ========== Join-path resolution ==========

    /// Resolve a join request to its OTAA device. Returns `None` when the
    /// dev-nonce was already consumed, the device is unknown or bound to
    /// another gateway, or it carries no application key.
    pub async fn resolve_by_join(
        &self,
        frame: &JoinRequestFrame,
    ) -> Result<Option<Arc<Device>>> {
        let outcome = self
            .search
            .by_join(
                &self.gateway_id,
                frame.dev_eui,
                frame.app_eui,
                frame.dev_nonce,
            )
            .await
            .map_err(LnsError::collaborator)?;

        if outcome.dev_nonce_already_used {
            warn!(dev_eui = %frame.dev_eui, dev_nonce = frame.dev_nonce.0, "join replay, dev-nonce already consumed");
            return Ok(None);
        }
        let Some(identity) = outcome.devices.first() else {
            debug!(dev_eui = %frame.dev_eui, "join from unknown device");
            return Ok(None);
        };
        if identity.app_key.is_none() {
            warn!(dev_eui = %frame.dev_eui, "join from device without application key");
            return Ok(None);
        }
        if let Some(owner) = identity.gateway_id.as_deref().filter(|g| !g.is_empty()) {
            if owner != self.gateway_id {
                warn!(dev_eui = %frame.dev_eui, owner, "join for device bound to another gateway");
                return Ok(None);
            }
        }
        if identity.last_dev_nonce == Some(frame.dev_nonce.0) {
            warn!(dev_eui = %frame.dev_eui, dev_nonce = frame.dev_nonce.0, "join replay, dev-nonce matches previous join");
            return Ok(None);
        }

        // Reuse a cached instance when the device already holds a session,
        // so in-flight counters are not discarded by the re-join
        if let Some(old_addr) = identity.dev_addr {
            if let Some(entry) = self.cache.get(&old_addr) {
                if let Some(device) = entry.devices.get(&identity.dev_eui) {
                    return Ok(Some(Arc::clone(&device)));
                }
            }
        }
        let device = Arc::new(Device::from_identity(identity));
        self.run_initializers(&device).await?;
        Ok(Some(device))
    }

    /// Move a device to its freshly assigned address after a completed join
    pub fn register_after_join(
        &self,
        device: &Arc<Device>,
        old_addr: Option<DevAddr>,
        new_addr: DevAddr,
    ) {
        if let Some(old) = old_addr.filter(|&old| old != new_addr) {
            if let Some(entry) = self.cache.get(&old) {
                entry.devices.remove(&device.dev_eui());
            }
        }
        let entry = self.cache.entry(new_addr).or_insert_with(AddressEntry::new);
        entry.touch();
        entry.devices.insert(device.dev_eui(), Arc::clone(device));
    }

    // ========== Eviction ==========

    /// Drop address entries idle longer than the TTL
    pub fn evict_idle(&self) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.idle_for() < self.cache_ttl);
        before - self.cache.len()
    }

    /// Background eviction loop, stopped through the cancellation token
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let period = (registry.cache_ttl / 4).max(Duration::from_secs(60));
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("device cache sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let evicted = registry.evict_idle();
                        if evicted > 0 {
                            info!(evicted, remaining = registry.cached_addresses(), "evicted idle device cache entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        DeviceIdentity, MemoryCounterService, MemoryIdentityStore, MemorySearch,
    };
    use lorawan::{AesKey, ParsedFrame};

    fn registry_with(
        search: Arc<MemorySearch>,
        store: Arc<MemoryIdentityStore>,
    ) -> DeviceRegistry {
        let store_dyn: Arc<dyn IdentityStore> = store;
        let counters: Arc<dyn CounterService> = Arc::new(MemoryCounterService::new());
        let seed = abp_counter_initializer(
            "gw-1",
            Arc::clone(&store_dyn),
            Arc::clone(&counters),
            10,
            10,
        );
        DeviceRegistry::new(
            "gw-1",
            search,
            store_dyn,
            counters,
            Duration::from_secs(3600),
            10,
            vec![seed],
        )
    }

    fn abp_identity(dev_eui: &str, addr: u32, nwk: [u8; 16]) -> DeviceIdentity {
        DeviceIdentity {
            dev_eui: dev_eui.parse().unwrap(),
            nwk_skey: Some(AesKey::new(nwk)),
            app_skey: Some(AesKey::new([9; 16])),
            dev_addr: Some(DevAddr::new(addr)),
            ..DeviceIdentity::default()
        }
    }

    /// Build a valid unconfirmed uplink the way a device would
    fn uplink_for(addr: u32, nwk: [u8; 16], fcnt: u32) -> Vec<u8> {
        let nwk_skey = AesKey::new(nwk);
        let app_skey = AesKey::new([9; 16]);
        let dev_addr = DevAddr::new(addr);
        let mut raw = vec![0x40];
        raw.extend_from_slice(&dev_addr.to_le_bytes());
        raw.push(0x00);
        raw.extend_from_slice(&(fcnt as u16).to_le_bytes());
        raw.push(1);
        raw.extend_from_slice(&lorawan::crypto::encrypt_frame_payload(
            &app_skey,
            dev_addr,
            fcnt,
            lorawan::crypto::Direction::Up,
            &[0x17],
        ));
        let mic = lorawan::crypto::compute_data_mic(
            &nwk_skey,
            dev_addr,
            fcnt,
            lorawan::crypto::Direction::Up,
            &raw,
        );
        raw.extend_from_slice(&mic);
        raw
    }

    fn parse_uplink(bytes: &[u8]) -> DataUpFrame {
        match ParsedFrame::parse(bytes).unwrap() {
            ParsedFrame::DataUp(frame) => frame,
            other => panic!("expected data uplink, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mic_disambiguates_shared_address() {
        let search = Arc::new(MemorySearch::new());
        let store = Arc::new(MemoryIdentityStore::new());
        let a = abp_identity("0000000000000001", 0x2600_0001, [1; 16]);
        let b = abp_identity("0000000000000002", 0x2600_0001, [2; 16]);
        search.insert(a.clone());
        search.insert(b.clone());
        store.insert(a);
        store.insert(b);

        let registry = registry_with(search, store);
        let bytes = uplink_for(0x2600_0001, [2; 16], 3);
        let frame = parse_uplink(&bytes);

        let device = registry.resolve_by_address(&frame).await.unwrap().unwrap();
        assert_eq!(device.dev_eui(), "0000000000000002".parse().unwrap());
        assert_eq!(registry.cached_addresses(), 1);
    }

    #[tokio::test]
    async fn unknown_address_resolves_to_none() {
        let search = Arc::new(MemorySearch::new());
        let store = Arc::new(MemoryIdentityStore::new());
        let registry = registry_with(search, store);

        let bytes = uplink_for(0x2600_0001, [1; 16], 0);
        let frame = parse_uplink(&bytes);
        assert!(registry.resolve_by_address(&frame).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn foreign_gateway_binding_excludes_device() {
        let search = Arc::new(MemorySearch::new());
        let store = Arc::new(MemoryIdentityStore::new());
        let mut identity = abp_identity("0000000000000003", 0x2600_0003, [3; 16]);
        identity.gateway_id = Some("gw-other".into());
        search.insert(identity.clone());
        store.insert(identity);

        let registry = registry_with(search, store);
        let bytes = uplink_for(0x2600_0003, [3; 16], 0);
        let frame = parse_uplink(&bytes);
        assert!(registry.resolve_by_address(&frame).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idle_entries_are_evicted() {
        let search = Arc::new(MemorySearch::new());
        let store = Arc::new(MemoryIdentityStore::new());
        let identity = abp_identity("0000000000000004", 0x2600_0004, [4; 16]);
        search.insert(identity.clone());
        store.insert(identity);

        let mut registry = registry_with(search, store);
        registry.cache_ttl = Duration::ZERO;

        let bytes = uplink_for(0x2600_0004, [4; 16], 0);
        let frame = parse_uplink(&bytes);
        registry.resolve_by_address(&frame).await.unwrap().unwrap();
        assert_eq!(registry.cached_addresses(), 1);
        assert_eq!(registry.evict_idle(), 1);
        assert_eq!(registry.cached_addresses(), 0);
    }

    #[tokio::test]
    async fn initializers_run_in_registration_order() {
        let search = Arc::new(MemorySearch::new());
        let store = Arc::new(MemoryIdentityStore::new());
        let identity = abp_identity("0000000000000006", 0x2600_0006, [6; 16]);
        search.insert(identity.clone());
        store.insert(identity);

        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |tag: &'static str| -> DeviceInitializer {
            let order = Arc::clone(&order);
            Box::new(move |_device: Arc<Device>| -> InitFuture {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().push(tag);
                    Ok(())
                })
            })
        };

        let store_dyn: Arc<dyn IdentityStore> = store;
        let counters: Arc<dyn CounterService> = Arc::new(MemoryCounterService::new());
        let registry = DeviceRegistry::new(
            "gw-1",
            search,
            store_dyn,
            counters,
            Duration::from_secs(3600),
            10,
            vec![record("counters"), record("decoder")],
        );

        let bytes = uplink_for(0x2600_0006, [6; 16], 0);
        let frame = parse_uplink(&bytes);
        registry.resolve_by_address(&frame).await.unwrap().unwrap();
        assert_eq!(*order.lock(), vec!["counters", "decoder"]);
    }

    #[tokio::test]
    async fn abp_construction_pre_advances_downlink_counter() {
        let search = Arc::new(MemorySearch::new());
        let store = Arc::new(MemoryIdentityStore::new());
        let mut identity = abp_identity("0000000000000005", 0x2600_0005, [5; 16]);
        identity.gateway_id = Some("gw-1".into());
        identity.fcnt_down = 4;
        search.insert(identity.clone());
        store.insert(identity);

        let registry = registry_with(search, Arc::clone(&store));
        let bytes = uplink_for(0x2600_0005, [5; 16], 0);
        let frame = parse_uplink(&bytes);
        let device = registry.resolve_by_address(&frame).await.unwrap().unwrap();
        assert_eq!(device.fcnt_down(), 14);
        assert_eq!(store.get(device.dev_eui()).unwrap().fcnt_down, 14);
    }
}
