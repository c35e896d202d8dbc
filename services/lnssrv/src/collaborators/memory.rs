//! In-memory collaborator implementations
//!
//! Back the integration tests and local runs. Semantics mirror the cloud
//! backends closely enough to exercise the processor: the queue supports
//! complete/abandon redelivery, the search collaborator reports dev-nonce
//! replay, and the counter service hands out strictly increasing values.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use lorawan::{DevAddr, DevNonce, Eui64};

use super::{
    CounterService, DeviceIdentity, DeviceSearch, DownlinkQueue, IdentityStore, IdentityUpdate,
    QueuedDownlink, SearchOutcome, TelemetrySink, UplinkEvent,
};

/// Identity store over a HashMap
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: Mutex<HashMap<Eui64, DeviceIdentity>>,
    /// When set, the next update call fails (collaborator-failure tests)
    fail_updates: Mutex<bool>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: DeviceIdentity) {
        self.identities.lock().insert(identity.dev_eui, identity);
    }

    pub fn get(&self, dev_eui: Eui64) -> Option<DeviceIdentity> {
        self.identities.lock().get(&dev_eui).cloned()
    }

    pub fn set_fail_updates(&self, fail: bool) {
        *self.fail_updates.lock() = fail;
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get_identity(&self, dev_eui: Eui64) -> anyhow::Result<Option<DeviceIdentity>> {
        Ok(self.identities.lock().get(&dev_eui).cloned())
    }

    async fn update_identity(&self, dev_eui: Eui64, update: IdentityUpdate) -> anyhow::Result<()> {
        if *self.fail_updates.lock() {
            anyhow::bail!("identity store unavailable");
        }
        let mut identities = self.identities.lock();
        let identity = identities
            .get_mut(&dev_eui)
            .ok_or_else(|| anyhow::anyhow!("unknown device {dev_eui}"))?;
        if let Some(k) = update.nwk_skey {
            identity.nwk_skey = Some(k);
        }
        if let Some(k) = update.app_skey {
            identity.app_skey = Some(k);
        }
        if let Some(a) = update.dev_addr {
            identity.dev_addr = Some(a);
        }
        if let Some(v) = update.fcnt_up {
            identity.fcnt_up = v;
        }
        if let Some(v) = update.fcnt_down {
            identity.fcnt_down = v;
        }
        if let Some(n) = update.last_dev_nonce {
            identity.last_dev_nonce = Some(n);
        }
        Ok(())
    }
}

/// Search collaborator over the same identity map
#[derive(Debug, Default)]
pub struct MemorySearch {
    identities: Mutex<HashMap<Eui64, DeviceIdentity>>,
    used_nonces: Mutex<HashMap<Eui64, HashSet<u16>>>,
}

impl MemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: DeviceIdentity) {
        self.identities.lock().insert(identity.dev_eui, identity);
    }

    /// Mark a dev-nonce as consumed (replay tests)
    pub fn mark_nonce_used(&self, dev_eui: Eui64, nonce: u16) {
        self.used_nonces.lock().entry(dev_eui).or_default().insert(nonce);
    }
}

#[async_trait]
impl DeviceSearch for MemorySearch {
    async fn by_address(
        &self,
        _gateway_id: &str,
        dev_addr: DevAddr,
    ) -> anyhow::Result<SearchOutcome> {
        let devices = self
            .identities
            .lock()
            .values()
            .filter(|d| d.dev_addr == Some(dev_addr))
            .cloned()
            .collect();
        Ok(SearchOutcome {
            devices,
            dev_nonce_already_used: false,
        })
    }

    async fn by_join(
        &self,
        _gateway_id: &str,
        dev_eui: Eui64,
        app_eui: Eui64,
        dev_nonce: DevNonce,
    ) -> anyhow::Result<SearchOutcome> {
        let already_used = self
            .used_nonces
            .lock()
            .get(&dev_eui)
            .is_some_and(|set| set.contains(&dev_nonce.0));
        if already_used {
            return Ok(SearchOutcome {
                devices: Vec::new(),
                dev_nonce_already_used: true,
            });
        }
        let devices = self
            .identities
            .lock()
            .get(&dev_eui)
            .filter(|d| d.app_eui == Some(app_eui))
            .cloned()
            .into_iter()
            .collect();
        Ok(SearchOutcome {
            devices,
            dev_nonce_already_used: false,
        })
    }
}

/// Counter service allocating from a local map
#[derive(Debug, Default)]
pub struct MemoryCounterService {
    counters: Mutex<HashMap<Eui64, u32>>,
    calls: Mutex<u32>,
}

impl MemoryCounterService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl CounterService for MemoryCounterService {
    async fn next_downlink_counter(
        &self,
        dev_eui: Eui64,
        current_down: u32,
        _current_up: u32,
        _gateway_id: &str,
    ) -> anyhow::Result<u32> {
        *self.calls.lock() += 1;
        let mut counters = self.counters.lock();
        let entry = counters.entry(dev_eui).or_insert(current_down);
        *entry = (*entry).max(current_down) + 1;
        Ok(*entry)
    }

    async fn reset_abp_counters(&self, dev_eui: Eui64) -> anyhow::Result<()> {
        self.counters.lock().remove(&dev_eui);
        Ok(())
    }
}

/// Cloud-to-device queue with complete/abandon semantics
#[derive(Debug, Default)]
pub struct MemoryDownlinkQueue {
    pending: Mutex<HashMap<Eui64, VecDeque<QueuedDownlink>>>,
    in_flight: Mutex<HashMap<(Eui64, u64), QueuedDownlink>>,
}

impl MemoryDownlinkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, dev_eui: Eui64, message: QueuedDownlink) {
        self.pending.lock().entry(dev_eui).or_default().push_back(message);
    }

    pub fn pending_count(&self, dev_eui: Eui64) -> usize {
        self.pending.lock().get(&dev_eui).map_or(0, VecDeque::len)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[async_trait]
impl DownlinkQueue for MemoryDownlinkQueue {
    async fn receive(
        &self,
        dev_eui: Eui64,
        _timeout: Duration,
    ) -> anyhow::Result<Option<QueuedDownlink>> {
        let message = self
            .pending
            .lock()
            .get_mut(&dev_eui)
            .and_then(VecDeque::pop_front);
        if let Some(message) = &message {
            self.in_flight
                .lock()
                .insert((dev_eui, message.id), message.clone());
        }
        Ok(message)
    }

    async fn complete(&self, dev_eui: Eui64, id: u64) -> anyhow::Result<()> {
        self.in_flight
            .lock()
            .remove(&(dev_eui, id))
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("message {id} is not in flight"))
    }

    async fn abandon(&self, dev_eui: Eui64, id: u64) -> anyhow::Result<()> {
        let message = self
            .in_flight
            .lock()
            .remove(&(dev_eui, id))
            .ok_or_else(|| anyhow::anyhow!("message {id} is not in flight"))?;
        self.pending
            .lock()
            .entry(dev_eui)
            .or_default()
            .push_front(message);
        Ok(())
    }
}

/// Telemetry sink collecting events in memory
#[derive(Debug, Default)]
pub struct MemoryTelemetrySink {
    events: Mutex<Vec<UplinkEvent>>,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UplinkEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetrySink {
    async fn publish(&self, event: UplinkEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
