//! Frame-counter synchronization strategies
//!
//! Two strategies cover the two deployment shapes. A device bound to
//! exactly one gateway keeps counters local and persists them lazily every
//! N uplinks. A device served by several gateways must observe a globally
//! ordered downlink counter, so every allocation goes through the external
//! counter service and nothing is persisted locally.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::collaborators::{CounterService, IdentityStore, IdentityUpdate};
use crate::device::Device;
use crate::error::{LnsError, Result};

/// Counter-synchronization strategy selected per resolved device
pub enum FcntStrategy {
    /// Counters live on this server; persisted every `persist_interval`
    /// uplinks and on demand
    SingleGateway {
        store: Arc<dyn IdentityStore>,
        persist_interval: u32,
    },
    /// Counters allocated by the external counter service
    MultiGateway {
        counters: Arc<dyn CounterService>,
        gateway_id: String,
    },
}

impl FcntStrategy {
    /// Pick the strategy for a device: devices owned by this gateway use
    /// local counters, everything else defers to the counter service
    pub fn select(
        device: &Device,
        gateway_id: &str,
        store: Arc<dyn IdentityStore>,
        counters: Arc<dyn CounterService>,
        persist_interval: u32,
    ) -> Self {
        if device.owned_by(gateway_id) {
            Self::SingleGateway {
                store,
                persist_interval,
            }
        } else {
            Self::MultiGateway {
                counters,
                gateway_id: gateway_id.to_string(),
            }
        }
    }

    /// Seed counters for a freshly constructed ABP device. In single-gateway
    /// mode the downlink counter is pre-advanced by `margin` so restarts
    /// that lost unpersisted increments never reuse a counter value.
    pub async fn initialize(&self, device: &Device, margin: u32) -> Result<()> {
        if let Self::SingleGateway { store, .. } = self {
            let advanced = device.fcnt_down().saturating_add(margin);
            device.set_fcnt_down(advanced);
            let update = IdentityUpdate::counters(device.fcnt_up(), advanced);
            store
                .update_identity(device.dev_eui(), update)
                .await
                .map_err(LnsError::collaborator)?;
            let snapshot = device.persist_snapshot();
            device.clear_dirty_if_unchanged(snapshot);
        }
        Ok(())
    }

    /// Zero both counters after an out-of-order uplink from a relaxed
    /// device signalled a reset on the device side
    pub async fn reset(&self, device: &Device) -> Result<()> {
        match self {
            Self::SingleGateway { .. } => {
                device.reset_counters();
                self.persist(device, true).await
            }
            Self::MultiGateway { counters, .. } => {
                counters
                    .reset_abp_counters(device.dev_eui())
                    .await
                    .map_err(LnsError::collaborator)?;
                device.reset_counters();
                Ok(())
            }
        }
    }

    /// Allocate the next downlink counter
    pub async fn next_downlink(&self, device: &Device) -> Result<u32> {
        match self {
            Self::SingleGateway { .. } => Ok(device.incr_fcnt_down()),
            Self::MultiGateway {
                counters,
                gateway_id,
            } => {
                let next = counters
                    .next_downlink_counter(
                        device.dev_eui(),
                        device.fcnt_down(),
                        device.fcnt_up(),
                        gateway_id,
                    )
                    .await
                    .map_err(LnsError::collaborator)?;
                device.set_fcnt_down(next);
                Ok(next)
            }
        }
    }

    /// Write counters back to the identity store. Without `force` the write
    /// is skipped unless the uplink counter crossed a persist boundary; a
    /// failed write leaves the device dirty for the next attempt.
    pub async fn persist(&self, device: &Device, force: bool) -> Result<()> {
        let Self::SingleGateway {
            store,
            persist_interval,
        } = self
        else {
            return Ok(());
        };

        if !device.is_dirty() {
            return Ok(());
        }
        if !force && *persist_interval > 1 && device.fcnt_up() % persist_interval != 0 {
            debug!(
                dev_eui = %device.dev_eui(),
                fcnt_up = device.fcnt_up(),
                "deferring counter persist"
            );
            return Ok(());
        }

        let snapshot = device.persist_snapshot();
        let update = IdentityUpdate::counters(device.fcnt_up(), device.fcnt_down());
        store
            .update_identity(device.dev_eui(), update)
            .await
            .map_err(LnsError::collaborator)?;
        if !device.clear_dirty_if_unchanged(snapshot) {
            warn!(
                dev_eui = %device.dev_eui(),
                "counters changed during persist, device stays dirty"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{DeviceIdentity, MemoryCounterService, MemoryIdentityStore};
    use lorawan::{AesKey, DevAddr};

    fn abp_identity(gateway: Option<&str>) -> DeviceIdentity {
        DeviceIdentity {
            dev_eui: "0000000000000009".parse().unwrap(),
            nwk_skey: Some(AesKey::new([1; 16])),
            app_skey: Some(AesKey::new([2; 16])),
            dev_addr: Some(DevAddr::new(0x2600_0009)),
            gateway_id: gateway.map(Into::into),
            fcnt_up: 20,
            fcnt_down: 7,
            ..DeviceIdentity::default()
        }
    }

    fn strategy_for(
        device: &Device,
        store: Arc<MemoryIdentityStore>,
        counters: Arc<MemoryCounterService>,
    ) -> FcntStrategy {
        FcntStrategy::select(device, "gw-1", store, counters, 10)
    }

    #[tokio::test]
    async fn owned_device_uses_local_counters() {
        let store = Arc::new(MemoryIdentityStore::new());
        let counters = Arc::new(MemoryCounterService::new());
        let identity = abp_identity(Some("gw-1"));
        store.insert(identity.clone());
        let device = Device::from_identity(&identity);

        let strategy = strategy_for(&device, store, Arc::clone(&counters));
        let next = strategy.next_downlink(&device).await.unwrap();
        assert_eq!(next, 8);
        assert_eq!(counters.calls(), 0);
    }

    #[tokio::test]
    async fn shared_device_uses_counter_service() {
        let store = Arc::new(MemoryIdentityStore::new());
        let counters = Arc::new(MemoryCounterService::new());
        let identity = abp_identity(None);
        let device = Device::from_identity(&identity);

        let strategy = strategy_for(&device, store, Arc::clone(&counters));
        let next = strategy.next_downlink(&device).await.unwrap();
        assert!(next > 7);
        assert_eq!(counters.calls(), 1);
        assert_eq!(device.fcnt_down(), next);
    }

    #[tokio::test]
    async fn persist_skips_between_boundaries() {
        let store = Arc::new(MemoryIdentityStore::new());
        let counters = Arc::new(MemoryCounterService::new());
        let identity = abp_identity(Some("gw-1"));
        store.insert(identity.clone());
        let device = Device::from_identity(&identity);
        let strategy = strategy_for(&device, Arc::clone(&store), counters);

        // 21 is not a multiple of the persist interval
        device.set_fcnt_up(21);
        strategy.persist(&device, false).await.unwrap();
        assert!(device.is_dirty());
        assert_eq!(store.get(device.dev_eui()).unwrap().fcnt_up, 20);

        device.set_fcnt_up(30);
        strategy.persist(&device, false).await.unwrap();
        assert!(!device.is_dirty());
        assert_eq!(store.get(device.dev_eui()).unwrap().fcnt_up, 30);
    }

    #[tokio::test]
    async fn forced_persist_ignores_interval() {
        let store = Arc::new(MemoryIdentityStore::new());
        let counters = Arc::new(MemoryCounterService::new());
        let identity = abp_identity(Some("gw-1"));
        store.insert(identity.clone());
        let device = Device::from_identity(&identity);
        let strategy = strategy_for(&device, Arc::clone(&store), counters);

        device.set_fcnt_up(21);
        strategy.persist(&device, true).await.unwrap();
        assert!(!device.is_dirty());
        assert_eq!(store.get(device.dev_eui()).unwrap().fcnt_up, 21);
    }

    #[tokio::test]
    async fn failed_persist_keeps_device_dirty() {
        let store = Arc::new(MemoryIdentityStore::new());
        let counters = Arc::new(MemoryCounterService::new());
        let identity = abp_identity(Some("gw-1"));
        store.insert(identity.clone());
        let device = Device::from_identity(&identity);
        let strategy = strategy_for(&device, Arc::clone(&store), counters);

        device.set_fcnt_up(30);
        store.set_fail_updates(true);
        assert!(strategy.persist(&device, false).await.is_err());
        assert!(device.is_dirty());
    }

    #[tokio::test]
    async fn abp_initialize_pre_advances_downlink_counter() {
        let store = Arc::new(MemoryIdentityStore::new());
        let counters = Arc::new(MemoryCounterService::new());
        let identity = abp_identity(Some("gw-1"));
        store.insert(identity.clone());
        let device = Device::from_identity(&identity);
        let strategy = strategy_for(&device, Arc::clone(&store), counters);

        strategy.initialize(&device, 10).await.unwrap();
        assert_eq!(device.fcnt_down(), 17);
        assert_eq!(store.get(device.dev_eui()).unwrap().fcnt_down, 17);
        assert!(!device.is_dirty());
    }

    #[tokio::test]
    async fn multi_gateway_reset_clears_external_state() {
        let store = Arc::new(MemoryIdentityStore::new());
        let counters = Arc::new(MemoryCounterService::new());
        let identity = abp_identity(None);
        let device = Device::from_identity(&identity);
        let strategy = strategy_for(&device, store, Arc::clone(&counters));

        strategy.next_downlink(&device).await.unwrap();
        strategy.reset(&device).await.unwrap();
        assert_eq!(device.fcnt_up(), 0);
        assert_eq!(device.fcnt_down(), 0);

        // After the reset the service starts over from the device counter
        let next = strategy.next_downlink(&device).await.unwrap();
        assert_eq!(next, 1);
    }
}
