//! Device entity
//!
//! One [`Device`] per physical end-device, shared across concurrent uplink
//! tasks behind an `Arc`. Frame counters and the dirty flag are atomics so
//! duplicate deliveries from multiple gateways never observe torn values;
//! a change-version counter implements the "clear dirty only if no newer
//! change raced in" persist contract.
//!
//! Session fields (keys, address, last dev-nonce) change only on join
//! completion and sit behind a small parking_lot lock.

pub mod fcnt;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use lorawan::{AesKey, DevAddr, DevNonce, Eui64};

use crate::collaborators::DeviceIdentity;

/// Session state negotiated at activation (static for ABP, rotated by OTAA)
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub dev_addr: Option<DevAddr>,
    pub nwk_skey: Option<AesKey>,
    pub app_skey: Option<AesKey>,
    pub last_dev_nonce: Option<DevNonce>,
}

/// Device record resolved from the identity store
#[derive(Debug)]
pub struct Device {
    dev_eui: Eui64,
    app_eui: Option<Eui64>,
    /// Present for OTAA devices only; its presence defines the mode
    app_key: Option<AesKey>,
    session: RwLock<Session>,

    fcnt_up: AtomicU32,
    fcnt_down: AtomicU32,
    /// Bumped on every counter mutation; persist snapshots it
    version: AtomicU64,
    /// Set when counters have unpersisted changes
    dirty: AtomicBool,

    /// Owning gateway; `None` means any gateway may serve this device
    gateway_id: Option<String>,
    decoder: Option<String>,
    receive_delay1: Option<Duration>,
    receive_delay2: Option<Duration>,
    relaxed_fcnt: bool,
    prefer_second_window: bool,
}

impl Device {
    /// Build a device from its identity-store record
    pub fn from_identity(identity: &DeviceIdentity) -> Self {
        Self {
            dev_eui: identity.dev_eui,
            app_eui: identity.app_eui,
            app_key: identity.app_key,
            session: RwLock::new(Session {
                dev_addr: identity.dev_addr,
                nwk_skey: identity.nwk_skey,
                app_skey: identity.app_skey,
                last_dev_nonce: identity.last_dev_nonce.map(DevNonce),
            }),
            fcnt_up: AtomicU32::new(identity.fcnt_up),
            fcnt_down: AtomicU32::new(identity.fcnt_down),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            gateway_id: identity.gateway_id.clone().filter(|g| !g.is_empty()),
            decoder: identity.decoder.clone(),
            receive_delay1: identity.receive_delay1_secs.map(Duration::from_secs),
            receive_delay2: identity.receive_delay2_secs.map(Duration::from_secs),
            relaxed_fcnt: identity.relaxed_fcnt,
            prefer_second_window: identity.prefer_second_window,
        }
    }

    pub fn dev_eui(&self) -> Eui64 {
        self.dev_eui
    }

    pub fn app_eui(&self) -> Option<Eui64> {
        self.app_eui
    }

    pub fn app_key(&self) -> Option<AesKey> {
        self.app_key
    }

    /// OTAA devices carry an application key; ABP devices do not
    pub fn is_otaa(&self) -> bool {
        self.app_key.is_some()
    }

    pub fn is_abp(&self) -> bool {
        self.app_key.is_none()
    }

    pub fn decoder(&self) -> Option<&str> {
        self.decoder.as_deref()
    }

    pub fn relaxed_fcnt(&self) -> bool {
        self.relaxed_fcnt
    }

    pub fn prefer_second_window(&self) -> bool {
        self.prefer_second_window
    }

    pub fn receive_delay1(&self) -> Option<Duration> {
        self.receive_delay1
    }

    pub fn receive_delay2(&self) -> Option<Duration> {
        self.receive_delay2
    }

    pub fn gateway_id(&self) -> Option<&str> {
        self.gateway_id.as_deref()
    }

    /// True when this server's gateway is the sole owner of the device
    pub fn owned_by(&self, gateway_id: &str) -> bool {
        self.gateway_id.as_deref() == Some(gateway_id)
    }

    /// Validation predicate for address resolution: the owning gateway must
    /// be unset or ours, and a network session key must be present
    pub fn serves_gateway(&self, gateway_id: &str) -> bool {
        match self.gateway_id.as_deref() {
            Some(owner) if owner != gateway_id => false,
            _ => self.session.read().nwk_skey.is_some(),
        }
    }

    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    pub fn dev_addr(&self) -> Option<DevAddr> {
        self.session.read().dev_addr
    }

    pub fn last_dev_nonce(&self) -> Option<DevNonce> {
        self.session.read().last_dev_nonce
    }

    // ========== Counter operations ==========

    pub fn fcnt_up(&self) -> u32 {
        self.fcnt_up.load(Ordering::Acquire)
    }

    pub fn fcnt_down(&self) -> u32 {
        self.fcnt_down.load(Ordering::Acquire)
    }

    pub fn set_fcnt_up(&self, value: u32) {
        self.fcnt_up.store(value, Ordering::Release);
        self.mark_dirty();
    }

    pub fn set_fcnt_down(&self, value: u32) {
        self.fcnt_down.store(value, Ordering::Release);
        self.mark_dirty();
    }

    /// Local downlink-counter allocation (single-gateway strategy)
    pub fn incr_fcnt_down(&self) -> u32 {
        let next = self.fcnt_down.fetch_add(1, Ordering::AcqRel) + 1;
        self.mark_dirty();
        next
    }

    /// Zero both counters (join completion, relaxed-counter recovery)
    pub fn reset_counters(&self) {
        self.fcnt_up.store(0, Ordering::Release);
        self.fcnt_down.store(0, Ordering::Release);
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Snapshot the change version before a persist write
    pub fn persist_snapshot(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Clear the dirty flag after a successful persist, but only if no
    /// newer counter change raced in underneath the write
    pub fn clear_dirty_if_unchanged(&self, snapshot: u64) -> bool {
        if self.version.load(Ordering::Acquire) != snapshot {
            return false;
        }
        self.dirty.store(false, Ordering::Release);
        // Compare-after-write: a writer may have bumped the version between
        // the check above and the store; re-mark dirty in that case
        if self.version.load(Ordering::Acquire) != snapshot {
            self.dirty.store(true, Ordering::Release);
            return false;
        }
        true
    }

    // ========== Join completion ==========

    /// Install freshly derived session material and reset counters
    pub fn apply_session(
        &self,
        dev_addr: DevAddr,
        nwk_skey: AesKey,
        app_skey: AesKey,
        dev_nonce: DevNonce,
    ) {
        let mut session = self.session.write();
        session.dev_addr = Some(dev_addr);
        session.nwk_skey = Some(nwk_skey);
        session.app_skey = Some(app_skey);
        session.last_dev_nonce = Some(dev_nonce);
        drop(session);
        self.reset_counters();
    }
}
