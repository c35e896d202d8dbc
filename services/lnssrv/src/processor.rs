//! Uplink message processing
//!
//! One [`MessageProcessor::process_frame`] call per received uplink. The
//! flow is: region selection, frame parse, device resolution, counter
//! validation, payload decrypt and decode, telemetry publish, and finally
//! the downlink decision (acknowledgement, MAC answers, cloud-to-device
//! payload) gated by the receive-window time budget.
//!
//! Failures split two ways: frames that cannot or must not be answered
//! resolve to `Ok(None)` and are logged, while collaborator failures and
//! missed mandatory windows surface as errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::RngCore;
use tracing::{debug, info, warn};

use lorawan::{
    crypto, maccmd, AppNonce, DataDownBuilder, DataUpFrame, JoinAcceptBuilder, JoinRequestFrame,
    MacCommand, ParsedFrame,
};

use crate::collaborators::{
    DownlinkQueue, IdentityStore, IdentityUpdate, QueuedDownlink, TelemetrySink, UplinkEvent,
};
use crate::config::LnsConfig;
use crate::decoder;
use crate::device::Device;
use crate::error::{LnsError, Result};
use crate::region::{RegionParams, RegionSet};
use crate::registry::DeviceRegistry;
use crate::timing::{ReceiveWindow, TimeWatcher};

/// Radio metadata accompanying one received uplink
#[derive(Debug, Clone, Copy)]
pub struct UplinkContext {
    /// Uplink center frequency in Hz
    pub frequency: u32,
    /// Uplink datarate index
    pub datarate: u8,
    /// Signal-to-noise ratio in dB, when the gateway reported one
    pub snr: Option<f32>,
    /// Arrival instant; all window deadlines anchor here
    pub received_at: Instant,
}

/// A downlink ready for transmission through the gateway
#[derive(Debug, Clone)]
pub struct DownlinkFrame {
    pub bytes: Vec<u8>,
    /// Downstream center frequency in Hz
    pub frequency: u32,
    /// Downstream datarate index
    pub datarate: u8,
    /// Transmit delay relative to the uplink arrival
    pub delay: Duration,
    pub window: ReceiveWindow,
}

pub struct MessageProcessor {
    config: Arc<LnsConfig>,
    regions: RegionSet,
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn IdentityStore>,
    queue: Arc<dyn DownlinkQueue>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl MessageProcessor {
    pub fn new(
        config: Arc<LnsConfig>,
        regions: RegionSet,
        registry: Arc<DeviceRegistry>,
        store: Arc<dyn IdentityStore>,
        queue: Arc<dyn DownlinkQueue>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            regions,
            registry,
            store,
            queue,
            telemetry,
        }
    }

    /// Process one raw uplink frame
    pub async fn process_frame(
        &self,
        raw: &[u8],
        ctx: UplinkContext,
    ) -> Result<Option<DownlinkFrame>> {
        let region = self.regions.select(ctx.frequency).ok_or_else(|| {
            LnsError::Region(format!("no configured region covers {} Hz", ctx.frequency))
        })?;
        if !region.is_valid_uplink_datarate(ctx.datarate) {
            return Err(LnsError::Region(format!(
                "datarate DR{} is not a valid {} uplink rate",
                ctx.datarate, region.name
            )));
        }

        match ParsedFrame::parse(raw)? {
            ParsedFrame::JoinRequest(frame) => self.process_join(&frame, ctx, &region).await,
            ParsedFrame::DataUp(frame) => self.process_data(&frame, ctx, &region).await,
            ParsedFrame::Other(mtype) => {
                debug!(?mtype, "ignoring frame type not handled by the network server");
                Ok(None)
            },
        }
    }

    fn watcher(
        &self,
        ctx: UplinkContext,
        region: &RegionParams,
        device: Option<&Device>,
    ) -> TimeWatcher {
        TimeWatcher::new(
            ctx.received_at,
            region,
            device,
            self.config.package_and_send_budget(),
            self.config.downlink_poll_budget(),
        )
    }

    // ========== Join path ==========

    async fn process_join(
        &self,
        frame: &JoinRequestFrame,
        ctx: UplinkContext,
        region: &RegionParams,
    ) -> Result<Option<DownlinkFrame>> {
        let Some(device) = self.registry.resolve_by_join(frame).await? else {
            return Ok(None);
        };
        let Some(app_key) = device.app_key() else {
            return Ok(None);
        };
        if !frame.check_mic(&app_key) {
            warn!(dev_eui = %frame.dev_eui, "join request failed MIC check");
            return Ok(None);
        }

        let mut nonce = [0u8; 3];
        rand::thread_rng().fill_bytes(&mut nonce);
        let app_nonce = AppNonce(nonce);
        let net_id = self.config.network_id;
        let dev_addr = crypto::derive_dev_addr(&app_key, app_nonce, net_id, frame.dev_nonce);
        let (nwk_skey, app_skey) =
            crypto::derive_session_keys(&app_key, app_nonce, net_id, frame.dev_nonce);

        // Store the new session before answering: a join accept the device
        // acts on must never reference keys the network lost
        self.store
            .update_identity(
                frame.dev_eui,
                IdentityUpdate {
                    nwk_skey: Some(nwk_skey),
                    app_skey: Some(app_skey),
                    dev_addr: Some(dev_addr),
                    fcnt_up: Some(0),
                    fcnt_down: Some(0),
                    last_dev_nonce: Some(frame.dev_nonce.0),
                },
            )
            .await
            .map_err(LnsError::collaborator)?;

        let old_addr = device.dev_addr();
        device.apply_session(dev_addr, nwk_skey, app_skey, frame.dev_nonce);
        let snapshot = device.persist_snapshot();
        device.clear_dirty_if_unchanged(snapshot);
        self.registry.register_after_join(&device, old_addr, dev_addr);

        let watcher = self.watcher(ctx, region, Some(device.as_ref()));
        let Some(window) = watcher.select_join_window(device.prefer_second_window()) else {
            return Err(LnsError::TimeBudgetExhausted(format!(
                "join accept for {} missed both windows",
                frame.dev_eui
            )));
        };

        let accept = JoinAcceptBuilder {
            app_nonce,
            net_id,
            dev_addr,
            dl_settings: region.rx2_datarate & 0x0F,
            rx_delay: watcher.receive_delay1().as_secs() as u8,
            cf_list: None,
        };
        let bytes = accept.build(&app_key);

        info!(dev_eui = %frame.dev_eui, %dev_addr, ?window, "join accepted");
        Ok(Some(self.downlink_on(window, bytes, ctx, region, &watcher, true)))
    }

    // ========== Data path ==========

    async fn process_data(
        &self,
        frame: &DataUpFrame,
        ctx: UplinkContext,
        region: &RegionParams,
    ) -> Result<Option<DownlinkFrame>> {
        let Some(device) = self.registry.resolve_by_address(frame).await? else {
            debug!(dev_addr = %frame.dev_addr, "uplink from unresolvable address");
            return Ok(None);
        };
        let session = device.session();
        let (Some(nwk_skey), Some(app_skey)) = (session.nwk_skey, session.app_skey) else {
            return Err(LnsError::ValidationFailed(format!(
                "device {} session is missing keys",
                device.dev_eui()
            )));
        };
        if let Some(max) = region.max_payload_size(ctx.datarate) {
            if frame.frm_payload.len() as u32 > max {
                warn!(
                    dev_eui = %device.dev_eui(),
                    len = frame.frm_payload.len(),
                    max,
                    "payload exceeds regional maximum, dropping"
                );
                return Ok(None);
            }
        }

        let watcher = self.watcher(ctx, region, Some(device.as_ref()));
        let strategy = self.registry.strategy_for(&device);

        let accepted = match classify_fcnt(device.fcnt_up(), frame.fcnt, region.max_fcnt_gap) {
            FcntOutcome::Next(value) => value,
            FcntOutcome::Resubmission => {
                return self.answer_resubmission(frame, &device, ctx, region, &watcher).await;
            },
            FcntOutcome::Stale => {
                // A restarted relaxed device presents a near-zero counter;
                // any other stale counter is a replay even in relaxed mode
                if device.relaxed_fcnt() && frame.fcnt <= 1 && device.fcnt_up() > 0 {
                    info!(dev_eui = %device.dev_eui(), fcnt = frame.fcnt, "relaxed counter recovery");
                    strategy.reset(&device).await?;
                    u32::from(frame.fcnt)
                } else {
                    debug!(dev_eui = %device.dev_eui(), fcnt = frame.fcnt, "stale frame counter, dropping");
                    return Ok(None);
                }
            },
        };
        device.set_fcnt_up(accepted);

        // MAC commands ride either in FOpts or, on port 0, in the payload
        let plaintext = frame.fport.map(|_| frame.decrypt_payload(&nwk_skey, &app_skey));
        let commands = if frame.fport == Some(0) {
            maccmd::decode_uplink(plaintext.as_deref().unwrap_or_default())
        } else {
            maccmd::decode_uplink(&frame.fopts)
        };
        let mac_answers = self.answer_mac_commands(&commands, ctx, &device);

        if frame.is_bare_ack() {
            debug!(dev_eui = %device.dev_eui(), fcnt = accepted, "content-less acknowledgement, nothing to decode");
        } else if let (Some(fport), Some(plaintext)) = (frame.fport, plaintext.as_ref()) {
            if fport != 0 {
                self.publish_telemetry(&device, frame, fport, plaintext).await;
            }
        }

        let need_ack = frame.is_confirmed();

        // Claim the downlink slot for confirmed traffic up front, before
        // the queue poll can spend the remaining budget or a missed window
        // bails out
        let mut fcnt_down = None;
        if need_ack {
            fcnt_down = Some(strategy.next_downlink(&device).await?);
        }

        // Cloud-to-device poll, skipped when the remaining window time
        // cannot cover a poll plus packaging
        let mut c2d = None;
        let mut fpending = false;
        if let Some(timeout) = watcher.poll_timeout() {
            c2d = self.poll_downlink(&device, timeout, region).await;
            if c2d.is_some() {
                fpending = self.more_pending(&device).await;
            }
        } else {
            debug!(dev_eui = %device.dev_eui(), "skipping downlink poll, window budget too tight");
        }

        if !need_ack && mac_answers.is_empty() && c2d.is_none() {
            strategy.persist(&device, false).await?;
            return Ok(None);
        }

        let Some(window) = watcher.select_window(device.prefer_second_window()) else {
            if let Some(msg) = c2d {
                self.abandon_quietly(&device, msg.id).await;
            }
            // The uplink counter (and a claimed downlink slot) already
            // moved, the missed window must not lose them
            strategy.persist(&device, false).await?;
            if need_ack {
                return Err(LnsError::TimeBudgetExhausted(format!(
                    "acknowledgement for {} missed both windows",
                    device.dev_eui()
                )));
            }
            return Ok(None);
        };

        let fcnt_down = match fcnt_down {
            Some(value) => value,
            None => strategy.next_downlink(&device).await?,
        };
        let mut builder = DataDownBuilder::new(frame.dev_addr, fcnt_down);
        builder.ack = need_ack;
        builder.fpending = fpending;
        builder.fopts = maccmd::encode_all(&mac_answers)?;
        if let Some(msg) = &c2d {
            builder.confirmed = msg.confirmed;
            builder.fport = Some(msg.fport);
            builder.payload = msg.payload.clone();
        }
        let bytes = builder.build(&nwk_skey, &app_skey)?;

        if let Some(msg) = &c2d {
            if let Err(e) = self.queue.complete(device.dev_eui(), msg.id).await {
                warn!(dev_eui = %device.dev_eui(), id = msg.id, error = %e, "failed to complete downlink message");
            }
        }
        strategy.persist(&device, false).await?;

        debug!(dev_eui = %device.dev_eui(), fcnt_down, ?window, "sending data downlink");
        Ok(Some(self.downlink_on(window, bytes, ctx, region, &watcher, false)))
    }

    /// A confirmed resubmission gets its acknowledgement again and nothing
    /// else; an unconfirmed duplicate is dropped
    async fn answer_resubmission(
        &self,
        frame: &DataUpFrame,
        device: &Arc<Device>,
        ctx: UplinkContext,
        region: &RegionParams,
        watcher: &TimeWatcher,
    ) -> Result<Option<DownlinkFrame>> {
        if !frame.is_confirmed() {
            debug!(dev_eui = %device.dev_eui(), fcnt = frame.fcnt, "duplicate unconfirmed uplink, dropping");
            return Ok(None);
        }
        let session = device.session();
        let (Some(nwk_skey), Some(app_skey)) = (session.nwk_skey, session.app_skey) else {
            return Err(LnsError::ValidationFailed(format!(
                "device {} session is missing keys",
                device.dev_eui()
            )));
        };
        let Some(window) = watcher.select_window(device.prefer_second_window()) else {
            return Err(LnsError::TimeBudgetExhausted(format!(
                "repeat acknowledgement for {} missed both windows",
                device.dev_eui()
            )));
        };

        let strategy = self.registry.strategy_for(device);
        let fcnt_down = strategy.next_downlink(device).await?;
        let mut builder = DataDownBuilder::new(frame.dev_addr, fcnt_down);
        builder.ack = true;
        let bytes = builder.build(&nwk_skey, &app_skey)?;
        strategy.persist(device, false).await?;

        info!(dev_eui = %device.dev_eui(), fcnt = frame.fcnt, "re-acknowledging resubmitted uplink");
        Ok(Some(self.downlink_on(window, bytes, ctx, region, watcher, false)))
    }

    /// Answers the network owes for uplinked MAC commands
    fn answer_mac_commands(
        &self,
        commands: &[MacCommand],
        ctx: UplinkContext,
        device: &Device,
    ) -> Vec<MacCommand> {
        let mut answers = Vec::new();
        for command in commands {
            match command {
                MacCommand::LinkCheckReq => {
                    answers.push(MacCommand::LinkCheckAns {
                        margin: link_margin(ctx.snr),
                        gateway_count: 1,
                    });
                },
                other => {
                    debug!(dev_eui = %device.dev_eui(), cid = other.cid(), "MAC command noted, no answer required");
                },
            }
        }
        answers
    }

    async fn publish_telemetry(
        &self,
        device: &Device,
        frame: &DataUpFrame,
        fport: u8,
        plaintext: &[u8],
    ) {
        let decoder_name = device.decoder().unwrap_or(decoder::HEX_SENSOR);
        let fields = decoder::decode(device.decoder(), plaintext, fport);
        let event = UplinkEvent {
            dev_eui: device.dev_eui(),
            gateway_id: self.registry.gateway_id().to_string(),
            received_at: Utc::now(),
            fcnt: device.fcnt_up(),
            fport: Some(fport),
            decoder: decoder_name.to_string(),
            fields,
        };
        // Telemetry loss must not fail frame processing
        if let Err(e) = self.telemetry.publish(event).await {
            warn!(dev_eui = %device.dev_eui(), error = %e, "telemetry publish failed");
        }
    }

    /// Poll the queue and validate the message against the wire limits;
    /// invalid messages are completed so they cannot wedge the queue
    async fn poll_downlink(
        &self,
        device: &Device,
        timeout: Duration,
        region: &RegionParams,
    ) -> Option<QueuedDownlink> {
        let msg = match self.queue.receive(device.dev_eui(), timeout).await {
            Ok(msg) => msg?,
            Err(e) => {
                warn!(dev_eui = %device.dev_eui(), error = %e, "downlink queue poll failed");
                return None;
            },
        };

        let max = region
            .max_payload_size(region.rx2_datarate)
            .unwrap_or(u32::from(u8::MAX));
        if msg.fport == 0 || msg.payload.len() as u32 > max {
            warn!(
                dev_eui = %device.dev_eui(),
                id = msg.id,
                fport = msg.fport,
                len = msg.payload.len(),
                "rejecting invalid cloud-to-device message"
            );
            if let Err(e) = self.queue.complete(device.dev_eui(), msg.id).await {
                warn!(dev_eui = %device.dev_eui(), id = msg.id, error = %e, "failed to reject message");
            }
            return None;
        }
        Some(msg)
    }

    /// Probe for further queued messages to decide the FPending bit; the
    /// probe message itself is returned to the queue
    async fn more_pending(&self, device: &Device) -> bool {
        match self.queue.receive(device.dev_eui(), Duration::ZERO).await {
            Ok(Some(next)) => {
                self.abandon_quietly(device, next.id).await;
                true
            },
            Ok(None) => false,
            Err(e) => {
                warn!(dev_eui = %device.dev_eui(), error = %e, "pending-message probe failed");
                false
            },
        }
    }

    async fn abandon_quietly(&self, device: &Device, id: u64) {
        if let Err(e) = self.queue.abandon(device.dev_eui(), id).await {
            warn!(dev_eui = %device.dev_eui(), id, error = %e, "failed to abandon downlink message");
        }
    }

    /// Frequency, datarate and delay for a downlink on the given window
    fn downlink_on(
        &self,
        window: ReceiveWindow,
        bytes: Vec<u8>,
        ctx: UplinkContext,
        region: &RegionParams,
        watcher: &TimeWatcher,
        join: bool,
    ) -> DownlinkFrame {
        let (frequency, datarate, delay) = match window {
            ReceiveWindow::First => (
                region.downstream_frequency(ctx.frequency, ctx.datarate),
                region.downstream_datarate(ctx.datarate, 0),
                if join {
                    region.join_accept_delay1
                } else {
                    watcher.receive_delay1()
                },
            ),
            ReceiveWindow::Second => (
                region.rx2_frequency,
                region.rx2_datarate,
                if join {
                    region.join_accept_delay1 + region.join_accept_delay2
                } else {
                    watcher.receive_delay2()
                },
            ),
        };
        DownlinkFrame {
            bytes,
            frequency,
            datarate,
            delay,
            window,
        }
    }
}

/// Uplink counter classification against the last accepted value
#[derive(Debug, PartialEq, Eq)]
enum FcntOutcome {
    /// Accept and record this 32-bit counter
    Next(u32),
    /// Same counter as the last accepted uplink
    Resubmission,
    /// Behind the last accepted uplink
    Stale,
}

/// Extend the 16-bit wire counter against the 32-bit stored one and decide
/// whether the frame moves the sequence forward
fn classify_fcnt(current: u32, wire: u16, max_gap: u32) -> FcntOutcome {
    let candidate = (current & 0xFFFF_0000) | u32::from(wire);
    if candidate == current {
        if current == 0 {
            // First frame of a fresh session
            return FcntOutcome::Next(0);
        }
        return FcntOutcome::Resubmission;
    }
    if candidate > current {
        if candidate - current > max_gap {
            return FcntOutcome::Stale;
        }
        return FcntOutcome::Next(candidate);
    }
    // The 16-bit counter wrapped into the next window
    let rolled = candidate + 0x1_0000;
    if rolled - current <= max_gap {
        FcntOutcome::Next(rolled)
    } else {
        FcntOutcome::Stale
    }
}

/// Demodulation margin reported in LinkCheckAns
fn link_margin(snr: Option<f32>) -> u8 {
    match snr {
        Some(snr) => snr.round().clamp(0.0, 254.0) as u8,
        None => 0,
    }
}
