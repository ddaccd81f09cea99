// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Per-call tap sessions and their resource graph.
//!
//! A tap session owns everything the orchestrator created for one call:
//! snoop channels, mixing bridges, external-media channels, and either a
//! port lease at the framed gateway or a context registration at the
//! streaming gateway. Cleanup is latched so any number of terminal events
//! tears the graph down exactly once, and every teardown step is
//! best-effort so a half-gone call can not wedge the orchestrator.

use crate::gateways::GatewayClients;
use crate::metrics;
use crate::ports::PortAllocator;
use crate::settings::Settings;
use anyhow::{bail, Context, Result};
use auricle_ari_client::{AriClient, Channel, SpyDirection};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::sleep;

/// External-media channels re-enter the stasis application under this
/// technology prefix and must not be mistaken for snoops
pub const EXTERNAL_MEDIA_PREFIX: &str = "UnicastRTP";

const ADD_CHANNEL_ATTEMPTS: usize = 5;
const ADD_CHANNEL_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Framed,
    Streaming,
}

impl Backend {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "framed" => Some(Backend::Framed),
            "streaming" => Some(Backend::Streaming),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Framed => "framed",
            Backend::Streaming => "streaming",
        }
    }
}

/// Direction key of a call's bridges: one `Both` for the framed backend,
/// `In`/`Out` for the streaming backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapDirection {
    In,
    Out,
    Both,
}

impl TapDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(TapDirection::In),
            "out" => Some(TapDirection::Out),
            "both" => Some(TapDirection::Both),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TapDirection::In => "in",
            TapDirection::Out => "out",
            TapDirection::Both => "both",
        }
    }

    fn spy(self) -> SpyDirection {
        match self {
            TapDirection::In => SpyDirection::In,
            TapDirection::Out => SpyDirection::Out,
            TapDirection::Both => SpyDirection::Both,
        }
    }
}

/// Call metadata passed through `/start_tap`
#[derive(Debug, Clone, Default)]
pub struct CallMeta {
    pub extension: String,
    pub caller: String,
    pub caller_name: String,
    pub agent_extension: String,
    pub agent_username: String,
    pub agent_id: String,
}

/// Arguments carried on snoop and external-media channels so their stasis
/// events can be routed back to the call
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TapArgs {
    pub role: Option<String>,
    pub uuid: Option<String>,
    pub dir: Option<TapDirection>,
    pub backend: Option<Backend>,
}

impl TapArgs {
    pub fn format(role: &str, uuid: &str, dir: TapDirection, backend: Backend) -> String {
        format!(
            "role={role},uuid={uuid},dir={},gw={}",
            dir.as_str(),
            backend.as_str()
        )
    }

    pub fn parse(args: &[String]) -> Self {
        let mut parsed = Self::default();

        // the PBX splits appArgs on commas; each piece is key=value
        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };

            match key {
                "role" => parsed.role = Some(value.to_owned()),
                "uuid" => parsed.uuid = Some(value.to_owned()),
                "dir" => parsed.dir = TapDirection::parse(value),
                "gw" => parsed.backend = Backend::parse(value),
                _ => {}
            }
        }

        parsed
    }
}

#[derive(Clone)]
pub struct TapSession {
    pub backend: Backend,
    pub meta: CallMeta,
    pub snoops: Vec<String>,
    pub external_media: Vec<String>,
    pub bridges: HashMap<TapDirection, String>,
    bridge_slots: HashMap<TapDirection, Arc<OnceCell<String>>>,
    /// Snoop channels whose pipeline is already set up; duplicate
    /// stasis-start deliveries for them are ignored
    wired: HashSet<String>,
    pub port: Option<u16>,
    pub cleaned: bool,
}

impl TapSession {
    fn new(backend: Backend, meta: CallMeta) -> Self {
        Self {
            backend,
            meta,
            snoops: Vec::new(),
            external_media: Vec::new(),
            bridges: HashMap::new(),
            bridge_slots: HashMap::new(),
            wired: HashSet::new(),
            port: None,
            cleaned: false,
        }
    }
}

pub struct StartTapParams {
    pub channel: String,
    pub uuid: String,
    pub backend: Backend,
    pub meta: CallMeta,
}

pub struct Orchestrator {
    pub settings: Arc<Settings>,
    ari: AriClient,
    gateways: GatewayClients,
    ports: PortAllocator,
    sessions: Mutex<HashMap<String, TapSession>>,
    channel_index: Mutex<HashMap<String, String>>,
}

impl Orchestrator {
    pub fn new(settings: Arc<Settings>) -> Result<Arc<Self>> {
        let mut ari = AriClient::connect(
            &settings.ari.base_url,
            settings.ari.path_prefix.as_deref(),
            &settings.ari.username,
            &settings.ari.password,
        )
        .context("invalid ARI base url")?
        .with_events_endpoint(settings.ari.events_endpoint);

        if let Some(url) = &settings.ari.events_url {
            ari = ari.with_events_url(url.clone());
        }

        let (port_start, port_end) = settings
            .framed
            .as_ref()
            .map(|framed| (framed.port_range.start, framed.port_range.end))
            .unwrap_or((40000, 49999));

        Ok(Arc::new(Self {
            gateways: GatewayClients::new(&settings),
            ports: PortAllocator::new(port_start, port_end),
            ari,
            settings,
            sessions: Mutex::new(HashMap::new()),
            channel_index: Mutex::new(HashMap::new()),
        }))
    }

    /// Open the stasis event stream this orchestrator drives on
    pub async fn connect_events(&self) -> Result<auricle_ari_client::AriEvents> {
        self.ari
            .start(&self.settings.ari.app)
            .await
            .context("failed to open the stasis event stream")
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Ports currently leased for framed taps (observability)
    pub fn leased_ports(&self) -> usize {
        self.ports.leased()
    }

    /// Handle `/start_tap`: create the session, reserve gateway resources,
    /// and ask the PBX for the snoop channel(s). The rest of the pipeline
    /// is driven by the snoops' stasis-start events.
    pub async fn start_tap(self: &Arc<Self>, params: StartTapParams) -> Result<()> {
        log::info!(
            "starting {} tap for call {} on channel {}",
            params.backend.as_str(),
            params.uuid,
            params.channel
        );

        {
            let mut sessions = self.sessions.lock();

            let session = sessions
                .entry(params.uuid.clone())
                .or_insert_with(|| TapSession::new(params.backend, params.meta.clone()));

            if session.cleaned {
                bail!("call {} is already being cleaned up", params.uuid);
            }

            session.backend = params.backend;
            session.meta = params.meta.clone();
        }

        metrics::SESSIONS_ACTIVE.set(self.sessions.lock().len() as i64);

        let result = match params.backend {
            Backend::Framed => self.start_framed_tap(&params).await,
            Backend::Streaming => self.start_streaming_tap(&params).await,
        };

        if let Err(e) = result {
            metrics::TAPS_FAILED.inc();
            self.cleanup_session(&params.uuid, "start-failed").await;
            return Err(e);
        }

        metrics::TAPS_STARTED
            .with_label_values(&[params.backend.as_str()])
            .inc();

        Ok(())
    }

    async fn start_framed_tap(self: &Arc<Self>, params: &StartTapParams) -> Result<()> {
        let port = self
            .ports
            .allocate()
            .context("framed rtp port range is exhausted")?;

        // reserve the port at the gateway before the PBX learns about it;
        // a rejected reservation abandons the tap
        if let Err(e) = self
            .gateways
            .framed_register(&params.uuid, port, &params.meta)
            .await
        {
            self.ports.free(port);
            return Err(e);
        }

        let tap_still_active = {
            let mut sessions = self.sessions.lock();

            match sessions.get_mut(&params.uuid) {
                Some(session) if !session.cleaned => {
                    session.port = Some(port);
                    true
                }
                _ => false,
            }
        };

        if !tap_still_active {
            self.gateways.framed_unregister(port).await.ok();
            self.ports.free(port);
            bail!("call {} ended before the tap was set up", params.uuid);
        }

        self.create_snoop(&params.uuid, &params.channel, TapDirection::Both, params.backend)
            .await?;

        Ok(())
    }

    async fn start_streaming_tap(self: &Arc<Self>, params: &StartTapParams) -> Result<()> {
        for direction in [TapDirection::In, TapDirection::Out] {
            self.create_snoop(&params.uuid, &params.channel, direction, params.backend)
                .await?;
        }

        Ok(())
    }

    async fn create_snoop(
        &self,
        uuid: &str,
        channel: &str,
        direction: TapDirection,
        backend: Backend,
    ) -> Result<()> {
        let snoop = self
            .ari
            .snoop_channel(
                channel,
                &self.settings.ari.app,
                direction.spy(),
                &TapArgs::format("snoop", uuid, direction, backend),
            )
            .await
            .with_context(|| format!("failed to snoop channel {channel} ({})", direction.as_str()))?;

        metrics::SNOOPS_CREATED.inc();

        log::debug!(
            "created {} snoop {} for call {uuid}",
            direction.as_str(),
            snoop.id
        );

        self.track_channel(uuid, &snoop.id, |session, id| {
            if !session.snoops.contains(&id) {
                session.snoops.push(id);
            }
        })
        .await?;

        Ok(())
    }

    /// Drive one snoop channel that entered the stasis application: get the
    /// direction's bridge (single-flight), add the snoop, then create the
    /// external-media channel and add that too.
    pub async fn handle_snoop_started(
        self: &Arc<Self>,
        uuid: &str,
        args: &TapArgs,
        channel: &Channel,
    ) -> Result<()> {
        let backend = {
            let mut sessions = self.sessions.lock();

            // the snoop may reach stasis before /start_tap returned, or
            // after a restart; make sure a session exists either way
            let session = sessions.entry(uuid.to_owned()).or_insert_with(|| {
                TapSession::new(args.backend.unwrap_or(Backend::Framed), CallMeta::default())
            });

            if session.cleaned {
                return Ok(());
            }

            if !session.wired.insert(channel.id.clone()) {
                log::debug!("snoop {} is already wired up", channel.id);
                return Ok(());
            }

            if !session.snoops.contains(&channel.id) {
                session.snoops.push(channel.id.clone());
            }

            session.backend
        };

        self.channel_index
            .lock()
            .insert(channel.id.clone(), uuid.to_owned());

        match backend {
            Backend::Framed => {
                let port = self
                    .sessions
                    .lock()
                    .get(uuid)
                    .and_then(|session| session.port)
                    .context("no rtp port leased for this call")?;

                let rtp_host = self
                    .settings
                    .framed
                    .as_ref()
                    .map(|framed| framed.rtp_host.clone())
                    .context("framed backend is not configured")?;

                let bridge = self.ensure_bridge(uuid, TapDirection::Both).await?;

                self.ari.bridge_add_channel(&bridge, &channel.id).await?;

                self.create_external_media(
                    uuid,
                    &bridge,
                    &format!("{rtp_host}:{port}"),
                )
                .await?;
            }
            Backend::Streaming => {
                let direction = args.dir.context("snoop event carries no direction")?;

                let streaming = self
                    .settings
                    .streaming
                    .as_ref()
                    .context("streaming backend is not configured")?;

                let external_host = match direction {
                    TapDirection::In => streaming.rtp_in.clone(),
                    TapDirection::Out => streaming.rtp_out.clone(),
                    TapDirection::Both => bail!("streaming snoops are directional"),
                };

                let meta = self
                    .sessions
                    .lock()
                    .get(uuid)
                    .map(|session| session.meta.clone())
                    .unwrap_or_default();

                // context must be pending at the gateway before the
                // external-media channel starts sending; a failed register
                // only costs the binding, not the tap
                if let Err(e) = self.gateways.streaming_register(uuid, &meta, direction).await {
                    log::warn!("streaming gateway register failed for call {uuid}: {e:#}");
                    metrics::GATEWAY_REGISTER_FAILURES.inc();
                }

                let bridge = self.ensure_bridge(uuid, direction).await?;

                self.ari.bridge_add_channel(&bridge, &channel.id).await?;

                self.create_external_media(uuid, &bridge, &external_host)
                    .await?;
            }
        }

        Ok(())
    }

    /// Get or create the call's bridge for `direction`. Concurrent callers
    /// coalesce onto one in-flight creation; a failed creation leaves the
    /// slot empty so the next caller can retry.
    async fn ensure_bridge(&self, uuid: &str, direction: TapDirection) -> Result<String> {
        let cell = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(uuid)
                .with_context(|| format!("no tap session for call {uuid}"))?;

            if session.cleaned {
                bail!("call {uuid} is already being cleaned up");
            }

            session
                .bridge_slots
                .entry(direction)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let bridge_id = cell
            .get_or_try_init(|| async {
                let bridge = self.ari.create_bridge("mixing").await?;

                metrics::BRIDGES_CREATED.inc();

                log::debug!(
                    "created {} bridge {} for call {uuid}",
                    direction.as_str(),
                    bridge.id
                );

                Ok::<_, auricle_ari_client::AriError>(bridge.id)
            })
            .await?
            .clone();

        let bridge_still_active = {
            let mut sessions = self.sessions.lock();

            match sessions.get_mut(uuid) {
                Some(session) if !session.cleaned => {
                    session.bridges.insert(direction, bridge_id.clone());
                    true
                }
                _ => false,
            }
        };

        if !bridge_still_active {
            self.ari.destroy_bridge(&bridge_id).await.ok();

            bail!("call {uuid} ended while its bridge was being created");
        }

        Ok(bridge_id)
    }

    /// Create the external-media channel and add it to `bridge`, retrying
    /// the add while the PBX has not materialized the channel yet.
    async fn create_external_media(
        &self,
        uuid: &str,
        bridge: &str,
        external_host: &str,
    ) -> Result<()> {
        let channel = self
            .ari
            .external_media(
                &self.settings.ari.app,
                &format!("role=em,uuid={uuid}"),
                external_host,
                "slin16",
                "udp",
                "rtp",
            )
            .await
            .with_context(|| format!("failed to create external media towards {external_host}"))?;

        metrics::EXTERNAL_MEDIA_CREATED.inc();

        log::debug!(
            "created external media {} towards {external_host} for call {uuid}",
            channel.id
        );

        self.track_channel(uuid, &channel.id, |session, id| {
            if !session.external_media.contains(&id) {
                session.external_media.push(id);
            }
        })
        .await?;

        let mut attempt = 0;

        loop {
            match self.ari.bridge_add_channel(bridge, &channel.id).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() && attempt + 1 < ADD_CHANNEL_ATTEMPTS => {
                    attempt += 1;

                    log::debug!(
                        "channel {} not in the registry yet, retrying add ({attempt})",
                        channel.id
                    );

                    sleep(ADD_CHANNEL_DELAY).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to add external media {} to bridge {bridge}", channel.id)
                    });
                }
            }
        }
    }

    /// Record an acquired channel on the live session, or hang it up right
    /// away when the session got cleaned while the PBX call was in flight.
    async fn track_channel(
        &self,
        uuid: &str,
        channel_id: &str,
        record: impl FnOnce(&mut TapSession, String),
    ) -> Result<()> {
        let still_active = {
            let mut sessions = self.sessions.lock();

            match sessions.get_mut(uuid) {
                Some(session) if !session.cleaned => {
                    record(session, channel_id.to_owned());
                    true
                }
                _ => false,
            }
        };

        if !still_active {
            self.ari.hangup(channel_id).await.ok();

            bail!("call {uuid} ended while resources were being acquired");
        }

        self.channel_index
            .lock()
            .insert(channel_id.to_owned(), uuid.to_owned());

        Ok(())
    }

    /// A terminal event arrived for some channel; when the channel belongs
    /// to a tracked call, the whole tap session is torn down.
    pub async fn handle_terminal_event(self: &Arc<Self>, channel_id: &str, reason: &str) {
        let uuid = self.channel_index.lock().get(channel_id).cloned();

        if let Some(uuid) = uuid {
            self.cleanup_session(&uuid, reason).await;
        }
    }

    /// Tear down everything the tap created for `uuid`. Latched: the first
    /// caller runs the teardown, every later caller is a no-op. All PBX
    /// operations are best-effort so the live call is never disturbed.
    pub async fn cleanup_session(self: &Arc<Self>, uuid: &str, reason: &str) {
        let session = {
            let mut sessions = self.sessions.lock();

            match sessions.get_mut(uuid) {
                Some(session) if !session.cleaned => {
                    session.cleaned = true;
                    session.clone()
                }
                _ => return,
            }
        };

        log::info!("cleaning up tap session {uuid} ({reason})");

        metrics::CLEANUPS.with_label_values(&[reason]).inc();

        match session.backend {
            Backend::Framed => {
                if let Some(port) = session.port {
                    if let Err(e) = self.gateways.framed_unregister(port).await {
                        log::warn!("framed gateway unregister failed for port {port}: {e:#}");
                    }

                    self.ports.free(port);
                }
            }
            Backend::Streaming => {
                if let Err(e) = self.gateways.streaming_unregister(uuid).await {
                    log::warn!("streaming gateway unregister failed for call {uuid}: {e:#}");
                }
            }
        }

        for bridge in session.bridges.values() {
            if let Err(e) = self.ari.destroy_bridge(bridge).await {
                if !e.is_not_found() {
                    log::warn!("failed to destroy bridge {bridge}: {e}");
                }
            }
        }

        for channel in session.snoops.iter().chain(&session.external_media) {
            if let Err(e) = self.ari.hangup(channel).await {
                if !e.is_not_found() {
                    log::warn!("failed to hang up channel {channel}: {e}");
                }
            }
        }

        {
            let mut index = self.channel_index.lock();

            for channel in session.snoops.iter().chain(&session.external_media) {
                index.remove(channel);
            }
        }

        self.sessions.lock().remove(uuid);

        metrics::SESSIONS_ACTIVE.set(self.sessions.lock().len() as i64);

        log::info!("tap session {uuid} cleaned up");
    }
}
