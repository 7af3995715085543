//! Connection state machine and the async session that drives it.
//!
//! A Muse S only exposes its control characteristic on the first connection
//! of a power cycle.  The sensor characteristics become enumerable after the
//! host has connected, sent a halt, disconnected and reconnected:
//!
//! ```text
//! Disconnected ─connect─▶ PhaseOneConnected ─subscribed─▶ PhaseOneHalted
//!      ▲                                                       │ halt window
//!      │                                                       ▼
//!      │          ┌──────────── Disconnected (phase one complete)
//!      │          │ reconnect timer
//!      │          ▼
//!      │   PhaseTwoConnecting ─full channel set─▶ Streaming
//!      │          │ channels missing                  │ link lost
//!      │          ▼                                   │
//!      │       Faulted                                │
//!      └──────────────────────────────────────────────┘
//! ```
//!
//! [`StateMachine`] is the pure transition table; [`Session`] performs the
//! transport work for each step and publishes every transition to the
//! pipeline.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::error::{MuseError, Result};
use crate::parse::{decode_eeg, decode_imu, decode_telemetry, Continuity, SequenceTracker};
use crate::pipeline::{Consumer, Pipeline};
use crate::protocol::{
    encode_command, Channel, Electrode, CMD_HALT, CMD_RESUME, CMD_STATUS, CMD_VERSION,
    PRESET_AUX, PRESET_DEFAULT,
};
use crate::response::ResponseAssembler;
use crate::transport::{Link, Transport};
use crate::types::{
    ConnectionState, ControlResponse, DeviceIdentity, DeviceStatus, NotificationFragment,
    StreamEvent,
};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Automatic reconnection after the link drops while streaming.
///
/// Never applies to `Faulted`: a failed handshake or exhausted retries always
/// need an explicit [`Session::connect`] from the caller.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Automatic reconnects per [`Session::run_with_reconnect`] call.
    pub max_attempts: u32,
    /// Pause before each reconnect.
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            delay: Duration::ZERO,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

/// Configuration for [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Match devices whose advertised name starts with this.  Default `"Muse"`.
    pub name_prefix: String,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    /// Preset sent on entry to streaming.  Default `p21`.
    pub preset: String,
    /// Also subscribe AUX_L, AUX_R and REF when the device exposes them.
    pub enable_aux: bool,
    /// How long the phase-one halt is given before the link is closed.
    pub halt_window: Duration,
    /// Pause between the phase-one disconnect and the phase-two connect.
    pub reconnect_delay: Duration,
    /// Pause after each startup command.
    pub command_spacing: Duration,
    /// Extra attempts for a failing subscribe or write before faulting.
    pub entry_retries: u32,
    /// Backoff unit; attempt `n` waits `n × retry_backoff`.
    pub retry_backoff: Duration,
    /// Queue size for consumers created with [`Session::consumer`].
    pub consumer_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    /// Enable the auxiliary electrodes and switch to the matching preset.
    pub fn with_aux(mut self) -> Self {
        self.enable_aux = true;
        self.preset = PRESET_AUX.into();
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name_prefix: "Muse".into(),
            scan_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            preset: PRESET_DEFAULT.into(),
            enable_aux: false,
            halt_window: Duration::from_millis(300),
            reconnect_delay: Duration::from_millis(1500),
            command_spacing: Duration::from_millis(100),
            entry_retries: 3,
            retry_backoff: Duration::from_millis(100),
            consumer_capacity: 256,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Inputs to [`StateMachine::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    SubscriptionConfirmed,
    HaltWindowElapsed,
    ReconnectTimerFired,
    FullChannelSetObserved,
    ChannelSetIncomplete,
    /// Connect / subscribe / write failed after its retries.
    TransportFailed,
    /// The device dropped the link while streaming.
    TransportDisconnected,
    StopRequested,
}

/// Pure transition table for one headset connection.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConnectionState,
    phase_one_complete: bool,
    session_id: u64,
    /// States entered since the last `ConnectRequested`.
    history: Vec<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            phase_one_complete: false,
            session_id: 0,
            history: vec![ConnectionState::Disconnected],
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Incremented by every `ConnectRequested`.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// `true` while disconnected between the two phases.
    pub fn phase_one_complete(&self) -> bool {
        self.phase_one_complete
    }

    pub fn history(&self) -> &[ConnectionState] {
        &self.history
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<ConnectionState> {
        use ConnectionState::*;
        use SessionEvent::*;

        let next = match (self.state, event) {
            (_, StopRequested) => Disconnected,
            (Disconnected, ConnectRequested) => PhaseOneConnected,
            (PhaseOneConnected, SubscriptionConfirmed) => PhaseOneHalted,
            (PhaseOneHalted, HaltWindowElapsed) => Disconnected,
            (Disconnected, ReconnectTimerFired) if self.phase_one_complete => PhaseTwoConnecting,
            (PhaseTwoConnecting, FullChannelSetObserved) => Streaming,
            (PhaseTwoConnecting, ChannelSetIncomplete) => Faulted,
            (PhaseOneConnected | PhaseOneHalted | PhaseTwoConnecting | Streaming, TransportFailed) => {
                Faulted
            }
            (Streaming, TransportDisconnected) => Disconnected,
            (from, event) => return Err(MuseError::InvalidTransition { from, event }),
        };

        match event {
            ConnectRequested => {
                self.session_id += 1;
                self.history.clear();
                self.phase_one_complete = false;
            }
            HaltWindowElapsed => self.phase_one_complete = true,
            _ => self.phase_one_complete = false,
        }
        self.state = next;
        self.history.push(next);
        Ok(next)
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Counters for everything the session dropped or flagged.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub packets: BTreeMap<Channel, u64>,
    pub control_responses: u64,
    pub malformed_packets: u64,
    pub oversized_responses: u64,
    pub invalid_responses: u64,
    pub missed_packets: u64,
    pub late_packets: u64,
    pub duplicate_packets: u64,
    pub wraparounds: u64,
    pub discontinuities: u64,
}

impl SessionStats {
    fn record_packet(&mut self, channel: Channel) -> u64 {
        let n = self.packets.entry(channel).or_insert(0);
        *n += 1;
        *n
    }

    /// Sensor packets received, control fragments excluded.
    pub fn sensor_packets(&self) -> u64 {
        self.packets
            .iter()
            .filter(|(ch, _)| **ch != Channel::Control)
            .map(|(_, n)| n)
            .sum()
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Ends a [`Session::run`] loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The caller asked to stop.
    Stopped,
    /// The device dropped the link; consumers have received end-of-stream.
    Interrupted,
}

/// Cloneable remote control for a session owned by another task.
#[derive(Clone)]
pub struct SessionHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    cmd_tx: mpsc::Sender<String>,
}

impl SessionHandle {
    /// Stop the session in whatever state it is in.  In-flight writes are
    /// abandoned; the session sends a best-effort halt and closes the link.
    ///
    /// A stop requested while the session is idle is kept until the next
    /// [`Session::connect`], which then returns [`MuseError::Stopped`].
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// `true` while a stop request has not been handled yet.
    pub fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Queue a raw command for the streaming loop.  Never waits: fails with
    /// [`MuseError::CommandQueueFull`] when the loop is not draining the
    /// queue.
    pub async fn send_command(&self, token: &str) -> Result<()> {
        encode_command(token)?;
        self.cmd_tx.try_send(token.to_owned()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MuseError::CommandQueueFull,
            mpsc::error::TrySendError::Closed(_) => MuseError::Stopped,
        })
    }

    pub async fn pause(&self) -> Result<()> {
        self.send_command(CMD_HALT).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send_command(CMD_RESUME).await
    }

    pub async fn request_status(&self) -> Result<()> {
        self.send_command(CMD_STATUS).await
    }

    pub async fn request_version(&self) -> Result<()> {
        self.send_command(CMD_VERSION).await
    }
}

/// Commands a [`SessionHandle`] can queue ahead of the streaming loop.
pub const COMMAND_QUEUE_LEN: usize = 32;

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await;
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One logical connection to one headset.
///
/// Owns the state machine, the response assembler and the packet counters;
/// nothing else mutates them.  Consumers only ever see immutable
/// [`StreamEvent`]s through the [`Pipeline`].
pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    machine: StateMachine,
    link: Option<T::Link>,
    subscribed: Vec<Channel>,
    assembler: ResponseAssembler,
    sequences: HashMap<Channel, SequenceTracker>,
    identity: Option<DeviceIdentity>,
    status: Option<DeviceStatus>,
    stats: SessionStats,
    pipeline: Pipeline,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    cmd_tx: mpsc::Sender<String>,
    cmd_rx: mpsc::Receiver<String>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        Self {
            transport,
            config,
            machine: StateMachine::new(),
            link: None,
            subscribed: Vec::new(),
            assembler: ResponseAssembler::new(),
            sequences: HashMap::new(),
            identity: None,
            status: None,
            stats: SessionStats::default(),
            pipeline: Pipeline::new(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            cmd_tx,
            cmd_rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            stop_tx: Arc::clone(&self.stop_tx),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Register a consumer with the configured queue size.
    pub fn consumer(&self) -> Consumer {
        self.pipeline.register(self.config.consumer_capacity)
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn status(&self) -> Option<&DeviceStatus> {
        self.status.as_ref()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Channels subscribed on the current link.
    pub fn subscribed(&self) -> &[Channel] {
        &self.subscribed
    }

    /// Scan for headsets.  A stop request ends the scan early.
    pub async fn discover(&self) -> Result<Vec<String>> {
        self.interruptible(self.transport.discover(self.config.scan_timeout))
            .await
    }

    // ── transitions ──────────────────────────────────────────────────────────

    fn apply(&mut self, event: SessionEvent) -> Result<ConnectionState> {
        let before = self.machine.state();
        let after = self.machine.apply(event)?;
        if before != after {
            info!("session {}: {before:?} → {after:?} ({event:?})", self.machine.session_id());
            self.pipeline.publish(StreamEvent::State(after));
        }
        Ok(after)
    }

    /// Fault the session on a connection-level error and hand the error back.
    fn fail<R>(&mut self, e: MuseError) -> Result<R> {
        if !matches!(e, MuseError::Stopped) {
            error!("session {}: {e}", self.machine.session_id());
            if let Err(t) = self.apply(SessionEvent::TransportFailed) {
                debug!("{t}");
            }
        }
        Err(e)
    }

    /// Run `fut` unless a stop request arrives first.
    async fn interruptible<R>(&self, fut: impl Future<Output = Result<R>>) -> Result<R> {
        let mut stop = self.stop_rx.clone();
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => Err(MuseError::Stopped),
            r = fut => r,
        }
    }

    async fn pause_for(&self, d: Duration) -> Result<()> {
        self.interruptible(async {
            tokio::time::sleep(d).await;
            Ok(())
        })
        .await
    }

    async fn retry<F, Fut>(&self, what: &str, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let attempts = self.config.entry_retries + 1;
        let mut attempt = 1;
        loop {
            match self.interruptible(op()).await {
                Ok(()) => return Ok(()),
                Err(MuseError::Stopped) => return Err(MuseError::Stopped),
                Err(e) if attempt < attempts => {
                    warn!("{what} failed (attempt {attempt}/{attempts}): {e}");
                    self.pause_for(self.config.retry_backoff * attempt).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── handshake ────────────────────────────────────────────────────────────

    /// Run the full two-phase handshake against `address` and start streaming.
    ///
    /// Calling this from `Faulted` (or any connected state) first tears the
    /// current session down; this is the only way out of `Faulted`.  A stop
    /// request that arrived before the call is honoured here.
    pub async fn connect(&mut self, address: &str) -> Result<()> {
        if self.machine.state() != ConnectionState::Disconnected {
            self.teardown().await;
        }
        if *self.stop_rx.borrow() {
            info!("{address}: stop requested before connect");
            self.stop().await;
            return Err(MuseError::Stopped);
        }
        match self.handshake(address).await {
            Err(MuseError::Stopped) => {
                self.stop().await;
                Err(MuseError::Stopped)
            }
            other => other,
        }
    }

    async fn handshake(&mut self, address: &str) -> Result<()> {
        self.apply(SessionEvent::ConnectRequested)?;
        self.identity = None;
        let halt = encode_command(CMD_HALT)?;

        // Phase one: only the control channel is visible.
        info!("{address}: phase one connect");
        let link = match self.interruptible(self.transport.connect(address)).await {
            Ok(l) => l,
            Err(e) => return self.fail(e),
        };
        let subscribed = self
            .retry("phase one subscribe", || link.subscribe(Channel::Control))
            .await;
        if let Err(e) = subscribed {
            link.disconnect().await.ok();
            return self.fail(e);
        }
        self.apply(SessionEvent::SubscriptionConfirmed)?;

        let halted = async {
            self.retry("phase one halt", || link.write(Channel::Control, &halt.bytes, false))
                .await?;
            self.pause_for(self.config.halt_window).await
        }
        .await;
        link.disconnect().await.ok();
        drop(link);
        if let Err(e) = halted {
            return self.fail(e);
        }
        self.apply(SessionEvent::HaltWindowElapsed)?;

        // Single reconnect timer; a stop request cancels it.
        info!("{address}: phase one complete, reconnecting in {:?}", self.config.reconnect_delay);
        self.pause_for(self.config.reconnect_delay).await?;
        self.apply(SessionEvent::ReconnectTimerFired)?;

        // Phase two: the full GATT table should now be enumerable.
        let link = match self.interruptible(self.transport.connect(address)).await {
            Ok(l) => l,
            Err(e) => return self.fail(e),
        };
        let available = link.channels();
        let missing: Vec<Channel> = Channel::REQUIRED
            .iter()
            .filter(|ch| !available.contains(ch))
            .copied()
            .collect();
        if !missing.is_empty() {
            link.disconnect().await.ok();
            error!("{address}: phase two still missing {missing:?}; power-cycle the headset");
            self.apply(SessionEvent::ChannelSetIncomplete)?;
            return Err(MuseError::HandshakeFailed { missing });
        }
        info!("{address}: phase two exposes {} channel(s)", available.len());

        self.assembler = ResponseAssembler::new();
        self.sequences.clear();
        self.link = Some(link);
        self.apply(SessionEvent::FullChannelSetObserved)?;

        match self.start_streaming(&available).await {
            Ok(()) => Ok(()),
            Err(MuseError::Stopped) => Err(MuseError::Stopped),
            Err(e) => {
                if let Some(link) = self.link.take() {
                    link.disconnect().await.ok();
                }
                self.subscribed.clear();
                self.fail(e)
            }
        }
    }

    /// Subscribe every sensor channel, then send version → status → halt →
    /// preset → resume.  Resume before preset would start the wrong sensor
    /// set, and the halt is needed even on a fresh link because the headset
    /// may still be streaming for a previous host.
    async fn start_streaming(&mut self, available: &[Channel]) -> Result<()> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| MuseError::Transport("no link".into()))?;

        let mut channels = Channel::REQUIRED.to_vec();
        if self.config.enable_aux {
            channels.extend(
                Electrode::AUXILIARY
                    .iter()
                    .map(|&e| Channel::Eeg(e))
                    .filter(|ch| available.contains(ch)),
            );
        }
        for &ch in &channels {
            self.retry(&format!("subscribe {ch}"), || link.subscribe(ch))
                .await?;
        }

        let preset = self.config.preset.clone();
        for token in [CMD_VERSION, CMD_STATUS, CMD_HALT, preset.as_str(), CMD_RESUME] {
            let frame = encode_command(token)?;
            self.retry(&format!("command {token}"), || {
                link.write(Channel::Control, &frame.bytes, false)
            })
            .await?;
            debug!("sent {token}");
            self.pause_for(self.config.command_spacing).await?;
        }
        info!("streaming with preset {preset} on {} channel(s)", channels.len());
        self.subscribed = channels;
        Ok(())
    }

    // ── streaming ────────────────────────────────────────────────────────────

    /// Write one command on the current link.
    pub async fn send_command(&self, token: &str) -> Result<()> {
        let frame = encode_command(token)?;
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| MuseError::Transport("not connected".into()))?;
        link.write(Channel::Control, &frame.bytes, false).await
    }

    /// Pump notifications into the pipeline until the link drops or a stop is
    /// requested.  Commands queued through [`SessionHandle`] are written in
    /// between notifications.
    pub async fn run(&mut self) -> Result<SessionEnd> {
        if self.machine.state() != ConnectionState::Streaming {
            return Err(MuseError::NotStreaming(self.machine.state()));
        }
        let stream = match self.link.as_ref() {
            Some(link) => link.notifications().await,
            None => Err(MuseError::Transport("no link".into())),
        };
        let mut notifications = match stream {
            Ok(s) => s,
            Err(e) => return self.fail(e),
        };
        let mut stop = self.stop_rx.clone();

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => {
                    info!("stop requested");
                    self.stop().await;
                    return Ok(SessionEnd::Stopped);
                }
                Some(token) = self.cmd_rx.recv() => {
                    if let Err(e) = self.send_command(&token).await {
                        warn!("command {token:?} failed: {e}");
                    }
                }
                next = notifications.next() => match next {
                    Some(fragment) => self.handle_notification(fragment),
                    None => {
                        self.on_link_lost().await;
                        return Ok(SessionEnd::Interrupted);
                    }
                },
            }
        }
    }

    /// [`Session::connect`] then [`Session::run`], reconnecting after link
    /// loss according to the configured [`ReconnectPolicy`].
    pub async fn run_with_reconnect(&mut self, address: &str) -> Result<SessionEnd> {
        let policy = self.config.reconnect.clone();
        let mut reconnects = 0u32;
        loop {
            if self.machine.state() != ConnectionState::Streaming {
                match self.connect(address).await {
                    Ok(()) => {}
                    Err(MuseError::Stopped) => return Ok(SessionEnd::Stopped),
                    Err(e) => return Err(e),
                }
            }
            match self.run().await? {
                SessionEnd::Stopped => return Ok(SessionEnd::Stopped),
                SessionEnd::Interrupted if reconnects >= policy.max_attempts => {
                    warn!("link lost; no reconnects left");
                    return Ok(SessionEnd::Interrupted);
                }
                SessionEnd::Interrupted => {
                    reconnects += 1;
                    warn!(
                        "link lost; reconnecting in {:?} ({reconnects}/{})",
                        policy.delay, policy.max_attempts
                    );
                    if self.pause_for(policy.delay).await.is_err() {
                        self.stop().await;
                        return Ok(SessionEnd::Stopped);
                    }
                }
            }
        }
    }

    /// Decode one notification and publish the result.  Never awaits; bad
    /// packets are counted and dropped without ending the stream.
    pub fn handle_notification(&mut self, fragment: NotificationFragment) {
        let NotificationFragment {
            channel,
            data,
            received_at,
        } = fragment;
        let n = self.stats.record_packet(channel);
        if n <= 3 || n % 500 == 0 {
            debug!("{channel} #{n} len={} {:02x?}", data.len(), &data[..data.len().min(10)]);
        }

        let decoded = match channel {
            Channel::Control => {
                self.handle_control(&data, received_at);
                return;
            }
            Channel::Eeg(_) => decode_eeg(&data, channel, received_at).map(|b| {
                self.track(channel, b.counter);
                StreamEvent::Eeg(Arc::new(b))
            }),
            Channel::Accelerometer => decode_imu(&data, channel, received_at).map(|b| {
                self.track(channel, b.counter);
                StreamEvent::Accelerometer(Arc::new(b))
            }),
            Channel::Gyroscope => decode_imu(&data, channel, received_at).map(|b| {
                self.track(channel, b.counter);
                StreamEvent::Gyroscope(Arc::new(b))
            }),
            Channel::Telemetry => decode_telemetry(&data, received_at)
                .map(|b| StreamEvent::Telemetry(Arc::new(b))),
        };

        match decoded {
            Ok(event) => self.pipeline.publish(event),
            Err(e) => {
                self.stats.malformed_packets += 1;
                warn!("dropping packet: {e}");
            }
        }
    }

    fn track(&mut self, channel: Channel, counter: u16) {
        if !channel.is_sequenced() {
            return;
        }
        let tracker = self.sequences.entry(channel).or_default();
        match tracker.observe(counter) {
            Continuity::First | Continuity::Contiguous => {}
            Continuity::Duplicate => self.stats.duplicate_packets += 1,
            Continuity::Gap { missed } => {
                self.stats.missed_packets += u64::from(missed);
                debug!("{channel}: {missed} packet(s) missed before #{counter}");
            }
            Continuity::Wrapped { missed } => {
                self.stats.wraparounds += 1;
                self.stats.missed_packets += u64::from(missed);
            }
            Continuity::Late { behind } => {
                self.stats.late_packets += 1;
                debug!("{channel}: #{counter} arrived {behind} behind");
            }
            Continuity::Discontinuity { from, to } => {
                self.stats.discontinuities += 1;
                warn!("{channel}: packet counter jumped {from} → {to}");
            }
        }
    }

    fn handle_control(&mut self, data: &[u8], received_at: f64) {
        let mut next = self.assembler.push(data).transpose();
        while let Some(result) = next {
            self.on_response(result, received_at);
            next = self.assembler.take_ready();
        }
    }

    fn on_response(&mut self, result: Result<ControlResponse>, received_at: f64) {
        match result {
            Ok(resp) => {
                debug!("control response: {}", resp.raw);
                self.stats.control_responses += 1;
                if resp.is_version() && self.identity.is_none() {
                    let identity = DeviceIdentity::from_response(&resp);
                    info!(
                        "device: fw {} hw {}",
                        identity.firmware_version.as_deref().unwrap_or("?"),
                        identity.hardware_revision.as_deref().unwrap_or("?")
                    );
                    self.identity = Some(identity);
                }
                if resp.is_status() {
                    self.status = Some(DeviceStatus::from_response(&resp, received_at));
                }
                self.pipeline.publish(StreamEvent::Control(Arc::new(resp)));
            }
            Err(e @ MuseError::ResponseTooLarge { .. }) => {
                self.stats.oversized_responses += 1;
                warn!("dropping control response: {e}");
            }
            Err(e) => {
                self.stats.invalid_responses += 1;
                warn!("dropping control response: {e}");
            }
        }
    }

    async fn on_link_lost(&mut self) {
        warn!("notification stream ended, device disconnected");
        if let Some(link) = self.link.take() {
            link.disconnect().await.ok();
        }
        self.assembler = ResponseAssembler::new();
        self.sequences.clear();
        if let Err(e) = self.apply(SessionEvent::TransportDisconnected) {
            debug!("{e}");
        }
        let channels = std::mem::take(&mut self.subscribed);
        self.pipeline.end_of_stream(&channels);
    }

    /// Stop from any state: best-effort halt, close the link, reset buffers
    /// and tell consumers the streams ended.  Consumes any pending stop
    /// request.
    pub async fn stop(&mut self) {
        self.teardown().await;
        self.stop_tx.send_replace(false);
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            if let Ok(frame) = encode_command(CMD_HALT) {
                let halt = link.write(Channel::Control, &frame.bytes, false);
                match tokio::time::timeout(Duration::from_millis(500), halt).await {
                    Ok(Err(e)) => debug!("halt on stop failed: {e}"),
                    Err(_) => debug!("halt on stop timed out"),
                    Ok(Ok(())) => {}
                }
            }
            link.disconnect().await.ok();
        }
        self.assembler = ResponseAssembler::new();
        self.sequences.clear();
        if let Err(e) = self.apply(SessionEvent::StopRequested) {
            debug!("{e}");
        }
        let channels = std::mem::take(&mut self.subscribed);
        if !channels.is_empty() {
            self.pipeline.end_of_stream(&channels);
        }
    }
}
