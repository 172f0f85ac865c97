//! Client session manager.
//!
//! Owns the three channels to one remote host and is the only surface the host
//! integration talks to. Control operations are synchronous and serialized by
//! the tagged command lock; the real-time path goes through [`Session::process`]
//! and only ever touches atomics and the bounded-retry audio lock.

use crate::audio::{
    fill_silence, AudioAccess, AudioEngine, AudioStatsSnapshot, AudioStreamer, FailureHook,
    Sample, StreamLayout, StreamStatus,
};
use crate::command::{self, CommandChannel, Connection};
use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, Result};
use crate::lock::{LockId, TaggedGuard, TaggedMutex};
use crate::parameter::Parameter;
use crate::plugin::{PluginChain, PluginSlot, ServerPlugin};
use crate::protocol::{
    ChannelKind, Hello, KeyPress, MidiEvent, MidiEventVec, MouseEvent, ParameterResult, Precision,
    Request, Response, TransportInfo, PROTOCOL_VERSION,
};
use crate::screen::{ScreenCallback, ScreenImage, ScreenSink, ScreenStreamer};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Runtime;

/// Grace period for the goodbye sent on close.
const QUIT_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Error = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Connecting,
            2 => SessionState::Ready,
            3 => SessionState::Error,
            4 => SessionState::Closed,
            _ => SessionState::Disconnected,
        }
    }
}

/// Lifecycle callback (`on_connect` / `on_close`).
pub type SessionCallback = Box<dyn Fn() + Send + Sync>;

/// Negotiation parameters of the last `init`, reused by `reinit_if_needed`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitParams {
    pub channels_in: usize,
    pub channels_out: usize,
    pub sample_rate: f64,
    pub block_size: usize,
    pub double_precision: bool,
}

/// State the failure hooks of the streaming tasks can reach.
struct Shared {
    state: AtomicU8,
    ready: AtomicBool,
    /// Set while `on_connect` has fired without a matching `on_close`.
    connected: AtomicBool,
    on_connect: ArcSwapOption<SessionCallback>,
    on_close: ArcSwapOption<SessionCallback>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Disconnected as u8),
            ready: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            on_connect: ArcSwapOption::empty(),
            on_close: ArcSwapOption::empty(),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn enter_ready(&self) {
        self.state.store(SessionState::Ready as u8, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        if !self.connected.swap(true, Ordering::AcqRel) {
            if let Some(callback) = self.on_connect.load().as_ref() {
                callback();
            }
        }
    }

    /// Leaves `Ready` (if there) for `next`.
    fn leave(&self, next: SessionState) {
        self.ready.store(false, Ordering::Release);
        self.state.store(next as u8, Ordering::Release);
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Some(callback) = self.on_close.load().as_ref() {
                callback();
            }
        }
    }

    /// Channel failure reported by a streaming task.
    fn channel_failed(&self, error: &ClientError) {
        if self.state() != SessionState::Ready {
            return;
        }
        tracing::error!("session failed: {}", error);
        self.leave(SessionState::Error);
    }
}

/// Everything guarded by the command lock.
#[derive(Default)]
struct Control {
    channel: Option<CommandChannel<OwnedReadHalf, OwnedWriteHalf>>,
    /// Kept open for the lifetime of the screen stream.
    screen_writer: Option<OwnedWriteHalf>,
    chain: PluginChain,
    params: Option<InitParams>,
}

/// Client session manager for one remote processing host.
///
/// Lifecycle callbacks run on whichever thread observed the transition and
/// must not call back into the session.
pub struct Session {
    config: ClientConfig,
    shared: Arc<Shared>,
    control: TaggedMutex<Control>,
    endpoint: Mutex<Endpoint>,
    audio: AudioAccess,
    screen: Mutex<Option<ScreenStreamer>>,
    screen_sink: ScreenSink,
    needs_reconnect: AtomicBool,
    buffer_depth: AtomicUsize,
    load_plugin_timeout_secs: AtomicU64,
    base_latency: AtomicUsize,
    buffer_latency: AtomicUsize,
    load_bits: AtomicU32,
    runtime: Runtime,
}

impl Session {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("remotefx-io")
            .enable_all()
            .build()?;

        Ok(Self {
            shared: Arc::new(Shared::new()),
            control: TaggedMutex::new(Control::default()),
            endpoint: Mutex::new(Endpoint {
                port: config.server_port,
                ..Default::default()
            }),
            audio: AudioAccess::new(config.audio_lock_retries, config.audio_lock_retry_interval()),
            screen: Mutex::new(None),
            screen_sink: Arc::new(ArcSwapOption::empty()),
            needs_reconnect: AtomicBool::new(false),
            buffer_depth: AtomicUsize::new(config.buffer_depth),
            load_plugin_timeout_secs: AtomicU64::new(config.load_plugin_timeout_secs),
            base_latency: AtomicUsize::new(0),
            buffer_latency: AtomicUsize::new(0),
            load_bits: AtomicU32::new(0f32.to_bits()),
            runtime,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // =========================================================================
    // Endpoint
    // =========================================================================

    /// Stores the target host. Nothing connects until the next `init`; a
    /// session that was already initialized is marked for reconnection.
    pub fn set_server(&self, endpoint: Endpoint) {
        let mut current = self.endpoint.lock();
        let moved = current.address() != endpoint.address() || current.id != endpoint.id;
        tracing::info!("server set to {}", endpoint.host_and_id());
        self.load_bits.store(endpoint.load.to_bits(), Ordering::Relaxed);
        *current = endpoint;
        drop(current);

        if moved && self.control.lock(LockId::Init).params.is_some() {
            self.reconnect();
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.lock().clone()
    }

    pub fn server_host_and_id(&self) -> String {
        self.endpoint.lock().host_and_id()
    }

    /// Smoothed server load, as of the last `update_load`.
    pub fn load(&self) -> f32 {
        f32::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Connects all three channels and negotiates the stream.
    ///
    /// Any previous connection is torn down first. Plugins that were loaded
    /// before are loaded again, in order, with their last known settings.
    pub fn init(
        &self,
        channels_in: usize,
        channels_out: usize,
        sample_rate: f64,
        block_size: usize,
        double_precision: bool,
    ) -> Result<()> {
        self.init_with(InitParams {
            channels_in,
            channels_out,
            sample_rate,
            block_size,
            double_precision,
        })
    }

    pub fn init_with(&self, params: InitParams) -> Result<()> {
        let mut control = self.control.lock(LockId::Init);
        self.needs_reconnect.store(false, Ordering::Release);
        self.teardown(&mut control, SessionState::Connecting);
        control.params = Some(params);

        let previous = control.chain.take();
        let result = self
            .connect(&mut control, params)
            .and_then(|()| self.restore_chain(&mut control, &previous));

        match result {
            Ok(()) => {
                tracing::info!(
                    "connected to {} ({}in/{}out, {}Hz, {} samples, {:?})",
                    self.server_host_and_id(),
                    params.channels_in,
                    params.channels_out,
                    params.sample_rate,
                    params.block_size,
                    Precision::from_double(params.double_precision)
                );
                self.shared.enter_ready();
                Ok(())
            }
            Err(e) => {
                tracing::error!("init failed: {}", e);
                control.chain.clear();
                for slot in previous {
                    control.chain.push(slot);
                }
                self.teardown(&mut control, SessionState::Error);
                Err(e)
            }
        }
    }

    /// Marks the session for re-initialization. Repeated calls before the
    /// next `reinit_if_needed` (or `init`) collapse into one.
    pub fn reconnect(&self) {
        self.needs_reconnect.store(true, Ordering::Release);
    }

    pub fn needs_reconnect(&self) -> bool {
        self.needs_reconnect.load(Ordering::Acquire)
    }

    /// Runs a pending reconnect with the parameters of the last `init`.
    ///
    /// Returns `Ok(false)` when no reconnect was requested. Call from a
    /// non-real-time thread; an in-flight audio frame finishes first.
    pub fn reinit_if_needed(&self) -> Result<bool> {
        if !self.needs_reconnect.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let params = self.control.lock(LockId::Init).params;
        match params {
            Some(params) => self.init_with(params).map(|()| true),
            None => {
                tracing::warn!("reconnect requested before the first init");
                Ok(false)
            }
        }
    }

    /// Tears everything down and leaves the session `Closed`.
    pub fn close(&self) {
        // Real-time callers see the session as not ready from here on.
        self.shared.ready.store(false, Ordering::Release);
        let mut control = self.control.lock(LockId::Close);
        if let Some(channel) = control.channel.as_mut().filter(|c| c.is_ok()) {
            let _ = self.runtime.block_on(channel.request(Request::Quit, QUIT_TIMEOUT));
        }
        self.teardown(&mut control, SessionState::Closed);
        tracing::info!("session closed");
    }

    /// Lock-free readiness, safe for the real-time path.
    pub fn is_ready_lock_free(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Readiness including channel health. Waits up to `timeout_ms` in total
    /// for the command and audio locks and reports not ready if either stays
    /// busy.
    pub fn is_ready(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let Some(control) = self
            .control
            .try_lock_for(LockId::IsReady, Duration::from_millis(timeout_ms))
        else {
            tracing::debug!("is_ready: command lock held by {}", self.control.holder());
            return false;
        };
        if !self.is_ready_lock_free() || !control.channel.as_ref().is_some_and(|c| c.is_ok()) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.audio
            .acquire_for(remaining)
            .is_some_and(|audio| audio.is_ok())
    }

    /// Stops the workers and drops the channels, then moves to `next`.
    fn teardown(&self, control: &mut Control, next: SessionState) {
        self.shared.leave(next);
        let wait = self.config.screen_join_timeout();

        if let Some(screen) = self.screen.lock().take() {
            screen.stop(self.runtime.handle(), wait);
        }
        let engine = self.audio.acquire().take();
        if let Some(engine) = engine {
            engine.stop(self.runtime.handle(), wait);
        }
        control.channel = None;
        control.screen_writer = None;
    }

    fn connect(&self, control: &mut Control, params: InitParams) -> Result<()> {
        let endpoint = self.endpoint();
        if endpoint.host.is_empty() {
            return Err(ClientError::ConnectionFailed("no server configured".to_string()));
        }
        let address = endpoint.address();
        let precision = Precision::from_double(params.double_precision);
        let hello = |channel, session| Hello {
            channel,
            version: PROTOCOL_VERSION,
            session,
            client_port: self.config.client_port,
            precision: Some(precision),
        };

        tracing::info!("connecting to {}", endpoint.host_and_id());
        let cmd = self.open(&address, &hello(ChannelKind::Command, 0))?;
        let session_id = cmd.session;
        let server_id = cmd.server_id;
        let mut channel = CommandChannel::from_connection(cmd);

        let init = Request::Init {
            channels_in: params.channels_in as u32,
            channels_out: params.channels_out as u32,
            sample_rate: params.sample_rate,
            block_size: params.block_size as u32,
            double_precision: params.double_precision,
        };
        let base_latency = match self.block_on(channel.request(init, self.config.request_timeout()))? {
            Response::Accepted { latency_samples } => latency_samples as usize,
            Response::Rejected { reason } => return Err(ClientError::Negotiation(reason)),
            other => return Err(command::unexpected("init", other)),
        };

        let audio = self.open(&address, &hello(ChannelKind::Audio, session_id))?;
        let screen = self.open(&address, &hello(ChannelKind::Screen, session_id))?;

        let layout = StreamLayout {
            channels_in: params.channels_in,
            channels_out: params.channels_out,
            sample_rate: params.sample_rate,
            block_size: params.block_size,
            depth: self.buffer_depth.load(Ordering::Relaxed),
        };
        let hook = self.failure_hook();
        let handle = self.runtime.handle();
        let stats = Arc::clone(self.audio.stats());
        let engine = match precision {
            Precision::Single => AudioEngine::Single(AudioStreamer::start(
                handle,
                audio.reader,
                audio.writer,
                layout,
                stats,
                Arc::clone(&hook),
            )),
            Precision::Double => AudioEngine::Double(AudioStreamer::start(
                handle,
                audio.reader,
                audio.writer,
                layout,
                stats,
                Arc::clone(&hook),
            )),
        };
        self.audio.acquire().replace(Some(engine));
        *self.screen.lock() = Some(ScreenStreamer::start(
            handle,
            screen.reader,
            Arc::clone(&self.screen_sink),
            hook,
        ));

        self.base_latency.store(base_latency, Ordering::Relaxed);
        self.buffer_latency
            .store(layout.depth * layout.block_size, Ordering::Relaxed);
        self.endpoint.lock().id = server_id;
        control.channel = Some(channel);
        control.screen_writer = Some(screen.writer);
        Ok(())
    }

    fn open(&self, address: &str, hello: &Hello) -> Result<Connection> {
        self.block_on(command::connect(
            address,
            hello,
            self.config.connect_timeout(),
            self.config.max_frame_size,
        ))
    }

    fn restore_chain(&self, control: &mut Control, previous: &[PluginSlot]) -> Result<()> {
        for slot in previous {
            let settings = (!slot.settings.is_empty()).then_some(slot.settings.as_str());
            match self.add_plugin_locked(control, &slot.id, settings) {
                Ok(idx) => {
                    if slot.bypassed {
                        self.request(control, Request::BypassPlugin { idx })?;
                        if let Some(restored) = control.chain.get_mut(idx) {
                            restored.bypassed = true;
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("could not restore {}: {}", slot.name, e),
            }
        }
        if !previous.is_empty() {
            tracing::info!("restored plugin chain: {}", control.chain.describe());
        }
        Ok(())
    }

    fn failure_hook(&self) -> FailureHook {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |e| shared.channel_failed(&e))
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    pub fn set_screen_callback<F>(&self, callback: F)
    where
        F: Fn(Arc<ScreenImage>, u32, u32) + Send + Sync + 'static,
    {
        let _control = self.control.lock(LockId::SetScreenCallback);
        let callback: ScreenCallback = Box::new(callback);
        self.screen_sink.store(Some(Arc::new(callback)));
    }

    pub fn set_on_connect<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        let _control = self.control.lock(LockId::SetOnConnectCallback);
        let callback: SessionCallback = Box::new(callback);
        self.shared.on_connect.store(Some(Arc::new(callback)));
    }

    pub fn set_on_close<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        let _control = self.control.lock(LockId::SetOnCloseCallback);
        let callback: SessionCallback = Box::new(callback);
        self.shared.on_close.store(Some(Arc::new(callback)));
    }

    // =========================================================================
    // Real-time path
    // =========================================================================

    /// Exchanges one block with the remote chain. Called from the audio thread.
    ///
    /// Never blocks longer than the audio lock's retry budget and never fails:
    /// anything but [`StreamStatus::Ok`] means `outputs` holds silence.
    pub fn process<T: Sample>(
        &self,
        inputs: &[&[T]],
        outputs: &mut [&mut [T]],
        midi_in: &[MidiEvent],
        midi_out: &mut MidiEventVec,
        transport: &TransportInfo,
    ) -> StreamStatus {
        midi_out.clear();
        if !self.is_ready_lock_free() {
            fill_silence(outputs);
            return StreamStatus::NotReady;
        }
        let Ok(guard) = self.audio.try_acquire() else {
            fill_silence(outputs);
            return StreamStatus::Contended;
        };
        let Some(streamer) = guard.streamer::<T>() else {
            fill_silence(outputs);
            return StreamStatus::NotReady;
        };

        let sent = streamer.send(inputs, midi_in, transport);
        let received = streamer.read(outputs, midi_out);
        if sent.is_ok() {
            received
        } else {
            sent
        }
    }

    pub fn audio_access(&self) -> &AudioAccess {
        &self.audio
    }

    pub fn audio_stats(&self) -> AudioStatsSnapshot {
        self.audio.stats().snapshot()
    }

    /// Server chain latency plus the jitter buffer, in samples.
    pub fn latency_samples(&self) -> usize {
        self.base_latency.load(Ordering::Relaxed) + self.buffer_latency.load(Ordering::Relaxed)
    }

    /// Jitter buffer depth for the next `init`.
    pub fn set_buffer_depth(&self, depth: usize) {
        self.buffer_depth.store(depth, Ordering::Relaxed);
    }

    pub fn buffer_depth(&self) -> usize {
        self.buffer_depth.load(Ordering::Relaxed)
    }

    pub fn set_load_plugin_timeout(&self, timeout: Duration) {
        self.load_plugin_timeout_secs
            .store(timeout.as_secs().max(1), Ordering::Relaxed);
    }

    fn load_plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.load_plugin_timeout_secs.load(Ordering::Relaxed))
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Sends `request` on the command channel. The caller holds the lock.
    fn request_for(&self, control: &mut Control, request: Request, wait: Duration) -> Result<Response> {
        let channel = control.channel.as_mut().ok_or(ClientError::NotReady)?;
        let result = self.block_on(channel.request(request, wait));
        if let Err(e) = &result {
            if e.is_fatal() && self.shared.state() == SessionState::Ready {
                tracing::error!("session failed: {}", e);
                self.shared.leave(SessionState::Error);
            }
        }
        result
    }

    fn request(&self, control: &mut Control, request: Request) -> Result<Response> {
        self.request_for(control, request, self.config.request_timeout())
    }

    /// Blocking acquire for user-initiated operations.
    fn lock(&self, id: LockId) -> Result<TaggedGuard<'_, Control>> {
        let control = self.control.lock(id);
        self.check_ready()?;
        Ok(control)
    }

    /// Best-effort acquire; `Ok(None)` when another operation is in flight.
    fn try_lock(&self, id: LockId) -> Result<Option<TaggedGuard<'_, Control>>> {
        match self.control.try_lock(id) {
            Some(control) => {
                self.check_ready()?;
                Ok(Some(control))
            }
            None => {
                tracing::debug!("{} skipped, command lock held by {}", id, self.control.holder());
                Ok(None)
            }
        }
    }

    fn check_ready(&self) -> Result<()> {
        match self.shared.state() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(ClientError::Closed),
            _ => Err(ClientError::NotReady),
        }
    }

    fn expect_done(&self, operation: &str, response: Response) -> Result<Option<u32>> {
        match response {
            Response::Done { latency_samples } => {
                if let Some(latency) = latency_samples {
                    self.base_latency.store(latency as usize, Ordering::Relaxed);
                }
                Ok(latency_samples)
            }
            other => Err(command::unexpected(operation, other)),
        }
    }

    fn slot_exists(control: &Control, idx: usize) -> Result<()> {
        if idx < control.chain.len() {
            Ok(())
        } else {
            Err(ClientError::InvalidSlot(idx))
        }
    }

    /// Loads plugin `id` at the end of the chain and returns its slot.
    pub fn add_plugin(&self, id: &str, settings: Option<&str>) -> Result<PluginSlot> {
        let mut control = self.lock(LockId::AddPlugin)?;
        let idx = self.add_plugin_locked(&mut control, id, settings)?;
        control
            .chain
            .get(idx)
            .cloned()
            .ok_or(ClientError::InvalidSlot(idx))
    }

    fn add_plugin_locked(&self, control: &mut Control, id: &str, settings: Option<&str>) -> Result<usize> {
        let request = Request::AddPlugin {
            id: id.to_string(),
            settings: settings.map(str::to_string),
        };
        let timeout = self.load_plugin_timeout();
        match self.request_for(control, request, timeout)? {
            Response::PluginAdded {
                name,
                presets,
                parameters,
                latency_samples,
            } => {
                self.base_latency
                    .store(latency_samples as usize, Ordering::Relaxed);
                let slot = PluginSlot {
                    id: id.to_string(),
                    name: if name.is_empty() { id.to_string() } else { name },
                    presets,
                    parameters: parameters.into_iter().map(Parameter::from_wire).collect(),
                    settings: settings.unwrap_or_default().to_string(),
                    bypassed: false,
                };
                tracing::info!("loaded {} ({} parameters)", slot.name, slot.parameters.len());
                control.chain.push(slot);
                Ok(control.chain.len() - 1)
            }
            other => Err(command::unexpected("add plugin", other)),
        }
    }

    pub fn del_plugin(&self, idx: usize) -> Result<()> {
        let mut control = self.lock(LockId::DelPlugin)?;
        Self::slot_exists(&control, idx)?;
        let response = self.request(&mut control, Request::DelPlugin { idx })?;
        self.expect_done("delete plugin", response)?;
        control.chain.remove(idx);
        Ok(())
    }

    /// Opens the plugin's editor on the server; its image arrives on the screen stream.
    pub fn edit_plugin(&self, idx: usize) -> Result<()> {
        let mut control = self.lock(LockId::EditPlugin)?;
        Self::slot_exists(&control, idx)?;
        let response = self.request(&mut control, Request::EditPlugin { idx })?;
        self.expect_done("edit plugin", response).map(drop)
    }

    pub fn hide_plugin(&self) -> Result<()> {
        let mut control = self.lock(LockId::HidePlugin)?;
        let response = self.request(&mut control, Request::HidePlugin)?;
        self.expect_done("hide plugin", response).map(drop)
    }

    pub fn get_plugin_settings(&self, idx: usize) -> Result<String> {
        let mut control = self.lock(LockId::GetPluginSettings)?;
        Self::slot_exists(&control, idx)?;
        match self.request(&mut control, Request::GetPluginSettings { idx })? {
            Response::Settings { settings } => {
                if let Some(slot) = control.chain.get_mut(idx) {
                    slot.settings = settings.clone();
                }
                Ok(settings)
            }
            other => Err(command::unexpected("get plugin settings", other)),
        }
    }

    pub fn set_plugin_settings(&self, idx: usize, settings: &str) -> Result<()> {
        let mut control = self.lock(LockId::SetPluginSettings)?;
        Self::slot_exists(&control, idx)?;
        let request = Request::SetPluginSettings {
            idx,
            settings: settings.to_string(),
        };
        let response = self.request(&mut control, request)?;
        self.expect_done("set plugin settings", response)?;
        if let Some(slot) = control.chain.get_mut(idx) {
            slot.settings = settings.to_string();
        }
        Ok(())
    }

    pub fn bypass_plugin(&self, idx: usize) -> Result<()> {
        self.set_bypass(LockId::BypassPlugin, idx, true)
    }

    pub fn unbypass_plugin(&self, idx: usize) -> Result<()> {
        self.set_bypass(LockId::UnbypassPlugin, idx, false)
    }

    fn set_bypass(&self, id: LockId, idx: usize, bypassed: bool) -> Result<()> {
        let mut control = self.lock(id)?;
        Self::slot_exists(&control, idx)?;
        let request = if bypassed {
            Request::BypassPlugin { idx }
        } else {
            Request::UnbypassPlugin { idx }
        };
        let response = self.request(&mut control, request)?;
        self.expect_done("bypass", response)?;
        if let Some(slot) = control.chain.get_mut(idx) {
            slot.bypassed = bypassed;
        }
        Ok(())
    }

    /// Swaps two slots of the chain.
    pub fn exchange_plugins(&self, idx_a: usize, idx_b: usize) -> Result<()> {
        let mut control = self.lock(LockId::ExchangePlugins)?;
        Self::slot_exists(&control, idx_a)?;
        Self::slot_exists(&control, idx_b)?;
        let response = self.request(&mut control, Request::ExchangePlugins { idx_a, idx_b })?;
        self.expect_done("exchange plugins", response)?;
        control.chain.exchange(idx_a, idx_b);
        Ok(())
    }

    /// Recently used plugins on the server, newest first.
    pub fn recents(&self) -> Result<Vec<ServerPlugin>> {
        let mut control = self.lock(LockId::GetRecents)?;
        let request = Request::RecentsList {
            max: self.config.num_recents,
        };
        match self.request(&mut control, request)? {
            Response::Recents { plugins } => Ok(plugins),
            other => Err(command::unexpected("recents list", other)),
        }
    }

    pub fn set_preset(&self, idx: usize, preset: i32) -> Result<()> {
        let mut control = self.lock(LockId::SetPreset)?;
        Self::slot_exists(&control, idx)?;
        let response = self.request(&mut control, Request::Preset { idx, preset })?;
        self.expect_done("preset", response).map(drop)
    }

    /// Normalized value of one parameter, read from the server.
    pub fn get_parameter_value(&self, idx: usize, param_idx: i32) -> Result<f32> {
        let mut control = self.lock(LockId::GetParameterValue)?;
        Self::slot_exists(&control, idx)?;
        match self.request(&mut control, Request::GetParameterValue { idx, param_idx })? {
            Response::ParameterValue { value } => {
                if let Some(param) = control
                    .chain
                    .get_mut(idx)
                    .and_then(|s| s.parameter_mut(param_idx))
                {
                    param.current_value = value;
                }
                Ok(value)
            }
            other => Err(command::unexpected("get parameter value", other)),
        }
    }

    /// Sets one parameter to a normalized value.
    pub fn set_parameter_value(&self, idx: usize, param_idx: i32, value: f32) -> Result<()> {
        let mut control = self.lock(LockId::SetParameterValue)?;
        Self::slot_exists(&control, idx)?;
        let request = Request::SetParameterValue {
            idx,
            param_idx,
            value,
        };
        let response = self.request(&mut control, request)?;
        self.expect_done("set parameter value", response)?;
        if let Some(param) = control
            .chain
            .get_mut(idx)
            .and_then(|s| s.parameter_mut(param_idx))
        {
            param.current_value = value;
        }
        Ok(())
    }

    /// Reads the first `count` parameters of a slot in one round trip.
    pub fn get_all_parameter_values(&self, idx: usize, count: usize) -> Result<Vec<ParameterResult>> {
        let mut control = self.lock(LockId::GetAllParameterValues)?;
        Self::slot_exists(&control, idx)?;
        match self.request(&mut control, Request::GetAllParameterValues { idx, count })? {
            Response::ParameterValues { values } => {
                if let Some(slot) = control.chain.get_mut(idx) {
                    for result in &values {
                        if let Some(param) = slot.parameter_mut(result.idx) {
                            param.current_value = result.value;
                        }
                    }
                }
                Ok(values)
            }
            other => Err(command::unexpected("get all parameter values", other)),
        }
    }

    /// Forwards a mouse event to the plugin editor. Returns `false` if it was
    /// dropped because another command was in flight.
    pub fn send_mouse_event(&self, event: MouseEvent) -> Result<bool> {
        let Some(mut control) = self.try_lock(LockId::SendMouseEvent)? else {
            return Ok(false);
        };
        let response = self.request(&mut control, Request::Mouse { event })?;
        self.expect_done("mouse event", response).map(|_| true)
    }

    /// Forwards a key press to the plugin editor; dropped like mouse events.
    pub fn send_key(&self, press: KeyPress) -> Result<bool> {
        let Some(mut control) = self.try_lock(LockId::KeyPressed)? else {
            return Ok(false);
        };
        let response = self.request(&mut control, Request::Key { press })?;
        self.expect_done("key event", response).map(|_| true)
    }

    pub fn update_screen_capture_area(&self, area: i32) -> Result<()> {
        let mut control = self.lock(LockId::UpdateScreenCaptureArea)?;
        let response = self.request(&mut control, Request::ScreenCaptureArea { area })?;
        self.expect_done("screen capture area", response).map(drop)
    }

    /// Asks the server to rescan its plugin catalog.
    pub fn rescan(&self, wipe: bool) -> Result<()> {
        let mut control = self.lock(LockId::Rescan)?;
        let response = self.request(&mut control, Request::Rescan { wipe })?;
        self.expect_done("rescan", response).map(drop)
    }

    /// Polls the server load and folds it into the smoothed metric.
    ///
    /// Skipped while another command holds the lock; the previous value is
    /// returned then.
    pub fn update_load(&self) -> Result<f32> {
        let Some(mut control) = self.try_lock(LockId::UpdateCpuLoad)? else {
            return Ok(self.load());
        };
        let sample = match self.request(&mut control, Request::CpuLoad)? {
            Response::Load { load } => load,
            other => return Err(command::unexpected("cpu load", other)),
        };
        drop(control);

        let mut endpoint = self.endpoint.lock();
        endpoint.record_load(sample, self.config.load_smoothing);
        self.load_bits.store(endpoint.load.to_bits(), Ordering::Relaxed);
        Ok(endpoint.load)
    }

    // =========================================================================
    // Local state
    // =========================================================================

    /// Snapshot of the loaded chain.
    pub fn plugins(&self) -> Vec<PluginSlot> {
        self.control.lock(LockId::GetPlugins).chain.slots().to_vec()
    }

    /// `"A > B > C"`, or `None` while the command lock is busy.
    pub fn loaded_plugins_string(&self) -> Option<String> {
        self.control
            .try_lock(LockId::GetLoadedPluginsString)
            .map(|control| control.chain.describe())
    }

    /// Latest remote editor image.
    pub fn plugin_screen(&self) -> Option<Arc<ScreenImage>> {
        self.screen.lock().as_ref().and_then(ScreenStreamer::latest)
    }

    /// Operation currently holding the command lock.
    pub fn command_lock_holder(&self) -> LockId {
        self.control.holder()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() != SessionState::Closed {
            self.close();
        }
    }
}
