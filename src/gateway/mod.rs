//! Gateway session: one logical session carried across many sockets.
//!
//! [`Gateway`] owns the reconnect loop. Each socket gets a fresh
//! [`transport::GatewayTransport`] and a [`handler::ConnectionHandler`];
//! the [`session::SessionRecord`] and the heartbeat loop outlive them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, debug, error, info, instrument::WithSubscriber, warn};

pub mod backoff;
pub mod constants;
pub(crate) mod handler;
pub mod identity;
pub mod opcodes;
pub mod payload;
pub mod resolver;
pub mod session;
pub mod sink;
pub mod transport;

pub use identity::{ClientProperties, Credentials};
pub use payload::{Activity, GatewayPayload, PresenceUpdate, Status};
pub use resolver::{EndpointResolver, StaticEndpoint};
pub use session::{SessionHandle, SessionRecord};
pub use sink::{ChannelSink, DispatchSink, GatewayEvent, NullSink};
pub use transport::CloseReason;

use self::{
    backoff::Backoff,
    constants::{NORMAL_CLOSE_CODE, RESUMABLE_CLOSE_CODE, is_fatal_close, is_reidentify_close},
    handler::{ConnectionHandler, SessionOutcome},
    resolver::connection_url,
    transport::{GatewayTransport, TransportSender},
};
use crate::{
    common::{
        errors::{GatewayError, GatewayResult},
        logger,
        types::{ChannelId, GuildId},
    },
    configs::GatewayConfig,
    heartbeat::{HeartbeatScheduler, HeartbeatTarget},
};

/// Observable lifecycle of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Active,
    /// Socket lost; waiting to reconnect.
    Suspended,
}

/// The socket currently in use, plus a way for other tasks to drop it.
struct Link {
    sender: TransportSender,
    dropped: CancellationToken,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

/// Read side of a [`Link`] drop request, held by the read loop.
struct LinkWatch {
    dropped: CancellationToken,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

impl LinkWatch {
    async fn dropped(&self) -> CloseReason {
        self.dropped.cancelled().await;
        self.reason.lock().take().unwrap_or(CloseReason::StreamEnded)
    }
}

/// State shared by the controller, the per-socket handler and the
/// heartbeat loop.
pub(crate) struct GatewayShared {
    pub(crate) label: String,
    pub(crate) config: GatewayConfig,
    pub(crate) credentials: Credentials,
    pub(crate) session: SessionHandle,
    pub(crate) heartbeat: HeartbeatScheduler,
    pub(crate) sink: Arc<dyn DispatchSink>,
    link: Mutex<Option<Link>>,
    state: watch::Sender<ConnectionState>,
    dispatch: Dispatch,
}

impl GatewayShared {
    pub(crate) fn new(
        config: GatewayConfig,
        credentials: Credentials,
        sink: Arc<dyn DispatchSink>,
        dispatch: Dispatch,
    ) -> Self {
        let label = match config.shard {
            Some([id, count]) => format!("shard {}/{}", id, count),
            None => "gateway".to_string(),
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            heartbeat: HeartbeatScheduler::new(
                label.clone(),
                config.check_heartbeat_acks,
                dispatch.clone(),
            ),
            label,
            config,
            credentials,
            session: SessionHandle::default(),
            sink,
            link: Mutex::new(None),
            state,
            dispatch,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("[{}] State {:?} -> {:?}", self.label, previous, state);
        }
    }

    fn attach(&self, sender: TransportSender) -> LinkWatch {
        let dropped = CancellationToken::new();
        let reason = Arc::new(Mutex::new(None));
        *self.link.lock() = Some(Link {
            sender,
            dropped: dropped.clone(),
            reason: reason.clone(),
        });
        LinkWatch { dropped, reason }
    }

    fn detach(&self) {
        self.link.lock().take();
    }

    /// Asks the read loop to drop the current socket.
    fn drop_link(&self, why: CloseReason) {
        if let Some(link) = self.link.lock().as_ref() {
            link.reason.lock().get_or_insert(why);
            link.dropped.cancel();
        }
    }

    fn link_open(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.sender.is_open())
    }

    fn send(&self, payload: &GatewayPayload) -> GatewayResult<()> {
        match self.link.lock().as_ref() {
            Some(link) => link.sender.send(payload),
            None => Err(GatewayError::NotConnected),
        }
    }
}

impl HeartbeatTarget for GatewayShared {
    type Error = GatewayError;

    fn is_suspended(&self) -> bool {
        self.session.is_suspended() || !self.link_open()
    }

    fn send_heartbeat(&self) -> GatewayResult<()> {
        let seq = self.session.heartbeat_sequence();
        self.send(&payload::heartbeat(seq))
    }

    fn on_zombie(&self) {
        self.drop_link(CloseReason::Zombie);
    }
}

/// A persistent gateway session.
///
/// Cheap to clone; clones control the same session. A stopped or killed
/// gateway cannot be started again.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<GatewayShared>,
    resolver: Arc<dyn EndpointResolver>,
    stop: CancellationToken,
    kill: CancellationToken,
    /// True while some `run` call is executing.
    running: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<GatewayResult<()>>>>>,
}

/// Clears the running flag however `run` exits, including when dropped.
struct RunningGuard<'a>(&'a watch::Sender<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        credentials: Credentials,
        resolver: Arc<dyn EndpointResolver>,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        Self {
            shared: Arc::new(GatewayShared::new(
                config,
                credentials,
                sink,
                logger::current(),
            )),
            resolver,
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            running: Arc::new(watch::channel(false).0),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Routes this gateway's logs (including its tasks) to `dispatch`.
    pub fn with_logger(mut self, dispatch: Dispatch) -> Self {
        self.shared = Arc::new(GatewayShared::new(
            self.shared.config.clone(),
            self.shared.credentials.clone(),
            self.shared.sink.clone(),
            dispatch,
        ));
        self
    }

    /// Drives the session until `stop()`, `kill()` or a terminal error.
    ///
    /// Dropped sockets are recovered internally; only fatal close codes,
    /// an exhausted reconnect budget and `kill()` surface as errors.
    pub async fn run(&self) -> GatewayResult<()> {
        self.running.send_replace(true);
        let _running = RunningGuard(&self.running);
        let dispatch = self.shared.dispatch.clone();
        let result = tokio::select! {
            biased;
            _ = self.kill.cancelled() => Err(GatewayError::Killed),
            res = self.run_loop().with_subscriber(dispatch) => res,
        };

        match &result {
            Err(GatewayError::Killed) => self.shared.heartbeat.abort(),
            _ => self.shared.heartbeat.stop().await,
        }
        self.shared.detach();
        self.shared.set_state(ConnectionState::Disconnected);
        result
    }

    /// Starts [`run`](Self::run) on a background task. No-op while running.
    pub fn connect(&self) {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Waits for the background task started by [`connect`](Self::connect).
    pub async fn wait(&self) -> GatewayResult<()> {
        let handle = self.task.lock().take();
        match handle {
            Some(handle) => handle.await.unwrap_or(Err(GatewayError::Killed)),
            None => Ok(()),
        }
    }

    /// Graceful shutdown: sends a normal close frame and waits until
    /// `run` has returned, whether it was driven by the caller or by
    /// [`connect`](Self::connect). The session record is left untouched.
    pub async fn stop(&self) {
        info!("[{}] Stopping gateway", self.shared.label);
        self.stop.cancel();
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Hard abort: no close frame, tasks are cancelled immediately and
    /// `run` returns [`GatewayError::Killed`].
    pub fn kill(&self) {
        warn!("[{}] Killing gateway", self.shared.label);
        self.kill.cancel();
        self.shared.heartbeat.abort();
        self.shared.detach();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.running.send_replace(false);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn session(&self) -> Option<SessionRecord> {
        self.shared.session.snapshot()
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<std::time::Duration> {
        self.shared.heartbeat.latency()
    }

    pub fn update_status(&self, presence: &PresenceUpdate) -> GatewayResult<()> {
        self.shared.send(&payload::presence_update(presence))
    }

    /// Joins, moves between or (with `channel_id = None`) leaves a voice
    /// channel.
    pub fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> GatewayResult<()> {
        self.shared.send(&payload::voice_state_update(
            guild_id, channel_id, self_mute, self_deaf,
        ))
    }

    pub fn request_members(&self, guild_id: GuildId, query: &str, limit: u32) -> GatewayResult<()> {
        self.shared
            .send(&payload::request_guild_members(guild_id, query, limit))
    }

    /// Sends a raw payload on the current socket.
    pub fn send_payload(&self, payload: &GatewayPayload) -> GatewayResult<()> {
        self.shared.send(payload)
    }

    async fn run_loop(&self) -> GatewayResult<()> {
        let shared = &self.shared;
        let max_attempts = shared.config.max_reconnect_attempts;
        let mut backoff = Backoff::new(shared.config.backoff.clone());

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            shared.set_state(ConnectionState::Connecting);
            let outcome = match self.connect_once(&mut backoff).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("[{}] Connection attempt failed: {}", shared.label, e);
                    SessionOutcome::Dropped(CloseReason::Io(e.to_string()))
                }
            };

            match outcome {
                SessionOutcome::Stopped => {
                    debug!("[{}] Gateway stopped cleanly", shared.label);
                    return Ok(());
                }
                SessionOutcome::ReconnectNow => {
                    if backoff.is_exhausted(max_attempts) {
                        error!("[{}] Max reconnect attempts reached", shared.label);
                        return Err(GatewayError::ReconnectsExhausted(backoff.attempts()));
                    }
                    backoff.record_immediate();
                    shared.set_state(ConnectionState::Suspended);
                    debug!("[{}] Reconnecting immediately (resume)", shared.label);
                }
                SessionOutcome::Dropped(reason) => {
                    if let CloseReason::Remote { code, reason } = &reason {
                        if is_fatal_close(*code) {
                            error!(
                                "[{}] Fatal close code {}: {}",
                                shared.label, code, reason
                            );
                            return Err(GatewayError::FatalClose {
                                code: *code,
                                reason: reason.clone(),
                            });
                        }
                        if is_reidentify_close(*code) {
                            info!(
                                "[{}] Close code {} invalidated the session",
                                shared.label, code
                            );
                            shared.session.invalidate();
                        }
                    }
                    shared.session.suspend();
                    shared.set_state(ConnectionState::Suspended);

                    if backoff.is_exhausted(max_attempts) {
                        error!("[{}] Max reconnect attempts reached", shared.label);
                        return Err(GatewayError::ReconnectsExhausted(backoff.attempts()));
                    }
                    let delay = backoff.next();
                    warn!(
                        "[{}] Disconnected ({}). Reconnecting in {:?}",
                        shared.label, reason, delay
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_once(&self, backoff: &mut Backoff) -> GatewayResult<SessionOutcome> {
        let shared = &self.shared;
        let base = self
            .resolver
            .gateway_url()
            .await
            .map_err(|e| GatewayError::Resolve(e.to_string()))?;
        let url = connection_url(&base, &shared.config);

        let mut transport = tokio::select! {
            _ = self.stop.cancelled() => return Ok(SessionOutcome::Stopped),
            res = GatewayTransport::connect(&url, &shared.label, &shared.dispatch) => res?,
        };
        let sender = transport.sender();
        let link = shared.attach(sender.clone());
        shared.set_state(ConnectionState::AwaitingHello);

        let mut handler = ConnectionHandler::new(Arc::clone(shared), sender.clone());
        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    sender.close(NORMAL_CLOSE_CODE);
                    break SessionOutcome::Stopped;
                }
                reason = link.dropped() => {
                    sender.close(RESUMABLE_CLOSE_CODE);
                    break SessionOutcome::Dropped(reason);
                }
                next = transport.next_payload() => match next {
                    Ok(payload) => {
                        if let Some(outcome) = handler.handle(payload).await {
                            break outcome;
                        }
                    }
                    Err(reason) => break SessionOutcome::Dropped(reason),
                },
            }
        };

        shared.detach();
        transport.shutdown().await;

        if let Some(since) = handler.active_since() {
            backoff.reset_attempts();
            backoff.on_stable(since.elapsed());
        }

        let reason = match &outcome {
            SessionOutcome::Dropped(reason) => reason.clone(),
            SessionOutcome::ReconnectNow => CloseReason::ReconnectRequested,
            SessionOutcome::Stopped => CloseReason::Stopped,
        };
        info!("[{}] Connection closed: {}", shared.label, reason);
        shared.sink.disconnected(&reason).await;

        Ok(outcome)
    }
}
