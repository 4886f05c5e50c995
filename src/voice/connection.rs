use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream::SplitStream};
use parking_lot::Mutex;
use tokio::{net::UdpSocket, task::JoinHandle, time::Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, debug, info, instrument::WithSubscriber, warn};

use crate::{
    common::{
        errors::{VoiceError, VoiceResult},
        logger,
        socket::{SocketWriter, WsStream},
        types::Shared,
    },
    configs::VoiceConfig,
    heartbeat::HeartbeatScheduler,
    voice::{
        control::{
            self, ControlSender, SessionDescription, VoiceControl, VoicePayload, VoiceReady,
            VoiceServerInfo, voice_url,
        },
        crypto::{EncryptionMode, PacketSealer, select_mode},
        opcodes::VoiceOpCode,
        player::{AudioSource, FrameSink, PacingOptions, Playback},
        udp::{VoiceUdp, discover_ip},
    },
};

/// A negotiated voice connection: control socket, heartbeat and an
/// encrypted datagram channel ready for audio.
pub struct VoiceConnection {
    label: String,
    control: Arc<VoiceControl>,
    ssrc: u32,
    mode: EncryptionMode,
    udp: Shared<VoiceUdp>,
    config: VoiceConfig,
    dispatch: Dispatch,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<SocketWriter>>,
    playback: Mutex<Option<Playback>>,
}

impl VoiceConnection {
    /// Connects and negotiates using the caller's current logger.
    pub async fn connect(info: VoiceServerInfo, config: VoiceConfig) -> VoiceResult<Self> {
        Self::connect_with_logger(info, config, logger::current()).await
    }

    pub async fn connect_with_logger(
        info: VoiceServerInfo,
        config: VoiceConfig,
        dispatch: Dispatch,
    ) -> VoiceResult<Self> {
        let label = format!("voice {}", info.guild_id);
        ensure_encryption(&config)?;
        connect_inner(label, info, config, dispatch.clone())
            .with_subscriber(dispatch)
            .await
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.control.sender.is_open()
    }

    /// Round trip of the last acknowledged voice heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.control.heartbeat.latency()
    }

    pub fn set_speaking(&self, speaking: bool) -> VoiceResult<()> {
        self.control
            .sender
            .send(&control::speaking(speaking, self.ssrc))
    }

    /// Starts streaming `source`, stopping any playback already running.
    pub async fn play<S: AudioSource>(&self, source: S) -> VoiceResult<Playback> {
        if !self.is_open() {
            return Err(VoiceError::NotConnected);
        }
        let previous = self.playback.lock().take();
        if let Some(previous) = previous {
            previous.stop();
            previous.finished().await;
        }

        let output = VoiceOutput {
            udp: self.udp.clone(),
            control: self.control.sender.clone(),
            ssrc: self.ssrc,
        };
        let playback = Playback::spawn(
            source,
            output,
            PacingOptions::from(&self.config),
            self.dispatch.clone(),
        );
        debug!("[{}] Playback started", self.label);
        *self.playback.lock() = Some(playback.clone());
        Ok(playback)
    }

    /// The current playback, if one was started.
    pub fn playback(&self) -> Option<Playback> {
        self.playback.lock().clone()
    }

    /// Tears everything down: playback and heartbeat are aborted, a close
    /// frame is sent and the datagram socket is released.
    pub async fn destroy(self) {
        info!("[{}] Destroying voice connection", self.label);
        self.cancel.cancel();
        if let Some(playback) = self.playback.lock().take() {
            playback.abort();
        }
        self.control.heartbeat.abort();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        self.control.sender.close();
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            writer.shutdown().await;
        }
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.control.heartbeat.abort();
        if let Some(playback) = self.playback.lock().take() {
            playback.abort();
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.lock().take() {
            writer.abort();
        }
    }
}

/// Refuses to start without a usable secretbox mode; audio is never sent
/// in the clear.
fn ensure_encryption(config: &VoiceConfig) -> VoiceResult<()> {
    if config.encryption_modes.is_empty() {
        return Err(VoiceError::EncryptionUnavailable(
            "no encryption modes configured".into(),
        ));
    }
    Ok(())
}

/// What the handshake produces before the connection is assembled.
struct Negotiated {
    ssrc: u32,
    server: SocketAddr,
    socket: Arc<UdpSocket>,
    description: SessionDescription,
}

async fn connect_inner(
    label: String,
    info: VoiceServerInfo,
    config: VoiceConfig,
    dispatch: Dispatch,
) -> VoiceResult<VoiceConnection> {
    let url = voice_url(&info.endpoint, config.version);
    debug!("[{}] Connecting to voice gateway: {}", label, url);

    let (ws_stream, _) = connect_async(&url).await?;
    let (write, mut read) = ws_stream.split();
    let (mut writer, socket) = SocketWriter::spawn(&label, write, &dispatch);

    let sender = ControlSender::new(socket);
    let control = Arc::new(VoiceControl {
        label: label.clone(),
        sender: sender.clone(),
        heartbeat: HeartbeatScheduler::new(label.clone(), false, dispatch.clone()),
    });

    let negotiated = async {
        sender.send(&control::identify(&info))?;
        let negotiated = handshake(&label, &config, &control, &mut read).await?;
        let sealer = PacketSealer::new(
            negotiated.description.mode,
            &negotiated.description.secret_key,
        )?;
        Ok::<_, VoiceError>((negotiated, sealer))
    }
    .await;

    let (negotiated, sealer) = match negotiated {
        Ok(negotiated) => negotiated,
        Err(e) => {
            warn!("[{}] Voice handshake failed: {}", label, e);
            control.heartbeat.abort();
            sender.close();
            writer.shutdown().await;
            return Err(e);
        }
    };

    let cancel = CancellationToken::new();
    let udp = VoiceUdp::new(
        negotiated.socket,
        negotiated.server,
        negotiated.ssrc,
        sealer,
    );

    let reader = tokio::spawn(
        read_loop(control.clone(), read, cancel.clone()).with_subscriber(dispatch.clone()),
    );

    info!(
        "[{}] Voice ready (ssrc {}, mode {})",
        label, negotiated.ssrc, negotiated.description.mode
    );

    Ok(VoiceConnection {
        label,
        control,
        ssrc: negotiated.ssrc,
        mode: negotiated.description.mode,
        udp: Arc::new(tokio::sync::Mutex::new(udp)),
        config,
        dispatch,
        cancel,
        reader: Mutex::new(Some(reader)),
        writer: Mutex::new(Some(writer)),
        playback: Mutex::new(None),
    })
}

/// Aborts the discovery task when the handshake is abandoned.
struct DiscoveryTask(JoinHandle<VoiceResult<(String, u16)>>);

impl Drop for DiscoveryTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Handshake progress; each waiting step has its own deadline.
enum Step {
    AwaitingReady,
    Discovering {
        ssrc: u32,
        server: SocketAddr,
        socket: Arc<UdpSocket>,
        mode: EncryptionMode,
        task: DiscoveryTask,
    },
    AwaitingDescription {
        ssrc: u32,
        server: SocketAddr,
        socket: Arc<UdpSocket>,
        mode: EncryptionMode,
    },
}

async fn handshake(
    label: &str,
    config: &VoiceConfig,
    control: &Arc<VoiceControl>,
    read: &mut SplitStream<WsStream>,
) -> VoiceResult<Negotiated> {
    let mut step = Step::AwaitingReady;
    let mut deadline = config.ready_timeout().map(|t| Instant::now() + t);

    loop {
        let waiting_for = match step {
            Step::AwaitingReady => "voice ready",
            Step::Discovering { .. } => "ip discovery",
            Step::AwaitingDescription { .. } => "session description",
        };

        let discovery = async {
            match &mut step {
                Step::Discovering { task, .. } => (&mut task.0).await,
                _ => std::future::pending().await,
            }
        };
        let expiry = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let event = tokio::select! {
            _ = expiry => return Err(VoiceError::HandshakeTimeout(waiting_for)),
            joined = discovery => Event::Discovered(joined),
            msg = read.next() => Event::Frame(msg),
        };

        match event {
            Event::Discovered(joined) => {
                let (address, port) = joined
                    .map_err(|e| VoiceError::Closed(format!("ip discovery task failed: {e}")))??;
                let Step::Discovering {
                    ssrc,
                    server,
                    socket,
                    mode,
                    ..
                } = std::mem::replace(&mut step, Step::AwaitingReady)
                else {
                    continue;
                };
                debug!(
                    "[{}] Discovered external address {}:{}",
                    label, address, port
                );
                control
                    .sender
                    .send(&control::select_protocol(&address, port, mode))?;
                deadline = config.ready_timeout().map(|t| Instant::now() + t);
                step = Step::AwaitingDescription {
                    ssrc,
                    server,
                    socket,
                    mode,
                };
            }
            Event::Frame(None) => {
                control.sender.mark_closed();
                return Err(VoiceError::Closed("stream ended".into()));
            }
            Event::Frame(Some(Err(e))) => {
                control.sender.mark_closed();
                return Err(e.into());
            }
            Event::Frame(Some(Ok(msg))) => {
                let payload: VoicePayload = match msg {
                    Message::Text(text) => serde_json::from_str(text.as_str())?,
                    Message::Close(frame) => {
                        control.sender.mark_closed();
                        let reason = frame
                            .map(|cf| format!("{}: {}", u16::from(cf.code), cf.reason.as_str()))
                            .unwrap_or_else(|| "no reason".into());
                        return Err(VoiceError::Closed(reason));
                    }
                    _ => continue,
                };

                match payload.opcode() {
                    Some(VoiceOpCode::Hello) => {
                        let interval = heartbeat_interval(&payload.d)
                            .ok_or(VoiceError::Malformed("HELLO without heartbeat_interval"))?;
                        debug!("[{}] Voice heartbeat interval {:?}", label, interval);
                        control.heartbeat.start(interval, control.clone());
                    }
                    Some(VoiceOpCode::Ready) => {
                        if !matches!(step, Step::AwaitingReady) {
                            debug!("[{}] Ignoring repeated READY", label);
                            continue;
                        }
                        let ready: VoiceReady = serde_json::from_value(payload.d)?;
                        let mode = select_mode(&config.encryption_modes, &ready.modes)?;
                        let server = tokio::net::lookup_host((ready.ip.as_str(), ready.port))
                            .await?
                            .next()
                            .ok_or_else(|| {
                                VoiceError::Closed(format!("unresolvable voice server {}", ready.ip))
                            })?;
                        debug!(
                            "[{}] Ready! Server: {}, SSRC: {}, Mode: {}",
                            label, server, ready.ssrc, mode
                        );

                        let socket = Arc::new(UdpSocket::bind(bind_addr(&server)).await?);
                        let task = DiscoveryTask(tokio::spawn(
                            discover_ip_owned(
                                socket.clone(),
                                server,
                                ready.ssrc,
                                config.discovery_timeout(),
                            )
                            .with_current_subscriber(),
                        ));
                        // Discovery carries its own bound.
                        deadline = None;
                        step = Step::Discovering {
                            ssrc: ready.ssrc,
                            server,
                            socket,
                            mode,
                            task,
                        };
                    }
                    Some(VoiceOpCode::SessionDescription) => {
                        let Step::AwaitingDescription {
                            ssrc,
                            server,
                            socket,
                            mode,
                        } = std::mem::replace(&mut step, Step::AwaitingReady)
                        else {
                            warn!("[{}] SESSION_DESCRIPTION before protocol selection", label);
                            continue;
                        };
                        let description = SessionDescription::parse(&payload.d)?;
                        if description.mode != mode {
                            warn!(
                                "[{}] Selected {} but server answered with {}, using the server's mode",
                                label, mode, description.mode
                            );
                        }
                        return Ok(Negotiated {
                            ssrc,
                            server,
                            socket,
                            description,
                        });
                    }
                    Some(VoiceOpCode::HeartbeatAck) => control.heartbeat.acknowledge(),
                    other => debug!("[{}] Ignoring voice op {:?} during handshake", label, other),
                }
            }
        }
    }
}

enum Event {
    Discovered(Result<VoiceResult<(String, u16)>, tokio::task::JoinError>),
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

async fn discover_ip_owned(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    ssrc: u32,
    timeout: Option<Duration>,
) -> VoiceResult<(String, u16)> {
    discover_ip(&socket, server, ssrc, timeout).await
}

fn bind_addr(server: &SocketAddr) -> &'static str {
    if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }
}

/// HELLO carries milliseconds, sometimes as a float.
fn heartbeat_interval(d: &serde_json::Value) -> Option<Duration> {
    let ms = d["heartbeat_interval"].as_f64()?;
    Some(Duration::from_secs_f64(ms.max(1.0) / 1000.0))
}

async fn read_loop(
    control: Arc<VoiceControl>,
    mut read: SplitStream<WsStream>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<VoicePayload>(text.as_str()) {
                    Ok(p) if p.opcode() == Some(VoiceOpCode::HeartbeatAck) => {
                        control.heartbeat.acknowledge();
                    }
                    Ok(p) => debug!("[{}] Voice op {}: {}", control.label, p.op, p.d),
                    Err(e) => warn!("[{}] Undecodable voice frame: {}", control.label, e),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                info!("[{}] Voice socket closed: {:?}", control.label, frame);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("[{}] Voice WS read error: {}", control.label, e);
                break;
            }
            None => break,
        }
    }
    control.sender.mark_closed();
    debug!("[{}] Voice read loop stopped", control.label);
}

/// Paced frames go out over UDP; speaking updates over the control socket.
struct VoiceOutput {
    udp: Shared<VoiceUdp>,
    control: ControlSender,
    ssrc: u32,
}

#[async_trait]
impl FrameSink for VoiceOutput {
    async fn send_frame(&mut self, frame: &[u8]) -> VoiceResult<()> {
        self.udp.lock().await.send_frame(frame).await
    }

    async fn set_speaking(&mut self, speaking: bool) -> VoiceResult<()> {
        self.control.send(&control::speaking(speaking, self.ssrc))
    }
}
