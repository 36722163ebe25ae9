//! Functionality that manages a gateway session and dispatches its events.
//!
//! Each collector token and the republisher's bot token get one [`Shard`].
//! The shard owns the websocket, heartbeats, and resume state; everything the
//! mirror cares about arrives through a [`GatewayHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use async_tungstenite::{
    tokio::{connect_async, ConnectStream},
    tungstenite::Message as WsMessage,
    tungstenite::protocol::CloseFrame,
    tungstenite::protocol::frame::coding::CloseCode,
    WebSocketStream,
};
use futures::{SinkExt, TryStreamExt};
use log::{error, info, warn};
use thiserror::Error;
use tokio::time::{Duration, Instant};

use model::{Heartbeat, HelloPayload, Identify, Payload, Resume};

use crate::errors::MirrorError;
use crate::http::{ClientError, DiscordClient};
use crate::macros::API_VERSION;
use crate::model::channel::Channel;
use crate::model::guild::Guild;
use crate::model::message::Message;
use crate::shard::dispatch::{DispatchPayload, Ready};
use crate::utils::ShutdownRx;

pub mod dispatch;
pub mod intents;
pub mod model;

pub type ShardResult<T> = Result<T, ShardError>;
pub type WsStream = WebSocketStream<ConnectStream>;
type WsError = async_tungstenite::tungstenite::Error;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("http error: {0}")]
    Request(#[from] ClientError),
    #[error("websocket error: {0}")]
    Websocket(#[from] WsError),
    #[error("stream closed (restarting)")]
    NeedRestart,
    #[error("authentication failed, token is invalid")]
    AuthInvalid,
    #[error("shutdown requested")]
    Shutdown,
}

impl ShardError {
    /// Terminal errors stop the reconnect loop entirely; the collector marks
    /// the token failed (or exits) instead of retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthInvalid | Self::Shutdown)
    }
}

/// Gateway close codes that mean the token itself is bad.
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_INTENTS_DISALLOWED: u16 = 4014;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ConnectionAction {
    None,
    Resume,
    Reconnect,
}

impl ConnectionAction {
    fn terminal(self) -> bool {
        match self {
            Self::None => false,
            Self::Resume | Self::Reconnect => true,
        }
    }
}

fn gateway_params(url: &str) -> String {
    format!("{url}/?v={API_VERSION}&encoding=json")
}

/// What a session does with the events it receives. One implementation per
/// process: the collector's filter/normalize/enqueue pipeline, and the
/// republisher's destination-guild bookkeeping.
#[async_trait]
pub trait GatewayHandler: Send + Sync + 'static {
    /// The identify payload for this session (user or bot shaped).
    fn identify(&self) -> Identify;

    async fn ready(&self, _ready: Ready) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn resumed(&self) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn guild_create(&self, _guild: Guild) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn channel_create(&self, _channel: Channel) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn channel_delete(&self, _channel: Channel) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn message_create(&self, _message: Message) -> Result<(), MirrorError> {
        Ok(())
    }

    /// Called with any error an event handler returned.
    async fn on_error(&self, error: MirrorError) {
        error!("event handler error: {error}");
    }
}

pub struct Shard<H: GatewayHandler> {
    handler: Arc<H>,
    client: Arc<DiscordClient>,
    shutdown: ShutdownRx,
    stream: Option<WsStream>,
    session_id: Option<String>,
    gateway: Option<String>,
    resume_gateway: Option<String>,
    seq: Option<u64>,
    heartbeat_interval: Option<Duration>,
    heartbeat: Option<Instant>,
    ack: Option<Instant>,
    /// true once the current outage has been logged, so an outage produces a
    /// single disconnected/reconnected pair no matter how many retries it takes
    outage_logged: bool,
}

impl<H: GatewayHandler> Shard<H> {
    pub fn new(handler: Arc<H>, client: Arc<DiscordClient>, shutdown: ShutdownRx) -> Self {
        Self {
            handler,
            client,
            shutdown,
            stream: None,
            session_id: None,
            gateway: None,
            resume_gateway: None,
            seq: None,
            heartbeat_interval: None,
            heartbeat: None,
            ack: None,
            outage_logged: false,
        }
    }

    /// Run the session until a terminal error. Transient failures reconnect
    /// with exponential backoff from `initial_delay` doubling up to
    /// `max_delay`; after `max_attempts` consecutive failed connections the
    /// last error is returned.
    pub async fn run(
        &mut self,
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> ShardError {
        let mut delay = initial_delay;
        let mut attempts: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return ShardError::Shutdown;
            }
            attempts += 1;
            match self.run_once().await {
                // a live session (Ready seen, resume state intact) reconnects
                // immediately and resets the attempt budget
                Ok(()) if self.session_id.is_some() => {
                    attempts = 0;
                    delay = initial_delay;
                }
                Ok(()) => {
                    if attempts >= max_attempts {
                        error!("gateway gave up after {attempts} attempts");
                        return ShardError::NeedRestart;
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
                Err(e) if e.is_terminal() => return e,
                Err(e) => {
                    if !self.outage_logged {
                        warn!("gateway disconnected: {e}");
                        self.outage_logged = true;
                    }
                    if attempts >= max_attempts {
                        error!("gateway gave up after {attempts} attempts: {e}");
                        return e;
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    /// One connect-process-disconnect cycle. `Ok(())` means events were being
    /// processed and the connection ended in a way that calls for an
    /// immediate reconnect or resume.
    async fn run_once(&mut self) -> ShardResult<()> {
        if self.stream.is_none() {
            let url = match (&self.resume_gateway, &self.session_id) {
                (Some(resume), Some(_)) => resume.clone(),
                _ => {
                    if self.gateway.is_none() {
                        let gateway = self.client.gateway().await.map_err(|e| {
                            if e.is_unauthorized() { ShardError::AuthInvalid } else { e.into() }
                        })?;
                        self.gateway = Some(gateway_params(&gateway.url));
                    }
                    self.gateway.clone().unwrap()
                }
            };
            info!("connecting to {}", url);
            let (stream, _): (WsStream, _) = connect_async(&url).await?;
            self.stream = Some(stream);
        }

        if let (Some(session), &Some(seq)) = (&self.session_id, &self.seq) {
            let resume = Resume {
                token: self.client.token().to_string(),
                session_id: session.clone(),
                seq,
            };
            self.send(resume).await?;
        }

        let action = self.events_loop().await;
        match action {
            Err(ShardError::Websocket(_) | ShardError::NeedRestart) => {
                self.stream = None;
                Ok(())
            }
            Err(e) => Err(e),
            Ok(ConnectionAction::Resume) => {
                self.close(CloseFrame {
                    code: CloseCode::Restart,
                    reason: "Initiating resume".into(),
                }).await;
                Ok(())
            }
            Ok(ConnectionAction::Reconnect) => {
                self.stream = None;
                Ok(())
            }
            Ok(ConnectionAction::None) => unreachable!(),
        }
    }

    async fn close(&mut self, close_frame: CloseFrame<'_>) {
        info!("closing: {:?}", close_frame);
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(Some(close_frame)).await {
                error!("{}", e);
            }
        }
    }

    async fn events_loop(&mut self) -> ShardResult<ConnectionAction> {
        loop {
            if *self.shutdown.borrow() {
                self.close(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "shutting down".into(),
                }).await;
                return Err(ShardError::Shutdown);
            }
            if self.stream.is_none() {
                warn!("start of events loop with a None stream");
                return Err(ShardError::NeedRestart);
            }

            let action = self.heartbeat().await?;
            if action.terminal() {
                return Ok(action);
            }

            let result = tokio::time::timeout(
                Duration::from_millis(200),
                self.stream.as_mut().ok_or(ShardError::NeedRestart)?.try_next(),
            ).await;
            let Ok(next) = result else { continue };
            match next {
                Ok(Some(WsMessage::Text(text))) => {
                    let payload = match serde_json::from_str(&text) {
                        Ok(payload) => payload,
                        Err(payload_parse_error) => {
                            error!("payload_parse_error = {}", payload_parse_error);
                            continue;
                        }
                    };
                    let action = self.handle_payload(payload).await?;
                    if action.terminal() {
                        return Ok(action);
                    }
                }
                Ok(Some(WsMessage::Close(close_frame))) => {
                    if let Some(frame) = &close_frame {
                        let code: u16 = frame.code.into();
                        if code == CLOSE_AUTH_FAILED || code == CLOSE_INTENTS_DISALLOWED {
                            error!("gateway closed the session: {frame:?}");
                            return Err(ShardError::AuthInvalid);
                        }
                    }
                    error!("close frame = {:?}", close_frame);
                    self.reset_connection_state();
                    self.close(close_frame.unwrap_or(CloseFrame {
                        code: CloseCode::Restart,
                        reason: "Received `Message::Close` (without a CloseFrame)".into(),
                    })).await;
                    return Err(ShardError::NeedRestart);
                }
                Ok(Some(msg)) => warn!("msg = {:?}", msg),
                Ok(None) => {
                    error!("websocket closed");
                    self.reset_connection_state();
                    return Err(ShardError::NeedRestart);
                }
                Err(ws_error) => {
                    // Connection reset without closing handshake, etc
                    error!("ws_error = {:?}", ws_error);
                    self.reset_connection_state();
                    self.close(CloseFrame {
                        code: CloseCode::Error,
                        reason: "Websocket error".into(),
                    }).await;
                    return Err(ShardError::NeedRestart);
                }
            }
        }
    }

    async fn heartbeat(&mut self) -> ShardResult<ConnectionAction> {
        if let (Some(heartbeat), Some(ack)) = (self.heartbeat, self.ack) {
            // no ack since the last heartbeat means a zombied connection:
            // terminate and resume
            if heartbeat > ack {
                self.heartbeat = None;
                self.ack = None;
                self.close(CloseFrame {
                    code: CloseCode::Restart,
                    reason: "ACK not recent enough, closing websocket".into(),
                }).await;
                return Ok(ConnectionAction::Resume);
            }
        }

        match (self.heartbeat, self.heartbeat_interval, self.seq) {
            (Some(last_sent), Some(interval), _) if last_sent.elapsed() < interval => {}
            (_, Some(_), Some(seq_num)) => {
                self.send(Heartbeat { seq_num }).await?;
                self.heartbeat = Some(Instant::now());
            }
            _ => {}
        }

        Ok(ConnectionAction::None)
    }

    /// handles `payload`, returns if we need to reconnect
    async fn handle_payload(&mut self, payload: Payload) -> ShardResult<ConnectionAction> {
        let action = match payload {
            Payload::Hello(HelloPayload { heartbeat_interval }) => {
                self.heartbeat_interval = Some(Duration::from_millis(heartbeat_interval));
                if self.session_id.is_none() {
                    self.send(self.handler.identify()).await?;
                }
                ConnectionAction::None
            }
            Payload::Dispatch { event, seq_num } => {
                if let Some(curr) = self.seq {
                    if seq_num > curr + 1 {
                        warn!("received seq num {}, expected {} ({} were missed)",
                              seq_num, curr + 1, seq_num - curr - 1,
                        );
                    }
                }
                self.seq = Some(seq_num);
                self.handle_dispatch(event);
                ConnectionAction::None
            }
            Payload::HeartbeatAck => {
                self.ack = Some(Instant::now());
                ConnectionAction::None
            }
            Payload::Heartbeat(Heartbeat { seq_num }) => {
                info!("recv: Heartbeat {}", seq_num);
                self.send(Heartbeat { seq_num }).await?;
                self.heartbeat = Some(Instant::now());
                ConnectionAction::None
            }
            Payload::Reconnect => {
                info!("recv: Reconnect");
                self.close(CloseFrame {
                    code: CloseCode::Restart,
                    reason: "Reconnect requested by Discord".into(),
                }).await;
                ConnectionAction::Resume
            }
            Payload::InvalidSession(resumable) => {
                info!("recv: Invalid Session (resumable: {resumable})");
                if resumable {
                    ConnectionAction::Resume
                } else {
                    self.reset_connection_state();
                    let delay = rand::Rng::gen_range(&mut rand::thread_rng(), 1..=5);
                    self.close(CloseFrame {
                        code: CloseCode::Restart,
                        reason: "(non-resumable) Invalid Session".into(),
                    }).await;
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    ConnectionAction::Reconnect
                }
            }
            _ => {
                error!("Should not receive {:?}", payload);
                ConnectionAction::None
            }
        };
        Ok(action)
    }

    fn handle_dispatch(&mut self, event: DispatchPayload) {
        use DispatchPayload::*;
        if let Ready(ready) = &event {
            assert_eq!(API_VERSION, ready.v);
            self.session_id = Some(ready.session_id.clone());
            self.resume_gateway = ready.resume_gateway_url.as_deref().map(gateway_params);
            if self.outage_logged {
                info!("gateway reconnected");
                self.outage_logged = false;
            }
        }
        if matches!(&event, Resumed(_)) && self.outage_logged {
            info!("gateway reconnected (resumed)");
            self.outage_logged = false;
        }
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let result = match event {
                Ready(ready) => handler.ready(ready).await,
                Resumed(_) => handler.resumed().await,
                GuildCreate(guild) => handler.guild_create(guild).await,
                GuildDelete(_) => Ok(()),
                ChannelCreate(channel) => handler.channel_create(channel).await,
                ChannelDelete(channel) => handler.channel_delete(channel).await,
                MessageCreate(message) => handler.message_create(message).await,
                Unknown => Ok(()),
            };
            if let Err(error) = result {
                handler.on_error(error).await;
            }
        });
    }

    fn reset_connection_state(&mut self) {
        let Self {
            session_id,
            seq,
            heartbeat_interval,
            heartbeat,
            ack,
            resume_gateway,
            ..
        } = self;
        *session_id = None;
        *seq = None;
        *heartbeat_interval = None;
        *heartbeat = None;
        *ack = None;
        *resume_gateway = None;
    }

    async fn send<P>(&mut self, payload: P) -> ShardResult<()>
        where P: Into<Payload> + std::fmt::Display + Send
    {
        info!("sending {}", payload);
        let message = serde_json::to_string(&payload.into())
            .expect("Payload serialization can't fail");
        self.stream
            .as_mut()
            .ok_or(ShardError::NeedRestart)?
            .send(WsMessage::Text(message)).await?;
        Ok(())
    }
}
