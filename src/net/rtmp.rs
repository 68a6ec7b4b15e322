use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broadcast::{Broadcaster, MediaKind, MediaPacket, Publisher, Subscriber};
use crate::error::RtmpError;
use crate::state::{is_valid_uid, State, StateStore, StreamRequestState, StreamState};

/// RTMP application name devices publish under
pub const LOCAL_APP: &str = "local";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 4096;
/// A peer that cannot take a write within this window is dropped
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Validate `/local/{uid}` and return the UID.
pub fn parse_stream_path(app: &str, key: &str) -> Result<String, RtmpError> {
    if app == LOCAL_APP && is_valid_uid(key) {
        Ok(key.to_string())
    } else {
        Err(RtmpError::InvalidPath {
            app: app.to_string(),
            key: key.to_string(),
        })
    }
}

/// What a connection turned into after its publish/play request.
enum Role {
    Pending,
    Publishing {
        uid: String,
        publisher: Arc<Publisher>,
    },
    Playing {
        uid: String,
        stream_id: u32,
        subscriber: Subscriber,
    },
}

/// Whether the connection loop should keep going after a batch of session results
enum Flow {
    Continue,
    Finished,
}

/// Local RTMP server: devices publish at `/local/{uid}`, players read from
/// the same path.
pub struct RtmpServer {
    broadcaster: Arc<Broadcaster>,
    store: Arc<StateStore>,
}

impl RtmpServer {
    pub fn new(broadcaster: Arc<Broadcaster>, store: Arc<StateStore>) -> Self {
        Self { broadcaster, store }
    }

    /// Bind `addr` and serve until `cancel` fires.
    pub async fn run(self: Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> Result<(), RtmpError> {
        let listener = TcpListener::bind(addr).await?;
        info!("🎥 RTMP server listening on {}", addr);
        self.serve(listener, cancel).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<(), RtmpError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("RTMP server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!("RTMP connection from {}", peer_addr);
                            let server = self.clone();
                            let cancel = cancel.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr, cancel).await {
                                    match e {
                                        RtmpError::NotLive(_) | RtmpError::InvalidPath { .. } => {
                                            info!("RTMP connection {} rejected: {}", peer_addr, e)
                                        }
                                        _ => warn!("RTMP connection {} failed: {}", peer_addr, e),
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("RTMP accept error: {}", e);
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip(self, stream, cancel))]
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), RtmpError> {
        let remaining = tokio::time::timeout(HANDSHAKE_TIMEOUT, perform_handshake(&mut stream))
            .await
            .map_err(|_| RtmpError::HandshakeTimeout)??;

        let (mut session, initial) =
            ServerSession::new(ServerSessionConfig::new()).map_err(session_error)?;

        let mut role = Role::Pending;
        let result = self
            .drive(&mut stream, &mut session, &mut role, initial, remaining, cancel)
            .await;

        self.finish(role);
        result
    }

    async fn drive(
        &self,
        stream: &mut TcpStream,
        session: &mut ServerSession,
        role: &mut Role,
        initial: Vec<ServerSessionResult>,
        remaining: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<(), RtmpError> {
        if let Flow::Finished = self.process_results(stream, session, role, initial).await? {
            return Ok(());
        }
        if !remaining.is_empty() {
            let results = session.handle_input(&remaining).map_err(session_error)?;
            if let Flow::Finished = self.process_results(stream, session, role, results).await? {
                return Ok(());
            }
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                read = stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    let results = session.handle_input(&buf[..n]).map_err(session_error)?;
                    if let Flow::Finished = self.process_results(stream, session, role, results).await? {
                        return Ok(());
                    }
                }

                packet = next_packet(role) => {
                    let Some(packet) = packet else {
                        debug!("Publisher went away, closing player");
                        return Ok(());
                    };
                    let Role::Playing { stream_id, .. } = role else {
                        continue;
                    };
                    let stream_id = *stream_id;
                    let timestamp = RtmpTimestamp::new(packet.timestamp);
                    let can_be_dropped = !packet.is_sequence_header();
                    let outbound = match packet.kind {
                        MediaKind::Video => session.send_video_data(stream_id, packet.data, timestamp, can_be_dropped),
                        MediaKind::Audio => session.send_audio_data(stream_id, packet.data, timestamp, can_be_dropped),
                    }
                    .map_err(session_error)?;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        written = write_bytes(stream, &outbound.bytes) => written?,
                    }
                }
            }
        }
    }

    async fn process_results(
        &self,
        stream: &mut TcpStream,
        session: &mut ServerSession,
        role: &mut Role,
        results: Vec<ServerSessionResult>,
    ) -> Result<Flow, RtmpError> {
        let mut queue: VecDeque<ServerSessionResult> = results.into();
        while let Some(result) = queue.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    write_bytes(stream, &packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => {
                    if let Flow::Finished = self.handle_event(event, session, role, &mut queue)? {
                        return Ok(Flow::Finished);
                    }
                }
                ServerSessionResult::UnhandleableMessageReceived(_) => {
                    debug!("Ignoring unhandleable RTMP message");
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_event(
        &self,
        event: ServerSessionEvent,
        session: &mut ServerSession,
        role: &mut Role,
        queue: &mut VecDeque<ServerSessionResult>,
    ) -> Result<Flow, RtmpError> {
        match event {
            ServerSessionEvent::ConnectionRequested { request_id, app_name } => {
                if app_name != LOCAL_APP {
                    return Err(RtmpError::InvalidPath { app: app_name, key: String::new() });
                }
                queue.extend(session.accept_request(request_id).map_err(session_error)?);
            }

            ServerSessionEvent::PublishStreamRequested { request_id, app_name, stream_key, .. } => {
                let uid = parse_stream_path(&app_name, &stream_key)?;
                if !matches!(role, Role::Pending) {
                    return Err(RtmpError::Session("publish on a busy connection".to_string()));
                }

                let publisher = self.broadcaster.register_publisher(&uid);
                self.store.update(
                    &uid,
                    State::new()
                        .with_stream_state(StreamState::Alive)
                        .with_stream_request_state(StreamRequestState::NotRequested),
                );
                info!(uid = %uid, "📹 Device started publishing");
                *role = Role::Publishing { uid, publisher };
                queue.extend(session.accept_request(request_id).map_err(session_error)?);
            }

            ServerSessionEvent::PlayStreamRequested { request_id, app_name, stream_key, stream_id, .. } => {
                let uid = parse_stream_path(&app_name, &stream_key)?;
                self.attach_player(role, uid, stream_id)?;
                queue.extend(session.accept_request(request_id).map_err(session_error)?);
            }

            ServerSessionEvent::VideoDataReceived { data, timestamp, .. } => {
                self.forward(role, MediaPacket::video(timestamp.value, data));
            }

            ServerSessionEvent::AudioDataReceived { data, timestamp, .. } => {
                self.forward(role, MediaPacket::audio(timestamp.value, data));
            }

            ServerSessionEvent::PublishStreamFinished { .. } | ServerSessionEvent::PlayStreamFinished { .. } => {
                return Ok(Flow::Finished);
            }

            other => {
                debug!(event = ?other, "Unhandled RTMP event");
            }
        }

        Ok(Flow::Continue)
    }

    /// Turn a pending connection into a player of `uid`. A connection that
    /// already publishes or plays keeps its role.
    fn attach_player(&self, role: &mut Role, uid: String, stream_id: u32) -> Result<(), RtmpError> {
        if !matches!(role, Role::Pending) {
            return Err(RtmpError::Session("play on a busy connection".to_string()));
        }
        let subscriber = self
            .broadcaster
            .subscribe(&uid)
            .ok_or_else(|| RtmpError::NotLive(uid.clone()))?;

        info!(uid = %uid, subscriber = subscriber.id(), "▶️ Player attached");
        *role = Role::Playing { uid, stream_id, subscriber };
        Ok(())
    }

    fn forward(&self, role: &Role, packet: MediaPacket) {
        if let Role::Publishing { uid, publisher } = role {
            self.store.update(
                uid,
                State::new().with_last_video_packet_time(chrono::Utc::now().timestamp()),
            );
            publisher.publish(packet);
        }
    }

    /// Connection teardown. A publisher that is still the active one marks
    /// the stream unhealthy and takes its subscribers down with it.
    fn finish(&self, role: Role) {
        match role {
            Role::Publishing { uid, publisher } => {
                if self.broadcaster.close_publisher(&uid, &publisher) {
                    warn!(uid = %uid, "Device stopped publishing, marking stream unhealthy");
                    self.store.update(
                        &uid,
                        State::new()
                            .with_stream_state(StreamState::Unhealthy)
                            .with_last_video_packet_time(0),
                    );
                } else {
                    debug!(uid = %uid, "Superseded publisher disconnected");
                }
            }
            Role::Playing { uid, subscriber, .. } => {
                debug!(uid = %uid, subscriber = subscriber.id(), "Player detached");
                subscriber.unsubscribe();
            }
            Role::Pending => {}
        }
    }
}

/// Resolves to the next packet for a playing connection; never resolves otherwise.
async fn next_packet(role: &mut Role) -> Option<MediaPacket> {
    match role {
        Role::Playing { subscriber, .. } => subscriber.recv().await,
        _ => std::future::pending().await,
    }
}

/// Server side of the RTMP handshake. Returns bytes read past its end.
async fn perform_handshake(stream: &mut TcpStream) -> Result<Vec<u8>, RtmpError> {
    let mut handshake = Handshake::new(PeerType::Server);
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(RtmpError::Handshake("connection closed during handshake".to_string()));
        }

        match handshake
            .process_bytes(&buf[..n])
            .map_err(|e| RtmpError::Handshake(format!("{:?}", e)))?
        {
            HandshakeProcessResult::InProgress { response_bytes } => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
            }
            HandshakeProcessResult::Completed { response_bytes, remaining_bytes } => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
                return Ok(remaining_bytes);
            }
        }
    }
}

async fn write_bytes(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), RtmpError> {
    tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(bytes))
        .await
        .map_err(|_| RtmpError::WriteTimeout)??;
    Ok(())
}

fn session_error<E: std::fmt::Debug>(e: E) -> RtmpError {
    RtmpError::Session(format!("{:?}", e))
}
