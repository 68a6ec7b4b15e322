use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{AppConfig, DeviceConfig};
use crate::error::SocketError;
use crate::hls::HlsManager;
use crate::net::websocket;
use crate::protocol::messages::{GetControl, GetSensorData, GetStatus, StreamIdentifier, Streaming, StreamingStatus};
use crate::protocol::{DeviceConnection, Request, RequestType};
use crate::registry::ConnectionRegistry;
use crate::state::store::Subscription;
use crate::state::{State, StateStore, StreamRequestState, StreamState};

pub mod handlers;
pub mod streaming;

use streaming::StreamingOptions;

/// Timeout for the best-effort stop request sent on shutdown
const STOP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub auth_token: Option<String>,
    pub keepalive_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// `host:port` the device publishes to; `None` disables stream requests
    pub rtmp_public_addr: Option<String>,
    pub auto_start: bool,
    pub hls_enabled: bool,
    pub hls_start_delay: Duration,
    pub retry_interval: Duration,
    pub streaming: StreamingOptions,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            auth_token: Some(config.websocket.auth_token.clone()).filter(|t| !t.is_empty()),
            keepalive_interval: Duration::from_secs(config.websocket.keepalive_interval_secs.max(1)),
            reconnect_min: Duration::from_secs(config.websocket.reconnect_min_secs.max(1)),
            reconnect_max: Duration::from_secs(config.websocket.reconnect_max_secs.max(1)),
            rtmp_public_addr: config.rtmp.enabled.then(|| config.rtmp.public_addr.clone()),
            auto_start: config.rtmp.auto_start,
            hls_enabled: config.hls.enabled,
            hls_start_delay: Duration::from_secs(config.streaming.hls_start_delay_secs),
            retry_interval: Duration::from_secs(config.streaming.retry_interval_secs.max(1)),
            streaming: StreamingOptions {
                request_timeout: config.request_timeout(),
                connection_limit_message: config.streaming.connection_limit_message.clone(),
            },
        }
    }

    pub fn local_stream_url(&self, uid: &str) -> Option<String> {
        self.rtmp_public_addr
            .as_ref()
            .map(|addr| format!("rtmp://{}/local/{}", addr, uid))
    }
}

/// One live WebSocket session with a device.
struct DeviceSession {
    uid: String,
    conn: Arc<DeviceConnection>,
    /// Cancelled when the socket goes away or the device task stops
    cancel: CancellationToken,
    /// Set while a start request is in flight
    requesting: AtomicBool,
}

/// Ties the device sockets, the state store, the RTMP relay and HLS
/// together for every configured device.
pub struct Pipeline {
    store: Arc<StateStore>,
    hls: Arc<HlsManager>,
    registry: Arc<ConnectionRegistry>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        store: Arc<StateStore>,
        hls: Arc<HlsManager>,
        registry: Arc<ConnectionRegistry>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            hls,
            registry,
            options,
        }
    }

    /// Keep a device connected until `cancel` fires, reconnecting with
    /// jittered exponential backoff.
    #[instrument(skip_all, fields(uid = %device.uid))]
    pub async fn run_device(self: Arc<Self>, device: DeviceConfig, url: String, cancel: CancellationToken) {
        let uid = device.uid;
        let mut backoff = self.options.reconnect_min;
        info!(uid = %uid, "🚀 Starting device monitor");

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = websocket::connect(&url, self.options.auth_token.as_deref()) => result,
            };

            match connected {
                Ok(socket) => {
                    backoff = self.options.reconnect_min;
                    match self.run_session(&uid, socket, &cancel).await {
                        Ok(()) => info!(uid = %uid, "Device session closed"),
                        Err(e) => warn!(uid = %uid, error = %e, "Device connection lost"),
                    }
                }
                Err(e) => {
                    warn!(uid = %uid, error = %e, "Failed to connect to device");
                    self.store.update(&uid, State::new().with_websocket_alive(false));
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = with_jitter(backoff);
            debug!(uid = %uid, delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(self.options.reconnect_max);
        }

        info!(uid = %uid, "Device monitor stopped");
    }

    /// Drive one connected socket until it closes. Every task started for
    /// the session is cancelled before this returns.
    pub async fn run_session<S>(
        self: &Arc<Self>,
        uid: &str,
        socket: WebSocketStream<S>,
        cancel: &CancellationToken,
    ) -> Result<(), SocketError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (conn, outbound) = DeviceConnection::new(uid);
        let session = Arc::new(DeviceSession {
            uid: uid.to_string(),
            conn: conn.clone(),
            cancel: cancel.child_token(),
            requesting: AtomicBool::new(false),
        });

        handlers::install(&conn, self.store.clone());
        self.registry.register(uid, conn.clone());
        self.store.update(uid, State::new().with_websocket_alive(true));
        info!(uid = %uid, "🔌 Device connected");

        let health = self.watch_stream_health(&session);
        self.send_initial_queries(&conn);
        self.start_session_tasks(&session);

        // Shutdown asks the device to stop streaming before the socket closes
        let socket_cancel = CancellationToken::new();
        let graceful = {
            let pipeline = self.clone();
            let session = session.clone();
            let parent = cancel.clone();
            let socket_cancel = socket_cancel.clone();
            tokio::spawn(async move {
                parent.cancelled().await;
                pipeline.stop_device_stream(&session).await;
                socket_cancel.cancel();
            })
        };

        let result = websocket::run_socket(
            socket,
            conn.clone(),
            outbound,
            self.options.keepalive_interval,
            socket_cancel,
        )
        .await;

        graceful.abort();
        session.cancel.cancel();
        drop(health);

        self.store.update(uid, State::new().with_websocket_alive(false));
        self.hls.stop_transcoding(uid).await;
        self.registry.unregister(uid, &conn);
        info!(uid = %uid, "🔌 Device disconnected");
        result
    }

    fn send_initial_queries(&self, conn: &Arc<DeviceConnection>) {
        let queries = [
            (
                RequestType::GetControl,
                Request {
                    get_control: Some(GetControl { night_light: Some(true) }),
                    ..Default::default()
                },
            ),
            (
                RequestType::GetSensorData,
                Request {
                    get_sensor_data: Some(GetSensorData {
                        all: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
            (
                RequestType::GetStatus,
                Request {
                    get_status: Some(GetStatus { all: Some(true) }),
                    ..Default::default()
                },
            ),
            (RequestType::GetSettings, Request::default()),
        ];

        // Responses reach the store through the message handler; awaiting
        // here only reports failures.
        let awaiters: Vec<_> = queries
            .into_iter()
            .map(|(request_type, request)| (request_type, conn.send_request(request_type, request)))
            .collect();
        let uid = conn.uid().to_string();
        let timeout = self.options.streaming.request_timeout;
        tokio::spawn(async move {
            for (request_type, awaiter) in awaiters {
                if let Err(e) = awaiter.wait(timeout).await {
                    debug!(uid = %uid, request_type = ?request_type, error = %e, "Initial query failed");
                }
            }
        });
    }

    /// Re-request the stream whenever it turns unhealthy, unless the device
    /// already refused it.
    fn watch_stream_health(self: &Arc<Self>, session: &Arc<DeviceSession>) -> Subscription {
        let pipeline = self.clone();
        let session = session.clone();
        let runtime = Handle::current();
        self.store.subscribe(move |uid, delta| {
            if uid != session.uid || session.cancel.is_cancelled() {
                return;
            }
            let current = pipeline.store.get(uid);
            if streaming::should_rerequest_on_change(delta, &current) {
                info!(uid = %uid, "Stream became unhealthy, requesting it again");
                let pipeline = pipeline.clone();
                let session = session.clone();
                runtime.spawn(async move { pipeline.request_stream(&session).await });
            }
        })
    }

    fn start_session_tasks(self: &Arc<Self>, session: &Arc<DeviceSession>) {
        if self.options.auto_start {
            let pipeline = self.clone();
            let session = session.clone();
            tokio::spawn(async move { pipeline.auto_start(&session).await });
        }

        let pipeline = self.clone();
        let session = session.clone();
        tokio::spawn(async move { pipeline.run_retry_monitor(&session).await });
    }

    async fn auto_start(&self, session: &DeviceSession) {
        let state = self.store.get(&session.uid);
        if streaming::needs_stream_request(&state) {
            // HLS start is scheduled alongside, not after, the request
            let request = self.request_stream(session);
            let hls = async {
                tokio::time::sleep(self.options.hls_start_delay).await;
                self.ensure_hls(&session.uid).await;
            };
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = async { tokio::join!(request, hls) } => {}
            }
        } else {
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.options.hls_start_delay) => self.ensure_hls(&session.uid).await,
            }
        }
    }

    /// Periodically ask again for a stream the device refused, typically
    /// because too many app connections were open.
    async fn run_retry_monitor(&self, session: &DeviceSession) {
        let mut ticker = tokio::time::interval(self.options.retry_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if !streaming::should_retry_streaming(&self.store.get(&session.uid)) {
                continue;
            }

            info!(uid = %session.uid, "🔄 Retrying local streaming after refusal");
            self.store.update(
                &session.uid,
                State::new().with_stream_request_state(StreamRequestState::NotRequested),
            );
            self.request_stream(session).await;

            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.options.hls_start_delay) => {}
            }
            self.ensure_hls(&session.uid).await;
        }
    }

    /// Ask the device to publish to the local relay. Only one start request
    /// per session is in flight at a time.
    async fn request_stream(&self, session: &DeviceSession) {
        let Some(url) = self.options.local_stream_url(&session.uid) else {
            return;
        };
        if session.requesting.swap(true, Ordering::AcqRel) {
            debug!(uid = %session.uid, "Stream request already in flight");
            return;
        }

        let result = streaming::request_local_streaming(
            &session.conn,
            &self.store,
            &url,
            StreamingStatus::Started,
            &self.options.streaming,
            &session.cancel,
        )
        .await;
        session.requesting.store(false, Ordering::Release);

        if let Err(e) = result {
            debug!(uid = %session.uid, error = %e, "Stream request ended without success");
        }
    }

    async fn ensure_hls(&self, uid: &str) {
        if !self.options.hls_enabled || self.hls.is_running(uid) {
            return;
        }
        let Some(url) = self.options.local_stream_url(uid) else {
            return;
        };
        match self.hls.start_transcoding(uid, &url).await {
            Ok(()) => info!(uid = %uid, "🎬 HLS transcoding started"),
            Err(e) => warn!(uid = %uid, error = %e, "Failed to start HLS transcoding"),
        }
    }

    /// Best-effort request for the device to stop publishing.
    async fn stop_device_stream(&self, session: &DeviceSession) {
        if self.store.get(&session.uid).stream_state() != StreamState::Alive {
            return;
        }
        let Some(url) = self.options.local_stream_url(&session.uid) else {
            return;
        };
        let request = Request {
            streaming: Some(Streaming {
                id: Some(StreamIdentifier::Mobile as i32),
                status: Some(StreamingStatus::Stopped as i32),
                rtmp_url: Some(url),
                attempts: Some(1),
            }),
            ..Default::default()
        };
        match session
            .conn
            .request(RequestType::PutStreaming, request, STOP_REQUEST_TIMEOUT)
            .await
        {
            Ok(_) => info!(uid = %session.uid, "Asked device to stop streaming"),
            Err(e) => debug!(uid = %session.uid, error = %e, "Stop streaming request failed"),
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

/// History sink that records sensor and control changes as structured
/// events under the `history` target.
pub fn history_sink(uid: &str, delta: &State) -> anyhow::Result<()> {
    let relevant = delta.temperature_milli.is_some()
        || delta.humidity_milli.is_some()
        || delta.is_night.is_some()
        || delta.night_light.is_some()
        || delta.standby.is_some();
    if relevant {
        info!(
            target: "history",
            uid = %uid,
            temperature = ?delta.temperature(),
            humidity = ?delta.humidity(),
            is_night = ?delta.is_night,
            night_light = ?delta.night_light,
            standby = ?delta.standby,
            "Recorded device change"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::TranscodeSettings;
    use crate::protocol::messages::{SensorData, SensorType};
    use crate::protocol::{codec, Message, Response};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn test_options() -> PipelineOptions {
        PipelineOptions {
            auth_token: None,
            keepalive_interval: Duration::from_secs(30),
            reconnect_min: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
            rtmp_public_addr: Some("127.0.0.1:1935".to_string()),
            auto_start: false,
            hls_enabled: false,
            hls_start_delay: Duration::from_millis(10),
            retry_interval: Duration::from_secs(60),
            streaming: StreamingOptions {
                request_timeout: Duration::from_secs(5),
                connection_limit_message: crate::config::DEFAULT_CONNECTION_LIMIT_MESSAGE.to_string(),
            },
        }
    }

    fn test_pipeline(dir: &std::path::Path, options: PipelineOptions) -> Arc<Pipeline> {
        test_pipeline_with(dir, TranscodeSettings::default(), options)
    }

    fn test_pipeline_with(
        dir: &std::path::Path,
        settings: TranscodeSettings,
        options: PipelineOptions,
    ) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::new(StateStore::new()),
            Arc::new(HlsManager::new(dir, settings)),
            Arc::new(ConnectionRegistry::new()),
            options,
        ))
    }

    fn test_session(uid: &str) -> (Arc<DeviceSession>, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let (conn, outbound) = DeviceConnection::new(uid);
        let session = Arc::new(DeviceSession {
            uid: uid.to_string(),
            conn,
            cancel: CancellationToken::new(),
            requesting: AtomicBool::new(false),
        });
        (session, outbound)
    }

    #[tokio::test]
    async fn test_unhealthy_triggers_exactly_one_start_request() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), test_options());
        let (session, mut outbound) = test_session("abc");
        let _health = pipeline.watch_stream_health(&session);

        pipeline.store.update("abc", State::new().with_stream_state(StreamState::Unhealthy));
        // Repeating an identical update is a no-op and must not notify
        pipeline.store.update("abc", State::new().with_stream_state(StreamState::Unhealthy));

        let frame = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        let request = codec::decode(&frame).unwrap().request.unwrap();
        assert_eq!(request.r#type(), RequestType::PutStreaming);
        assert_eq!(request.streaming.unwrap().status(), StreamingStatus::Started);

        assert!(tokio::time::timeout(Duration::from_millis(200), outbound.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_after_refusal_is_left_to_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), test_options());
        let (session, mut outbound) = test_session("abc");
        let _health = pipeline.watch_stream_health(&session);

        pipeline.store.update(
            "abc",
            State::new()
                .with_stream_request_state(StreamRequestState::RequestFailed)
                .with_stream_state(StreamState::Unhealthy),
        );

        assert!(tokio::time::timeout(Duration::from_millis(200), outbound.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_other_devices_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), test_options());
        let (session, mut outbound) = test_session("abc");
        let _health = pipeline.watch_stream_health(&session);

        pipeline.store.update("other", State::new().with_stream_state(StreamState::Unhealthy));

        assert!(tokio::time::timeout(Duration::from_millis(200), outbound.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_monitor_retries_refused_device() {
        let dir = tempfile::tempdir().unwrap();
        let options = PipelineOptions {
            retry_interval: Duration::from_millis(20),
            ..test_options()
        };
        let pipeline = test_pipeline(dir.path(), options);
        let (session, mut outbound) = test_session("abc");
        pipeline.store.update(
            "abc",
            State::new()
                .with_websocket_alive(true)
                .with_stream_request_state(StreamRequestState::RequestFailed),
        );

        let monitor = {
            let pipeline = pipeline.clone();
            let session = session.clone();
            tokio::spawn(async move { pipeline.run_retry_monitor(&session).await })
        };

        let frame = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        let request = codec::decode(&frame).unwrap().request.unwrap();
        assert_eq!(request.r#type(), RequestType::PutStreaming);
        assert_eq!(
            pipeline.store.get("abc").stream_request_state(),
            StreamRequestState::NotRequested
        );

        session.cancel.cancel();
        monitor.await.unwrap();
    }

    async fn socket_pair() -> (WebSocketStream<TcpStream>, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let (client, _) = tokio_tungstenite::client_async(format!("ws://{}/", addr), stream)
            .await
            .unwrap();
        (device.await.unwrap(), client)
    }

    async fn next_request(device: &mut WebSocketStream<TcpStream>) -> Request {
        loop {
            if let WsMessage::Binary(data) = device.next().await.unwrap().unwrap() {
                if let Some(request) = codec::decode(&data).unwrap().request {
                    return request;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), test_options());
        let (mut device, client) = socket_pair().await;
        let cancel = CancellationToken::new();

        let driver = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run_session("abc", client, &cancel).await })
        };

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(next_request(&mut device).await);
        }
        let types: Vec<_> = seen.iter().map(|r| r.r#type()).collect();
        assert_eq!(
            types,
            vec![
                RequestType::GetControl,
                RequestType::GetSensorData,
                RequestType::GetStatus,
                RequestType::GetSettings
            ]
        );
        assert!(pipeline.store.get("abc").websocket_alive());
        assert!(pipeline.registry.is_connected("abc"));

        let sensors = &seen[1];
        let reply: Message = codec::response_message(Response {
            request_id: sensors.id,
            request_type: sensors.r#type,
            status_code: Some(200),
            sensor_data: vec![SensorData {
                sensor_type: Some(SensorType::Temperature as i32),
                value_milli: Some(21500),
                ..Default::default()
            }],
            ..Default::default()
        });
        device.send(WsMessage::Binary(codec::encode(&reply).into())).await.unwrap();

        for _ in 0..50 {
            if pipeline.store.get("abc").temperature().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.store.get("abc").temperature(), Some(21.5));

        device.close(None).await.unwrap();
        assert!(driver.await.unwrap().is_err());
        assert!(!pipeline.store.get("abc").websocket_alive());
        assert!(!pipeline.registry.is_connected("abc"));
        assert_eq!(pipeline.store.subscriber_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_close_stops_hls() {
        use crate::hls::transcoder::tests::fake;

        let tools = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let settings = TranscodeSettings {
            program: fake::script(tools.path(), "ffmpeg", "exec sleep 30\n"),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let options = PipelineOptions {
            auto_start: true,
            hls_enabled: true,
            ..test_options()
        };
        let pipeline = test_pipeline_with(dir.path(), settings, options);
        // Already publishing, so auto-start goes straight to HLS
        pipeline.store.update("abc", State::new().with_stream_state(StreamState::Alive));

        let (mut device, client) = socket_pair().await;
        let cancel = CancellationToken::new();
        let driver = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run_session("abc", client, &cancel).await })
        };

        for _ in 0..4 {
            next_request(&mut device).await;
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pipeline.hls.is_running("abc") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        device.close(None).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), driver).await.unwrap().unwrap();
        assert!(result.is_err());
        assert!(!pipeline.hls.is_running("abc"));
        assert!(pipeline.hls.transcoder("abc").is_none());
        assert!(!pipeline.store.get("abc").websocket_alive());
    }

    #[tokio::test]
    async fn test_shutdown_asks_device_to_stop_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), test_options());
        pipeline.store.update("abc", State::new().with_stream_state(StreamState::Alive));

        let (mut device, client) = socket_pair().await;
        let cancel = CancellationToken::new();
        let driver = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run_session("abc", client, &cancel).await })
        };

        for _ in 0..4 {
            next_request(&mut device).await;
        }
        cancel.cancel();

        let stop = tokio::time::timeout(Duration::from_secs(2), next_request(&mut device))
            .await
            .unwrap();
        assert_eq!(stop.r#type(), RequestType::PutStreaming);
        let streaming = stop.streaming.as_ref().unwrap();
        assert_eq!(streaming.status(), StreamingStatus::Stopped);
        assert_eq!(streaming.id(), StreamIdentifier::Mobile);
        assert_eq!(streaming.rtmp_url(), "rtmp://127.0.0.1:1935/local/abc");

        let reply = codec::response_message(Response {
            request_id: stop.id,
            request_type: stop.r#type,
            status_code: Some(200),
            ..Default::default()
        });
        device.send(WsMessage::Binary(codec::encode(&reply).into())).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), driver).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!pipeline.registry.is_connected("abc"));
        // Shutdown never rewrites the request bookkeeping
        assert_eq!(
            pipeline.store.get("abc").stream_request_state(),
            StreamRequestState::NotRequested
        );
    }

    #[tokio::test]
    async fn test_shutdown_skips_stop_when_not_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path(), test_options());

        let (mut device, client) = socket_pair().await;
        let cancel = CancellationToken::new();
        let driver = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run_session("abc", client, &cancel).await })
        };

        for _ in 0..4 {
            next_request(&mut device).await;
        }
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), driver).await.unwrap().unwrap();
        assert!(result.is_ok());
        // Only the close frame follows
        loop {
            match device.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    assert!(codec::decode(&data).unwrap().request.is_none());
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let delay = with_jitter(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_local_stream_url() {
        let options = test_options();
        assert_eq!(
            options.local_stream_url("abc").as_deref(),
            Some("rtmp://127.0.0.1:1935/local/abc")
        );
        let disabled = PipelineOptions {
            rtmp_public_addr: None,
            ..test_options()
        };
        assert!(disabled.local_stream_url("abc").is_none());
    }

    #[test]
    fn test_history_sink_accepts_every_delta() {
        assert!(history_sink("abc", &State::new().with_temperature_milli(20000)).is_ok());
        assert!(history_sink("abc", &State::new().with_stream_state(StreamState::Alive)).is_ok());
    }
}
