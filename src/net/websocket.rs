use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::SocketError;
use crate::protocol::DeviceConnection;

/// A device that cannot take a frame within this window is dropped
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub type DeviceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial the device endpoint, authenticating with a bearer token when given.
#[instrument(skip(auth_token))]
pub async fn connect(url: &str, auth_token: Option<&str>) -> Result<DeviceSocket, SocketError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SocketError::InvalidAuthHeader)?;
        request.headers_mut().insert("Authorization", value);
    }

    let (socket, response) = tokio_tungstenite::connect_async(request).await?;
    debug!(status = %response.status(), "WebSocket handshake complete");
    Ok(socket)
}

/// Pump frames between `socket` and `conn` until the socket fails, the peer
/// closes or `cancel` fires.
///
/// Inbound binary frames go to the protocol engine, queued outbound frames go
/// to the socket, and a keepalive is queued every `keepalive_interval`. Any
/// read, write or keepalive failure ends the loop with an error. `conn` is
/// closed on every exit path.
pub async fn run_socket<S>(
    socket: WebSocketStream<S>,
    conn: Arc<DeviceConnection>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    keepalive_interval: Duration,
    cancel: CancellationToken,
) -> Result<(), SocketError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let result = pump(socket, &conn, &mut outbound, keepalive_interval, &cancel).await;
    conn.close();
    result
}

async fn pump<S>(
    socket: WebSocketStream<S>,
    conn: &DeviceConnection,
    outbound: &mut mpsc::Receiver<Vec<u8>>,
    keepalive_interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), SocketError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let uid = conn.uid().to_string();
    let (mut sink, mut stream) = socket.split();

    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    keepalive.tick().await;

    info!(uid = %uid, "🔗 Device socket ready");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(uid = %uid, "Closing device socket");
                let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Close(None))).await;
                return Ok(());
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Binary(data))) => {
                        if let Err(e) = conn.handle_frame(&data) {
                            warn!(uid = %uid, error = %e, "Dropping undecodable frame");
                        }
                    }
                    Some(Ok(WsMessage::Close(reason))) => {
                        info!(uid = %uid, reason = ?reason, "Device closed the socket");
                        return Err(SocketError::ClosedByPeer);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(SocketError::ClosedByPeer),
                }
            }

            data = outbound.recv() => {
                match data {
                    Some(data) => {
                        let write = tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Binary(data.into())));
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(uid = %uid, "Abandoning write to stalled device socket");
                                return Ok(());
                            }
                            written = write => written.map_err(|_| SocketError::WriteTimeout)??,
                        }
                    }
                    None => return Err(SocketError::OutboundClosed),
                }
            }

            _ = keepalive.tick() => {
                conn.send_keepalive().map_err(SocketError::Keepalive)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec;
    use crate::protocol::messages::{Request, RequestType, Response};
    use tokio::net::TcpListener;

    async fn device_pair() -> (
        WebSocketStream<TcpStream>,
        WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        let client = connect(&format!("ws://{}/", addr), Some("secret")).await.unwrap();
        (device.await.unwrap(), client)
    }

    #[tokio::test]
    async fn test_request_round_trip_over_socket() {
        let (mut device, client) = device_pair().await;
        let (conn, outbound) = DeviceConnection::new("abc");
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(run_socket(
            client,
            conn.clone(),
            outbound,
            Duration::from_secs(30),
            cancel.clone(),
        ));

        let awaiter = conn.send_request(RequestType::GetStatus, Request::default());

        // Device side: read the request and answer it
        let request = loop {
            match device.next().await.unwrap().unwrap() {
                WsMessage::Binary(data) => break codec::decode(&data).unwrap(),
                _ => continue,
            }
        };
        let request = request.request.unwrap();
        let reply = codec::response_message(Response {
            request_id: request.id,
            request_type: request.r#type,
            status_code: Some(200),
            ..Default::default()
        });
        device.send(WsMessage::Binary(codec::encode(&reply).into())).await.unwrap();

        let response = awaiter.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.request_type(), RequestType::GetStatus);

        cancel.cancel();
        assert!(driver.await.unwrap().is_ok());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_keepalive_is_sent() {
        let (mut device, client) = device_pair().await;
        let (conn, outbound) = DeviceConnection::new("abc");
        let cancel = CancellationToken::new();
        let _driver = tokio::spawn(run_socket(
            client,
            conn,
            outbound,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let frame = tokio::time::timeout(Duration::from_secs(2), device.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            WsMessage::Binary(data) => assert!(codec::is_keepalive(&codec::decode(&data).unwrap())),
            other => panic!("unexpected frame {:?}", other),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_write() {
        // Peer half is never read, so a large frame cannot be flushed
        let (local, _peer) = tokio::io::duplex(64);
        let socket = WebSocketStream::from_raw_socket(
            local,
            tokio_tungstenite::tungstenite::protocol::Role::Client,
            None,
        )
        .await;
        let (conn, _unused) = DeviceConnection::new("abc");
        let (tx, outbound) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(run_socket(
            socket,
            conn.clone(),
            outbound,
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tx.send(vec![0u8; 1 << 20]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!driver.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), driver).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_ends_driver_with_error() {
        let (mut device, client) = device_pair().await;
        let (conn, outbound) = DeviceConnection::new("abc");
        let driver = tokio::spawn(run_socket(
            client,
            conn.clone(),
            outbound,
            Duration::from_secs(30),
            CancellationToken::new(),
        ));

        device.close(None).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), driver).await.unwrap().unwrap();
        assert!(result.is_err());
        assert!(conn.is_closed());
    }
}
