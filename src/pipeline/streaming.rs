use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ProtocolError;
use crate::protocol::messages::{StreamIdentifier, Streaming, StreamingStatus};
use crate::protocol::{DeviceConnection, Request, RequestType};
use crate::state::{State, StateStore, StreamRequestState, StreamState};

#[derive(Debug, Clone)]
pub struct StreamingOptions {
    pub request_timeout: Duration,
    /// Device rejection text meaning "too many app connections"
    pub connection_limit_message: String,
}

/// Ask the device to start or stop pushing its mobile stream to `url`.
///
/// Timeouts are retried for as long as the device socket stays up and
/// `cancel` has not fired. A connection-limit rejection marks the request
/// as failed so the retry monitor picks it up later.
pub async fn request_local_streaming(
    conn: &DeviceConnection,
    store: &StateStore,
    url: &str,
    status: StreamingStatus,
    options: &StreamingOptions,
    cancel: &CancellationToken,
) -> Result<(), ProtocolError> {
    let uid = conn.uid();
    info!(uid = %uid, url = %url, status = ?status, "📡 Requesting local streaming");

    loop {
        let request = Request {
            streaming: Some(Streaming {
                id: Some(StreamIdentifier::Mobile as i32),
                status: Some(status as i32),
                rtmp_url: Some(url.to_string()),
                attempts: Some(1),
            }),
            ..Default::default()
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ProtocolError::ConnectionClosed),
            result = conn.request(RequestType::PutStreaming, request, options.request_timeout) => result,
        };

        match result {
            Ok(_) => {
                if status == StreamingStatus::Started {
                    store.update(uid, State::new().with_stream_request_state(StreamRequestState::Requested));
                }
                info!(uid = %uid, status = ?status, "✅ Local streaming request accepted");
                return Ok(());
            }
            Err(ProtocolError::Timeout) => {
                if cancel.is_cancelled() || !store.get(uid).websocket_alive() {
                    return Err(ProtocolError::Timeout);
                }
                warn!(uid = %uid, "Streaming request timed out, retrying");
            }
            Err(ProtocolError::Rejected { code, message }) if message == options.connection_limit_message => {
                warn!(uid = %uid, code, "Device refused streaming: connection limit reached");
                store.update(uid, State::new().with_stream_request_state(StreamRequestState::RequestFailed));
                return Err(ProtocolError::Rejected { code, message });
            }
            Err(e) => {
                if store.get(uid).stream_state() == StreamState::Alive {
                    // Stream is already flowing, the device just refused a duplicate ask
                    warn!(uid = %uid, error = %e, "Streaming request failed while stream is alive");
                } else {
                    warn!(uid = %uid, error = %e, "Streaming request failed");
                    store.update(uid, State::new().with_stream_request_state(StreamRequestState::RequestFailed));
                }
                return Err(e);
            }
        }
    }
}

/// Whether a freshly connected device should be asked to stream.
pub fn needs_stream_request(state: &State) -> bool {
    state.stream_state() != StreamState::Alive
        && (state.stream_request_state() != StreamRequestState::Requested
            || state.stream_state() == StreamState::Unhealthy)
}

/// Whether a store notification means the stream just died and should be
/// requested again.
pub fn should_rerequest_on_change(delta: &State, current: &State) -> bool {
    delta.stream_state == Some(StreamState::Unhealthy)
        && current.stream_request_state() != StreamRequestState::RequestFailed
}

/// Whether the periodic monitor should ask a refusing device again.
pub fn should_retry_streaming(state: &State) -> bool {
    state.websocket_alive()
        && state.stream_request_state() == StreamRequestState::RequestFailed
        && state.stream_state() != StreamState::Alive
}
