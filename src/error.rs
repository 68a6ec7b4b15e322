use thiserror::Error;

/// Failures of a single request/response exchange with the device.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("request timeout")]
    Timeout,

    #[error("no status code received")]
    MissingStatus,

    /// Device answered with a non-200 status. `message` is the device-reported
    /// status message when present.
    #[error("{message}")]
    Rejected { code: i32, message: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("outbound queue full")]
    QueueFull,

    #[error("failed to decode message: {0}")]
    Decode(String),
}

impl ProtocolError {
    pub fn rejected(code: i32, message: Option<&str>) -> Self {
        let message = match message {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => format!("unexpected status code {}", code),
        };
        ProtocolError::Rejected { code, message }
    }
}

impl From<prost::DecodeError> for ProtocolError {
    fn from(e: prost::DecodeError) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

/// Transport failures of the device WebSocket.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid authorization header")]
    InvalidAuthHeader,

    #[error("socket closed by peer")]
    ClosedByPeer,

    #[error("outbound queue closed")]
    OutboundClosed,

    #[error("write to device timed out")]
    WriteTimeout,

    #[error("keepalive failed: {0}")]
    Keepalive(#[source] ProtocolError),
}

#[derive(Debug, Error)]
pub enum RtmpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("rtmp session error: {0}")]
    Session(String),

    #[error("invalid stream path /{app}/{key}")]
    InvalidPath { app: String, key: String },

    #[error("stream {0} is not live")]
    NotLive(String),

    #[error("write to peer timed out")]
    WriteTimeout,
}

#[derive(Debug, Error)]
pub enum HlsError {
    #[error("transcoder already running for {0}")]
    AlreadyRunning(String),

    #[error("invalid device uid '{0}': only lowercase letters, numbers, underscore and hyphen allowed")]
    InvalidUid(String),

    #[error("failed to prepare hls directory: {0}")]
    Directory(#[source] std::io::Error),

    #[error("failed to start ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),
}
