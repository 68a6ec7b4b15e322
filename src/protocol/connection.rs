use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::codec;
use super::messages::{Message, MessageType, Request, RequestType, Response};
use super::STATUS_OK;
use crate::error::ProtocolError;

/// Callback invoked for every inbound message, responses included.
pub type MessageHandler = Arc<dyn Fn(&Message, &DeviceConnection) + Send + Sync>;

/// Bound on frames waiting for the socket writer
pub const OUTBOUND_QUEUE_SIZE: usize = 64;

struct PendingRequest {
    request_type: RequestType,
    tx: oneshot::Sender<Response>,
}

type PendingMap = Mutex<HashMap<i32, PendingRequest>>;

/// Request/response engine for one device connection.
///
/// Owns no socket. Encoded frames leave through the outbound queue returned
/// by [`DeviceConnection::new`]; the socket driver feeds inbound frames to
/// [`DeviceConnection::handle_frame`].
pub struct DeviceConnection {
    uid: String,
    outbound: mpsc::Sender<Vec<u8>>,
    last_request_id: AtomicI32,
    pending: Arc<PendingMap>,
    handlers: RwLock<Vec<MessageHandler>>,
    closed: AtomicBool,
}

impl DeviceConnection {
    pub fn new(uid: &str) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let conn = Arc::new(Self {
            uid: uid.to_string(),
            outbound,
            last_request_id: AtomicI32::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (conn, outbound_rx)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a handler called for every inbound message.
    pub fn register_handler<F>(&self, handler: F)
    where
        F: Fn(&Message, &DeviceConnection) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Low-level send of a raw envelope. Use [`send_request`](Self::send_request) for requests.
    pub fn send_message(&self, message: &Message) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }

        if codec::is_keepalive(message) {
            trace!(uid = %self.uid, "Sending keepalive");
        } else {
            debug!(uid = %self.uid, message = %codec::describe(message), "📤 Sending message");
        }

        self.outbound
            .try_send(codec::encode(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ProtocolError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
            })
    }

    pub fn send_keepalive(&self) -> Result<(), ProtocolError> {
        self.send_message(&codec::keepalive())
    }

    /// Send a request and return an awaiter for its response.
    ///
    /// The request id is allocated atomically, so concurrent callers never
    /// share an id. A send failure is reported by the awaiter.
    pub fn send_request(&self, request_type: RequestType, request: Request) -> ResponseAwaiter {
        let id = self.last_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(id, PendingRequest { request_type, tx });

        let message = codec::request_message(id, request_type, request);
        let send_error = match self.send_message(&message) {
            Ok(()) => None,
            Err(e) => {
                warn!(uid = %self.uid, request_id = id, error = %e, "Failed to send request");
                self.pending.lock().remove(&id);
                Some(e)
            }
        };

        ResponseAwaiter {
            id,
            rx: Some(rx),
            pending: Arc::downgrade(&self.pending),
            send_error,
        }
    }

    /// Send a request and wait for its validated response.
    pub async fn request(
        &self,
        request_type: RequestType,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        self.send_request(request_type, request).wait(timeout).await
    }

    /// Decode and dispatch one inbound binary frame.
    pub fn handle_frame(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let message = codec::decode(data)?;
        self.handle_message(&message);
        Ok(())
    }

    pub fn handle_message(&self, message: &Message) {
        if codec::is_keepalive(message) {
            trace!(uid = %self.uid, "Received keepalive");
        } else {
            debug!(uid = %self.uid, message = %codec::describe(message), "📥 Received message");
        }

        if message.r#type == Some(MessageType::Response as i32) {
            if let Some(response) = &message.response {
                self.resolve(response);
            }
        }

        let handlers: Vec<MessageHandler> = self.handlers.read().clone();
        for handler in handlers {
            handler(message, self);
        }
    }

    /// Hand `response` to its waiting request, if any. Unmatched responses
    /// are ignored; a request is resolved at most once.
    fn resolve(&self, response: &Response) {
        let (Some(id), Some(kind)) = (response.request_id, response.request_type) else {
            return;
        };

        let pending = {
            let mut pending = self.pending.lock();
            match pending.get(&id) {
                Some(entry) if entry.request_type as i32 == kind => pending.remove(&id),
                _ => None,
            }
        };

        if let Some(pending) = pending {
            // Receiver may already be gone after a timeout
            let _ = pending.tx.send(response.clone());
        }
    }

    /// Mark the connection closed and fail every outstanding request.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        debug!(uid = %self.uid, pending = dropped, "Device connection closed");
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Waits for the response to one request. Dropping it discards the
/// pending entry.
pub struct ResponseAwaiter {
    id: i32,
    rx: Option<oneshot::Receiver<Response>>,
    pending: Weak<PendingMap>,
    send_error: Option<ProtocolError>,
}

impl ResponseAwaiter {
    pub fn request_id(&self) -> i32 {
        self.id
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<Response, ProtocolError> {
        if let Some(e) = self.send_error.take() {
            return Err(e);
        }
        let Some(rx) = self.rx.take() else {
            return Err(ProtocolError::ConnectionClosed);
        };

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ProtocolError::Timeout),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Ok(Ok(response)) => validate(response),
        }
    }
}

impl Drop for ResponseAwaiter {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade() {
            pending.lock().remove(&self.id);
        }
    }
}

fn validate(response: Response) -> Result<Response, ProtocolError> {
    match response.status_code {
        None => Err(ProtocolError::MissingStatus),
        Some(STATUS_OK) => Ok(response),
        Some(code) => Err(ProtocolError::rejected(code, response.status_message.as_deref())),
    }
}
