use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default bound on packets queued for one subscriber
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// One media packet as received from the publisher. The payload is opaque
/// and forwarded unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub timestamp: u32,
    pub data: Bytes,
}

impl MediaPacket {
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self { kind: MediaKind::Video, timestamp, data }
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self { kind: MediaKind::Audio, timestamp, data }
    }

    /// AVC decoder configuration or AAC audio specific config. Late joiners
    /// cannot decode anything without these.
    pub fn is_sequence_header(&self) -> bool {
        if self.data.len() < 2 {
            return false;
        }
        match self.kind {
            // FLV video tag: codec id 7 (AVC), AVCPacketType 0
            MediaKind::Video => self.data[0] & 0x0F == 7 && self.data[1] == 0,
            // FLV audio tag: sound format 10 (AAC), AACPacketType 0
            MediaKind::Audio => self.data[0] >> 4 == 10 && self.data[1] == 0,
        }
    }
}

type SubscriberMap = Mutex<HashMap<u64, mpsc::Sender<MediaPacket>>>;

/// The single active ingest path for one device.
pub struct Publisher {
    uid: String,
    subscribers: Arc<SubscriberMap>,
    next_subscriber_id: AtomicU64,
    queue_capacity: usize,
    video_header: Mutex<Option<MediaPacket>>,
    audio_header: Mutex<Option<MediaPacket>>,
    closed: AtomicBool,
}

impl Publisher {
    fn new(uid: &str, queue_capacity: usize) -> Self {
        Self {
            uid: uid.to_string(),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            video_header: Mutex::new(None),
            audio_header: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Fan `packet` out to every subscriber queue without blocking. A
    /// subscriber whose queue is full or gone is disconnected.
    pub fn publish(&self, packet: MediaPacket) {
        if packet.is_sequence_header() {
            let slot = match packet.kind {
                MediaKind::Video => &self.video_header,
                MediaKind::Audio => &self.audio_header,
            };
            *slot.lock() = Some(packet.clone());
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(packet.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(uid = %self.uid, subscriber = id, "Subscriber too slow, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(uid = %self.uid, subscriber = id, "Subscriber gone");
                false
            }
        });
    }

    /// `None` once this publisher has been closed or superseded.
    fn subscribe(&self) -> Option<Subscriber> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        // Prime with cached sequence headers so the new reader can decode
        for header in [self.video_header.lock().clone(), self.audio_header.lock().clone()]
            .into_iter()
            .flatten()
        {
            let _ = tx.try_send(header);
        }

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        {
            // Checked under the lock so a concurrent close either sees us or we see it
            let mut subscribers = self.subscribers.lock();
            if self.is_closed() {
                return None;
            }
            subscribers.insert(id, tx);
        }
        debug!(uid = %self.uid, subscriber = id, "Subscriber attached");

        Some(Subscriber {
            id,
            rx,
            subscribers: Arc::downgrade(&self.subscribers),
        })
    }

    /// Close every subscriber queue. Their readers observe end-of-stream.
    fn close_subscribers(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped: Vec<_> = self.subscribers.lock().drain().collect();
        if !dropped.is_empty() {
            info!(uid = %self.uid, count = dropped.len(), "🔌 Closing subscribers");
        }
    }
}

/// Read side of one playback connection.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<MediaPacket>,
    subscribers: Weak<SubscriberMap>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next packet in publisher order, or `None` once the publisher is gone
    /// or this subscriber was disconnected.
    pub async fn recv(&mut self) -> Option<MediaPacket> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        // Drop removes us from the fan-out set
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().remove(&self.id);
        }
    }
}

/// Registry of the active publisher per device UID.
pub struct Broadcaster {
    publishers: RwLock<HashMap<String, Arc<Publisher>>>,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            publishers: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Install a new publisher for `uid`. A previous publisher is swapped out
    /// and its subscribers are torn down in the background.
    pub fn register_publisher(&self, uid: &str) -> Arc<Publisher> {
        let publisher = Arc::new(Publisher::new(uid, self.queue_capacity));
        let previous = self
            .publishers
            .write()
            .insert(uid.to_string(), publisher.clone());

        if let Some(previous) = previous {
            warn!(uid = %uid, "Replacing existing publisher");
            tokio::spawn(async move {
                previous.close_subscribers();
            });
        }

        info!(uid = %uid, "📡 Publisher registered");
        publisher
    }

    /// Attach a subscriber to the active publisher. `None` means the stream
    /// is not live, or its publisher was torn down while we attached.
    pub fn subscribe(&self, uid: &str) -> Option<Subscriber> {
        let publisher = self.publishers.read().get(uid).cloned()?;
        publisher.subscribe()
    }

    /// Tear down `publisher` if it is still the active one for `uid`.
    /// Returns `false` when it had already been replaced.
    pub fn close_publisher(&self, uid: &str, publisher: &Arc<Publisher>) -> bool {
        let removed = {
            let mut publishers = self.publishers.write();
            match publishers.get(uid) {
                Some(current) if Arc::ptr_eq(current, publisher) => publishers.remove(uid).is_some(),
                _ => false,
            }
        };

        publisher.close_subscribers();
        if removed {
            info!(uid = %uid, "Publisher closed");
        }
        removed
    }

    pub fn is_live(&self, uid: &str) -> bool {
        self.publishers.read().contains_key(uid)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(n: u8) -> MediaPacket {
        MediaPacket::video(n as u32 * 40, Bytes::from(vec![0x27, 0x01, n]))
    }

    #[tokio::test]
    async fn test_subscribe_without_publisher_is_none() {
        let broadcaster = Broadcaster::default();
        assert!(broadcaster.subscribe("abc").is_none());
        assert!(!broadcaster.is_live("abc"));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_later_packets_in_order() {
        let broadcaster = Broadcaster::default();
        let publisher = broadcaster.register_publisher("abc");

        publisher.publish(frame(1));
        let mut subscriber = broadcaster.subscribe("abc").unwrap();
        publisher.publish(frame(2));
        publisher.publish(frame(3));

        assert_eq!(subscriber.recv().await, Some(frame(2)));
        assert_eq!(subscriber.recv().await, Some(frame(3)));

        broadcaster.close_publisher("abc", &publisher);
        assert_eq!(subscriber.recv().await, None);
    }

    #[tokio::test]
    async fn test_new_publisher_closes_previous_subscribers() {
        let broadcaster = Broadcaster::default();
        let first = broadcaster.register_publisher("abc");
        let mut old_subscriber = broadcaster.subscribe("abc").unwrap();

        let second = broadcaster.register_publisher("abc");
        let closed = tokio::time::timeout(Duration::from_secs(1), old_subscriber.recv()).await;
        assert_eq!(closed.unwrap(), None);
        assert!(first.is_closed());

        let mut new_subscriber = broadcaster.subscribe("abc").unwrap();
        first.publish(frame(9));
        second.publish(frame(1));
        assert_eq!(new_subscriber.recv().await, Some(frame(1)));
    }

    #[tokio::test]
    async fn test_stale_publisher_cannot_remove_replacement() {
        let broadcaster = Broadcaster::default();
        let first = broadcaster.register_publisher("abc");
        let _second = broadcaster.register_publisher("abc");

        assert!(!broadcaster.close_publisher("abc", &first));
        assert!(broadcaster.is_live("abc"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected() {
        let broadcaster = Broadcaster::new(2);
        let publisher = broadcaster.register_publisher("abc");
        let mut slow = broadcaster.subscribe("abc").unwrap();

        for n in 1..=3 {
            publisher.publish(frame(n));
        }

        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(slow.recv().await, Some(frame(1)));
        assert_eq!(slow.recv().await, Some(frame(2)));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_publisher_running() {
        let broadcaster = Broadcaster::default();
        let publisher = broadcaster.register_publisher("abc");
        let subscriber = broadcaster.subscribe("abc").unwrap();
        let mut other = broadcaster.subscribe("abc").unwrap();

        subscriber.unsubscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        publisher.publish(frame(4));
        assert_eq!(other.recv().await, Some(frame(4)));
        assert!(broadcaster.is_live("abc"));
    }

    #[tokio::test]
    async fn test_closed_publisher_refuses_new_subscribers() {
        let broadcaster = Broadcaster::default();
        let first = broadcaster.register_publisher("abc");

        // Reader that looked the publisher up just before it was closed
        broadcaster.close_publisher("abc", &first);
        assert!(first.subscribe().is_none());
        assert_eq!(first.subscriber_count(), 0);

        let stale = broadcaster.register_publisher("abc");
        let _third = broadcaster.register_publisher("abc");
        tokio::time::timeout(Duration::from_secs(1), async {
            while !stale.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(stale.subscribe().is_none());
        assert!(broadcaster.subscribe("abc").is_some());
    }

    #[tokio::test]
    async fn test_late_joiner_is_primed_with_sequence_headers() {
        let broadcaster = Broadcaster::default();
        let publisher = broadcaster.register_publisher("abc");

        let avc_config = MediaPacket::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00]));
        let aac_config = MediaPacket::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(avc_config.is_sequence_header());
        assert!(aac_config.is_sequence_header());
        assert!(!frame(1).is_sequence_header());

        publisher.publish(avc_config.clone());
        publisher.publish(aac_config.clone());
        publisher.publish(frame(1));

        let mut late = broadcaster.subscribe("abc").unwrap();
        publisher.publish(frame(2));

        assert_eq!(late.recv().await, Some(avc_config));
        assert_eq!(late.recv().await, Some(aac_config));
        assert_eq!(late.recv().await, Some(frame(2)));
    }
}
