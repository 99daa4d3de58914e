//! Per-session task that coalesces dirty rectangles into one bounding-box
//! image and fans it out to every attached subscriber, throttled to ~30 fps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::compression;
use crate::framebuffer::Framebuffer;
use crate::subscriber::{OutboundMessage, SubscriberSink};

/// Ticks at roughly 30 fps.
const TICK_TIMEOUT: Duration = Duration::from_millis(33);

/// Bounding boxes at or above this pixel count are encoded via
/// `spawn_blocking` rather than inline on the broadcaster task.
const BLOCKING_DISPATCH_THRESHOLD: u32 = 64 * 64;

/// Drives the coalesce-and-emit loop for one session's framebuffer.
pub struct Broadcaster {
    framebuffer: Arc<Framebuffer>,
    subscribers: Mutex<Vec<Arc<dyn SubscriberSink>>>,
    running: AtomicBool,
}

impl Broadcaster {
    /// Spawns the broadcaster's background task and returns a handle to it.
    pub fn spawn(framebuffer: Arc<Framebuffer>) -> Arc<Self> {
        let broadcaster = Arc::new(Self {
            framebuffer,
            subscribers: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });
        let task_handle = broadcaster.clone();
        tokio::spawn(async move { task_handle.run().await });
        broadcaster
    }

    /// Attaches a subscriber; it receives future coalesced updates.
    pub async fn attach(&self, subscriber: Arc<dyn SubscriberSink>) {
        self.subscribers.lock().await.push(subscriber);
    }

    /// Stops the broadcaster loop after its current tick.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    async fn run(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let _ = timeout(TICK_TIMEOUT, self.framebuffer.dirty()).await;
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let Some((bbox, pixels)) = self.framebuffer.take_dirty_snapshot() else {
                continue;
            };

            if self.subscribers.lock().await.is_empty() {
                continue;
            }

            let (fb_width, fb_height) = self.framebuffer.dimensions();
            let framebuffer_area = u32::from(fb_width) * u32::from(fb_height);
            let bbox_area = u32::from(bbox.width) * u32::from(bbox.height);
            let quality = compression::quality_for_area(bbox_area, framebuffer_area);

            let jpeg_bytes = if bbox_area >= BLOCKING_DISPATCH_THRESHOLD {
                let (width, height) = (bbox.width, bbox.height);
                tokio::task::spawn_blocking(move || compression::encode_jpeg(&pixels, width, height, quality))
                    .await
                    .unwrap_or_else(|join_err| Err(crate::error::GatewayError::Encoding(join_err.to_string())))
            } else {
                compression::encode_jpeg(&pixels, bbox.width, bbox.height, quality)
            };

            let jpeg_bytes = match jpeg_bytes {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("JPEG encode failed: {err}");
                    continue;
                }
            };

            let data = base64::engine::general_purpose::STANDARD.encode(jpeg_bytes);
            let message = OutboundMessage::Update { x: bbox.x, y: bbox.y, data };
            self.fan_out(message).await;
        }
    }

    async fn fan_out(&self, message: OutboundMessage) {
        let mut subscribers = self.subscribers.lock().await;
        let mut alive = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers.drain(..) {
            if subscriber.send(message.clone()).await.is_ok() {
                alive.push(subscriber);
            } else {
                debug!("dropping dead subscriber");
            }
        }
        *subscribers = alive;
    }
}

impl Clone for OutboundMessage {
    fn clone(&self) -> Self {
        match self {
            Self::Connected { width, height } => Self::Connected { width: *width, height: *height },
            Self::Frame { x, y, data } => Self::Frame { x: *x, y: *y, data: data.clone() },
            Self::Update { x, y, data } => Self::Update { x: *x, y: *y, data: data.clone() },
            Self::Error { message } => Self::Error { message: message.clone() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Notify as TokioNotify;

    struct RecordingSink {
        updates: Arc<std::sync::Mutex<Vec<OutboundMessage>>>,
        notify: Arc<TokioNotify>,
    }

    #[async_trait]
    impl SubscriberSink for RecordingSink {
        async fn send(&self, msg: OutboundMessage) -> Result<(), crate::subscriber::SinkError> {
            self.updates.lock().unwrap().push(msg);
            self.notify.notify_one();
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn coalesces_two_rects_into_one_update_bbox() {
        let framebuffer = Arc::new(Framebuffer::new(64, 64));
        let broadcaster = Broadcaster::spawn(framebuffer.clone());
        let updates = Arc::new(std::sync::Mutex::new(Vec::new()));
        let notify = Arc::new(TokioNotify::new());
        let sink = Arc::new(RecordingSink { updates: updates.clone(), notify: notify.clone() });
        broadcaster.attach(sink).await;

        let rgb_a = vec![0u8; 10 * 10 * 3];
        let rgb_b = vec![0u8; 5 * 5 * 3];
        framebuffer.paste(0, 0, 10, 10, &rgb_a);
        framebuffer.paste(20, 30, 5, 5, &rgb_b);

        tokio::time::timeout(Duration::from_secs(2), notify.notified()).await.unwrap();
        let captured = updates.lock().unwrap();
        assert_eq!(captured.len(), 1);
        match &captured[0] {
            OutboundMessage::Update { x, y, data } => {
                assert_eq!((*x, *y), (0, 0));
                let jpeg_bytes = base64::engine::general_purpose::STANDARD.decode(data).unwrap();
                let decoded = image::load_from_memory(&jpeg_bytes).unwrap();
                assert_eq!((decoded.width(), decoded.height()), (25, 35));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        broadcaster.shutdown();
    }
}
