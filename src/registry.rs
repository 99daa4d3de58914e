//! Process-wide map from `(host, port)` to a live [`RfbSession`], created on
//! demand and torn down once its last subscriber leaves.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use tokio::sync::Mutex;

use crate::broadcaster::Broadcaster;
use crate::error::Result;
use crate::session::RfbSession;

struct Entry {
    session: Arc<RfbSession>,
    broadcaster: Arc<Broadcaster>,
    subscriber_count: usize,
}

/// Keyed registry of upstream RFB sessions.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Returns the existing session for `host:port`, or connects a new one,
    /// drives its handshake, and registers it. The returned broadcaster is
    /// shared by every subscriber of this session.
    ///
    /// A new subscriber is assumed on every call; pair with [`Self::release`]
    /// once the caller's subscription ends.
    pub async fn get_or_create(&self, host: &str, port: u16) -> Result<(Arc<RfbSession>, Arc<Broadcaster>)> {
        let key = format!("{host}:{port}");
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&key) {
            entry.subscriber_count += 1;
            return Ok((entry.session.clone(), entry.broadcaster.clone()));
        }

        let (session, read_half) = RfbSession::connect(host, port).await?;
        let broadcaster = Broadcaster::spawn(session.framebuffer.clone());

        let session_for_task = session.clone();
        tokio::spawn(async move {
            if let Err(err) = session_for_task.run(read_half).await {
                log::warn!("session {}:{} ended: {err}", session_for_task.host, session_for_task.port);
            }
        });

        entries.insert(
            key.clone(),
            Entry { session: session.clone(), broadcaster: broadcaster.clone(), subscriber_count: 1 },
        );
        info!("registered session for {key}");
        Ok((session, broadcaster))
    }

    /// Releases one subscriber's hold on `host:port`. Once the last
    /// subscriber releases, the session is shut down and the entry removed.
    /// Calling this again for an already-removed key is a no-op.
    pub async fn release(&self, host: &str, port: u16) {
        let key = format!("{host}:{port}");
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&key) else { return };
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        if entry.subscriber_count == 0 {
            if let Some(entry) = entries.remove(&key) {
                entry.session.shutdown();
                entry.broadcaster.shutdown();
                info!("released session for {key}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_without_create_is_a_no_op() {
        let registry = SessionRegistry::new();
        registry.release("nowhere", 5900).await;
    }
}
