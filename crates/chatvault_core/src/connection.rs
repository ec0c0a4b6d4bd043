/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The single owner of the remote session. Crawler and listener both go
//! through it; nothing else holds the source.

use anyhow::{Context, Result};
use chatvault_protocol::{RemoteChat, RemoteMessage, RemotePeer};
use rand::{thread_rng, Rng};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::remote::{EventStream, RemoteError, RemoteSource};

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub retry_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Funnel every request through one lane when the transport can't
    /// multiplex concurrent calls.
    pub serialize_requests: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            serialize_requests: true,
        }
    }
}

pub struct RemoteConnection {
    source: Arc<dyn RemoteSource>,
    settings: ConnectionSettings,
    lane: TokioMutex<()>,
    connected: AtomicBool,
}

impl RemoteConnection {
    pub fn new(source: Arc<dyn RemoteSource>, settings: ConnectionSettings) -> Arc<Self> {
        Arc::new(Self {
            source,
            settings,
            lane: TokioMutex::new(()),
            connected: AtomicBool::new(false),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.call("connect", || self.source.connect()).await?;
        self.connected.store(true, Ordering::Relaxed);
        info!("remote session connected");
        Ok(())
    }

    pub async fn list_chats(&self) -> Result<Vec<RemoteChat>> {
        self.call("list_chats", || self.source.list_chats()).await
    }

    pub async fn list_archived_chats(&self) -> Result<Vec<RemoteChat>> {
        self.call("list_archived_chats", || self.source.list_archived_chats()).await
    }

    pub async fn get_chat(&self, peer: &RemotePeer) -> Result<RemoteChat> {
        self.call("get_chat", || self.source.get_chat(peer)).await
    }

    pub async fn fetch_messages(
        &self,
        peer: &RemotePeer,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>> {
        self.call("fetch_messages", || self.source.fetch_messages(peer, after_id, limit))
            .await
    }

    pub async fn fetch_pinned_ids(&self, peer: &RemotePeer) -> Result<Vec<i64>> {
        self.call("fetch_pinned_ids", || self.source.fetch_pinned_ids(peer)).await
    }

    pub async fn download_media(&self, peer: &RemotePeer, message_id: i64) -> Result<Vec<u8>> {
        self.call("download_media", || self.source.download_media(peer, message_id))
            .await
    }

    pub async fn subscribe(&self) -> Result<EventStream> {
        let stream = self.call("subscribe", || self.source.subscribe()).await?;
        self.connected.store(true, Ordering::Relaxed);
        Ok(stream)
    }

    /// Runs one request with retry on transient failures. Everything else is
    /// returned at once with the [`RemoteError`] kept in the chain.
    async fn call<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, RemoteError>> + Send,
        T: Send,
    {
        let max_attempts = self.settings.retry_attempts.clamp(1, 10);
        let mut backoff = self.settings.base_backoff;
        for attempt in 0..max_attempts {
            let res = {
                let _lane = if self.settings.serialize_requests {
                    Some(self.lane.lock().await)
                } else {
                    None
                };
                op().await
            };
            match res {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    warn!(op = what, attempt = attempt + 1, "transient remote error: {e}");
                    sleep_with_jitter(backoff).await;
                    backoff = backoff.saturating_mul(2).min(self.settings.max_backoff);
                }
                Err(e) => {
                    if e.is_transient() {
                        self.connected.store(false, Ordering::Relaxed);
                    }
                    debug!(op = what, "remote call failed: {e}");
                    return Err(e).context(what);
                }
            }
        }
        unreachable!("retry loop should return or error");
    }
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
