/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Real-time event dispatcher.
//!
//! Keeps one event subscription open through the shared connection and
//! reconnects with backoff whenever it drops. Events are routed into one
//! ordered lane per chat; lanes run concurrently and survive reconnects.
//! Edits and deletions only reach storage through the [`MassGuard`].

use anyhow::Result;
use async_trait::async_trait;
use chatvault_protocol::{ChatKind, RemoteChat, RemoteEvent, RemoteMessage};
use futures_util::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::archive_db::{ArchiveDb, MessageEntry};
use crate::change_events::{ChangeFeed, ChangeOp, EntityKind};
use crate::chat_filter::FilterRules;
use crate::chat_id::ChatId;
use crate::chat_locks::ChatLocks;
use crate::connection::RemoteConnection;
use crate::mass_guard::{MassGuard, OpSink, PendingOp};
use crate::media_ingest::MediaIngest;
use crate::normalize;
use crate::remote::{classify, is_access_revoked, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Listening,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    pub listen_edits: bool,
    /// When false every deletion is dropped before the rate limiter.
    pub listen_deletions: bool,
    /// Download media of new messages immediately instead of on the next crawl.
    pub download_media: bool,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            listen_edits: true,
            listen_deletions: true,
            download_media: false,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

pub(crate) fn next_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let delay = base.saturating_mul(1u32 << pow).min(max);
    let jitter_cap = (base.as_millis() as u64).min(200);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
}

/// Applies rate-limited operations to the archive and announces what changed.
pub struct ArchiveSink {
    db: ArchiveDb,
    locks: Arc<ChatLocks>,
    feed: ChangeFeed,
}

impl ArchiveSink {
    pub fn new(db: ArchiveDb, locks: Arc<ChatLocks>, feed: ChangeFeed) -> Self {
        Self { db, locks, feed }
    }
}

#[async_trait]
impl OpSink for ArchiveSink {
    async fn apply(&self, chat: ChatId, ops: Vec<PendingOp>) -> Result<()> {
        let changed = {
            let _lane = self.locks.lock(chat).await;
            self.db.run(move |db| db.apply_ops(chat, &ops)).await?
        };
        for (message_id, op) in changed {
            self.feed.publish(chat, EntityKind::Message, message_id, op);
        }
        Ok(())
    }
}

type Lanes = HashMap<ChatId, mpsc::UnboundedSender<RemoteEvent>>;

pub struct Listener {
    conn: Arc<RemoteConnection>,
    db: ArchiveDb,
    rules: FilterRules,
    settings: ListenerSettings,
    guard: Arc<MassGuard>,
    media: Arc<MediaIngest>,
    locks: Arc<ChatLocks>,
    feed: ChangeFeed,
    tracked: Mutex<HashMap<ChatId, bool>>,
    state: watch::Sender<ListenerState>,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Arc<RemoteConnection>,
        db: ArchiveDb,
        rules: FilterRules,
        settings: ListenerSettings,
        guard: Arc<MassGuard>,
        media: Arc<MediaIngest>,
        locks: Arc<ChatLocks>,
        feed: ChangeFeed,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Arc::new(Self {
            conn,
            db,
            rules,
            settings,
            guard,
            media,
            locks,
            feed,
            tracked: Mutex::new(HashMap::new()),
            state,
        })
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ListenerState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "listener state");
        }
    }

    /// Replaces the admission cache with the chats the crawler just admitted.
    /// Anything else is decided again on its next event.
    pub fn reload_tracked(&self, admitted: impl IntoIterator<Item = ChatId>) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        tracked.clear();
        tracked.extend(admitted.into_iter().map(|id| (id, true)));
        debug!(count = tracked.len(), "listener tracked chats reloaded");
    }

    fn cached_decision(&self, id: ChatId) -> Option<bool> {
        let tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        tracked.get(&id).copied()
    }

    fn remember(&self, id: ChatId, admitted: bool) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        tracked.insert(id, admitted);
    }

    async fn chat_kind(&self, id: ChatId, ev: &RemoteEvent) -> Result<Option<ChatKind>> {
        if let Some(chat) = ev.chat() {
            return Ok(Some(chat.kind));
        }
        if let Some(kind) = self.db.run(move |db| db.chat_kind(id)).await? {
            return Ok(Some(kind));
        }
        match self.conn.get_chat(&id.to_peer()).await {
            Ok(chat) => Ok(Some(chat.kind)),
            Err(e) if is_access_revoked(&e) || matches!(classify(&e), Some(RemoteError::NotFound(_))) => {
                debug!(chat_id = %id, "event for unreachable chat: {e:#}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn admits(&self, id: ChatId, ev: &RemoteEvent) -> Result<bool> {
        if let Some(decision) = self.cached_decision(id) {
            return Ok(decision);
        }
        let Some(kind) = self.chat_kind(id, ev).await? else {
            return Ok(false);
        };
        let decision = self.rules.admit(id, kind);
        self.remember(id, decision);
        Ok(decision)
    }

    /// Runs until `shutdown` flips to true. Pending rate-limited operations
    /// are flushed before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut lanes: Lanes = HashMap::new();
        let mut workers = JoinSet::new();
        let mut attempt = 0u32;

        'run: loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ListenerState::Connecting);
            match self.conn.subscribe().await {
                Ok(mut stream) => {
                    attempt = 0;
                    self.set_state(ListenerState::Listening);
                    info!("listener connected");
                    loop {
                        tokio::select! {
                            res = shutdown.changed() => {
                                if res.is_err() || *shutdown.borrow() {
                                    break 'run;
                                }
                            }
                            item = stream.next() => match item {
                                Some(Ok(ev)) => self.dispatch(ev, &mut lanes, &mut workers),
                                Some(Err(RemoteError::AccessRevoked { peer, reason })) => {
                                    info!(peer = ?peer, "event source reports revoked access: {reason}");
                                }
                                Some(Err(e)) => {
                                    warn!("event stream failed: {e}");
                                    break;
                                }
                                None => {
                                    info!("event stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!("listener connect failed: {e:#}"),
            }

            self.set_state(ListenerState::Connecting);
            attempt = attempt.saturating_add(1);
            let delay = next_backoff(attempt, self.settings.base_backoff, self.settings.max_backoff);
            info!(attempt, delay_ms = delay.as_millis() as u64, "listener reconnecting");
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        drop(lanes);
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!("listener lane panicked: {e}");
            }
        }
        self.guard.flush_all().await;
        self.set_state(ListenerState::Disconnected);
        info!("listener stopped");
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, ev: RemoteEvent, lanes: &mut Lanes, workers: &mut JoinSet<()>) {
        let id = match ChatId::from_peer(&ev.peer()) {
            Ok(id) => id,
            Err(e) => {
                error!(event = ev.name(), "event with invalid peer dropped: {e:#}");
                return;
            }
        };
        let ev = match lanes.get(&id) {
            Some(tx) => match tx.send(ev) {
                Ok(()) => return,
                Err(mpsc::error::SendError(ev)) => ev,
            },
            None => ev,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ev);
        lanes.insert(id, tx);
        workers.spawn(self.clone().drive_lane(id, rx));
    }

    async fn drive_lane(self: Arc<Self>, id: ChatId, mut rx: mpsc::UnboundedReceiver<RemoteEvent>) {
        while let Some(ev) = rx.recv().await {
            let name = ev.name();
            if let Err(e) = self.handle(id, ev).await {
                if is_access_revoked(&e) {
                    info!(chat_id = %id, event = name, "access revoked while handling event: {e:#}");
                } else if normalize::is_integrity_violation(&e) {
                    error!(chat_id = %id, event = name, "invariant violation, event dropped: {e:?}");
                } else {
                    warn!(chat_id = %id, event = name, "event handling failed: {e:#}");
                }
            }
        }
    }

    pub async fn handle(&self, id: ChatId, ev: RemoteEvent) -> Result<()> {
        if !self.admits(id, &ev).await? {
            debug!(chat_id = %id, event = ev.name(), "event for filtered chat dropped");
            return Ok(());
        }
        match ev {
            RemoteEvent::NewMessage { chat, message } => self.on_new_message(id, chat, message).await,
            RemoteEvent::Edit {
                message_id,
                text,
                edit_date_ms,
                ..
            } => {
                if !self.settings.listen_edits {
                    return Ok(());
                }
                self.guard
                    .submit(
                        id,
                        PendingOp::Edit {
                            message_id,
                            text,
                            edit_date_ms,
                        },
                    )
                    .await;
                Ok(())
            }
            RemoteEvent::Delete { message_ids, .. } => {
                if !self.settings.listen_deletions {
                    debug!(chat_id = %id, count = message_ids.len(), "deletions disabled, ignored");
                    return Ok(());
                }
                for message_id in message_ids {
                    self.guard.submit(id, PendingOp::Delete { message_id }).await;
                }
                Ok(())
            }
            RemoteEvent::ChatAction { chat, action } => {
                let record = normalize::chat_record(&chat)?;
                let (created, changed) = {
                    let _lane = self.locks.lock(id).await;
                    self.db
                        .run(move |db| {
                            let created = db.ensure_chat(&record)?;
                            let changed = db.apply_chat_action(record.id, &action)?;
                            Ok((created, changed))
                        })
                        .await?
                };
                if created {
                    self.feed.publish(id, EntityKind::Chat, id.get(), ChangeOp::Insert);
                } else if changed {
                    self.feed.publish(id, EntityKind::Chat, id.get(), ChangeOp::Update);
                }
                Ok(())
            }
            RemoteEvent::PinChange {
                message_ids,
                pinned,
                ..
            } => {
                let changed = {
                    let _lane = self.locks.lock(id).await;
                    self.db
                        .run(move |db| db.set_pinned(id, &message_ids, pinned))
                        .await?
                };
                self.feed.publish_messages(id, &changed, ChangeOp::Update);
                Ok(())
            }
        }
    }

    async fn on_new_message(&self, id: ChatId, chat: RemoteChat, message: RemoteMessage) -> Result<()> {
        let record = normalize::chat_record(&chat)?;
        let mut media = message.media.as_ref().map(normalize::media_record);
        if self.settings.download_media {
            if let Some(m) = media.take() {
                media = Some(self.media.materialize(id, &chat.peer, message.id, m).await?);
            }
        }
        let entry = MessageEntry {
            message: normalize::message_record(id, &message)?,
            sender: message.sender.as_ref().map(normalize::user_record),
            media,
            reactions: normalize::reaction_records(&message),
        };
        let (created, written) = {
            let _lane = self.locks.lock(id).await;
            self.db
                .run(move |db| {
                    let created = db.ensure_chat(&record)?;
                    let written = db.write_batch(record.id, &[entry], None)?;
                    Ok((created, written))
                })
                .await?
        };
        if created {
            info!(chat_id = %id, "new chat seen by listener");
            self.feed.publish(id, EntityKind::Chat, id.get(), ChangeOp::Insert);
        }
        self.feed.publish_messages(id, &written.inserted, ChangeOp::Insert);
        self.feed.publish_messages(id, &written.updated, ChangeOp::Update);
        for mid in &written.media_added {
            self.feed.publish(id, EntityKind::Media, *mid, ChangeOp::Insert);
        }
        debug!(chat_id = %id, message_id = message.id, "new message stored");
        Ok(())
    }
}
