/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory [`RemoteSource`] fed from a JSON fixture. Used by the replay
//! binary and throughout the test suite; it also lets tests inject revoked
//! access, failing fetches and dropped subscriptions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chatvault_protocol::{RemoteChat, RemoteEvent, RemoteMessage, RemotePeer};
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::remote::{EventStream, RemoteError, RemoteSource};

#[derive(Debug, Default, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub chats: Vec<RemoteChat>,
    /// Reachable by id but absent from the dialog listing.
    #[serde(default)]
    pub hidden_chats: Vec<RemoteChat>,
    /// Listed in the archive folder only.
    #[serde(default)]
    pub archived_chats: Vec<RemoteChat>,
    #[serde(default)]
    pub histories: Vec<FixtureHistory>,
    /// Delivered to the first subscriber.
    #[serde(default)]
    pub events: Vec<RemoteEvent>,
}

#[derive(Debug, Deserialize)]
pub struct FixtureHistory {
    pub peer: RemotePeer,
    #[serde(default)]
    pub messages: Vec<RemoteMessage>,
    #[serde(default)]
    pub pinned: Vec<i64>,
    #[serde(default)]
    pub media: Vec<FixtureBlob>,
}

#[derive(Debug, Deserialize)]
pub struct FixtureBlob {
    pub message_id: i64,
    pub content: String,
}

type EventSender = mpsc::UnboundedSender<Result<RemoteEvent, RemoteError>>;

#[derive(Default)]
struct FixtureState {
    chats: Vec<RemoteChat>,
    hidden: Vec<RemoteChat>,
    archived: Vec<RemoteChat>,
    history: HashMap<RemotePeer, Vec<RemoteMessage>>,
    pinned: HashMap<RemotePeer, Vec<i64>>,
    blobs: HashMap<(RemotePeer, i64), Vec<u8>>,
    revoked: HashSet<RemotePeer>,
    fetch_failures: HashMap<RemotePeer, (u32, RemoteError)>,
    transient_failures: u32,
    queued_events: Vec<RemoteEvent>,
    subscribers: Vec<EventSender>,
    fetch_calls: u32,
    download_calls: u32,
    subscribe_calls: u32,
}

#[derive(Default)]
pub struct FixtureSource {
    state: Mutex<FixtureState>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(file: FixtureFile) -> Self {
        let src = Self::new();
        for chat in file.chats {
            src.add_chat(chat);
        }
        for chat in file.hidden_chats {
            src.add_hidden_chat(chat);
        }
        for chat in file.archived_chats {
            src.add_archived_chat(chat);
        }
        for h in file.histories {
            src.add_messages(h.peer, h.messages);
            if !h.pinned.is_empty() {
                src.set_pinned(h.peer, h.pinned);
            }
            for blob in h.media {
                src.add_media_blob(h.peer, blob.message_id, blob.content.into_bytes());
            }
        }
        src.state().queued_events = file.events;
        src
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let file: FixtureFile = serde_json::from_str(text).context("parse fixture json")?;
        Ok(Self::from_fixture(file))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read fixture: {}", path.display()))?;
        Self::from_json(&text)
    }

    fn state(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_chat(&self, chat: RemoteChat) {
        self.state().chats.push(chat);
    }

    pub fn add_hidden_chat(&self, chat: RemoteChat) {
        self.state().hidden.push(chat);
    }

    pub fn add_archived_chat(&self, chat: RemoteChat) {
        self.state().archived.push(chat);
    }

    pub fn add_messages(&self, peer: RemotePeer, messages: Vec<RemoteMessage>) {
        let mut st = self.state();
        let list = st.history.entry(peer).or_default();
        list.retain(|m| !messages.iter().any(|n| n.id == m.id));
        list.extend(messages);
        list.sort_by_key(|m| m.id);
    }

    pub fn set_pinned(&self, peer: RemotePeer, ids: Vec<i64>) {
        self.state().pinned.insert(peer, ids);
    }

    pub fn add_media_blob(&self, peer: RemotePeer, message_id: i64, bytes: Vec<u8>) {
        self.state().blobs.insert((peer, message_id), bytes);
    }

    pub fn revoke(&self, peer: RemotePeer) {
        self.state().revoked.insert(peer);
    }

    /// After `ok_calls` more successful fetches for `peer`, every fetch fails
    /// with `err` until [`FixtureSource::clear_fetch_failure`].
    pub fn fail_fetch_after(&self, peer: RemotePeer, ok_calls: u32, err: RemoteError) {
        self.state().fetch_failures.insert(peer, (ok_calls, err));
    }

    pub fn clear_fetch_failure(&self, peer: RemotePeer) {
        self.state().fetch_failures.remove(&peer);
    }

    /// The next `n` calls of any kind fail with a transient error.
    pub fn fail_next_calls(&self, n: u32) {
        self.state().transient_failures = n;
    }

    /// Delivers to live subscribers, or queues for the next one.
    pub fn push_event(&self, ev: RemoteEvent) {
        let mut st = self.state();
        st.subscribers.retain(|tx| !tx.is_closed());
        if st.subscribers.is_empty() {
            st.queued_events.push(ev);
            return;
        }
        for tx in &st.subscribers {
            let _ = tx.send(Ok(ev.clone()));
        }
    }

    /// Ends every open event stream, as a dropped connection would.
    pub fn drop_subscribers(&self) {
        self.state().subscribers.clear();
    }

    pub fn fetch_calls(&self) -> u32 {
        self.state().fetch_calls
    }

    pub fn download_calls(&self) -> u32 {
        self.state().download_calls
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.state().subscribe_calls
    }

    fn check_transient(st: &mut FixtureState) -> Result<(), RemoteError> {
        if st.transient_failures > 0 {
            st.transient_failures -= 1;
            return Err(RemoteError::Transient("injected failure".to_string()));
        }
        Ok(())
    }

    fn check_access(st: &FixtureState, peer: &RemotePeer) -> Result<(), RemoteError> {
        if st.revoked.contains(peer) {
            return Err(RemoteError::AccessRevoked {
                peer: *peer,
                reason: "channel is private".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for FixtureSource {
    async fn connect(&self) -> Result<(), RemoteError> {
        Self::check_transient(&mut self.state())
    }

    async fn list_chats(&self) -> Result<Vec<RemoteChat>, RemoteError> {
        let mut st = self.state();
        Self::check_transient(&mut st)?;
        Ok(st.chats.clone())
    }

    async fn list_archived_chats(&self) -> Result<Vec<RemoteChat>, RemoteError> {
        let mut st = self.state();
        Self::check_transient(&mut st)?;
        Ok(st.archived.clone())
    }

    async fn get_chat(&self, peer: &RemotePeer) -> Result<RemoteChat, RemoteError> {
        let mut st = self.state();
        Self::check_transient(&mut st)?;
        Self::check_access(&st, peer)?;
        st.chats
            .iter()
            .chain(st.hidden.iter())
            .chain(st.archived.iter())
            .find(|c| c.peer == *peer)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("chat {peer:?}")))
    }

    async fn fetch_messages(
        &self,
        peer: &RemotePeer,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        let mut st = self.state();
        st.fetch_calls += 1;
        Self::check_transient(&mut st)?;
        Self::check_access(&st, peer)?;
        if let Some((ok_calls, err)) = st.fetch_failures.get_mut(peer) {
            if *ok_calls == 0 {
                return Err(err.clone());
            }
            *ok_calls -= 1;
        }
        Ok(st
            .history
            .get(peer)
            .map(|list| {
                list.iter()
                    .filter(|m| m.id > after_id)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_pinned_ids(&self, peer: &RemotePeer) -> Result<Vec<i64>, RemoteError> {
        let mut st = self.state();
        Self::check_transient(&mut st)?;
        Self::check_access(&st, peer)?;
        Ok(st.pinned.get(peer).cloned().unwrap_or_default())
    }

    async fn download_media(&self, peer: &RemotePeer, message_id: i64) -> Result<Vec<u8>, RemoteError> {
        let mut st = self.state();
        st.download_calls += 1;
        Self::check_transient(&mut st)?;
        Self::check_access(&st, peer)?;
        st.blobs
            .get(&(*peer, message_id))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("media for message {message_id}")))
    }

    async fn subscribe(&self) -> Result<EventStream, RemoteError> {
        let mut st = self.state();
        st.subscribe_calls += 1;
        Self::check_transient(&mut st)?;
        let (tx, rx) = mpsc::unbounded_channel();
        for ev in std::mem::take(&mut st.queued_events) {
            let _ = tx.send(Ok(ev));
        }
        st.subscribers.push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_protocol::{GroupKey, PeerKind};

    const DEMO: &str = include_str!("../demos/replay_fixture.json");

    fn releases() -> RemotePeer {
        RemotePeer {
            kind: PeerKind::Channel,
            id: 1234,
        }
    }

    #[tokio::test]
    async fn demo_fixture_loads() {
        let src = FixtureSource::from_json(DEMO).unwrap();
        assert_eq!(src.list_chats().await.unwrap().len(), 2);
        let bot = RemotePeer {
            kind: PeerKind::User,
            id: 9001,
        };
        assert_eq!(src.get_chat(&bot).await.unwrap().first_name.as_deref(), Some("Deploy bot"));

        let page = src.fetch_messages(&releases(), 1, 2).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(page[0].grouped_id, Some(GroupKey::Num(4242)));
        assert_eq!(page[1].grouped_id, Some(GroupKey::Text("4242".into())));
        assert_eq!(src.fetch_pinned_ids(&releases()).await.unwrap(), vec![1]);
        assert_eq!(src.download_media(&releases(), 2).await.unwrap(), b"png-bytes-a".to_vec());
    }

    #[tokio::test]
    async fn queued_events_go_to_first_subscriber() {
        let src = FixtureSource::from_json(DEMO).unwrap();
        let first: Vec<_> = src.subscribe().await.unwrap().take(5).collect().await;
        assert_eq!(first.len(), 5);
        assert!(matches!(first[0], Ok(RemoteEvent::NewMessage { .. })));
        assert!(matches!(first[4], Ok(RemoteEvent::Delete { .. })));

        let mut second = src.subscribe().await.unwrap();
        src.drop_subscribers();
        assert!(second.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_failures() {
        let src = FixtureSource::from_json(DEMO).unwrap();
        src.fail_next_calls(1);
        assert!(src.list_chats().await.unwrap_err().is_transient());
        assert!(src.list_chats().await.is_ok());

        src.fail_fetch_after(releases(), 1, RemoteError::Other("boom".into()));
        assert!(src.fetch_messages(&releases(), 0, 10).await.is_ok());
        assert!(src.fetch_messages(&releases(), 0, 10).await.is_err());
        src.clear_fetch_failure(releases());
        src.revoke(releases());
        assert!(matches!(
            src.fetch_messages(&releases(), 0, 10).await,
            Err(RemoteError::AccessRevoked { .. })
        ));
        assert_eq!(src.fetch_calls(), 3);
    }
}
