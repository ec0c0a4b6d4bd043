/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Builders shared by the engine tests.

use chatvault_protocol::{ChatKind, PeerKind, RemoteChat, RemoteMedia, RemoteMessage, RemotePeer};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::archive_db::ArchiveDb;
use crate::chat_filter::FilterRules;
use crate::chat_locks::ChatLocks;
use crate::change_events::ChangeFeed;
use crate::connection::{ConnectionSettings, RemoteConnection};
use crate::crawler::{Crawler, CrawlerSettings};
use crate::fixture_source::FixtureSource;
use crate::media_ingest::MediaIngest;
use crate::media_store::{LocalMediaStore, MediaSettings};

pub fn chat(kind: ChatKind, peer_kind: PeerKind, id: i64, title: &str) -> RemoteChat {
    RemoteChat {
        peer: RemotePeer { kind: peer_kind, id },
        kind,
        title: Some(title.to_string()),
        username: None,
        first_name: None,
        last_name: None,
        participants_count: None,
    }
}

pub fn channel(id: i64, title: &str) -> RemoteChat {
    chat(ChatKind::Channel, PeerKind::Channel, id, title)
}

pub fn group(id: i64, title: &str) -> RemoteChat {
    chat(ChatKind::Group, PeerKind::BasicGroup, id, title)
}

pub fn message(id: i64, text: &str) -> RemoteMessage {
    RemoteMessage {
        id,
        date_ms: 1_700_000_000_000 + id * 1000,
        edit_date_ms: None,
        sender_id: Some(1),
        sender: None,
        text: text.to_string(),
        reply_to_msg_id: None,
        reply_to_text: None,
        forward_from_id: None,
        forward_from_name: None,
        post_author: None,
        is_service: false,
        outgoing: false,
        pinned: false,
        grouped_id: None,
        media: None,
        reactions: vec![],
    }
}

pub fn messages(ids: std::ops::RangeInclusive<i64>) -> Vec<RemoteMessage> {
    ids.map(|id| message(id, &format!("message {id}"))).collect()
}

pub fn photo(file_id: &str, size: i64) -> RemoteMedia {
    RemoteMedia {
        kind: "photo".into(),
        file_id: Some(file_id.into()),
        file_name: None,
        mime_type: Some("image/jpeg".into()),
        size,
        width: Some(10),
        height: Some(10),
        duration: None,
    }
}

pub fn fast_connection() -> ConnectionSettings {
    ConnectionSettings {
        retry_attempts: 2,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        serialize_requests: true,
    }
}

/// One archive, one fixture source and everything wired between them.
pub struct Env {
    pub dir: TempDir,
    pub db: ArchiveDb,
    pub src: Arc<FixtureSource>,
    pub conn: Arc<RemoteConnection>,
    pub media: Arc<MediaIngest>,
    pub store: Arc<LocalMediaStore>,
    pub locks: Arc<ChatLocks>,
    pub feed: ChangeFeed,
}

impl Env {
    pub fn new(media: MediaSettings) -> Self {
        let dir = TempDir::new().unwrap();
        let db = ArchiveDb::open(dir.path().join("archive.db"), Duration::from_secs(10)).unwrap();
        let src = Arc::new(FixtureSource::new());
        let conn = RemoteConnection::new(src.clone(), fast_connection());
        let store = Arc::new(LocalMediaStore::new(dir.path().join("media")));
        let ingest = Arc::new(MediaIngest::new(conn.clone(), store.clone(), db.clone(), media));
        Self {
            dir,
            db,
            src,
            conn,
            media: ingest,
            store,
            locks: Arc::new(ChatLocks::new()),
            feed: ChangeFeed::new(4096),
        }
    }

    pub fn crawler(&self, rules: FilterRules, settings: CrawlerSettings) -> Crawler {
        Crawler::new(
            self.conn.clone(),
            self.db.clone(),
            rules,
            settings,
            self.media.clone(),
            self.locks.clone(),
            self.feed.clone(),
        )
    }
}

/// Polls `cond` every 10ms for up to five seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
