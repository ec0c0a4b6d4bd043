/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use chatvault_protocol::RemotePeer;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::archive_db::{ArchiveDb, MediaObject, MediaRecord};
use crate::chat_id::ChatId;
use crate::connection::RemoteConnection;
use crate::media_store::{content_hash, MediaSettings, MediaStore};
use crate::remote::is_access_revoked;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct VerifyReport {
    pub checked: u64,
    pub missing: u64,
    /// Present but with a length other than the recorded one.
    pub corrupted: u64,
    pub repaired: u64,
    pub unrecoverable: u64,
}

/// Turns a media descriptor into a stored object, reusing one already known
/// for the same remote file before downloading anything.
pub struct MediaIngest {
    conn: Arc<RemoteConnection>,
    store: Arc<dyn MediaStore>,
    db: ArchiveDb,
    settings: MediaSettings,
}

impl MediaIngest {
    pub fn new(
        conn: Arc<RemoteConnection>,
        store: Arc<dyn MediaStore>,
        db: ArchiveDb,
        settings: MediaSettings,
    ) -> Self {
        Self {
            conn,
            store,
            db,
            settings,
        }
    }

    /// Returns the record with `object` filled in when the bytes are stored.
    /// Skipped, oversized and failed downloads come back with `object: None`.
    pub async fn materialize(
        &self,
        chat: ChatId,
        peer: &RemotePeer,
        message_id: i64,
        mut record: MediaRecord,
    ) -> Result<MediaRecord> {
        if record.object.is_some() || !self.settings.enabled_for(chat) {
            return Ok(record);
        }
        if !self.settings.within_limit(record.size) {
            debug!(chat_id = %chat, message_id, size = record.size, "media over size limit, not downloading");
            return Ok(record);
        }
        if let Some(file_id) = record.remote_file_id.clone() {
            if let Some(obj) = self.db.run(move |db| db.known_file_object(&file_id)).await? {
                record.object = Some(obj);
                return Ok(record);
            }
        }
        let bytes = match self.conn.download_media(peer, message_id).await {
            Ok(b) => b,
            Err(e) if is_access_revoked(&e) => return Err(e),
            Err(e) => {
                warn!(chat_id = %chat, message_id, "media download failed: {e:#}");
                return Ok(record);
            }
        };
        if !self.settings.within_limit(bytes.len() as i64) {
            debug!(chat_id = %chat, message_id, size = bytes.len(), "downloaded media over size limit, dropped");
            return Ok(record);
        }
        let put = self.store.put(&bytes).await?;
        if put.created {
            debug!(chat_id = %chat, message_id, hash = %put.object.content_hash, "stored new media object");
        }
        record.object = Some(put.object);
        Ok(record)
    }

    /// Checks every stored object against its recorded size and fetches
    /// missing or damaged ones again through a message that references them.
    pub async fn verify_stored(&self) -> Result<VerifyReport> {
        let objects = self.db.run(|db| db.list_media_objects()).await?;
        let mut report = VerifyReport::default();
        for obj in objects {
            report.checked += 1;
            match self.store.stored_size(&obj.storage_key).await? {
                Some(len) if len == obj.size.max(0) as u64 => continue,
                Some(len) => {
                    debug!(hash = %obj.content_hash, expected = obj.size, found = len, "media object damaged");
                    report.corrupted += 1;
                }
                None => {
                    debug!(hash = %obj.content_hash, "media object missing");
                    report.missing += 1;
                }
            }
            if self.repair(&obj).await? {
                report.repaired += 1;
            } else {
                report.unrecoverable += 1;
            }
        }
        info!(
            checked = report.checked,
            missing = report.missing,
            corrupted = report.corrupted,
            repaired = report.repaired,
            unrecoverable = report.unrecoverable,
            "media verification finished"
        );
        Ok(report)
    }

    async fn repair(&self, obj: &MediaObject) -> Result<bool> {
        let hash = obj.content_hash.clone();
        let refs = self.db.run(move |db| db.media_references(&hash)).await?;
        for (chat, message_id) in refs {
            if !self.settings.enabled_for(chat) {
                continue;
            }
            let bytes = match self.conn.download_media(&chat.to_peer(), message_id).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(chat_id = %chat, message_id, "media re-download failed: {e:#}");
                    continue;
                }
            };
            if content_hash(&bytes) != obj.content_hash {
                warn!(chat_id = %chat, message_id, "re-downloaded media has different content, not used");
                continue;
            }
            self.store.discard(&obj.storage_key).await?;
            self.store.put(&bytes).await?;
            info!(hash = %obj.content_hash, chat_id = %chat, message_id, "media object repaired");
            return Ok(true);
        }
        warn!(hash = %obj.content_hash, "media object could not be recovered");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_filter::FilterRules;
    use crate::crawler::CrawlerSettings;
    use crate::test_support::*;
    use tokio::sync::watch;

    async fn crawled(env: &Env) -> (ChatId, MediaObject) {
        let news = channel(10, "news");
        env.src.add_chat(news.clone());
        let mut m1 = message(1, "a");
        m1.media = Some(photo("file-a", 9));
        let mut m2 = message(2, "b");
        m2.media = Some(photo("file-b", 9));
        env.src.add_messages(news.peer, vec![m1, m2]);
        env.src.add_media_blob(news.peer, 1, b"png-bytes".to_vec());
        env.src.add_media_blob(news.peer, 2, b"png-bytes".to_vec());
        let crawler = env.crawler(FilterRules::all_types(), CrawlerSettings::default());
        crawler.run(watch::channel(false).1).await.unwrap();
        let id = ChatId::from_peer(&news.peer).unwrap();
        let objects = env.db.list_media_objects().unwrap();
        assert_eq!(objects.len(), 1);
        (id, objects[0].clone())
    }

    #[tokio::test]
    async fn intact_archive_needs_nothing() {
        let env = Env::new(MediaSettings::default());
        crawled(&env).await;
        let downloads = env.src.download_calls();
        let report = env.media.verify_stored().await.unwrap();
        assert_eq!(report, VerifyReport { checked: 1, ..VerifyReport::default() });
        assert_eq!(env.src.download_calls(), downloads);
    }

    #[tokio::test]
    async fn missing_and_truncated_objects_are_fetched_again() {
        let env = Env::new(MediaSettings::default());
        let (_, obj) = crawled(&env).await;
        let path = env.store.path_for(&obj.storage_key);

        std::fs::remove_file(&path).unwrap();
        let report = env.media.verify_stored().await.unwrap();
        assert_eq!((report.missing, report.repaired), (1, 1));
        assert_eq!(std::fs::read(&path).unwrap(), b"png-bytes");

        std::fs::write(&path, b"").unwrap();
        let report = env.media.verify_stored().await.unwrap();
        assert_eq!((report.corrupted, report.repaired), (1, 1));
        assert_eq!(std::fs::read(&path).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn falls_back_to_other_references_then_gives_up() {
        let env = Env::new(MediaSettings::default());
        let (id, obj) = crawled(&env).await;
        let path = env.store.path_for(&obj.storage_key);
        std::fs::remove_file(&path).unwrap();

        // First reference now serves different bytes; the second still matches.
        env.src.add_media_blob(id.to_peer(), 1, b"edited".to_vec());
        let report = env.media.verify_stored().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert!(path.exists());

        std::fs::remove_file(&path).unwrap();
        env.src.revoke(id.to_peer());
        let report = env.media.verify_stored().await.unwrap();
        assert_eq!((report.missing, report.unrecoverable), (1, 1));
        assert!(!path.exists());
    }
}
