/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Incremental backup of every admitted chat.
//!
//! Each chat is read forward from its checkpoint in batches. A batch is
//! committed in one transaction; every `checkpoint_interval` batches the new
//! cursor is committed inside that same transaction, and once more after the
//! last batch. The stored cursor therefore never points past committed data.

use anyhow::{Context, Result};
use chatvault_protocol::{RemoteChat, RemoteMessage};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::archive_db::{now_rfc3339, ArchiveDb, MessageEntry, Statistics};
use crate::change_events::{ChangeFeed, ChangeOp, EntityKind};
use crate::chat_filter::FilterRules;
use crate::chat_id::ChatId;
use crate::chat_locks::ChatLocks;
use crate::connection::RemoteConnection;
use crate::media_ingest::{MediaIngest, VerifyReport};
use crate::normalize;
use crate::remote::{classify, is_access_revoked, RemoteError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlerSettings {
    pub batch_size: u32,
    pub checkpoint_interval: u32,
    pub concurrency: usize,
    pub sync_pinned: bool,
    /// Also back up chats from the archive folder.
    pub include_archived: bool,
    /// Backed up first, in this order.
    pub priority: Vec<ChatId>,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            checkpoint_interval: 1,
            concurrency: 1,
            sync_pinned: true,
            include_archived: true,
            priority: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmittedChat {
    pub id: ChatId,
    pub remote: RemoteChat,
    /// Listed only in the archive folder.
    pub archived: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChatOutcome {
    pub batches: u32,
    pub messages_added: u64,
    pub messages_updated: u64,
    pub media_added: u64,
    pub last_message_id: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunSummary {
    pub chats_processed: u64,
    pub chats_skipped: u64,
    pub chats_failed: u64,
    pub messages_added: u64,
    pub messages_updated: u64,
    pub media_added: u64,
    pub errors: Vec<String>,
    /// Shutdown was requested before every chat finished.
    pub aborted: bool,
    pub statistics: Statistics,
    /// Filled in when stored media was verified after the run.
    pub media_verify: Option<VerifyReport>,
}

enum ChatResult {
    Done(ChatOutcome),
    Skipped,
    Failed(String),
}

pub struct Crawler {
    conn: Arc<RemoteConnection>,
    db: ArchiveDb,
    rules: FilterRules,
    settings: CrawlerSettings,
    media: Arc<MediaIngest>,
    locks: Arc<ChatLocks>,
    feed: ChangeFeed,
}

/// Stable: prioritized chats first in configured order, the rest keep the
/// order the source listed them in.
pub fn order_by_priority(mut chats: Vec<AdmittedChat>, priority: &[ChatId]) -> Vec<AdmittedChat> {
    chats.sort_by_key(|c| {
        priority
            .iter()
            .position(|p| *p == c.id)
            .unwrap_or(usize::MAX)
    });
    chats
}

impl Crawler {
    pub fn new(
        conn: Arc<RemoteConnection>,
        db: ArchiveDb,
        rules: FilterRules,
        settings: CrawlerSettings,
        media: Arc<MediaIngest>,
        locks: Arc<ChatLocks>,
        feed: ChangeFeed,
    ) -> Self {
        Self {
            conn,
            db,
            rules,
            settings,
            media,
            locks,
            feed,
        }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        let chats = self.admitted_chats().await?;
        self.run_chats(chats, shutdown).await
    }

    /// Dialogs that pass the filter, then archived dialogs the regular
    /// listing did not return, plus explicitly included chats neither listing
    /// returned, in backup order.
    pub async fn admitted_chats(&self) -> Result<Vec<AdmittedChat>> {
        let listed = self.conn.list_chats().await.context("list chats")?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for remote in listed {
            let id = match ChatId::from_peer(&remote.peer) {
                Ok(id) => id,
                Err(e) => {
                    error!(peer = ?remote.peer, "dialog with invalid peer ignored: {e:#}");
                    continue;
                }
            };
            if !seen.insert(id) {
                continue;
            }
            if self.rules.admit(id, remote.kind) {
                out.push(AdmittedChat { id, remote, archived: false });
            }
        }

        if self.settings.include_archived {
            match self.conn.list_archived_chats().await {
                Ok(archived) => {
                    for remote in archived {
                        let Ok(id) = ChatId::from_peer(&remote.peer) else {
                            error!(peer = ?remote.peer, "archived dialog with invalid peer ignored");
                            continue;
                        };
                        // The regular listing wins for chats present in both.
                        if !seen.insert(id) {
                            continue;
                        }
                        if self.rules.admit(id, remote.kind) {
                            out.push(AdmittedChat { id, remote, archived: true });
                        }
                    }
                }
                Err(e) => warn!("listing archived chats failed, archived chats skipped this run: {e:#}"),
            }
        }

        for id in self.rules.explicit_ids() {
            if seen.contains(&id) {
                continue;
            }
            match self.conn.get_chat(&id.to_peer()).await {
                Ok(remote) => {
                    if ChatId::from_peer(&remote.peer).ok() != Some(id) {
                        warn!(chat_id = %id, peer = ?remote.peer, "source answered with a different chat, ignored");
                        continue;
                    }
                    if self.rules.admit(id, remote.kind) {
                        info!(chat_id = %id, "included chat missing from dialogs, fetched by id");
                        out.push(AdmittedChat { id, remote, archived: false });
                    }
                }
                Err(e)
                    if is_access_revoked(&e)
                        || matches!(classify(&e), Some(RemoteError::NotFound(_))) =>
                {
                    info!(chat_id = %id, "included chat unreachable, skipped: {e:#}");
                }
                Err(e) => warn!(chat_id = %id, "fetching included chat failed: {e:#}"),
            }
        }
        Ok(order_by_priority(out, &self.settings.priority))
    }

    pub async fn run_chats(
        &self,
        chats: Vec<AdmittedChat>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        let started = now_rfc3339()?;
        self.db
            .run(move |db| db.set_metadata("last_backup_time", &started))
            .await?;
        info!(chats = chats.len(), "crawler run starting");
        let results: Vec<ChatResult> = futures_util::stream::iter(chats)
            .map(|chat| {
                let shutdown = shutdown.clone();
                async move { self.backup_classified(&chat, &shutdown).await }
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for r in results {
            match r {
                ChatResult::Done(o) => {
                    summary.chats_processed += 1;
                    summary.messages_added += o.messages_added;
                    summary.messages_updated += o.messages_updated;
                    summary.media_added += o.media_added;
                }
                ChatResult::Skipped => summary.chats_skipped += 1,
                ChatResult::Failed(msg) => {
                    summary.chats_failed += 1;
                    summary.errors.push(msg);
                }
            }
        }
        summary.aborted = *shutdown.borrow();
        summary.statistics = self
            .db
            .run(|db| db.calculate_and_store_statistics())
            .await?;
        info!(
            processed = summary.chats_processed,
            skipped = summary.chats_skipped,
            failed = summary.chats_failed,
            added = summary.messages_added,
            updated = summary.messages_updated,
            media = summary.media_added,
            total_messages = summary.statistics.messages,
            "crawler run finished"
        );
        Ok(summary)
    }

    async fn backup_classified(&self, chat: &AdmittedChat, shutdown: &watch::Receiver<bool>) -> ChatResult {
        let id = chat.id;
        match self.backup_chat(chat, shutdown).await {
            Ok(o) => ChatResult::Done(o),
            Err(e) if is_access_revoked(&e) => {
                info!(chat_id = %id, "access revoked, chat skipped for this run: {e:#}");
                ChatResult::Skipped
            }
            Err(e) if normalize::is_integrity_violation(&e) => {
                error!(chat_id = %id, title = ?chat.remote.title, "invariant violation, chat aborted: {e:?}");
                ChatResult::Failed(format!("chat {id}: {e:#}"))
            }
            Err(e) => {
                warn!(chat_id = %id, "chat backup failed, will retry next run: {e:#}");
                ChatResult::Failed(format!("chat {id}: {e:#}"))
            }
        }
    }

    pub async fn backup_chat(
        &self,
        chat: &AdmittedChat,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ChatOutcome> {
        let id = chat.id;
        let peer = chat.remote.peer;
        let record = normalize::chat_record(&chat.remote)?;
        let backed_up_at = now_ms();
        let archived = chat.archived;
        let is_new = {
            let _lane = self.locks.lock(id).await;
            self.db
                .run(move |db| {
                    let is_new = db.chat_kind(record.id)?.is_none();
                    db.upsert_chat(&record, Some(backed_up_at))?;
                    db.set_archived(record.id, archived)?;
                    Ok(is_new)
                })
                .await?
        };
        let op = if is_new { ChangeOp::Insert } else { ChangeOp::Update };
        self.feed.publish(id, EntityKind::Chat, id.get(), op);

        let mut cursor = self.db.run(move |db| db.get_checkpoint(id)).await?;
        let mut outcome = ChatOutcome::default();
        let mut since_checkpoint = 0u32;
        let mut uncheckpointed = false;
        debug!(chat_id = %id, cursor, "backing up chat");

        loop {
            if *shutdown.borrow() {
                info!(chat_id = %id, "shutdown requested, stopping between batches");
                break;
            }
            let mut page = self
                .conn
                .fetch_messages(&peer, cursor, self.settings.batch_size)
                .await?;
            page.retain(|m| m.id > cursor);
            if page.is_empty() {
                break;
            }
            page.sort_by_key(|m| m.id);
            let max_id = page[page.len() - 1].id;
            let entries = self.normalize_batch(chat, &page).await?;

            since_checkpoint += 1;
            let checkpoint = (since_checkpoint >= self.settings.checkpoint_interval).then_some(max_id);
            let written = {
                let _lane = self.locks.lock(id).await;
                self.db
                    .run(move |db| db.write_batch(id, &entries, checkpoint))
                    .await?
            };
            cursor = max_id;
            if checkpoint.is_some() {
                since_checkpoint = 0;
                uncheckpointed = false;
            } else {
                uncheckpointed = true;
            }

            outcome.batches += 1;
            outcome.messages_added += written.inserted.len() as u64;
            outcome.messages_updated += written.updated.len() as u64;
            outcome.media_added += written.media_added.len() as u64;
            self.feed.publish_messages(id, &written.inserted, ChangeOp::Insert);
            self.feed.publish_messages(id, &written.updated, ChangeOp::Update);
            for mid in &written.media_added {
                self.feed.publish(id, EntityKind::Media, *mid, ChangeOp::Insert);
            }
            debug!(chat_id = %id, batch = outcome.batches, count = page.len(), last_id = max_id, "batch committed");
        }

        if uncheckpointed {
            self.db
                .run(move |db| db.advance_checkpoint(id, cursor))
                .await?;
        }
        outcome.last_message_id = cursor;

        if self.settings.sync_pinned && !*shutdown.borrow() {
            match self.conn.fetch_pinned_ids(&peer).await {
                Ok(ids) => {
                    let changed = {
                        let _lane = self.locks.lock(id).await;
                        self.db.run(move |db| db.sync_pinned(id, &ids)).await?
                    };
                    self.feed.publish_messages(id, &changed, ChangeOp::Update);
                }
                Err(e) if is_access_revoked(&e) => return Err(e),
                Err(e) => warn!(chat_id = %id, "pinned message sync failed: {e:#}"),
            }
        }

        if outcome.batches > 0 {
            info!(
                chat_id = %id,
                added = outcome.messages_added,
                updated = outcome.messages_updated,
                media = outcome.media_added,
                last_id = cursor,
                "chat backed up"
            );
        }
        Ok(outcome)
    }

    async fn normalize_batch(&self, chat: &AdmittedChat, page: &[RemoteMessage]) -> Result<Vec<MessageEntry>> {
        let mut out = Vec::with_capacity(page.len());
        for m in page {
            let message = normalize::message_record(chat.id, m)
                .with_context(|| format!("normalize message {} of chat {}", m.id, chat.id))?;
            let media = match &m.media {
                Some(remote) => Some(
                    self.media
                        .materialize(chat.id, &chat.remote.peer, m.id, normalize::media_record(remote))
                        .await?,
                ),
                None => None,
            };
            out.push(MessageEntry {
                message,
                sender: m.sender.as_ref().map(normalize::user_record),
                media,
                reactions: normalize::reaction_records(m),
            });
        }
        Ok(out)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_filter::ChatType;
    use crate::media_store::MediaSettings;
    use crate::test_support::*;
    use chatvault_protocol::{GroupKey, PeerKind, RemotePeer};

    fn settings(batch_size: u32, checkpoint_interval: u32) -> CrawlerSettings {
        CrawlerSettings {
            batch_size,
            checkpoint_interval,
            ..CrawlerSettings::default()
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn marked(chat: &RemoteChat) -> ChatId {
        ChatId::from_peer(&chat.peer).unwrap()
    }

    #[tokio::test]
    async fn backs_up_everything_and_checkpoints_last_id() {
        let env = Env::new(MediaSettings::default());
        let news = channel(10, "news");
        env.src.add_chat(news.clone());
        env.src.add_messages(news.peer, messages(1..=5));
        let crawler = env.crawler(FilterRules::all_types(), settings(2, 1));

        let summary = crawler.run(no_shutdown()).await.unwrap();
        let id = marked(&news);
        assert_eq!(summary.chats_processed, 1);
        assert_eq!(summary.messages_added, 5);
        assert_eq!(summary.statistics.messages, 5);
        assert_eq!(summary.statistics.chats, 1);
        assert_eq!(env.db.get_checkpoint(id).unwrap(), 5);
        assert!(env.db.get_metadata("last_backup_time").unwrap().is_some());
        assert_eq!(env.db.get_metadata("stats_messages").unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn second_run_only_fetches_newer_messages() {
        let env = Env::new(MediaSettings::default());
        let news = channel(10, "news");
        env.src.add_chat(news.clone());
        env.src.add_messages(news.peer, messages(1..=5));
        let crawler = env.crawler(FilterRules::all_types(), settings(100, 1));
        crawler.run(no_shutdown()).await.unwrap();

        env.src.add_messages(news.peer, messages(6..=8));
        let summary = crawler.run(no_shutdown()).await.unwrap();
        assert_eq!(summary.messages_added, 3);
        assert_eq!(summary.messages_updated, 0);
        assert_eq!(env.db.get_checkpoint(marked(&news)).unwrap(), 8);
    }

    #[tokio::test]
    async fn checkpoint_matches_last_committed_message_for_any_interval() {
        for interval in 1..=4 {
            let env = Env::new(MediaSettings::default());
            let news = channel(10, "news");
            env.src.add_chat(news.clone());
            env.src.add_messages(news.peer, messages(1..=7));
            let crawler = env.crawler(FilterRules::all_types(), settings(2, interval));
            crawler.run(no_shutdown()).await.unwrap();
            let id = marked(&news);
            let ids = env.db.message_ids(id).unwrap();
            assert_eq!(ids.last().copied(), Some(7));
            assert_eq!(env.db.get_checkpoint(id).unwrap(), 7, "interval {interval}");
        }
    }

    #[tokio::test]
    async fn rerun_after_failure_reprocesses_without_duplicates() {
        let env = Env::new(MediaSettings::default());
        let news = channel(10, "news");
        let id = marked(&news);
        env.src.add_chat(news.clone());
        env.src.add_messages(news.peer, messages(1..=5));
        // Two batches commit, the third fetch dies before any checkpoint.
        env.src
            .fail_fetch_after(news.peer, 2, RemoteError::Other("connection reset".into()));
        let crawler = env.crawler(FilterRules::all_types(), settings(2, 3));

        let first = crawler.run(no_shutdown()).await.unwrap();
        assert_eq!(first.chats_failed, 1);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(env.db.count_messages(id).unwrap(), 4);
        assert_eq!(env.db.get_checkpoint(id).unwrap(), 0);

        env.src.clear_fetch_failure(news.peer);
        let second = crawler.run(no_shutdown()).await.unwrap();
        assert_eq!(second.chats_processed, 1);
        assert_eq!(second.messages_added, 1);
        assert_eq!(second.messages_updated, 4);
        assert_eq!(env.db.message_ids(id).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(env.db.get_checkpoint(id).unwrap(), 5);
    }

    #[tokio::test]
    async fn revoked_chat_is_skipped_others_continue() {
        let env = Env::new(MediaSettings::default());
        let gone = channel(10, "gone");
        let kept = group(20, "kept");
        env.src.add_chat(gone.clone());
        env.src.add_chat(kept.clone());
        env.src.add_messages(gone.peer, messages(1..=3));
        env.src.add_messages(kept.peer, messages(1..=3));
        env.src.revoke(gone.peer);
        let crawler = env.crawler(FilterRules::all_types(), settings(10, 1));

        let summary = crawler.run(no_shutdown()).await.unwrap();
        assert_eq!(summary.chats_skipped, 1);
        assert_eq!(summary.chats_processed, 1);
        assert_eq!(summary.chats_failed, 0);
        assert_eq!(env.db.count_messages(marked(&kept)).unwrap(), 3);
        assert_eq!(env.db.count_messages(marked(&gone)).unwrap(), 0);
    }

    #[tokio::test]
    async fn filter_and_missing_includes() {
        let env = Env::new(MediaSettings::default());
        let team = group(1, "team");
        let listed = channel(2, "listed");
        let hidden = channel(999, "hidden");
        env.src.add_chat(team.clone());
        env.src.add_chat(listed.clone());
        env.src.add_hidden_chat(hidden.clone());
        let rules = FilterRules {
            chat_types: [ChatType::Groups].into_iter().collect(),
            channels_include: [marked(&hidden)].into_iter().collect(),
            ..FilterRules::default()
        };
        let crawler = env.crawler(rules, settings(10, 1));
        let admitted: Vec<ChatId> = crawler
            .admitted_chats()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(admitted, vec![marked(&team), marked(&hidden)]);
    }

    #[tokio::test]
    async fn archived_dialogs_are_backed_up_and_flagged() {
        let env = Env::new(MediaSettings::default());
        let team = group(1, "team");
        let old = group(2, "old team");
        let news = channel(3, "news");
        env.src.add_chat(team.clone());
        env.src.add_archived_chat(old.clone());
        env.src.add_archived_chat(team.clone());
        env.src.add_archived_chat(news.clone());
        env.src.add_messages(old.peer, messages(1..=3));
        let rules = FilterRules {
            chat_types: [ChatType::Groups].into_iter().collect(),
            ..FilterRules::default()
        };
        let crawler = env.crawler(rules.clone(), settings(10, 1));
        let summary = crawler.run(no_shutdown()).await.unwrap();

        assert_eq!(summary.chats_processed, 2);
        assert_eq!(env.db.count_messages(marked(&old)).unwrap(), 3);
        assert!(env.db.is_archived(marked(&old)).unwrap());
        // Present in both listings counts as not archived.
        assert!(!env.db.is_archived(marked(&team)).unwrap());
        assert!(env.db.chat_kind(marked(&news)).unwrap().is_none());

        let skip = CrawlerSettings {
            include_archived: false,
            ..settings(10, 1)
        };
        let admitted: Vec<ChatId> = env
            .crawler(rules, skip)
            .admitted_chats()
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(admitted, vec![marked(&team)]);
    }

    #[tokio::test]
    async fn unreachable_include_is_ignored() {
        let env = Env::new(MediaSettings::default());
        let rules = FilterRules {
            global_include: [ChatId::from_marked(-1000000000777).unwrap()]
                .into_iter()
                .collect(),
            ..FilterRules::all_types()
        };
        let crawler = env.crawler(rules, settings(10, 1));
        assert!(crawler.admitted_chats().await.unwrap().is_empty());
    }

    #[test]
    fn priority_first_then_source_order() {
        let mk = |id: i64| AdmittedChat {
            id: ChatId::from_marked(id).unwrap(),
            remote: group(id.abs(), "g"),
            archived: false,
        };
        let chats = vec![mk(-1), mk(-2), mk(-3), mk(-4)];
        let prio = vec![ChatId::from_marked(-3).unwrap(), ChatId::from_marked(-1).unwrap()];
        let got: Vec<i64> = order_by_priority(chats, &prio).iter().map(|c| c.id.get()).collect();
        assert_eq!(got, vec![-3, -1, -2, -4]);
    }

    #[tokio::test]
    async fn identical_media_in_two_chats_is_stored_once() {
        let env = Env::new(MediaSettings::default());
        let a = channel(1, "a");
        let b = channel(2, "b");
        env.src.add_chat(a.clone());
        env.src.add_chat(b.clone());
        let mut ma = message(1, "pic");
        ma.media = Some(photo("file-a", 5));
        let mut mb = message(1, "same pic");
        mb.media = Some(photo("file-b", 5));
        let mut mb2 = message(2, "forwarded again");
        mb2.media = Some(photo("file-a", 5));
        env.src.add_messages(a.peer, vec![ma]);
        env.src.add_messages(b.peer, vec![mb, mb2]);
        env.src.add_media_blob(a.peer, 1, b"bytes".to_vec());
        env.src.add_media_blob(b.peer, 1, b"bytes".to_vec());
        let crawler = env.crawler(FilterRules::all_types(), settings(10, 1));

        let summary = crawler.run(no_shutdown()).await.unwrap();
        assert_eq!(summary.media_added, 3);
        assert_eq!(summary.statistics.media_items, 3);
        assert_eq!(summary.statistics.media_objects, 1);
        // The second use of file-a is served from the archive.
        assert_eq!(env.src.download_calls(), 2);
        let ra = env.db.get_media(marked(&a), 1).unwrap().unwrap();
        let rb = env.db.get_media(marked(&b), 2).unwrap().unwrap();
        assert_eq!(ra.content_hash, rb.content_hash);
        assert!(env.store.path_for(ra.storage_key.as_deref().unwrap()).exists());
    }

    #[tokio::test]
    async fn oversized_and_skipped_media_stay_undownloaded() {
        let big = channel(1, "big");
        let quiet = channel(2, "quiet");
        let media = MediaSettings {
            max_size_bytes: 10,
            skip_chats: [marked(&quiet)].into_iter().collect(),
            ..MediaSettings::default()
        };
        let env = Env::new(media);
        env.src.add_chat(big.clone());
        env.src.add_chat(quiet.clone());
        let mut m = message(1, "video");
        m.media = Some(photo("huge", 11));
        env.src.add_messages(big.peer, vec![m]);
        let mut q = message(1, "small");
        q.media = Some(photo("tiny", 1));
        env.src.add_messages(quiet.peer, vec![q]);
        let crawler = env.crawler(FilterRules::all_types(), settings(10, 1));
        crawler.run(no_shutdown()).await.unwrap();

        for chat in [&big, &quiet] {
            let row = env.db.get_media(marked(chat), 1).unwrap().unwrap();
            assert!(!row.downloaded);
            assert!(row.content_hash.is_none());
        }
        assert_eq!(env.src.download_calls(), 0);
    }

    #[tokio::test]
    async fn album_keys_normalize_and_pins_sync() {
        let env = Env::new(MediaSettings::default());
        let news = channel(10, "news");
        env.src.add_chat(news.clone());
        let mut m1 = message(1, "a");
        m1.grouped_id = Some(GroupKey::Num(77));
        let mut m2 = message(2, "b");
        m2.grouped_id = Some(GroupKey::Text("77".into()));
        env.src.add_messages(news.peer, vec![m1, m2, message(3, "c")]);
        env.src.set_pinned(news.peer, vec![3]);
        let crawler = env.crawler(FilterRules::all_types(), settings(10, 1));
        crawler.run(no_shutdown()).await.unwrap();

        let id = marked(&news);
        assert_eq!(env.db.album_members(id, 77).unwrap(), vec![1, 2]);
        assert!(env.db.get_message(id, 3).unwrap().unwrap().pinned);
        assert!(!env.db.get_message(id, 1).unwrap().unwrap().pinned);
    }

    #[tokio::test]
    async fn bad_album_key_fails_only_that_chat() {
        let env = Env::new(MediaSettings::default());
        let bad = channel(1, "bad");
        let good = channel(2, "good");
        env.src.add_chat(bad.clone());
        env.src.add_chat(good.clone());
        let mut m = message(1, "x");
        m.grouped_id = Some(GroupKey::Text("not-a-number".into()));
        env.src.add_messages(bad.peer, vec![m]);
        env.src.add_messages(good.peer, messages(1..=2));
        let crawler = env.crawler(FilterRules::all_types(), settings(10, 1));

        let summary = crawler.run(no_shutdown()).await.unwrap();
        assert_eq!(summary.chats_failed, 1);
        assert_eq!(summary.chats_processed, 1);
        assert_eq!(env.db.get_checkpoint(marked(&bad)).unwrap(), 0);
        assert_eq!(env.db.count_messages(marked(&good)).unwrap(), 2);
    }

    #[tokio::test]
    async fn change_events_follow_commits() {
        let env = Env::new(MediaSettings::default());
        let news = channel(10, "news");
        env.src.add_chat(news.clone());
        env.src.add_messages(news.peer, messages(1..=3));
        let mut rx = env.feed.subscribe();
        let crawler = env.crawler(FilterRules::all_types(), settings(10, 1));
        crawler.run(no_shutdown()).await.unwrap();

        let chat_ev = rx.try_recv().unwrap();
        assert_eq!((chat_ev.entity, chat_ev.op), (EntityKind::Chat, ChangeOp::Insert));
        let mut inserted = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(ev.entity, EntityKind::Message);
            assert!(env.db.get_message(marked(&news), ev.entity_id).unwrap().is_some());
            inserted.push(ev.entity_id);
        }
        assert_eq!(inserted, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn shutdown_stops_before_fetching() {
        let env = Env::new(MediaSettings::default());
        let news = channel(10, "news");
        env.src.add_chat(news.clone());
        env.src.add_messages(news.peer, messages(1..=3));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let crawler = env.crawler(FilterRules::all_types(), settings(10, 1));
        let summary = crawler.run(rx).await.unwrap();
        assert!(summary.aborted);
        assert_eq!(env.src.fetch_calls(), 0);
        assert_eq!(summary.statistics.messages, 0);
    }

    #[tokio::test]
    async fn concurrent_chats_all_complete() {
        let env = Env::new(MediaSettings::default());
        for i in 1..=4 {
            let c = channel(i, "c");
            env.src.add_chat(c.clone());
            env.src.add_messages(c.peer, messages(1..=6));
        }
        let crawler = env.crawler(
            FilterRules::all_types(),
            CrawlerSettings {
                concurrency: 3,
                ..settings(4, 1)
            },
        );
        let summary = crawler.run(no_shutdown()).await.unwrap();
        assert_eq!(summary.chats_processed, 4);
        assert_eq!(summary.statistics.messages, 24);
        let id = ChatId::from_peer(&RemotePeer { kind: PeerKind::Channel, id: 3 }).unwrap();
        assert_eq!(env.db.get_checkpoint(id).unwrap(), 6);
    }
}
