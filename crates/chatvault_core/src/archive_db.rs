/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use chatvault_protocol::{ChangeOp, ChatAction, ChatKind};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::chat_id::ChatId;
use crate::mass_guard::PendingOp;

#[derive(Clone)]
pub struct ArchiveDb {
    path: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRecord {
    pub id: ChatId,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub participants_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub chat_id: ChatId,
    pub id: i64,
    pub date_ms: i64,
    pub edit_date_ms: Option<i64>,
    pub sender_id: Option<i64>,
    pub text: String,
    pub reply_to_msg_id: Option<i64>,
    pub reply_to_text: Option<String>,
    pub forward_from_id: Option<i64>,
    pub is_service: bool,
    pub is_outgoing: bool,
    pub pinned: bool,
    pub grouped_id: Option<i64>,
    pub raw_json: String,
}

/// One physical stored blob, shared by every media item with the same hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaObject {
    pub content_hash: String,
    pub storage_key: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRecord {
    pub kind: String,
    pub remote_file_id: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration: Option<i64>,
    /// `None` until the bytes are materialized.
    pub object: Option<MediaObject>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRecord {
    pub emoji: String,
    pub user_id: Option<i64>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub message: MessageRecord,
    pub sender: Option<UserRecord>,
    pub media: Option<MediaRecord>,
    pub reactions: Vec<ReactionRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: Vec<i64>,
    pub updated: Vec<i64>,
    /// Messages whose media got materialized by this batch.
    pub media_added: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRow {
    pub kind: String,
    pub remote_file_id: Option<String>,
    pub size: i64,
    pub content_hash: Option<String>,
    pub storage_key: Option<String>,
    pub downloaded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Statistics {
    pub chats: i64,
    pub messages: i64,
    pub media_items: i64,
    pub media_objects: i64,
    pub total_size: i64,
}

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial schema",
        apply: m001_initial,
    },
    Migration {
        version: 2,
        name: "message pinned flag",
        apply: m002_pinned,
    },
    Migration {
        version: 3,
        name: "chat timeline and album indexes",
        apply: m003_indexes,
    },
    Migration {
        version: 4,
        name: "chat archived flag",
        apply: m004_archived,
    },
];

const MESSAGE_KEYS: &[&str] = &["chat_id", "id"];
const MESSAGE_FIELDS: &[&str] = &[
    "date_ms",
    "edit_date_ms",
    "sender_id",
    "text",
    "reply_to_msg_id",
    "reply_to_text",
    "forward_from_id",
    "is_service",
    "is_outgoing",
    "pinned",
    "grouped_id",
    "raw_json",
];

const MEDIA_KEYS: &[&str] = &["chat_id", "message_id"];
const MEDIA_FIELDS: &[&str] = &[
    "kind",
    "remote_file_id",
    "file_name",
    "mime_type",
    "size",
    "width",
    "height",
    "duration",
    "content_hash",
    "downloaded",
];

const REACTION_SEQUENCE: &str = "reactions";

impl ArchiveDb {
    pub fn open(db_path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db dir: {}", parent.display()))?;
        }
        let db = Self { path, timeout };
        let mut conn = db.conn()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        migrate(&mut conn)?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(self.timeout)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    /// Runs `f` on the blocking pool, bounded by the configured timeout.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ArchiveDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        let timeout = self.timeout;
        let job = tokio::task::spawn_blocking(move || f(&db));
        match tokio::time::timeout(timeout, job).await {
            Ok(joined) => joined.context("database task panicked")?,
            Err(_) => bail!("database operation timed out after {}s", timeout.as_secs()),
        }
    }

    pub fn upsert_chat(&self, chat: &ChatRecord, backed_up_at_ms: Option<i64>) -> Result<()> {
        let conn = self.conn()?;
        let now = now_ms();
        conn.execute(
            r#"
            INSERT INTO chats (id, kind, title, username, first_name, last_name, participants_count,
                               created_at_ms, updated_at_ms, last_backup_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
              kind=excluded.kind,
              title=excluded.title,
              username=excluded.username,
              first_name=excluded.first_name,
              last_name=excluded.last_name,
              participants_count=excluded.participants_count,
              updated_at_ms=excluded.updated_at_ms,
              last_backup_at_ms=COALESCE(excluded.last_backup_at_ms, chats.last_backup_at_ms)
            "#,
            params![
                chat.id.get(),
                chat.kind.as_str(),
                chat.title,
                chat.username,
                chat.first_name,
                chat.last_name,
                chat.participants_count,
                now,
                backed_up_at_ms,
            ],
        )?;
        Ok(())
    }

    /// Inserts the chat only if it is unknown. Returns true when inserted.
    pub fn ensure_chat(&self, chat: &ChatRecord) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_ms();
        let n = conn.execute(
            r#"
            INSERT INTO chats (id, kind, title, username, first_name, last_name, participants_count,
                               created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                chat.id.get(),
                chat.kind.as_str(),
                chat.title,
                chat.username,
                chat.first_name,
                chat.last_name,
                chat.participants_count,
                now,
            ],
        )?;
        Ok(n > 0)
    }

    pub fn chat_kind(&self, chat: ChatId) -> Result<Option<ChatKind>> {
        let conn = self.conn()?;
        let kind: Option<String> = conn
            .query_row("SELECT kind FROM chats WHERE id=?1", params![chat.get()], |r| r.get(0))
            .optional()?;
        Ok(kind.and_then(|k| ChatKind::parse(&k)))
    }

    pub fn chat_title(&self, chat: ChatId) -> Result<Option<String>> {
        let conn = self.conn()?;
        let title: Option<Option<String>> = conn
            .query_row("SELECT title FROM chats WHERE id=?1", params![chat.get()], |r| r.get(0))
            .optional()?;
        Ok(title.flatten())
    }

    pub fn list_chat_ids(&self) -> Result<Vec<ChatId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM chats ORDER BY id")?;
        let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(ChatId::from_marked(r?)?);
        }
        Ok(out)
    }

    /// Returns true when the chat row changed.
    pub fn apply_chat_action(&self, chat: ChatId, action: &ChatAction) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_ms();
        let n = match action {
            ChatAction::Title { title } => conn.execute(
                "UPDATE chats SET title=?2, updated_at_ms=?3 WHERE id=?1",
                params![chat.get(), title, now],
            )?,
            ChatAction::Photo => conn.execute(
                "UPDATE chats SET updated_at_ms=?2 WHERE id=?1",
                params![chat.get(), now],
            )?,
            ChatAction::MemberJoined { .. } => conn.execute(
                "UPDATE chats SET participants_count=participants_count+1, updated_at_ms=?2
                 WHERE id=?1 AND participants_count IS NOT NULL",
                params![chat.get(), now],
            )?,
            ChatAction::MemberLeft { .. } => conn.execute(
                "UPDATE chats SET participants_count=MAX(participants_count-1, 0), updated_at_ms=?2
                 WHERE id=?1 AND participants_count IS NOT NULL",
                params![chat.get(), now],
            )?,
        };
        Ok(n > 0)
    }

    /// Commits one batch atomically: senders, messages, media, reactions and,
    /// when given, the chat checkpoint.
    pub fn write_batch(
        &self,
        chat: ChatId,
        entries: &[MessageEntry],
        checkpoint: Option<i64>,
    ) -> Result<BatchOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut out = BatchOutcome::default();
        let now = now_ms();
        let message_sql = upsert_sql("messages", MESSAGE_KEYS, MESSAGE_FIELDS);
        let media_sql = upsert_sql("media_items", MEDIA_KEYS, MEDIA_FIELDS);

        for entry in entries {
            let m = &entry.message;
            if m.chat_id != chat {
                bail!("message {} belongs to chat {}, not {}", m.id, m.chat_id, chat);
            }
            if let Some(u) = &entry.sender {
                tx.execute(
                    r#"
                    INSERT INTO users (id, username, first_name, last_name, is_bot, updated_at_ms)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(id) DO UPDATE SET
                      username=excluded.username,
                      first_name=excluded.first_name,
                      last_name=excluded.last_name,
                      is_bot=excluded.is_bot,
                      updated_at_ms=excluded.updated_at_ms
                    "#,
                    params![u.id, u.username, u.first_name, u.last_name, u.is_bot as i64, now],
                )?;
            }

            let existed = tx
                .query_row(
                    "SELECT 1 FROM messages WHERE chat_id=?1 AND id=?2",
                    params![chat.get(), m.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            tx.prepare_cached(&message_sql)?.execute(params![
                chat.get(),
                m.id,
                m.date_ms,
                m.edit_date_ms,
                m.sender_id,
                m.text,
                m.reply_to_msg_id,
                m.reply_to_text,
                m.forward_from_id,
                m.is_service as i64,
                m.is_outgoing as i64,
                m.pinned as i64,
                m.grouped_id,
                m.raw_json,
            ])?;
            if existed {
                out.updated.push(m.id);
            } else {
                out.inserted.push(m.id);
            }

            match &entry.media {
                Some(media) => {
                    let stored: Option<(bool, Option<String>, Option<String>)> = tx
                        .query_row(
                            "SELECT downloaded, remote_file_id, content_hash FROM media_items
                             WHERE chat_id=?1 AND message_id=?2",
                            params![chat.get(), m.id],
                            |r| Ok((r.get::<_, i64>(0)? != 0, r.get(1)?, r.get(2)?)),
                        )
                        .optional()?;
                    let was_downloaded = stored.as_ref().is_some_and(|s| s.0);
                    // A descriptor without bytes never demotes the same file already stored.
                    let kept_hash = match (&media.object, stored) {
                        (None, Some((true, Some(file_id), hash)))
                            if media.remote_file_id.as_deref() == Some(file_id.as_str()) =>
                        {
                            hash
                        }
                        _ => None,
                    };
                    if let Some(obj) = &media.object {
                        tx.execute(
                            r#"
                            INSERT INTO media_objects (content_hash, storage_key, size, created_at_ms)
                            VALUES (?1, ?2, ?3, ?4)
                            ON CONFLICT(content_hash) DO NOTHING
                            "#,
                            params![obj.content_hash, obj.storage_key, obj.size, now],
                        )?;
                    }
                    tx.prepare_cached(&media_sql)?.execute(params![
                        chat.get(),
                        m.id,
                        media.kind,
                        media.remote_file_id,
                        media.file_name,
                        media.mime_type,
                        media.size,
                        media.width,
                        media.height,
                        media.duration,
                        media
                            .object
                            .as_ref()
                            .map(|o| o.content_hash.as_str())
                            .or(kept_hash.as_deref()),
                        (media.object.is_some() || kept_hash.is_some()) as i64,
                    ])?;
                    if media.object.is_some() && !was_downloaded {
                        out.media_added.push(m.id);
                    }
                }
                None => {
                    tx.execute(
                        "DELETE FROM media_items WHERE chat_id=?1 AND message_id=?2",
                        params![chat.get(), m.id],
                    )?;
                }
            }

            tx.execute(
                "DELETE FROM reactions WHERE chat_id=?1 AND message_id=?2",
                params![chat.get(), m.id],
            )?;
            for r in &entry.reactions {
                insert_reaction(&tx, chat, m.id, r)?;
            }
        }

        if let Some(last_id) = checkpoint {
            advance_checkpoint_tx(&tx, chat, last_id, now)?;
        }
        tx.commit()?;
        Ok(out)
    }

    pub fn get_checkpoint(&self, chat: ChatId) -> Result<i64> {
        let conn = self.conn()?;
        let v: Option<i64> = conn
            .query_row(
                "SELECT last_message_id FROM sync_status WHERE chat_id=?1",
                params![chat.get()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v.unwrap_or(0))
    }

    /// Moves the cursor forward only; a lower value is ignored.
    pub fn advance_checkpoint(&self, chat: ChatId, last_message_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        advance_checkpoint_tx(&tx, chat, last_message_id, now_ms())?;
        tx.commit()?;
        Ok(())
    }

    /// Applies rate-limited operations in order, in one transaction. Returns
    /// the operations that actually changed a row.
    pub fn apply_ops(&self, chat: ChatId, ops: &[PendingOp]) -> Result<Vec<(i64, ChangeOp)>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = Vec::new();
        for op in ops {
            match op {
                PendingOp::Delete { message_id } => {
                    let n = tx.execute(
                        "DELETE FROM messages WHERE chat_id=?1 AND id=?2",
                        params![chat.get(), message_id],
                    )?;
                    if n > 0 {
                        changed.push((*message_id, ChangeOp::Delete));
                    }
                }
                PendingOp::Edit {
                    message_id,
                    text,
                    edit_date_ms,
                } => {
                    let n = tx.execute(
                        "UPDATE messages SET text=?3, edit_date_ms=COALESCE(?4, edit_date_ms)
                         WHERE chat_id=?1 AND id=?2",
                        params![chat.get(), message_id, text, edit_date_ms],
                    )?;
                    if n > 0 {
                        changed.push((*message_id, ChangeOp::Update));
                    }
                }
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Sets `pinned` on the listed messages. Returns the ids that changed.
    pub fn set_pinned(&self, chat: ChatId, message_ids: &[i64], pinned: bool) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = Vec::new();
        for id in message_ids {
            let n = tx.execute(
                "UPDATE messages SET pinned=?3 WHERE chat_id=?1 AND id=?2 AND pinned<>?3",
                params![chat.get(), id, pinned as i64],
            )?;
            if n > 0 {
                changed.push(*id);
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Makes the set of pinned messages equal `pinned_ids`. Returns the ids
    /// whose flag flipped.
    pub fn sync_pinned(&self, chat: ChatId, pinned_ids: &[i64]) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let wanted: BTreeSet<i64> = pinned_ids.iter().copied().collect();
        let current: BTreeSet<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM messages WHERE chat_id=?1 AND pinned=1")?;
            let rows = stmt.query_map(params![chat.get()], |r| r.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut changed = Vec::new();
        for id in current.difference(&wanted) {
            tx.execute(
                "UPDATE messages SET pinned=0 WHERE chat_id=?1 AND id=?2",
                params![chat.get(), id],
            )?;
            changed.push(*id);
        }
        for id in wanted.difference(&current) {
            let n = tx.execute(
                "UPDATE messages SET pinned=1 WHERE chat_id=?1 AND id=?2",
                params![chat.get(), id],
            )?;
            if n > 0 {
                changed.push(*id);
            }
        }
        tx.commit()?;
        changed.sort_unstable();
        Ok(changed)
    }

    /// A stored object already holding the bytes of this remote file, if any.
    pub fn known_file_object(&self, remote_file_id: &str) -> Result<Option<MediaObject>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT o.content_hash, o.storage_key, o.size
            FROM media_items i
            JOIN media_objects o ON o.content_hash = i.content_hash
            WHERE i.remote_file_id=?1 AND i.downloaded=1
            LIMIT 1
            "#,
            params![remote_file_id],
            |r| {
                Ok(MediaObject {
                    content_hash: r.get(0)?,
                    storage_key: r.get(1)?,
                    size: r.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_message(&self, chat: ChatId, id: i64) -> Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT date_ms, edit_date_ms, sender_id, text, reply_to_msg_id, reply_to_text,
                   forward_from_id, is_service, is_outgoing, pinned, grouped_id, raw_json
            FROM messages WHERE chat_id=?1 AND id=?2
            "#,
            params![chat.get(), id],
            |r| {
                Ok(MessageRecord {
                    chat_id: chat,
                    id,
                    date_ms: r.get(0)?,
                    edit_date_ms: r.get(1)?,
                    sender_id: r.get(2)?,
                    text: r.get(3)?,
                    reply_to_msg_id: r.get(4)?,
                    reply_to_text: r.get(5)?,
                    forward_from_id: r.get(6)?,
                    is_service: r.get::<_, i64>(7)? != 0,
                    is_outgoing: r.get::<_, i64>(8)? != 0,
                    pinned: r.get::<_, i64>(9)? != 0,
                    grouped_id: r.get(10)?,
                    raw_json: r.get(11)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_media(&self, chat: ChatId, message_id: i64) -> Result<Option<MediaRow>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT i.kind, i.remote_file_id, i.size, i.content_hash, o.storage_key, i.downloaded
            FROM media_items i
            LEFT JOIN media_objects o ON o.content_hash = i.content_hash
            WHERE i.chat_id=?1 AND i.message_id=?2
            "#,
            params![chat.get(), message_id],
            |r| {
                Ok(MediaRow {
                    kind: r.get(0)?,
                    remote_file_id: r.get(1)?,
                    size: r.get(2)?,
                    content_hash: r.get(3)?,
                    storage_key: r.get(4)?,
                    downloaded: r.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Only the crawler knows which folder a chat is listed in.
    pub fn set_archived(&self, chat: ChatId, archived: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE chats SET is_archived=?2 WHERE id=?1",
            params![chat.get(), archived as i64],
        )?;
        Ok(())
    }

    pub fn is_archived(&self, chat: ChatId) -> Result<bool> {
        let conn = self.conn()?;
        let v: Option<i64> = conn
            .query_row("SELECT is_archived FROM chats WHERE id=?1", params![chat.get()], |r| r.get(0))
            .optional()?;
        Ok(v.unwrap_or(0) != 0)
    }

    pub fn list_media_objects(&self) -> Result<Vec<MediaObject>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT content_hash, storage_key, size FROM media_objects ORDER BY created_at_ms, content_hash",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(MediaObject {
                content_hash: r.get(0)?,
                storage_key: r.get(1)?,
                size: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Messages whose downloaded media points at `content_hash`, oldest first.
    pub fn media_references(&self, content_hash: &str) -> Result<Vec<(ChatId, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT chat_id, message_id FROM media_items
             WHERE content_hash=?1 AND downloaded=1 ORDER BY chat_id, message_id",
        )?;
        let rows = stmt.query_map(params![content_hash], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
        let mut out = Vec::new();
        for r in rows {
            let (chat, message_id) = r?;
            out.push((ChatId::from_marked(chat)?, message_id));
        }
        Ok(out)
    }

    pub fn list_reactions(&self, chat: ChatId, message_id: i64) -> Result<Vec<(i64, ReactionRecord)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, emoji, user_id, count FROM reactions
             WHERE chat_id=?1 AND message_id=?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![chat.get(), message_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                ReactionRecord {
                    emoji: r.get(1)?,
                    user_id: r.get(2)?,
                    count: r.get(3)?,
                },
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn count_messages(&self, chat: ChatId) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id=?1",
            params![chat.get()],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    pub fn message_ids(&self, chat: ChatId) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM messages WHERE chat_id=?1 ORDER BY id")?;
        let rows = stmt.query_map(params![chat.get()], |r| r.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Members of one album, in id order.
    pub fn album_members(&self, chat: ChatId, grouped_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id FROM messages WHERE chat_id=?1 AND grouped_id=?2 ORDER BY id")?;
        let rows = stmt.query_map(params![chat.get(), grouped_id], |r| r.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM metadata WHERE key=?1", params![key], |r| r.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metadata(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Aggregates straight from the tables, never from cached values.
    pub fn compute_statistics(&self) -> Result<Statistics> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT (SELECT COUNT(*) FROM chats),
                   (SELECT COUNT(*) FROM messages),
                   (SELECT COUNT(*) FROM media_items),
                   (SELECT COUNT(*) FROM media_objects),
                   (SELECT COALESCE(SUM(size), 0) FROM media_objects)
            "#,
            [],
            |r| {
                Ok(Statistics {
                    chats: r.get(0)?,
                    messages: r.get(1)?,
                    media_items: r.get(2)?,
                    media_objects: r.get(3)?,
                    total_size: r.get(4)?,
                })
            },
        )
        .map_err(Into::into)
    }

    pub fn calculate_and_store_statistics(&self) -> Result<Statistics> {
        let stats = self.compute_statistics()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (key, value) in [
            ("stats_chats", stats.chats.to_string()),
            ("stats_messages", stats.messages.to_string()),
            ("stats_media_items", stats.media_items.to_string()),
            ("stats_media_objects", stats.media_objects.to_string()),
            ("stats_total_size", stats.total_size.to_string()),
            ("stats_computed_at", now_rfc3339()?),
        ] {
            tx.execute(
                "INSERT INTO metadata(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(stats)
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    // IMMEDIATE takes the write lock up front; a second instance starting at
    // the same time waits here and then sees the finished schema.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )?;
    let current: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )?;
    for m in MIGRATIONS.iter().filter(|m| m.version > current) {
        (m.apply)(&tx).with_context(|| format!("migration {} ({})", m.version, m.name))?;
        tx.execute(
            "INSERT INTO schema_migrations(version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
            params![m.version, m.name, now_ms()],
        )?;
        info!(version = m.version, name = m.name, "applied schema migration");
    }
    tx.commit()?;
    Ok(())
}

fn m001_initial(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chats (
          id INTEGER PRIMARY KEY,
          kind TEXT NOT NULL,
          title TEXT NULL,
          username TEXT NULL,
          first_name TEXT NULL,
          last_name TEXT NULL,
          participants_count INTEGER NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          last_backup_at_ms INTEGER NULL
        );

        CREATE TABLE IF NOT EXISTS users (
          id INTEGER PRIMARY KEY,
          username TEXT NULL,
          first_name TEXT NULL,
          last_name TEXT NULL,
          is_bot INTEGER NOT NULL DEFAULT 0,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
          chat_id INTEGER NOT NULL REFERENCES chats(id),
          id INTEGER NOT NULL,
          date_ms INTEGER NOT NULL,
          edit_date_ms INTEGER NULL,
          sender_id INTEGER NULL,
          text TEXT NOT NULL,
          reply_to_msg_id INTEGER NULL,
          reply_to_text TEXT NULL,
          forward_from_id INTEGER NULL,
          is_service INTEGER NOT NULL DEFAULT 0,
          is_outgoing INTEGER NOT NULL DEFAULT 0,
          grouped_id INTEGER NULL,
          raw_json TEXT NOT NULL DEFAULT '{}',
          PRIMARY KEY (chat_id, id)
        );

        CREATE TABLE IF NOT EXISTS media_objects (
          content_hash TEXT PRIMARY KEY,
          storage_key TEXT NOT NULL,
          size INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS media_items (
          chat_id INTEGER NOT NULL,
          message_id INTEGER NOT NULL,
          kind TEXT NOT NULL,
          remote_file_id TEXT NULL,
          file_name TEXT NULL,
          mime_type TEXT NULL,
          size INTEGER NOT NULL DEFAULT 0,
          width INTEGER NULL,
          height INTEGER NULL,
          duration INTEGER NULL,
          content_hash TEXT NULL REFERENCES media_objects(content_hash),
          downloaded INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY (chat_id, message_id),
          FOREIGN KEY (chat_id, message_id) REFERENCES messages(chat_id, id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_media_items_file ON media_items(remote_file_id);

        CREATE TABLE IF NOT EXISTS reactions (
          id INTEGER PRIMARY KEY,
          chat_id INTEGER NOT NULL,
          message_id INTEGER NOT NULL,
          emoji TEXT NOT NULL,
          user_id INTEGER NULL,
          count INTEGER NOT NULL DEFAULT 1,
          FOREIGN KEY (chat_id, message_id) REFERENCES messages(chat_id, id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(chat_id, message_id);

        CREATE TABLE IF NOT EXISTS sync_status (
          chat_id INTEGER PRIMARY KEY REFERENCES chats(id),
          last_message_id INTEGER NOT NULL,
          last_sync_ms INTEGER NOT NULL,
          message_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS id_sequences (
          name TEXT PRIMARY KEY,
          next_value INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn m002_pinned(conn: &Connection) -> Result<()> {
    ensure_columns(conn, "messages", &[("pinned", "INTEGER NOT NULL DEFAULT 0")])
}

fn m003_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_chat_date ON messages(chat_id, date_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_album ON messages(chat_id, grouped_id)
          WHERE grouped_id IS NOT NULL;
        "#,
    )?;
    Ok(())
}

fn m004_archived(conn: &Connection) -> Result<()> {
    ensure_columns(conn, "chats", &[("is_archived", "INTEGER NOT NULL DEFAULT 0")])
}

fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for r in rows {
        existing.insert(r?);
    }
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}

/// `INSERT ... ON CONFLICT DO UPDATE` where the update path assigns exactly
/// the non-key columns the insert path writes.
fn upsert_sql(table: &str, keys: &[&str], fields: &[&str]) -> String {
    let cols: Vec<&str> = keys.iter().chain(fields.iter()).copied().collect();
    let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = fields.iter().map(|f| format!("{f}=excluded.{f}")).collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
        cols.join(", "),
        placeholders.join(", "),
        keys.join(", "),
        updates.join(", ")
    )
}

fn advance_checkpoint_tx(tx: &Transaction<'_>, chat: ChatId, last_message_id: i64, now: i64) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO sync_status (chat_id, last_message_id, last_sync_ms, message_count)
        VALUES (?1, ?2, ?3, (SELECT COUNT(*) FROM messages WHERE chat_id=?1))
        ON CONFLICT(chat_id) DO UPDATE SET
          last_message_id=MAX(sync_status.last_message_id, excluded.last_message_id),
          last_sync_ms=excluded.last_sync_ms,
          message_count=excluded.message_count
        "#,
        params![chat.get(), last_message_id, now],
    )?;
    Ok(())
}

fn insert_reaction(tx: &Transaction<'_>, chat: ChatId, message_id: i64, r: &ReactionRecord) -> Result<()> {
    for attempt in 0..2 {
        let id = next_sequence_value(tx, REACTION_SEQUENCE)?;
        let res = tx.execute(
            "INSERT INTO reactions (id, chat_id, message_id, emoji, user_id, count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, chat.get(), message_id, r.emoji, r.user_id, r.count],
        );
        match res {
            Ok(_) => return Ok(()),
            Err(e) if attempt == 0 && is_primary_key_violation(&e) => {
                warn!(sequence = REACTION_SEQUENCE, id, "id sequence drifted behind table, resyncing");
                resync_sequence(tx, REACTION_SEQUENCE, "reactions")?;
            }
            Err(e) => return Err(e).context("insert reaction"),
        }
    }
    bail!("reaction id sequence still colliding after resync")
}

fn next_sequence_value(tx: &Transaction<'_>, name: &str) -> Result<i64> {
    tx.execute(
        "INSERT INTO id_sequences(name, next_value) VALUES (?1, 1) ON CONFLICT(name) DO NOTHING",
        params![name],
    )?;
    let v = tx.query_row(
        "UPDATE id_sequences SET next_value=next_value+1 WHERE name=?1 RETURNING next_value-1",
        params![name],
        |r| r.get(0),
    )?;
    Ok(v)
}

fn resync_sequence(tx: &Transaction<'_>, name: &str, table: &str) -> Result<()> {
    tx.execute(
        &format!(
            "UPDATE id_sequences SET next_value=(SELECT COALESCE(MAX(id), 0) + 1 FROM {table})
             WHERE name=?1"
        ),
        params![name],
    )?;
    Ok(())
}

fn is_primary_key_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn now_rfc3339() -> Result<String> {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("format timestamp")
}
