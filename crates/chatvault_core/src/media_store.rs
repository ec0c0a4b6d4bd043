/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::archive_db::MediaObject;
use crate::chat_id::ChatId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSettings {
    pub download: bool,
    pub max_size_bytes: u64,
    pub skip_chats: BTreeSet<ChatId>,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            download: true,
            max_size_bytes: 100 * 1024 * 1024,
            skip_chats: BTreeSet::new(),
        }
    }
}

impl MediaSettings {
    pub fn enabled_for(&self, chat: ChatId) -> bool {
        self.download && !self.skip_chats.contains(&chat)
    }

    pub fn within_limit(&self, size: i64) -> bool {
        size.max(0) as u64 <= self.max_size_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub object: MediaObject,
    /// False when another writer had already materialized these bytes.
    pub created: bool,
}

/// Content-addressed blob storage. Identical bytes always map to one object.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<PutOutcome>;
    /// Byte length of the stored object, `None` when it is gone.
    async fn stored_size(&self, storage_key: &str) -> Result<Option<u64>>;
    /// Removes a damaged object so the next `put` writes it again.
    async fn discard(&self, storage_key: &str) -> Result<()>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn storage_key(hash: &str) -> String {
    format!("_shared/{}/{hash}", &hash[..2])
}

pub struct LocalMediaStore {
    root: PathBuf,
}

impl LocalMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, storage_key: &str) -> PathBuf {
        self.root.join(storage_key)
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn put(&self, bytes: &[u8]) -> Result<PutOutcome> {
        let hash = content_hash(bytes);
        let key = storage_key(&hash);
        let object = MediaObject {
            content_hash: hash.clone(),
            storage_key: key.clone(),
            size: bytes.len() as i64,
        };
        let path = self.path_for(&key);
        if path.exists() {
            return Ok(PutOutcome { object, created: false });
        }
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("create media dir: {}", dir.display()))?;

        // Write aside, then link into place: the first link wins and nobody
        // ever observes a half-written object.
        let tmp = dir.join(format!(".{hash}.{:016x}.tmp", OsRng.next_u64()));
        std::fs::write(&tmp, bytes).with_context(|| format!("write media temp: {}", tmp.display()))?;
        let created = match std::fs::hard_link(&tmp, &path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(_) => {
                std::fs::rename(&tmp, &path).context("move media into place")?;
                return Ok(PutOutcome { object, created: true });
            }
        };
        let _ = std::fs::remove_file(&tmp);
        Ok(PutOutcome { object, created })
    }

    async fn stored_size(&self, storage_key: &str) -> Result<Option<u64>> {
        let path = self.path_for(storage_key);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat media {}", path.display())),
        }
    }

    async fn discard(&self, storage_key: &str) -> Result<()> {
        let path = self.path_for(storage_key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove media {}", path.display())),
        }
    }
}

/// Guesses a mime type from a file name when the source did not send one.
pub fn guess_mime(file_name: Option<&str>) -> Option<String> {
    let name = file_name?;
    mime_guess::from_path(Path::new(name))
        .first()
        .map(|m| m.to_string())
}
