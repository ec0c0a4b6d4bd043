/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use chatvault_protocol::{RemoteChat, RemoteEvent, RemoteMessage, RemotePeer};
use futures_util::stream::BoxStream;

/// Failure reported by the remote source, classified so callers can decide
/// between retry, skip and abort.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Chat became private, we were banned or kicked. Skip, never retry.
    #[error("access revoked for {peer:?}: {reason}")]
    AccessRevoked { peer: RemotePeer, reason: String },
    /// Flood wait, dropped connection, timeout.
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote failure: {0}")]
    Other(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Finds a [`RemoteError`] anywhere in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&RemoteError> {
    err.chain().find_map(|e| e.downcast_ref::<RemoteError>())
}

pub fn is_access_revoked(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(RemoteError::AccessRevoked { .. }))
}

pub type EventStream = BoxStream<'static, Result<RemoteEvent, RemoteError>>;

/// The chat service client. One instance is owned by the
/// [`RemoteConnection`](crate::connection::RemoteConnection) and shared by
/// the crawler and the listener through it.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn connect(&self) -> Result<(), RemoteError>;

    /// Dialog listing, most recently active first.
    async fn list_chats(&self) -> Result<Vec<RemoteChat>, RemoteError>;

    /// Dialogs the account moved to the archive folder. A chat may show up
    /// here and in [`RemoteSource::list_chats`] at the same time.
    async fn list_archived_chats(&self) -> Result<Vec<RemoteChat>, RemoteError>;

    async fn get_chat(&self, peer: &RemotePeer) -> Result<RemoteChat, RemoteError>;

    /// Messages with `id > after_id`, ascending by id, at most `limit`.
    async fn fetch_messages(
        &self,
        peer: &RemotePeer,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError>;

    async fn fetch_pinned_ids(&self, peer: &RemotePeer) -> Result<Vec<i64>, RemoteError>;

    async fn download_media(&self, peer: &RemotePeer, message_id: i64) -> Result<Vec<u8>, RemoteError>;

    /// Push event subscription. The stream ending means the connection is gone.
    async fn subscribe(&self) -> Result<EventStream, RemoteError>;
}
