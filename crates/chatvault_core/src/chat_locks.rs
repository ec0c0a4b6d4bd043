/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

use crate::chat_id::ChatId;

/// One write lane per chat, shared by crawler, listener and the mass
/// operation guard. Chats never wait on each other.
#[derive(Default)]
pub struct ChatLocks {
    lanes: Mutex<HashMap<ChatId, Arc<TokioMutex<()>>>>,
}

impl ChatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, chat: ChatId) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes.entry(chat).or_default().clone()
        };
        lane.lock_owned().await
    }
}
