/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub use chatvault_protocol::{ChangeEvent, ChangeOp, EntityKind};
use tokio::sync::broadcast;

use crate::chat_id::ChatId;

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn change(chat: ChatId, entity: EntityKind, entity_id: i64, op: ChangeOp) -> ChangeEvent {
    ChangeEvent {
        chat_id: chat.get(),
        entity,
        entity_id,
        op,
        ts_ms: now_ms_u64(),
    }
}

/// Fan-out to viewers. Callers publish only after the write committed;
/// having no subscribers is fine.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, chat: ChatId, entity: EntityKind, entity_id: i64, op: ChangeOp) {
        let _ = self.tx.send(change(chat, entity, entity_id, op));
    }

    pub fn publish_messages(&self, chat: ChatId, ids: &[i64], op: ChangeOp) {
        for id in ids {
            self.publish(chat, EntityKind::Message, *id, op);
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}
