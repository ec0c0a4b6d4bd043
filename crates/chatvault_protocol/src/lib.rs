/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Objects exchanged with the collaborators around the sync engine: what the
//! remote-source client hands us, and what we hand to viewers after a commit.
//! Ids in this crate are always *source-native*; the engine normalizes them
//! into marked form exactly once, on ingestion.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    User,
    BasicGroup,
    Channel,
}

/// Source-native peer reference (`id` is always positive).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemotePeer {
    pub kind: PeerKind,
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Bot,
    Group,
    Channel,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Bot => "bot",
            ChatKind::Group => "group",
            ChatKind::Channel => "channel",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "private" => Some(Self::Private),
            "bot" => Some(Self::Bot),
            "group" => Some(Self::Group),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteChat {
    pub peer: RemotePeer,
    pub kind: ChatKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub participants_count: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

/// Album key as the client library reports it. Some clients hand out the
/// number, some its decimal string.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum GroupKey {
    Num(i64),
    Text(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteMedia {
    /// "photo", "video", "animation", "audio", "voice", "sticker", "document", ...
    pub kind: String,
    /// Stable id of the file on the remote side (same bytes, same id).
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub duration: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteReaction {
    pub emoji: String,
    pub count: i64,
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteMessage {
    pub id: i64,
    pub date_ms: i64,
    #[serde(default)]
    pub edit_date_ms: Option<i64>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub sender: Option<RemoteUser>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub reply_to_msg_id: Option<i64>,
    #[serde(default)]
    pub reply_to_text: Option<String>,
    #[serde(default)]
    pub forward_from_id: Option<i64>,
    #[serde(default)]
    pub forward_from_name: Option<String>,
    #[serde(default)]
    pub post_author: Option<String>,
    #[serde(default)]
    pub is_service: bool,
    #[serde(default)]
    pub outgoing: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub grouped_id: Option<GroupKey>,
    #[serde(default)]
    pub media: Option<RemoteMedia>,
    #[serde(default)]
    pub reactions: Vec<RemoteReaction>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatAction {
    Title { title: String },
    Photo,
    MemberJoined { user_id: i64 },
    MemberLeft { user_id: i64 },
}

/// Push notifications delivered by the event subscription.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RemoteEvent {
    NewMessage {
        chat: RemoteChat,
        message: RemoteMessage,
    },
    Edit {
        peer: RemotePeer,
        message_id: i64,
        text: String,
        #[serde(default)]
        edit_date_ms: Option<i64>,
    },
    Delete {
        peer: RemotePeer,
        message_ids: Vec<i64>,
    },
    ChatAction {
        chat: RemoteChat,
        action: ChatAction,
    },
    PinChange {
        peer: RemotePeer,
        message_ids: Vec<i64>,
        pinned: bool,
    },
}

impl RemoteEvent {
    pub fn peer(&self) -> RemotePeer {
        match self {
            RemoteEvent::NewMessage { chat, .. } | RemoteEvent::ChatAction { chat, .. } => chat.peer,
            RemoteEvent::Edit { peer, .. }
            | RemoteEvent::Delete { peer, .. }
            | RemoteEvent::PinChange { peer, .. } => *peer,
        }
    }

    /// Chat descriptor carried by the event, if the source sent one.
    pub fn chat(&self) -> Option<&RemoteChat> {
        match self {
            RemoteEvent::NewMessage { chat, .. } | RemoteEvent::ChatAction { chat, .. } => Some(chat),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteEvent::NewMessage { .. } => "new_message",
            RemoteEvent::Edit { .. } => "edit",
            RemoteEvent::Delete { .. } => "delete",
            RemoteEvent::ChatAction { .. } => "chat_action",
            RemoteEvent::PinChange { .. } => "pin_change",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Chat,
    Message,
    Media,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Normalized change notification for viewers. `chat_id` is the marked id;
/// `entity_id` is the chat id for chats and the message id otherwise.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChangeEvent {
    pub chat_id: i64,
    pub entity: EntityKind,
    pub entity_id: i64,
    pub op: ChangeOp,
    pub ts_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_uses_tagged_variants() {
        let raw = r#"{"event":"delete","peer":{"kind":"channel","id":42},"message_ids":[1,2]}"#;
        let ev: RemoteEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.name(), "delete");
        assert_eq!(ev.peer(), RemotePeer { kind: PeerKind::Channel, id: 42 });
        assert!(ev.chat().is_none());
    }

    #[test]
    fn group_key_accepts_number_or_string() {
        let n: GroupKey = serde_json::from_str("13").unwrap();
        let s: GroupKey = serde_json::from_str("\"13\"").unwrap();
        assert_eq!(n, GroupKey::Num(13));
        assert_eq!(s, GroupKey::Text("13".to_string()));
    }

    #[test]
    fn chat_action_round_trips_through_json() {
        let ev = RemoteEvent::ChatAction {
            chat: RemoteChat {
                peer: RemotePeer { kind: PeerKind::BasicGroup, id: 7 },
                kind: ChatKind::Group,
                title: Some("old".into()),
                username: None,
                first_name: None,
                last_name: None,
                participants_count: None,
            },
            action: ChatAction::Title { title: "new".into() },
        };
        let text = serde_json::to_string(&ev).unwrap();
        assert!(text.contains("\"event\":\"chat_action\""));
        assert!(text.contains("\"type\":\"title\""));
        let back: RemoteEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ev);
    }
}
