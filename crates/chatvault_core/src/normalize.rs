/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Remote objects to archive records. Chat ids are marked here and nowhere
//! else.

use anyhow::Result;
use chatvault_protocol::{GroupKey, RemoteChat, RemoteMedia, RemoteMessage, RemoteUser};
use serde_json::{json, Map, Value};

use crate::archive_db::{ChatRecord, MediaRecord, MessageRecord, ReactionRecord, UserRecord};
use crate::chat_id::ChatId;
use crate::media_store::guess_mime;

const REPLY_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("album key {0:?} is not a decimal integer")]
    MixedGroupKey(String),
    #[error("message {message_id} has a non-positive id in chat {chat}")]
    BadMessageId { chat: ChatId, message_id: i64 },
}

pub fn is_integrity_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<IntegrityError>())
}

pub fn chat_record(chat: &RemoteChat) -> Result<ChatRecord> {
    Ok(ChatRecord {
        id: ChatId::from_peer(&chat.peer)?,
        kind: chat.kind,
        title: chat.title.clone(),
        username: chat.username.clone(),
        first_name: chat.first_name.clone(),
        last_name: chat.last_name.clone(),
        participants_count: chat.participants_count,
    })
}

pub fn user_record(user: &RemoteUser) -> UserRecord {
    UserRecord {
        id: user.id,
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        is_bot: user.is_bot,
    }
}

/// Album keys compare as integers; `13` and `"13"` are the same album.
pub fn group_key(key: &GroupKey) -> Result<i64, IntegrityError> {
    match key {
        GroupKey::Num(n) => Ok(*n),
        GroupKey::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| IntegrityError::MixedGroupKey(s.clone())),
    }
}

pub fn message_record(chat: ChatId, msg: &RemoteMessage) -> Result<MessageRecord> {
    if msg.id <= 0 {
        return Err(IntegrityError::BadMessageId {
            chat,
            message_id: msg.id,
        }
        .into());
    }
    let grouped_id = msg.grouped_id.as_ref().map(group_key).transpose()?;

    let mut raw = Map::new();
    if let Some(name) = &msg.forward_from_name {
        raw.insert("forward_from_name".into(), json!(name));
    }
    if let Some(author) = &msg.post_author {
        raw.insert("post_author".into(), json!(author));
    }
    if let Some(media) = &msg.media {
        raw.insert("media_kind".into(), json!(media.kind));
    }

    Ok(MessageRecord {
        chat_id: chat,
        id: msg.id,
        date_ms: msg.date_ms,
        edit_date_ms: msg.edit_date_ms,
        sender_id: msg.sender_id.or_else(|| msg.sender.as_ref().map(|u| u.id)),
        text: msg.text.clone(),
        reply_to_msg_id: msg.reply_to_msg_id,
        reply_to_text: msg
            .reply_to_text
            .as_deref()
            .map(|t| t.chars().take(REPLY_PREVIEW_CHARS).collect()),
        forward_from_id: msg.forward_from_id,
        is_service: msg.is_service,
        is_outgoing: msg.outgoing,
        pinned: msg.pinned,
        grouped_id,
        raw_json: Value::Object(raw).to_string(),
    })
}

/// Descriptor only; bytes are attached later by the media ingest step.
pub fn media_record(media: &RemoteMedia) -> MediaRecord {
    MediaRecord {
        kind: media.kind.clone(),
        remote_file_id: media.file_id.clone(),
        file_name: media.file_name.clone(),
        mime_type: media
            .mime_type
            .clone()
            .or_else(|| guess_mime(media.file_name.as_deref())),
        size: media.size.max(0),
        width: media.width,
        height: media.height,
        duration: media.duration,
        object: None,
    }
}

/// One row per known reacting user, plus one anonymous row for the rest of
/// the count.
pub fn reaction_records(msg: &RemoteMessage) -> Vec<ReactionRecord> {
    let mut out = Vec::new();
    for r in &msg.reactions {
        for uid in &r.user_ids {
            out.push(ReactionRecord {
                emoji: r.emoji.clone(),
                user_id: Some(*uid),
                count: 1,
            });
        }
        let rest = r.count - r.user_ids.len() as i64;
        if rest > 0 {
            out.push(ReactionRecord {
                emoji: r.emoji.clone(),
                user_id: None,
                count: rest,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use chatvault_protocol::{ChatKind, PeerKind, RemotePeer, RemoteReaction};

    fn msg(id: i64) -> RemoteMessage {
        RemoteMessage {
            id,
            date_ms: 1000,
            edit_date_ms: None,
            sender_id: None,
            sender: Some(RemoteUser {
                id: 9,
                username: None,
                first_name: Some("Bo".into()),
                last_name: None,
                is_bot: false,
            }),
            text: "hi".into(),
            reply_to_msg_id: None,
            reply_to_text: Some("x".repeat(300)),
            forward_from_id: None,
            forward_from_name: Some("Someone".into()),
            post_author: None,
            is_service: false,
            outgoing: false,
            pinned: false,
            grouped_id: None,
            media: None,
            reactions: vec![],
        }
    }

    fn chat() -> ChatId {
        ChatId::from_marked(-100777).unwrap()
    }

    #[test]
    fn numeric_and_text_group_keys_match() {
        let mut a = msg(1);
        a.grouped_id = Some(GroupKey::Num(13));
        let mut b = msg(2);
        b.grouped_id = Some(GroupKey::Text(" 13".into()));
        let ra = message_record(chat(), &a).unwrap();
        let rb = message_record(chat(), &b).unwrap();
        assert_eq!(ra.grouped_id, Some(13));
        assert_eq!(ra.grouped_id, rb.grouped_id);
    }

    #[test]
    fn non_numeric_group_key_is_an_integrity_error() {
        let mut a = msg(1);
        a.grouped_id = Some(GroupKey::Text("album-x".into()));
        let err = message_record(chat(), &a).unwrap_err();
        assert_eq!(
            err.downcast_ref::<IntegrityError>(),
            Some(&IntegrityError::MixedGroupKey("album-x".into()))
        );
        assert!(err.downcast_ref::<RemoteError>().is_none());
    }

    #[test]
    fn message_fields_are_normalized() {
        let r = message_record(chat(), &msg(4)).unwrap();
        assert_eq!(r.sender_id, Some(9));
        assert_eq!(r.reply_to_text.as_deref().map(|t| t.chars().count()), Some(100));
        let raw: Value = serde_json::from_str(&r.raw_json).unwrap();
        assert_eq!(raw["forward_from_name"], "Someone");
        assert!(message_record(chat(), &msg(0)).is_err());
    }

    #[test]
    fn reactions_split_known_users_from_the_rest() {
        let mut m = msg(1);
        m.reactions = vec![
            RemoteReaction {
                emoji: "🔥".into(),
                count: 5,
                user_ids: vec![1, 2],
            },
            RemoteReaction {
                emoji: "👍".into(),
                count: 1,
                user_ids: vec![3],
            },
        ];
        let rows = reaction_records(&m);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2], ReactionRecord { emoji: "🔥".into(), user_id: None, count: 3 });
        assert_eq!(rows.iter().map(|r| r.count).sum::<i64>(), 6);
    }

    #[test]
    fn chat_record_uses_marked_id() {
        let rc = RemoteChat {
            peer: RemotePeer { kind: PeerKind::Channel, id: 777 },
            kind: ChatKind::Channel,
            title: Some("t".into()),
            username: None,
            first_name: None,
            last_name: None,
            participants_count: None,
        };
        assert_eq!(chat_record(&rc).unwrap().id.get(), -1000000000777);
    }

    #[test]
    fn media_record_fills_mime_from_name() {
        let media = RemoteMedia {
            kind: "document".into(),
            file_id: Some("F".into()),
            file_name: Some("report.pdf".into()),
            mime_type: None,
            size: -1,
            width: None,
            height: None,
            duration: None,
        };
        let r = media_record(&media);
        assert_eq!(r.mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(r.size, 0);
        assert!(r.object.is_none());
    }
}
