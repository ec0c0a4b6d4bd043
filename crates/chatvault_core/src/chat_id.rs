/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Marked chat ids.
//!
//! The source hands out three kinds of peers with overlapping positive id
//! spaces. Everything persisted or compared inside the engine uses a single
//! signed "marked" id instead:
//!
//! * users keep their positive id,
//! * basic groups become `-id`,
//! * channels / supergroups become `-(1_000_000_000_000 + id)`, which renders
//!   as the familiar `-100...` prefix.

use anyhow::{bail, Context, Result};
use chatvault_protocol::{PeerKind, RemotePeer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const CHANNEL_OFFSET: i64 = 1_000_000_000_000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub struct ChatId(i64);

impl ChatId {
    pub fn from_peer(peer: &RemotePeer) -> Result<Self> {
        if peer.id <= 0 {
            bail!("peer id must be positive, got {} ({:?})", peer.id, peer.kind);
        }
        match peer.kind {
            PeerKind::User => Ok(Self(peer.id)),
            PeerKind::BasicGroup => {
                if peer.id >= CHANNEL_OFFSET {
                    bail!("basic group id out of range: {}", peer.id);
                }
                Ok(Self(-peer.id))
            }
            PeerKind::Channel => {
                let shifted = CHANNEL_OFFSET
                    .checked_add(peer.id)
                    .context("channel id overflows marked range")?;
                Ok(Self(-shifted))
            }
        }
    }

    pub fn from_marked(value: i64) -> Result<Self> {
        if value == 0 {
            bail!("0 is not a valid chat id");
        }
        // Every marked id must be negatable.
        if value.checked_neg().is_none() {
            bail!("chat id out of range: {value}");
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn peer_kind(self) -> PeerKind {
        if self.0 > 0 {
            PeerKind::User
        } else if -self.0 < CHANNEL_OFFSET {
            PeerKind::BasicGroup
        } else {
            PeerKind::Channel
        }
    }

    /// Inverse of [`ChatId::from_peer`].
    pub fn to_peer(self) -> RemotePeer {
        let kind = self.peer_kind();
        let id = match kind {
            PeerKind::User => self.0,
            PeerKind::BasicGroup => -self.0,
            PeerKind::Channel => -self.0 - CHANNEL_OFFSET,
        };
        RemotePeer { kind, id }
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for ChatId {
    type Error = anyhow::Error;

    fn try_from(value: i64) -> Result<Self> {
        Self::from_marked(value)
    }
}

impl From<ChatId> for i64 {
    fn from(id: ChatId) -> i64 {
        id.0
    }
}

impl FromStr for ChatId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let v = s
            .trim()
            .parse::<i64>()
            .with_context(|| format!("invalid chat id: {s:?}"))?;
        Self::from_marked(v)
    }
}

/// Parses a comma-separated id list in listed order, dropping repeats;
/// blanks are ignored.
pub fn parse_id_seq(input: &str) -> Result<Vec<ChatId>> {
    let mut out = Vec::new();
    for part in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let id = ChatId::from_str(part)?;
        if !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(out)
}

pub fn id_set(values: &[i64]) -> Result<BTreeSet<ChatId>> {
    values.iter().copied().map(ChatId::from_marked).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(kind: PeerKind, id: i64) -> RemotePeer {
        RemotePeer { kind, id }
    }

    #[test]
    fn marks_each_peer_kind() {
        assert_eq!(ChatId::from_peer(&peer(PeerKind::User, 777)).unwrap().get(), 777);
        assert_eq!(ChatId::from_peer(&peer(PeerKind::BasicGroup, 4321)).unwrap().get(), -4321);
        assert_eq!(
            ChatId::from_peer(&peer(PeerKind::Channel, 1234567890)).unwrap().get(),
            -1001234567890
        );
    }

    #[test]
    fn same_raw_id_never_collides_across_kinds() {
        let a = ChatId::from_peer(&peer(PeerKind::User, 55)).unwrap();
        let b = ChatId::from_peer(&peer(PeerKind::BasicGroup, 55)).unwrap();
        let c = ChatId::from_peer(&peer(PeerKind::Channel, 55)).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn to_peer_inverts_marking() {
        for p in [
            peer(PeerKind::User, 9),
            peer(PeerKind::BasicGroup, 999_999_999_999),
            peer(PeerKind::Channel, 1),
            peer(PeerKind::Channel, 2_000_000_000),
        ] {
            assert_eq!(ChatId::from_peer(&p).unwrap().to_peer(), p);
        }
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(ChatId::from_peer(&peer(PeerKind::User, 0)).is_err());
        assert!(ChatId::from_peer(&peer(PeerKind::BasicGroup, -3)).is_err());
        assert!(ChatId::from_marked(0).is_err());
        assert!(ChatId::from_marked(i64::MIN).is_err());
        assert!(serde_json::from_str::<ChatId>(&i64::MIN.to_string()).is_err());
        let lowest = ChatId::from_marked(i64::MIN + 1).unwrap();
        assert_eq!(lowest.to_peer().kind, PeerKind::Channel);
        assert_eq!(serde_json::to_string(&lowest).unwrap(), (i64::MIN + 1).to_string());
    }

    #[test]
    fn parses_lists_with_blanks_and_spaces() {
        let ids = parse_id_seq(" -1001, 42,, -7 ").unwrap();
        let got: Vec<i64> = ids.iter().map(|c| c.get()).collect();
        assert_eq!(got, vec![-1001, 42, -7]);
        assert!(parse_id_seq("").unwrap().is_empty());
        assert!(parse_id_seq("12,abc").is_err());
    }

    #[test]
    fn repeated_ids_keep_first_position() {
        let ids = parse_id_seq("-1003, 42, -1003, -7").unwrap();
        let got: Vec<i64> = ids.iter().map(|c| c.get()).collect();
        assert_eq!(got, vec![-1003, 42, -7]);
    }
}
