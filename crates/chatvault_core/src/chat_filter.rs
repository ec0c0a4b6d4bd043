/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Which chats get mirrored.
//!
//! Order of evaluation:
//! 1. a non-empty whitelist overrides everything else;
//! 2. exclusions (global, then type-specific) win over any inclusion;
//! 3. explicit inclusions (global for any kind, type-specific only for a
//!    matching kind);
//! 4. otherwise the chat is admitted iff its type is enabled.
//!
//! Bots never match an enabled type; they can only be admitted by id.

use anyhow::{bail, Result};
use chatvault_protocol::ChatKind;
use std::collections::BTreeSet;

use crate::chat_id::ChatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChatType {
    Private,
    Groups,
    Channels,
}

impl ChatType {
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "private" => Ok(Self::Private),
            "groups" => Ok(Self::Groups),
            "channels" => Ok(Self::Channels),
            other => bail!("invalid chat type {other:?}; expected private, groups or channels"),
        }
    }

    pub fn of(kind: ChatKind) -> Option<Self> {
        match kind {
            ChatKind::Private => Some(Self::Private),
            ChatKind::Group => Some(Self::Groups),
            ChatKind::Channel => Some(Self::Channels),
            ChatKind::Bot => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRules {
    pub whitelist: BTreeSet<ChatId>,
    pub chat_types: BTreeSet<ChatType>,
    pub global_include: BTreeSet<ChatId>,
    pub global_exclude: BTreeSet<ChatId>,
    pub private_include: BTreeSet<ChatId>,
    pub private_exclude: BTreeSet<ChatId>,
    pub groups_include: BTreeSet<ChatId>,
    pub groups_exclude: BTreeSet<ChatId>,
    pub channels_include: BTreeSet<ChatId>,
    pub channels_exclude: BTreeSet<ChatId>,
}

impl FilterRules {
    pub fn all_types() -> Self {
        Self {
            chat_types: [ChatType::Private, ChatType::Groups, ChatType::Channels]
                .into_iter()
                .collect(),
            ..Self::default()
        }
    }

    fn include_for(&self, ty: ChatType) -> &BTreeSet<ChatId> {
        match ty {
            ChatType::Private => &self.private_include,
            ChatType::Groups => &self.groups_include,
            ChatType::Channels => &self.channels_include,
        }
    }

    fn exclude_for(&self, ty: ChatType) -> &BTreeSet<ChatId> {
        match ty {
            ChatType::Private => &self.private_exclude,
            ChatType::Groups => &self.groups_exclude,
            ChatType::Channels => &self.channels_exclude,
        }
    }

    /// Ids named explicitly for inclusion. The crawler fetches these by id
    /// when the dialog listing does not return them.
    pub fn explicit_ids(&self) -> BTreeSet<ChatId> {
        if !self.whitelist.is_empty() {
            return self.whitelist.clone();
        }
        let mut out = self.global_include.clone();
        out.extend(self.private_include.iter().copied());
        out.extend(self.groups_include.iter().copied());
        out.extend(self.channels_include.iter().copied());
        out
    }

    pub fn admit(&self, id: ChatId, kind: ChatKind) -> bool {
        admit(id, kind, self)
    }
}

pub fn admit(id: ChatId, kind: ChatKind, rules: &FilterRules) -> bool {
    if !rules.whitelist.is_empty() {
        return rules.whitelist.contains(&id);
    }
    let ty = ChatType::of(kind);
    if rules.global_exclude.contains(&id) {
        return false;
    }
    if let Some(ty) = ty {
        if rules.exclude_for(ty).contains(&id) {
            return false;
        }
    }
    if rules.global_include.contains(&id) {
        return true;
    }
    match ty {
        Some(ty) => rules.include_for(ty).contains(&id) || rules.chat_types.contains(&ty),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: i64) -> ChatId {
        ChatId::from_marked(v).unwrap()
    }

    fn set(v: &[i64]) -> BTreeSet<ChatId> {
        v.iter().map(|x| id(*x)).collect()
    }

    #[test]
    fn whitelist_overrides_everything() {
        let rules = FilterRules {
            whitelist: set(&[-100123]),
            global_exclude: set(&[-100123]),
            ..FilterRules::all_types()
        };
        assert!(admit(id(-100123), ChatKind::Channel, &rules));
        assert!(!admit(id(42), ChatKind::Private, &rules));
    }

    #[test]
    fn global_exclude_beats_type_enabled() {
        let rules = FilterRules {
            global_exclude: set(&[-100123]),
            ..FilterRules::all_types()
        };
        assert!(!admit(id(-100123), ChatKind::Channel, &rules));
        assert!(admit(id(-100999), ChatKind::Channel, &rules));
    }

    #[test]
    fn exclude_beats_include() {
        let rules = FilterRules {
            global_include: set(&[5]),
            private_exclude: set(&[5]),
            ..FilterRules::default()
        };
        assert!(!admit(id(5), ChatKind::Private, &rules));
    }

    #[test]
    fn type_include_requires_matching_kind() {
        let rules = FilterRules {
            chat_types: [ChatType::Private].into_iter().collect(),
            channels_include: set(&[-1001]),
            ..FilterRules::default()
        };
        assert!(admit(id(-1001), ChatKind::Channel, &rules));
        assert!(!admit(id(-1001), ChatKind::Group, &rules));
        assert!(!admit(id(-2002), ChatKind::Channel, &rules));
        assert!(admit(id(77), ChatKind::Private, &rules));
    }

    #[test]
    fn bots_only_by_explicit_id() {
        let rules = FilterRules::all_types();
        assert!(!admit(id(900), ChatKind::Bot, &rules));
        let rules = FilterRules {
            global_include: set(&[900]),
            ..FilterRules::all_types()
        };
        assert!(admit(id(900), ChatKind::Bot, &rules));
    }

    #[test]
    fn explicit_ids_prefers_whitelist() {
        let rules = FilterRules {
            whitelist: set(&[1]),
            global_include: set(&[2]),
            ..FilterRules::default()
        };
        assert_eq!(rules.explicit_ids(), set(&[1]));
        let rules = FilterRules {
            global_include: set(&[2]),
            groups_include: set(&[-3]),
            ..FilterRules::default()
        };
        assert_eq!(rules.explicit_ids(), set(&[2, -3]));
    }

    #[test]
    fn parses_chat_types() {
        assert_eq!(ChatType::parse(" Channels ").unwrap(), ChatType::Channels);
        assert!(ChatType::parse("supergroups").is_err());
    }
}
