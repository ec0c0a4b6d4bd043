/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chat_filter::{ChatType, FilterRules};
use crate::chat_id::{id_set, parse_id_seq, ChatId};
use crate::connection::ConnectionSettings;
use crate::crawler::CrawlerSettings;
use crate::listener::ListenerSettings;
use crate::mass_guard::GuardSettings;
use crate::media_store::MediaSettings;

/// Flat option set, loaded from JSON and overlaid with environment variables.
/// Every field is optional; accessors below supply defaults and clamp ranges.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub data_dir: Option<String>,

    pub chat_ids: Option<Vec<i64>>,
    pub chat_types: Option<Vec<String>>,
    pub global_include_chat_ids: Option<Vec<i64>>,
    pub global_exclude_chat_ids: Option<Vec<i64>>,
    pub private_include_chat_ids: Option<Vec<i64>>,
    pub private_exclude_chat_ids: Option<Vec<i64>>,
    pub groups_include_chat_ids: Option<Vec<i64>>,
    pub groups_exclude_chat_ids: Option<Vec<i64>>,
    pub channels_include_chat_ids: Option<Vec<i64>>,
    pub channels_exclude_chat_ids: Option<Vec<i64>>,
    pub priority_chat_ids: Option<Vec<i64>>,
    pub skip_media_chat_ids: Option<Vec<i64>>,

    pub backup_interval_secs: Option<u64>,
    pub batch_size: Option<u32>,
    pub checkpoint_interval: Option<u32>,
    pub crawler_concurrency: Option<u32>,
    pub sync_pinned: Option<bool>,
    pub backup_archived: Option<bool>,
    pub verify_media: Option<bool>,

    pub enable_listener: Option<bool>,
    pub listen_edits: Option<bool>,
    pub listen_deletions: Option<bool>,
    pub listener_download_media: Option<bool>,
    pub reconnect_max_backoff_secs: Option<u64>,

    pub mass_operation_threshold: Option<u32>,
    pub mass_operation_window_seconds: Option<u64>,
    pub mass_operation_buffer_delay: Option<f64>,

    pub db_timeout_secs: Option<u64>,
    pub download_media: Option<bool>,
    pub max_media_size_mb: Option<u64>,
    pub remote_retry_attempts: Option<u32>,
}

impl MirrorConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text).context("parse config json")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("config: {}", path.display()))
    }

    /// Loads the file if it exists, then applies the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => Self::from_path(p)?,
            _ => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let ids = |name: &str| -> Result<Option<Vec<i64>>> {
            match lookup(name) {
                Some(v) => {
                    let seq = parse_id_seq(&v).with_context(|| format!("env {name}"))?;
                    Ok(Some(seq.into_iter().map(ChatId::get).collect()))
                }
                None => Ok(None),
            }
        };
        let flag = |name: &str| -> Option<bool> {
            lookup(name).map(|v| {
                let v = v.trim();
                v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
            })
        };

        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = Some(v);
        }
        if let Some(v) = ids("CHAT_IDS")? {
            self.chat_ids = Some(v);
        }
        if let Some(v) = lookup("CHAT_TYPES") {
            self.chat_types = Some(
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }
        let lists: [(&str, &mut Option<Vec<i64>>); 10] = [
            ("GLOBAL_INCLUDE_CHAT_IDS", &mut self.global_include_chat_ids),
            ("GLOBAL_EXCLUDE_CHAT_IDS", &mut self.global_exclude_chat_ids),
            ("PRIVATE_INCLUDE_CHAT_IDS", &mut self.private_include_chat_ids),
            ("PRIVATE_EXCLUDE_CHAT_IDS", &mut self.private_exclude_chat_ids),
            ("GROUPS_INCLUDE_CHAT_IDS", &mut self.groups_include_chat_ids),
            ("GROUPS_EXCLUDE_CHAT_IDS", &mut self.groups_exclude_chat_ids),
            ("CHANNELS_INCLUDE_CHAT_IDS", &mut self.channels_include_chat_ids),
            ("CHANNELS_EXCLUDE_CHAT_IDS", &mut self.channels_exclude_chat_ids),
            ("PRIORITY_CHAT_IDS", &mut self.priority_chat_ids),
            ("SKIP_MEDIA_CHAT_IDS", &mut self.skip_media_chat_ids),
        ];
        for (name, slot) in lists {
            if let Some(v) = ids(name)? {
                *slot = Some(v);
            }
        }

        if let Some(v) = env_num::<u64>(&lookup, "BACKUP_INTERVAL_SECS")? {
            self.backup_interval_secs = Some(v);
        }
        if let Some(v) = env_num::<u32>(&lookup, "BATCH_SIZE")? {
            self.batch_size = Some(v);
        }
        if let Some(v) = env_num::<u32>(&lookup, "CHECKPOINT_INTERVAL")? {
            self.checkpoint_interval = Some(v);
        }
        if let Some(v) = env_num::<u32>(&lookup, "MASS_OPERATION_THRESHOLD")? {
            self.mass_operation_threshold = Some(v);
        }
        if let Some(v) = env_num::<u64>(&lookup, "MASS_OPERATION_WINDOW_SECONDS")? {
            self.mass_operation_window_seconds = Some(v);
        }
        if let Some(v) = env_num::<f64>(&lookup, "MASS_OPERATION_BUFFER_DELAY")? {
            self.mass_operation_buffer_delay = Some(v);
        }
        if let Some(v) = env_num::<u64>(&lookup, "DB_TIMEOUT_SECS")? {
            self.db_timeout_secs = Some(v);
        }
        if let Some(v) = env_num::<u64>(&lookup, "MAX_MEDIA_SIZE_MB")? {
            self.max_media_size_mb = Some(v);
        }
        if let Some(v) = flag("ENABLE_LISTENER") {
            self.enable_listener = Some(v);
        }
        if let Some(v) = flag("LISTEN_EDITS") {
            self.listen_edits = Some(v);
        }
        if let Some(v) = flag("LISTEN_DELETIONS") {
            self.listen_deletions = Some(v);
        }
        if let Some(v) = flag("LISTENER_DOWNLOAD_MEDIA") {
            self.listener_download_media = Some(v);
        }
        if let Some(v) = flag("DOWNLOAD_MEDIA") {
            self.download_media = Some(v);
        }
        if let Some(v) = flag("BACKUP_ARCHIVED") {
            self.backup_archived = Some(v);
        }
        if let Some(v) = flag("VERIFY_MEDIA") {
            self.verify_media = Some(v);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        self.chat_type_set()?;
        Ok(())
    }

    fn chat_type_set(&self) -> Result<BTreeSet<ChatType>> {
        match &self.chat_types {
            Some(list) => list
                .iter()
                .map(|s| ChatType::parse(s))
                .collect::<Result<BTreeSet<_>>>()
                .context("CHAT_TYPES"),
            None => Ok(FilterRules::all_types().chat_types),
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = self.data_dir.as_deref().filter(|s| !s.trim().is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        default_data_dir()
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("chatvault.db"))
    }

    pub fn media_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("media"))
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs.unwrap_or(60).max(1).min(3600))
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs.unwrap_or(21_600).max(60))
    }

    pub fn enable_listener(&self) -> bool {
        self.enable_listener.unwrap_or(true)
    }

    /// Re-check stored media after each scheduled backup.
    pub fn verify_media(&self) -> bool {
        self.verify_media.unwrap_or(false)
    }

    pub fn filter_rules(&self) -> Result<FilterRules> {
        let list = |v: &Option<Vec<i64>>| -> Result<BTreeSet<ChatId>> {
            id_set(v.as_deref().unwrap_or_default())
        };
        Ok(FilterRules {
            whitelist: list(&self.chat_ids)?,
            chat_types: self.chat_type_set()?,
            global_include: list(&self.global_include_chat_ids)?,
            global_exclude: list(&self.global_exclude_chat_ids)?,
            private_include: list(&self.private_include_chat_ids)?,
            private_exclude: list(&self.private_exclude_chat_ids)?,
            groups_include: list(&self.groups_include_chat_ids)?,
            groups_exclude: list(&self.groups_exclude_chat_ids)?,
            channels_include: list(&self.channels_include_chat_ids)?,
            channels_exclude: list(&self.channels_exclude_chat_ids)?,
        })
    }

    pub fn crawler_settings(&self) -> Result<CrawlerSettings> {
        // Priority order is the order the ids were listed in.
        let mut priority = Vec::new();
        for v in self.priority_chat_ids.as_deref().unwrap_or_default() {
            let id = ChatId::from_marked(*v)?;
            if !priority.contains(&id) {
                priority.push(id);
            }
        }
        Ok(CrawlerSettings {
            batch_size: self.batch_size.unwrap_or(100).max(1).min(1000),
            checkpoint_interval: self.checkpoint_interval.unwrap_or(1).max(1).min(1000),
            concurrency: self.crawler_concurrency.unwrap_or(1).max(1).min(16) as usize,
            sync_pinned: self.sync_pinned.unwrap_or(true),
            include_archived: self.backup_archived.unwrap_or(true),
            priority,
        })
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            listen_edits: self.listen_edits.unwrap_or(true),
            listen_deletions: self.listen_deletions.unwrap_or(true),
            download_media: self.listener_download_media.unwrap_or(false),
            max_backoff: Duration::from_secs(
                self.reconnect_max_backoff_secs.unwrap_or(300).max(1).min(3600),
            ),
            ..ListenerSettings::default()
        }
    }

    pub fn guard_settings(&self) -> GuardSettings {
        let delay = self
            .mass_operation_buffer_delay
            .filter(|v| v.is_finite())
            .unwrap_or(2.0)
            .max(0.0)
            .min(60.0);
        GuardSettings {
            threshold: self.mass_operation_threshold.unwrap_or(10).max(1),
            window: Duration::from_secs(
                self.mass_operation_window_seconds.unwrap_or(30).max(1).min(86_400),
            ),
            buffer_delay: Duration::from_secs_f64(delay),
        }
    }

    pub fn media_settings(&self) -> Result<MediaSettings> {
        Ok(MediaSettings {
            download: self.download_media.unwrap_or(true),
            max_size_bytes: self.max_media_size_mb.unwrap_or(100).saturating_mul(1024 * 1024),
            skip_chats: id_set(self.skip_media_chat_ids.as_deref().unwrap_or_default())?,
        })
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            retry_attempts: self.remote_retry_attempts.unwrap_or(3).max(1).min(10),
            ..ConnectionSettings::default()
        }
    }
}

fn env_num<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>().with_context(|| format!("env {name}={v:?}")))
        .transpose()
}

pub fn default_data_dir() -> Result<PathBuf> {
    let proj = ProjectDirs::from("net", "chatvault", "ChatVault")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

/// `--config <path>`, then `CHATVAULT_CONFIG`, then `<config dir>/config.json`.
pub fn resolve_config_path(arg: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(p) = arg {
        return Ok(p);
    }
    if let Ok(v) = std::env::var("CHATVAULT_CONFIG") {
        if !v.trim().is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    let proj = ProjectDirs::from("net", "chatvault", "ChatVault")
        .context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}
