/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::archive_db::ArchiveDb;
use crate::change_events::{ChangeEvent, ChangeFeed};
use crate::chat_locks::ChatLocks;
use crate::config::MirrorConfig;
use crate::connection::RemoteConnection;
use crate::crawler::{Crawler, RunSummary};
use crate::listener::{next_backoff, ArchiveSink, Listener};
use crate::mass_guard::MassGuard;
use crate::media_ingest::MediaIngest;
use crate::media_store::LocalMediaStore;
use crate::remote::RemoteSource;

const LISTENER_CHECK: Duration = Duration::from_secs(5);

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Mutex<Vec<(u64, RunningEngine)>> = Mutex::new(Vec::new());

struct RunningEngine {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

/// Every component of one archive, wired to one connection and one database.
pub struct Engine {
    db: ArchiveDb,
    conn: Arc<RemoteConnection>,
    crawler: Crawler,
    listener: Arc<Listener>,
    guard: Arc<MassGuard>,
    media: Arc<MediaIngest>,
    feed: ChangeFeed,
    backup_interval: Duration,
    verify_media: bool,
    enable_listener: bool,
    reconnect_base: Duration,
    reconnect_max: Duration,
}

impl Engine {
    pub fn build(cfg: &MirrorConfig, source: Arc<dyn RemoteSource>) -> Result<Self> {
        let data_dir = cfg.data_dir()?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        info!("archive dir: {}", data_dir.display());

        let db = ArchiveDb::open(cfg.db_path()?, cfg.db_timeout())?;
        let conn = RemoteConnection::new(source, cfg.connection_settings());
        let store = Arc::new(LocalMediaStore::new(cfg.media_dir()?));
        let media = Arc::new(MediaIngest::new(
            conn.clone(),
            store,
            db.clone(),
            cfg.media_settings()?,
        ));
        let locks = Arc::new(ChatLocks::new());
        let feed = ChangeFeed::default();
        let rules = cfg.filter_rules()?;
        let listener_settings = cfg.listener_settings();
        let (reconnect_base, reconnect_max) =
            (listener_settings.base_backoff, listener_settings.max_backoff);

        let crawler = Crawler::new(
            conn.clone(),
            db.clone(),
            rules.clone(),
            cfg.crawler_settings()?,
            media.clone(),
            locks.clone(),
            feed.clone(),
        );
        let sink = Arc::new(ArchiveSink::new(db.clone(), locks.clone(), feed.clone()));
        let guard = MassGuard::new(cfg.guard_settings(), sink);
        let listener = Listener::new(
            conn.clone(),
            db.clone(),
            rules,
            listener_settings,
            guard.clone(),
            media.clone(),
            locks,
            feed.clone(),
        );

        Ok(Self {
            db,
            conn,
            crawler,
            listener,
            guard,
            media,
            feed,
            backup_interval: cfg.backup_interval(),
            verify_media: cfg.verify_media(),
            enable_listener: cfg.enable_listener(),
            reconnect_base,
            reconnect_max,
        })
    }

    pub fn db(&self) -> &ArchiveDb {
        &self.db
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub fn guard(&self) -> &Arc<MassGuard> {
        &self.guard
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// One crawler pass, then media verification when enabled. The listener
    /// starts tracking whatever the crawler admitted.
    pub async fn crawl_once(&self, shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        self.conn.ensure_connected().await?;
        let chats = self.crawler.admitted_chats().await?;
        self.listener.reload_tracked(chats.iter().map(|c| c.id));
        let mut summary = self.crawler.run_chats(chats, shutdown).await?;
        if self.verify_media && !summary.aborted {
            match self.media.verify_stored().await {
                Ok(report) => summary.media_verify = Some(report),
                Err(e) => warn!("media verification failed: {e:#}"),
            }
        }
        Ok(summary)
    }

    /// Keeps retrying the first connect with backoff. False when shutdown
    /// arrives first.
    async fn connect_until_ready(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                return false;
            }
            match self.conn.ensure_connected().await {
                Ok(()) => return true,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = next_backoff(attempt, self.reconnect_base, self.reconnect_max);
                    warn!(attempt, "connect failed, retrying in {delay:?}: {e:#}");
                    tokio::select! {
                        res = shutdown.changed() => {
                            if res.is_err() {
                                return false;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn spawn_listener(&self, shutdown: &watch::Receiver<bool>) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.listener.clone().run(shutdown.clone()))
    }

    /// Initial crawl, then one crawl per backup interval, with the listener
    /// running alongside. Returns once `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.connect_until_ready(&mut shutdown).await {
            info!("engine stopped before connecting");
            return Ok(());
        }
        let mut listener = self
            .enable_listener
            .then(|| self.spawn_listener(&shutdown));

        let mut backup_tick = tokio::time::interval(self.backup_interval);
        backup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut listener_tick = tokio::time::interval(LISTENER_CHECK);
        listener_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = backup_tick.tick() => {
                    match self.crawl_once(shutdown.clone()).await {
                        Ok(summary) => info!(
                            processed = summary.chats_processed,
                            failed = summary.chats_failed,
                            added = summary.messages_added,
                            "scheduled backup done"
                        ),
                        Err(e) => warn!("scheduled backup failed: {e:#}"),
                    }
                }
                _ = listener_tick.tick() => {
                    let dead = listener.as_ref().map(|t| t.is_finished()).unwrap_or(false);
                    if dead && !*shutdown.borrow() {
                        warn!("listener stopped unexpectedly, restarting");
                        if let Some(task) = listener.take() {
                            if let Err(e) = task.await {
                                error!("listener task panicked: {e}");
                            }
                        }
                        listener = Some(self.spawn_listener(&shutdown));
                    }
                }
            }
        }

        if let Some(task) = listener {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("listener ended with error: {e:#}"),
                Err(e) => error!("listener task panicked: {e}"),
            }
        }
        info!("engine stopped");
        Ok(())
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).try_init().ok();
}

/// Runs an engine on its own thread and runtime. Returns a handle for [`stop`].
pub fn start(cfg: MirrorConfig, source: Arc<dyn RemoteSource>) -> Result<u64> {
    init_tracing();
    let engine = Arc::new(Engine::build(&cfg, source)?);

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = thread::Builder::new()
        .name(format!("chatvault-{handle}"))
        .spawn(move || {
            if let Err(e) = run_engine(engine, shutdown_rx) {
                error!("engine runtime failed: {e:#}");
            }
        })
        .context("spawn engine thread")?;

    let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    reg.push((
        handle,
        RunningEngine {
            shutdown_tx,
            join: Some(join),
        },
    ));
    Ok(handle)
}

/// Signals shutdown and waits for the engine thread to finish.
pub fn stop(handle: u64) -> Result<()> {
    let join = {
        let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
        let idx = reg
            .iter()
            .position(|(h, _)| *h == handle)
            .context("invalid handle")?;
        let (_, mut running) = reg.swap_remove(idx);
        let _ = running.shutdown_tx.send(true);
        running.join.take()
    };
    if let Some(j) = join {
        if j.join().is_err() {
            anyhow::bail!("engine thread panicked");
        }
    }
    Ok(())
}

fn run_engine(engine: Arc<Engine>, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(engine.run(shutdown_rx))
}
