/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Gate between the listener's edit/delete handlers and storage.
//!
//! Operations for a chat are buffered until the chat has been quiet for
//! `buffer_delay` (but never longer than `window` after the first buffered
//! operation). The buffer is then judged against the operations already
//! applied for that chat within the trailing `window`: if the total stays at
//! or under `threshold` everything is applied, otherwise only the first
//! operations up to the threshold are applied and the rest of the buffer is
//! dropped without touching storage.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::chat_id::ChatId;

const MAX_APPLY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardSettings {
    pub threshold: u32,
    pub window: Duration,
    pub buffer_delay: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            threshold: 10,
            window: Duration::from_secs(30),
            buffer_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Delete,
    Edit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Delete {
        message_id: i64,
    },
    Edit {
        message_id: i64,
        text: String,
        edit_date_ms: Option<i64>,
    },
}

impl PendingOp {
    pub fn message_id(&self) -> i64 {
        match self {
            PendingOp::Delete { message_id } | PendingOp::Edit { message_id, .. } => *message_id,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            PendingOp::Delete { .. } => OpKind::Delete,
            PendingOp::Edit { .. } => OpKind::Edit,
        }
    }
}

/// Where admitted operations go. Must apply the whole list, in order, or
/// nothing.
#[async_trait]
pub trait OpSink: Send + Sync {
    async fn apply(&self, chat: ChatId, ops: Vec<PendingOp>) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GuardStats {
    pub submitted: u64,
    pub applied: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct LaneState {
    window: VecDeque<(OpKind, Instant)>,
    buffer: Vec<PendingOp>,
    first_buffered_at: Option<Instant>,
    deadline: Option<Instant>,
    flushing: bool,
    failures: u32,
}

#[derive(Default)]
struct Lane {
    state: TokioMutex<LaneState>,
    wake: Notify,
}

pub struct MassGuard {
    settings: GuardSettings,
    sink: Arc<dyn OpSink>,
    lanes: Mutex<HashMap<ChatId, Arc<Lane>>>,
    submitted: AtomicU64,
    applied: AtomicU64,
    discarded: AtomicU64,
}

/// Splits a buffer given `recent` operations already applied in the window.
pub fn split_burst(
    recent: usize,
    mut buffered: Vec<PendingOp>,
    threshold: u32,
) -> (Vec<PendingOp>, Vec<PendingOp>) {
    let threshold = threshold as usize;
    if recent + buffered.len() <= threshold {
        return (buffered, Vec::new());
    }
    let allowed = threshold.saturating_sub(recent).min(buffered.len());
    let rest = buffered.split_off(allowed);
    (buffered, rest)
}

impl MassGuard {
    pub fn new(settings: GuardSettings, sink: Arc<dyn OpSink>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            sink,
            lanes: Mutex::new(HashMap::new()),
            submitted: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn lane(&self, chat: ChatId) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.entry(chat).or_default().clone()
    }

    pub async fn submit(self: &Arc<Self>, chat: ChatId, op: PendingOp) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let lane = self.lane(chat);
        let mut st = lane.state.lock().await;
        let now = Instant::now();
        debug!(chat_id = %chat, message_id = op.message_id(), kind = ?op.kind(), "buffered operation");
        st.buffer.push(op);
        let first = *st.first_buffered_at.get_or_insert(now);
        st.deadline = Some((now + self.settings.buffer_delay).min(first + self.settings.window));
        if !st.flushing {
            st.flushing = true;
            tokio::spawn(self.clone().flush_when_due(chat, lane.clone()));
        }
    }

    /// Judges and applies every buffered operation now, then waits until no
    /// chat has work pending. Used on shutdown.
    pub async fn flush_all(&self) {
        let lanes: Vec<Arc<Lane>> = {
            let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes.values().cloned().collect()
        };
        for lane in &lanes {
            let mut st = lane.state.lock().await;
            if st.deadline.is_some() {
                st.deadline = Some(Instant::now());
            }
            drop(st);
            lane.wake.notify_one();
        }
        for lane in &lanes {
            loop {
                if !lane.state.lock().await.flushing {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    async fn flush_when_due(self: Arc<Self>, chat: ChatId, lane: Arc<Lane>) {
        loop {
            let deadline = lane.state.lock().await.deadline;
            let Some(deadline) = deadline else {
                lane.state.lock().await.flushing = false;
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = lane.wake.notified() => {}
            }
            let mut st = lane.state.lock().await;
            match st.deadline {
                Some(d) if d > Instant::now() => continue,
                _ => {}
            }
            // The lane stays locked through the apply, so submits wait and
            // only requeued operations can be in the buffer afterwards.
            if self.flush_locked(chat, &mut st).await {
                st.deadline = Some(Instant::now() + self.settings.buffer_delay);
                continue;
            }
            st.deadline = None;
            st.first_buffered_at = None;
            st.flushing = false;
            return;
        }
    }

    /// Returns true when the sink failed and the admitted operations were
    /// put back for another attempt.
    async fn flush_locked(&self, chat: ChatId, st: &mut LaneState) -> bool {
        let now = Instant::now();
        let window = self.settings.window;
        while let Some((_, at)) = st.window.front() {
            if now.duration_since(*at) >= window {
                st.window.pop_front();
            } else {
                break;
            }
        }
        let recent = st.window.len();
        let ops = std::mem::take(&mut st.buffer);
        let buffered = ops.len();
        let (admitted, discarded) = split_burst(recent, ops, self.settings.threshold);
        if !discarded.is_empty() {
            self.discarded
                .fetch_add(discarded.len() as u64, Ordering::Relaxed);
            warn!(
                chat_id = %chat,
                recent,
                buffered,
                applied = admitted.len(),
                discarded = discarded.len(),
                threshold = self.settings.threshold,
                window_secs = window.as_secs(),
                "mass operation detected, discarding the rest of the burst"
            );
        }
        if admitted.is_empty() {
            return false;
        }
        let kinds: Vec<OpKind> = admitted.iter().map(PendingOp::kind).collect();
        match self.sink.apply(chat, admitted.clone()).await {
            Ok(()) => {
                let at = Instant::now();
                st.window.extend(kinds.into_iter().map(|k| (k, at)));
                st.failures = 0;
                self.applied
                    .fetch_add(admitted.len() as u64, Ordering::Relaxed);
                false
            }
            Err(e) => {
                st.failures += 1;
                if st.failures >= MAX_APPLY_ATTEMPTS {
                    error!(chat_id = %chat, count = admitted.len(), "giving up on operations after {} attempts: {e:#}", st.failures);
                    st.failures = 0;
                    return false;
                }
                warn!(chat_id = %chat, count = admitted.len(), attempt = st.failures, "applying operations failed, will retry: {e:#}");
                let mut requeued = admitted;
                requeued.append(&mut st.buffer);
                st.buffer = requeued;
                true
            }
        }
    }
}
