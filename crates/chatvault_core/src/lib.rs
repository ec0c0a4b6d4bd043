/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod archive_db;
pub mod change_events;
pub mod chat_filter;
pub mod chat_id;
pub mod chat_locks;
pub mod config;
pub mod connection;
pub mod crawler;
pub mod fixture_source;
pub mod listener;
pub mod mass_guard;
pub mod media_ingest;
pub mod media_store;
pub mod normalize;
pub mod remote;
pub mod runtime;

#[cfg(test)]
pub(crate) mod test_support;
