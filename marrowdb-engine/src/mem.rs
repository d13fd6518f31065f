// SPDX-License-Identifier: AGPL-3.0-or-later
// MarrowDB - Pluggable Storage Engine Adapter
// Copyright (C) 2026 MarrowDB Authors (https://github.com/marrowdb)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! In-memory reference engine
//!
//! The default [`crate::engine::Engine`] implementation: ordered tables in
//! process memory, addressed by URI. It exists to exercise the pooling
//! contract — the test suite and benchmarks run against it — and keeps
//! instrumentation counters for every lifecycle event so tests can assert
//! exactly how many sessions and cursors the pool opened, closed, and
//! reset.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use marrowdb_core::{EngineError, Result};

use crate::engine::{CursorConfig, Engine, EngineCursor, EngineSession};

/// Lifecycle counters, shared by the engine and everything it opens.
#[derive(Debug, Default)]
pub struct MemEngineStats {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    cursors_opened: AtomicU64,
    cursors_closed: AtomicU64,
    cursor_resets: AtomicU64,
    queued_drop_runs: AtomicU64,
}

impl MemEngineStats {
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    pub fn cursors_opened(&self) -> u64 {
        self.cursors_opened.load(Ordering::Relaxed)
    }

    pub fn cursors_closed(&self) -> u64 {
        self.cursors_closed.load(Ordering::Relaxed)
    }

    pub fn cursor_resets(&self) -> u64 {
        self.cursor_resets.load(Ordering::Relaxed)
    }

    pub fn queued_drop_runs(&self) -> u64 {
        self.queued_drop_runs.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct MemTable {
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemTable {
    fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

struct MemEngineInner {
    tables: DashMap<String, Arc<MemTable>>,
    stats: Arc<MemEngineStats>,
    queued_drops: Mutex<Vec<String>>,
}

/// In-memory storage engine.
pub struct MemEngine {
    inner: Arc<MemEngineInner>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemEngineInner {
                tables: DashMap::new(),
                stats: Arc::new(MemEngineStats::default()),
                queued_drops: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register an empty table under `uri`.
    pub fn create_table(&self, uri: &str) {
        self.inner
            .tables
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(MemTable::new()));
    }

    pub fn table_exists(&self, uri: &str) -> bool {
        self.inner.tables.contains_key(uri)
    }

    /// Queue `uri` for a deferred drop, as an engine would when open
    /// cursors block an immediate one.
    pub fn queue_drop(&self, uri: &str) {
        self.inner.queued_drops.lock().push(uri.to_string());
    }

    pub fn stats(&self) -> Arc<MemEngineStats> {
        Arc::clone(&self.inner.stats)
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemEngine {
    type Session = MemSession;

    fn open_session(&self) -> Result<MemSession> {
        self.inner.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(MemSession {
            inner: Arc::clone(&self.inner),
            pinned: AtomicU64::new(0),
        })
    }

    fn drops_queued(&self) -> bool {
        !self.inner.queued_drops.lock().is_empty()
    }

    fn drop_all_queued(&self) {
        let queued = std::mem::take(&mut *self.inner.queued_drops.lock());
        for uri in queued {
            self.inner.tables.remove(&uri);
        }
        self.inner.stats.queued_drop_runs.fetch_add(1, Ordering::Relaxed);
    }
}

/// One in-memory transactional context.
pub struct MemSession {
    inner: Arc<MemEngineInner>,
    /// Injectable pinned range so tests can model a non-idle session.
    pinned: AtomicU64,
}

impl MemSession {
    /// Pretend this session pins a transaction range of `range`.
    pub fn pin_range(&self, range: u64) {
        self.pinned.store(range, Ordering::Relaxed);
    }
}

impl EngineSession for MemSession {
    type Cursor = MemCursor;

    fn open_cursor(&self, uri: &str, config: CursorConfig) -> Result<MemCursor> {
        let table = self
            .inner
            .tables
            .get(uri)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::NotFound(uri.to_string()))?;
        self.inner.stats.cursors_opened.fetch_add(1, Ordering::Relaxed);
        Ok(MemCursor {
            uri: uri.to_string(),
            table,
            stats: Arc::clone(&self.inner.stats),
            position: None,
            overwrite: config.overwrite,
        })
    }

    fn pinned_range(&self) -> Result<u64> {
        Ok(self.pinned.load(Ordering::Relaxed))
    }

    fn close(self) -> Result<()> {
        self.inner.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Forward iterator over one in-memory table.
#[derive(Debug)]
pub struct MemCursor {
    uri: String,
    table: Arc<MemTable>,
    stats: Arc<MemEngineStats>,
    /// Last key yielded; `None` when idle.
    position: Option<Vec<u8>>,
    overwrite: bool,
}

impl MemCursor {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Advance to the next row, in key order.
    pub fn next_row(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let rows = self.table.rows.read();
        let start = match &self.position {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let (key, value) = rows
            .range((start, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))?;
        self.position = Some(key.clone());
        Some((key, value))
    }

    /// Insert a row. With `overwrite = false`, colliding with an existing
    /// key is an error.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut rows = self.table.rows.write();
        if !self.overwrite && rows.contains_key(key) {
            return Err(EngineError::DuplicateKey(self.uri.clone()));
        }
        rows.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Exact-match lookup; positions the cursor on the key when found.
    pub fn search(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let value = self.table.rows.read().get(key).cloned()?;
        self.position = Some(key.to_vec());
        Some(value)
    }
}

impl EngineCursor for MemCursor {
    fn reset(&mut self) -> Result<()> {
        self.position = None;
        self.stats.cursor_resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(self) -> Result<()> {
        self.stats.cursors_closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
