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

//! Per-session state: the engine session handle and its cursor cache.
//!
//! A [`Session`] is owned by exactly one caller at a time (or parked on the
//! pool's stack), so nothing here needs internal synchronization except the
//! two intrusive stack fields, which concurrent stack walkers may observe
//! while losing a CAS race.
//!
//! ## Cursor eviction
//!
//! The cache keeps recently used cursors at the front of a deque and stamps
//! each with a monotonic generation at insertion. After every insertion,
//! with `N` cursors cached, records older than `max(floor, N²)` generations
//! are closed from the back. A workload touching `N` distinct tables in
//! round-robin keeps all `N` cursors hot, while a table touched once decays
//! in roughly `N²` operations. The floor (default 100) keeps tiny workloads
//! from thrashing open/close cycles.

use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use marrowdb_core::EngineError;

use crate::engine::{engine_fatal, CursorConfig, Engine, EngineCursor, EngineSession};

/// Eviction floor applied when no override is configured.
pub const DEFAULT_EVICTION_FLOOR: u64 = 100;

/// Cursor type produced by an engine's sessions.
pub(crate) type CursorOf<E> = <<E as Engine>::Session as EngineSession>::Cursor;

struct CachedCursor<C> {
    table_id: u64,
    generation: u64,
    cursor: C,
}

/// Per-session cursor cache with generational eviction.
///
/// NOT THREADSAFE: accessed only by the thread currently holding the
/// owning session.
pub struct CursorPool<C> {
    /// Most-recently-inserted at the front.
    cached: VecDeque<CachedCursor<C>>,
    generation: u64,
    floor: u64,
}

impl<C: EngineCursor> CursorPool<C> {
    pub(crate) fn new(floor: u64) -> Self {
        Self {
            cached: VecDeque::new(),
            generation: 0,
            floor,
        }
    }

    /// Number of cursors currently cached.
    pub fn len(&self) -> usize {
        self.cached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }

    /// Current generation counter. Advances once per insertion.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Remove and return a cached cursor for `table_id`, if any.
    pub(crate) fn take(&mut self, table_id: u64) -> Option<C> {
        let idx = self.cached.iter().position(|r| r.table_id == table_id)?;
        self.cached.remove(idx).map(|r| r.cursor)
    }

    /// Insert a cursor at the front, stamp it, and apply the eviction rule.
    pub(crate) fn insert(&mut self, table_id: u64, cursor: C) {
        self.cached.push_front(CachedCursor {
            table_id,
            generation: self.generation,
            cursor,
        });
        self.generation += 1;
        self.evict();
    }

    fn evict(&mut self) {
        let mut n = self.cached.len() as u64;
        while let Some(oldest) = self.cached.back() {
            let cutoff = self.floor.max(n.saturating_mul(n));
            if self.generation.saturating_sub(oldest.generation) <= cutoff {
                break;
            }
            if let Some(stale) = self.cached.pop_back() {
                if let Err(err) = stale.cursor.close() {
                    engine_fatal("cursor close", err);
                }
                n -= 1;
            }
        }
    }

    /// Close every cached cursor and empty the cache.
    pub(crate) fn drain_close(&mut self) {
        while let Some(record) = self.cached.pop_front() {
            if let Err(err) = record.cursor.close() {
                engine_fatal("cursor close", err);
            }
        }
    }

    /// Best-effort close for drop paths; failures are logged, not fatal.
    fn drain_close_quietly(&mut self) {
        while let Some(record) = self.cached.pop_front() {
            if let Err(err) = record.cursor.close() {
                tracing::warn!(target: "marrowdb::session", %err, "cursor close failed during drop");
            }
        }
    }
}

/// One pooled engine session: the engine handle, its private cursor cache,
/// and the intrusive fields used while it sits on the pool's stack.
pub struct Session<E: Engine> {
    id: u64,
    /// Pool generation this session was created under. Never changes.
    epoch: u64,
    /// `None` only after the session has been destroyed.
    handle: Option<E::Session>,
    cursors: CursorPool<CursorOf<E>>,
    cursors_out: u32,
    /// Next entry down the pool stack. Atomic because a stack walker that
    /// loses the pop race may still load it.
    pub(crate) next: AtomicPtr<Session<E>>,
    /// Incremented on every pop. Atomic for the same reason as `next`.
    pub(crate) tag: AtomicU64,
}

impl<E: Engine> Session<E> {
    /// Open a fresh engine session stamped with `epoch`.
    pub(crate) fn open(engine: &E, epoch: u64, id: u64, eviction_floor: u64) -> Self {
        let handle = match engine.open_session() {
            Ok(handle) => handle,
            Err(err) => engine_fatal("session open", err),
        };
        Self {
            id,
            epoch,
            handle: Some(handle),
            cursors: CursorPool::new(eviction_floor),
            cursors_out: 0,
            next: AtomicPtr::new(ptr::null_mut()),
            tag: AtomicU64::new(0),
        }
    }

    /// Stable identifier assigned at creation, for diagnostics and tests.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of cursors currently checked out of this session.
    pub fn cursors_out(&self) -> u32 {
        self.cursors_out
    }

    /// Number of cursors parked in this session's cache.
    pub fn cached_cursors(&self) -> usize {
        self.cursors.len()
    }

    /// Times this session has been popped off the pool stack.
    pub fn tag(&self) -> u64 {
        self.tag.load(Ordering::Relaxed)
    }

    /// The underlying engine session.
    pub fn handle(&self) -> &E::Session {
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("session handle used after destruction"),
        }
    }

    /// Fetch a cursor for `table_id`, reusing a cached one when possible.
    ///
    /// Returns `None` when the engine reports the table does not exist;
    /// any other engine failure is fatal.
    pub fn get_cursor(
        &mut self,
        uri: &str,
        table_id: u64,
        for_record_store: bool,
    ) -> Option<CursorOf<E>> {
        if let Some(cursor) = self.cursors.take(table_id) {
            self.cursors_out += 1;
            return Some(cursor);
        }

        let config = if for_record_store {
            CursorConfig::record_store()
        } else {
            CursorConfig::table()
        };
        match self.handle().open_cursor(uri, config) {
            Ok(cursor) => {
                self.cursors_out += 1;
                Some(cursor)
            }
            Err(EngineError::NotFound(_)) => None,
            Err(err) => engine_fatal("cursor open", err),
        }
    }

    /// Return a cursor to the cache. The cursor is reset to an idle
    /// position first; a reset failure is fatal.
    pub fn release_cursor(&mut self, table_id: u64, mut cursor: CursorOf<E>) {
        assert!(
            self.handle.is_some(),
            "cursor released on a destroyed session"
        );
        self.cursors_out = match self.cursors_out.checked_sub(1) {
            Some(count) => count,
            None => panic!("cursor release without a matching acquire"),
        };

        if let Err(err) = cursor.reset() {
            engine_fatal("cursor reset", err);
        }
        self.cursors.insert(table_id, cursor);
    }

    /// Close every cached cursor.
    pub fn close_all_cursors(&mut self) {
        self.cursors.drain_close();
    }

    /// Tear down engine state: cached cursors first, then the session
    /// handle. Unexpected engine failures abort. Idempotent.
    pub(crate) fn destroy_engine_state(&mut self) {
        self.cursors.drain_close();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.close() {
                engine_fatal("session close", err);
            }
        }
    }

    /// Best-effort teardown for drop paths.
    pub(crate) fn close_quietly(&mut self) {
        self.cursors.drain_close_quietly();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.close() {
                tracing::warn!(target: "marrowdb::session", %err, "session close failed during drop");
            }
        }
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        // No-op when `destroy_engine_state` already ran; otherwise this is
        // the backstop for sessions dropped without going through the pool.
        self.close_quietly();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrowdb_core::Result;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    /// Minimal cursor that counts close/reset calls.
    struct StubCursor {
        closes: Arc<AtomicU32>,
        resets: Arc<AtomicU32>,
    }

    impl EngineCursor for StubCursor {
        fn reset(&mut self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn close(self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn stub(closes: &Arc<AtomicU32>, resets: &Arc<AtomicU32>) -> StubCursor {
        StubCursor {
            closes: Arc::clone(closes),
            resets: Arc::clone(resets),
        }
    }

    #[test]
    fn take_prefers_matching_table() {
        let closes = Arc::new(AtomicU32::new(0));
        let resets = Arc::new(AtomicU32::new(0));
        let mut pool = CursorPool::new(DEFAULT_EVICTION_FLOOR);

        pool.insert(1, stub(&closes, &resets));
        pool.insert(2, stub(&closes, &resets));

        assert!(pool.take(3).is_none());
        assert!(pool.take(1).is_some());
        assert!(pool.take(1).is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn recent_cursor_survives_reinsertion() {
        let closes = Arc::new(AtomicU32::new(0));
        let resets = Arc::new(AtomicU32::new(0));
        let mut pool = CursorPool::new(DEFAULT_EVICTION_FLOOR);

        pool.insert(1, stub(&closes, &resets));
        pool.insert(1, stub(&closes, &resets));

        // Age 2 is far below max(100, 4); both stay cached.
        assert_eq!(pool.len(), 2);
        assert_eq!(closes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn stale_cursor_evicted_past_floor() {
        let closes = Arc::new(AtomicU32::new(0));
        let resets = Arc::new(AtomicU32::new(0));
        let mut pool = CursorPool::new(DEFAULT_EVICTION_FLOOR);

        pool.insert(1, stub(&closes, &resets));
        // Let the cached cursor go stale without touching it.
        pool.generation += DEFAULT_EVICTION_FLOOR + 1;
        pool.insert(2, stub(&closes, &resets));

        // Oldest record's age (floor + 2) exceeds max(100, 4): exactly one
        // close, and the fresh cursor remains.
        assert_eq!(closes.load(Ordering::Relaxed), 1);
        assert_eq!(pool.len(), 1);
        assert!(pool.take(2).is_some());
    }

    #[test]
    fn quadratic_tolerance_scales_with_population() {
        let closes = Arc::new(AtomicU32::new(0));
        let resets = Arc::new(AtomicU32::new(0));
        // Tiny floor so the quadratic term governs.
        let mut pool = CursorPool::new(1);

        for table_id in 0..20u64 {
            pool.insert(table_id, stub(&closes, &resets));
        }

        // 20 distinct tables in round-robin: every age is at most 20, well
        // under 20² = 400. Nothing is evicted.
        assert_eq!(pool.len(), 20);
        assert_eq!(closes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn drain_closes_everything() {
        let closes = Arc::new(AtomicU32::new(0));
        let resets = Arc::new(AtomicU32::new(0));
        let mut pool = CursorPool::new(DEFAULT_EVICTION_FLOOR);

        for table_id in 0..5u64 {
            pool.insert(table_id, stub(&closes, &resets));
        }
        pool.drain_close();

        assert!(pool.is_empty());
        assert_eq!(closes.load(Ordering::Relaxed), 5);
    }
}
