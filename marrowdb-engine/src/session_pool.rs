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

//! Process-wide session cache
//!
//! A lock-free Treiber stack of idle engine sessions, shared by every
//! worker thread. Sessions embed their own next-pointer and ABA tag
//! ([`crate::tagged`]); the pool adds three policies on top of the raw
//! stack:
//!
//! - **High-water-mark**: the cache never holds more sessions than the
//!   maximum number ever checked out concurrently. Demand that never
//!   recurs is not worth caching for.
//! - **Epoch invalidation**: [`SessionPool::close_all`] bumps the pool
//!   epoch; a session stamped with an older epoch is destroyed instead of
//!   re-cached the next time it is released.
//! - **Shutdown barrier**: a shared/exclusive lock whose shared side is
//!   held for the duration of every `get`/`release`. Shutdown sets a flag,
//!   then acquires the lock exclusively, which drains all in-flight
//!   callers; sessions released after that point are deliberately leaked
//!   so teardown of the engine cannot race their destructors.
//!
//! ## Memory ordering
//!
//! | Operation | Ordering | Rationale |
//! |-----------|----------|-----------|
//! | push CAS success | Release | Publishes `next` and session writes to the popper |
//! | pop CAS success | Acquire | Pairs with push's Release |
//! | CAS failure reload | Relaxed | The retry revalidates through the next CAS |
//! | head inspection load | Acquire | May be followed by a dereference |
//! | counters | Relaxed | Monotonic bookkeeping, no ordering dependencies |
//! | epoch bump | AcqRel | Orders the bump against the drain that follows |
//!
//! ## Reclamation
//!
//! A popped-and-destroyed session's allocation is freed through
//! epoch-based reclamation (`crossbeam-epoch`), because a thread stalled
//! mid-pop may still load the `next`/`tag` fields of a session another
//! thread just popped. Engine-side teardown (cursor and session close) is
//! never deferred; only the Rust allocation is.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as ebr, Guard};
use parking_lot::RwLock;

use crate::engine::{engine_fatal, Engine, EngineSession};
use crate::session::{Session, DEFAULT_EVICTION_FLOOR};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

/// Pool tunables. The cursor eviction floor is the only recognized knob.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub eviction_floor: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            eviction_floor: DEFAULT_EVICTION_FLOOR,
        }
    }
}

/// Process-wide cache of idle engine sessions.
pub struct SessionPool<E: Engine> {
    /// Borrowed for the pool's lifetime; the engine outlives the pool.
    engine: Arc<E>,
    /// Top of the intrusive stack, tagged against ABA.
    head: AtomicTaggedPtr<Session<E>>,
    /// Sessions currently checked out.
    sessions_out: AtomicU64,
    /// Sessions currently resident on the stack.
    sessions_cached: AtomicU64,
    /// Most sessions ever out concurrently; the cache capacity.
    high_water_mark: AtomicU64,
    /// Bumped by `close_all`; sessions from older epochs are not re-cached.
    epoch: AtomicU64,
    next_session_id: AtomicU64,
    /// Table/cursor id allocator. Starts at 1; 0 is the metadata id.
    next_table_id: AtomicU64,
    shutting_down: AtomicBool,
    /// Shared mode for get/release, exclusive mode for shutdown.
    shutdown_lock: RwLock<()>,
    eviction_floor: u64,
}

impl<E: Engine> SessionPool<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self::with_config(engine, PoolConfig::default())
    }

    pub fn with_config(engine: Arc<E>, config: PoolConfig) -> Self {
        Self {
            engine,
            head: AtomicTaggedPtr::default(),
            sessions_out: AtomicU64::new(0),
            sessions_cached: AtomicU64::new(0),
            high_water_mark: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
            next_table_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            shutdown_lock: RwLock::new(()),
            eviction_floor: config.eviction_floor,
        }
    }

    /// The engine this pool opens sessions on.
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Allocate a table/cursor id. Monotonic, never returns
    /// [`crate::engine::METADATA_TABLE_ID`].
    pub fn gen_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Check a session out of the pool, popping a cached one when
    /// available and opening a fresh one otherwise.
    pub fn get_session(&self) -> CachedSession<E> {
        let _shared = self.shutdown_lock.read();

        // Unreachable once shutdown has begun: upper layers stop admitting
        // operations before tearing the engine down.
        assert!(
            !self.shutting_down.load(Ordering::Relaxed),
            "get_session after shutdown began"
        );

        let now_out = self.sessions_out.fetch_add(1, Ordering::Relaxed) + 1;
        self.raise_high_water_mark(now_out);

        let guard = ebr::pin();
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            // Safety: sessions published on the stack are freed only via
            // epoch-deferred reclamation; the pinned guard keeps these
            // allocations mapped even if another thread wins the pop and
            // destroys the session.
            let next = unsafe { (*current.ptr()).next.load(Ordering::Relaxed) };
            // The replacement carries the next node's own tag, keeping the
            // invariant that the head's tag always equals the tag stored on
            // the node currently at head.
            let next_tag = if next.is_null() {
                0
            } else {
                unsafe { (*next).tag.load(Ordering::Relaxed) }
            };
            let replacement = TaggedPtr::new(next, next_tag);
            match self.head.compare_exchange_weak(
                current,
                replacement,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let session = current.ptr();
                    // Exclusively owned from here. The tag bump invalidates
                    // any CAS still holding the pre-pop (ptr, tag) view.
                    unsafe {
                        (*session).next.store(ptr::null_mut(), Ordering::Relaxed);
                        (*session).tag.fetch_add(1, Ordering::Relaxed);
                    }
                    self.sessions_cached.fetch_sub(1, Ordering::Relaxed);
                    // Safety: the pop transferred ownership to us.
                    return unsafe { CachedSession::from_raw(session) };
                }
                Err(observed) => current = observed,
            }
        }
        drop(guard);

        self.open_fresh_session()
    }

    /// Return a session to the pool.
    ///
    /// The session must be idle: no cursors out and no pinned transaction
    /// range. It is re-cached only when its epoch is current and the cache
    /// is below the high-water-mark; otherwise it is destroyed. During
    /// shutdown it is deliberately leaked.
    pub fn release_session(&self, session: CachedSession<E>) {
        let _shared = self.shutdown_lock.read();

        assert_eq!(
            session.cursors_out(),
            0,
            "session released with cursors still checked out"
        );

        let raw = session.into_raw();

        if self.shutting_down.load(Ordering::Relaxed) {
            // Leaked on purpose: engine teardown may already be removing
            // state this session's destructor would touch.
            return;
        }

        // Safety: `raw` came out of `into_raw`; we own it exclusively
        // until it is pushed or destroyed below.
        let session_epoch = {
            let session = unsafe { &*raw };
            match session.handle().pinned_range() {
                Ok(0) => {}
                Ok(range) => {
                    panic!("session released with pinned transaction range {range}")
                }
                Err(err) => engine_fatal("pinned range query", err),
            }
            session.epoch()
        };

        let current_epoch = self.epoch.load(Ordering::Acquire);
        assert!(
            session_epoch <= current_epoch,
            "session epoch {session_epoch} ahead of pool epoch {current_epoch}"
        );

        let mut cached = false;
        if session_epoch == current_epoch && self.try_reserve_cache_slot() {
            self.push(raw);
            cached = true;
        }

        self.sessions_out.fetch_sub(1, Ordering::Relaxed);

        if !cached {
            let guard = ebr::pin();
            // Safety: the session was never pushed, so we still own it.
            unsafe { destroy_session(raw, &guard) };
        }

        if self.engine.drops_queued() {
            self.engine.drop_all_queued();
        }
    }

    /// Invalidate and destroy every cached session.
    ///
    /// Sessions still checked out are untouched; their stale epoch routes
    /// them to destruction when they are eventually released.
    pub fn close_all(&self) {
        // Bump first so releases racing this drain see the new epoch.
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(target: "marrowdb::pool", epoch, "invalidating cached sessions");

        let guard = ebr::pin();
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            // Safety: same reclamation argument as in `get_session`.
            let next = unsafe { (*current.ptr()).next.load(Ordering::Relaxed) };
            let next_tag = if next.is_null() {
                0
            } else {
                unsafe { (*next).tag.load(Ordering::Relaxed) }
            };
            let replacement = TaggedPtr::new(next, next_tag);
            match self.head.compare_exchange_weak(
                current,
                replacement,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let session = current.ptr();
                    unsafe {
                        (*session).next.store(ptr::null_mut(), Ordering::Relaxed);
                        (*session).tag.fetch_add(1, Ordering::Relaxed);
                    }
                    self.sessions_cached.fetch_sub(1, Ordering::Relaxed);
                    // Safety: the pop transferred ownership to us.
                    unsafe { destroy_session(session, &guard) };
                    current = self.head.load(Ordering::Acquire);
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Begin shutdown. Idempotent; the first caller drains all in-flight
    /// `get`/`release` calls and then destroys the cache exactly once.
    pub fn shutting_down(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: "marrowdb::pool", "session pool shutting down");

        {
            // Blocks until every caller inside a shared-mode section has
            // left; later entrants observe the flag and leak or bail.
            let _exclusive = self.shutdown_lock.write();
        }

        self.close_all();
    }

    /// Sessions currently checked out.
    pub fn sessions_out(&self) -> u64 {
        self.sessions_out.load(Ordering::Relaxed)
    }

    /// Sessions currently resident in the cache.
    pub fn sessions_cached(&self) -> u64 {
        self.sessions_cached.load(Ordering::Relaxed)
    }

    /// Most sessions ever checked out concurrently.
    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark.load(Ordering::Relaxed)
    }

    /// Current pool epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn open_fresh_session(&self) -> CachedSession<E> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let epoch = self.epoch.load(Ordering::Acquire);
        let session = Box::new(Session::open(
            self.engine.as_ref(),
            epoch,
            id,
            self.eviction_floor,
        ));
        // Safety: a freshly boxed session is exclusively ours.
        unsafe { CachedSession::from_raw(Box::into_raw(session)) }
    }

    /// Compare-and-bump: the high-water-mark only rises.
    fn raise_high_water_mark(&self, observed: u64) {
        let mut mark = self.high_water_mark.load(Ordering::Relaxed);
        while observed > mark {
            match self.high_water_mark.compare_exchange_weak(
                mark,
                observed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => mark = actual,
            }
        }
    }

    /// Atomically claim a cache slot below the high-water-mark, so the
    /// cached count can never exceed the mark even under racing releases.
    fn try_reserve_cache_slot(&self) -> bool {
        let mark = self.high_water_mark.load(Ordering::Relaxed);
        let mut cached = self.sessions_cached.load(Ordering::Relaxed);
        while cached < mark {
            match self.sessions_cached.compare_exchange_weak(
                cached,
                cached + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cached = actual,
            }
        }
        false
    }

    fn push(&self, session: *mut Session<E>) {
        // Safety: the caller owns `session` until the CAS below publishes
        // it; after that the Release ordering hands those writes to the
        // next popper.
        let tag = unsafe { (*session).tag.load(Ordering::Relaxed) };
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*session).next.store(current.ptr(), Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                current,
                TaggedPtr::new(session, tag),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl<E: Engine> Drop for SessionPool<E> {
    fn drop(&mut self) {
        self.shutting_down();
    }
}

/// Closes a session's engine state immediately and defers freeing the
/// allocation until no thread can still be reading its stack links.
///
/// # Safety
///
/// The caller must exclusively own `session`: popped from the stack, or
/// never published on it.
unsafe fn destroy_session<E: Engine>(session: *mut Session<E>, guard: &Guard) {
    (*session).destroy_engine_state();
    guard.defer_unchecked(move || drop(Box::from_raw(session)));
}

/// An exclusively owned, checked-out session.
///
/// The supported way to dispose of one is [`SessionPool::release_session`],
/// which recycles or destroys it under the pool's policies. Dropping it
/// instead closes the session outright, bypassing the cache.
pub struct CachedSession<E: Engine> {
    ptr: ptr::NonNull<Session<E>>,
}

// Safety: a CachedSession is the unique owner of its session, and every
// field a racing stack walker may touch is atomic.
unsafe impl<E: Engine> Send for CachedSession<E> {}

impl<E: Engine> CachedSession<E> {
    /// # Safety
    ///
    /// `raw` must be non-null and exclusively owned by the caller.
    unsafe fn from_raw(raw: *mut Session<E>) -> Self {
        Self {
            ptr: ptr::NonNull::new_unchecked(raw),
        }
    }

    fn into_raw(self) -> *mut Session<E> {
        let raw = self.ptr.as_ptr();
        std::mem::forget(self);
        raw
    }
}

impl<E: Engine> std::ops::Deref for CachedSession<E> {
    type Target = Session<E>;

    fn deref(&self) -> &Session<E> {
        // Safety: exclusive ownership for the guard's lifetime.
        unsafe { self.ptr.as_ref() }
    }
}

impl<E: Engine> std::ops::DerefMut for CachedSession<E> {
    fn deref_mut(&mut self) -> &mut Session<E> {
        // Safety: exclusive ownership for the guard's lifetime.
        unsafe { self.ptr.as_mut() }
    }
}

impl<E: Engine> Drop for CachedSession<E> {
    fn drop(&mut self) {
        let raw = self.ptr.as_ptr();
        // Close engine state now; defer only the free, since a thread
        // stalled mid-pop may still read this session's stack links if it
        // cycled through the cache earlier.
        unsafe {
            (*raw).close_quietly();
            let guard = ebr::pin();
            guard.defer_unchecked(move || drop(Box::from_raw(raw)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemEngine;

    fn pool() -> SessionPool<MemEngine> {
        SessionPool::new(Arc::new(MemEngine::new()))
    }

    #[test]
    fn single_thread_reuse_pops_the_same_session() {
        let pool = pool();

        let first = pool.get_session();
        let first_id = first.id();
        let tag_before = first.tag();
        pool.release_session(first);

        assert_eq!(pool.sessions_cached(), 1);

        let second = pool.get_session();
        assert_eq!(second.id(), first_id);
        assert_eq!(second.tag(), tag_before + 1);
        pool.release_session(second);
    }

    #[test]
    fn round_trip_leaves_counters_unchanged() {
        let pool = pool();

        // Warm the cache so the steady state is reached.
        let warm = pool.get_session();
        pool.release_session(warm);

        let out = pool.sessions_out();
        let cached = pool.sessions_cached();
        let mark = pool.high_water_mark();

        for _ in 0..100 {
            let session = pool.get_session();
            pool.release_session(session);
        }

        assert_eq!(pool.sessions_out(), out);
        assert_eq!(pool.sessions_cached(), cached);
        assert_eq!(pool.high_water_mark(), mark);
    }

    #[test]
    fn release_past_high_water_mark_destroys() {
        let pool = pool();
        let stats = pool.engine().stats();

        // One serial round trip: high-water-mark settles at 1.
        let session = pool.get_session();
        pool.release_session(session);
        assert_eq!(pool.high_water_mark(), 1);
        assert_eq!(pool.sessions_cached(), 1);

        // Emulate the race where a second caller's pop misses the push and
        // opens a fresh session while the first is already cached.
        pool.sessions_out.fetch_add(1, Ordering::Relaxed);
        let fresh = pool.open_fresh_session();
        pool.release_session(fresh);

        // The cache was already at the mark, so the fresh session died.
        assert_eq!(pool.sessions_cached(), 1);
        assert_eq!(stats.sessions_closed(), 1);
        assert_eq!(pool.high_water_mark(), 1);
    }

    #[test]
    fn epoch_mismatch_on_release_destroys() {
        let pool = pool();
        let stats = pool.engine().stats();

        let session = pool.get_session();
        let old_epoch = session.epoch();
        pool.close_all();
        pool.release_session(session);

        assert_eq!(pool.sessions_cached(), 0);
        assert_eq!(stats.sessions_closed(), 1);

        let fresh = pool.get_session();
        assert_eq!(fresh.epoch(), old_epoch + 1);
        pool.release_session(fresh);
    }

    #[test]
    fn close_all_destroys_cached_sessions() {
        let pool = pool();
        let stats = pool.engine().stats();

        let session = pool.get_session();
        pool.release_session(session);
        assert_eq!(pool.sessions_cached(), 1);

        pool.close_all();
        assert_eq!(pool.sessions_cached(), 0);
        assert_eq!(stats.sessions_closed(), 1);
    }

    #[test]
    fn stale_tagged_view_fails_after_recycle() {
        let pool = pool();

        let session = pool.get_session();
        pool.release_session(session);

        // A slow thread captures the head mid-pop.
        let stale = pool.head.load(Ordering::Acquire);
        assert!(!stale.is_null());

        // The session cycles through the stack: pop bumps its tag, the
        // release re-publishes it.
        let session = pool.get_session();
        pool.release_session(session);

        // Same pointer is back on top, but the stale (ptr, tag) view must
        // not be able to commit.
        let current = pool.head.load(Ordering::Acquire);
        assert_eq!(current.ptr(), stale.ptr());
        assert_ne!(current.tag(), stale.tag());
        assert!(pool
            .head
            .compare_exchange(
                stale,
                TaggedPtr::null(),
                Ordering::AcqRel,
                Ordering::Relaxed
            )
            .is_err());
    }

    #[test]
    fn stale_view_fails_when_pointer_returns_via_intermediate_nodes() {
        let pool = pool();

        // Three concurrent checkouts so the cache can hold three sessions.
        let a = pool.get_session();
        let b = pool.get_session();
        let c = pool.get_session();
        let a_id = a.id();
        let b_id = b.id();

        pool.release_session(a);

        // A slow thread captures the head while `a` sits on top, tag 0.
        let stale = pool.head.load(Ordering::Acquire);

        // `a` cycles for real: popped (its own tag advances to 1), then
        // re-published above `c`, so its next-pointer has changed.
        let a = pool.get_session();
        assert_eq!(a.id(), a_id);
        pool.release_session(c);
        pool.release_session(a);

        // A never-popped session (tag still 0) lands on top of `a`, then
        // is popped again, bringing the same pointer back to the head.
        pool.release_session(b);
        let b = pool.get_session();
        assert_eq!(b.id(), b_id);

        // The head must carry `a`'s real per-node tag, not the tag the
        // intermediate pop happened to observe, so the stale view cannot
        // commit and detach the rest of the stack.
        let current = pool.head.load(Ordering::Acquire);
        assert_eq!(current.ptr(), stale.ptr());
        assert_ne!(current.tag(), stale.tag());
        assert!(pool
            .head
            .compare_exchange(
                stale,
                TaggedPtr::null(),
                Ordering::AcqRel,
                Ordering::Relaxed
            )
            .is_err());

        pool.release_session(b);
    }

    #[test]
    #[should_panic(expected = "pinned transaction range")]
    fn releasing_a_pinned_session_is_fatal() {
        let pool = pool();

        let session = pool.get_session();
        session.handle().pin_range(3);
        pool.release_session(session);
    }

    #[test]
    #[should_panic(expected = "cursors still checked out")]
    fn releasing_with_cursors_out_is_fatal() {
        let pool = pool();
        pool.engine().create_table("table:stray");

        let mut session = pool.get_session();
        let table_id = pool.gen_table_id();
        let cursor = session.get_cursor("table:stray", table_id, true);
        assert!(cursor.is_some());
        // Cursor intentionally not released.
        std::mem::forget(cursor);
        pool.release_session(session);
    }

    #[test]
    fn table_ids_start_after_metadata() {
        let pool = pool();
        assert_eq!(pool.gen_table_id(), 1);
        assert_eq!(pool.gen_table_id(), 2);
    }
}
