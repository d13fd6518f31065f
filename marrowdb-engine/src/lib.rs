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

//! MarrowDB Engine Adapter
//!
//! Session and cursor pooling over a pluggable embedded storage engine.
//! Engine sessions (transactional contexts) and cursors (table iterators)
//! are expensive to create and are acquired and released at very high
//! rates, so this crate recycles both — correctly under concurrency,
//! through global invalidation, and across shutdown races.
//!
//! # Components
//!
//! - **Engine traits** (`engine`): the contract an embedded engine
//!   implements — connection, session, cursor.
//! - **Tagged pointer** (`tagged`): `(pointer, 64-bit tag)` pairs behind a
//!   single 128-bit atomic, defeating the ABA problem on the session stack.
//! - **Session + cursor cache** (`session`): one engine session plus its
//!   private cursor cache with generational eviction.
//! - **Session pool** (`session_pool`): the process-wide lock-free stack of
//!   idle sessions, with a high-water-mark capacity policy, epoch-based
//!   invalidation, and a shared/exclusive shutdown barrier.
//! - **Reference engine** (`mem`): an instrumented in-memory engine backing
//!   the test suite and benchmarks.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use marrowdb_engine::{MemEngine, SessionPool};
//!
//! let engine = Arc::new(MemEngine::new());
//! engine.create_table("table:orders");
//!
//! let pool = SessionPool::new(Arc::clone(&engine));
//! let table_id = pool.gen_table_id();
//!
//! let mut session = pool.get_session();
//! if let Some(cursor) = session.get_cursor("table:orders", table_id, true) {
//!     session.release_cursor(table_id, cursor);
//! }
//! pool.release_session(session);
//! ```

pub mod engine;
pub mod mem; // Instrumented in-memory reference engine
pub mod session;
pub mod session_pool;
pub mod tagged;

pub use engine::{CursorConfig, Engine, EngineCursor, EngineSession, METADATA_TABLE_ID};
pub use mem::{MemCursor, MemEngine, MemEngineStats, MemSession};
pub use session::{CursorPool, Session, DEFAULT_EVICTION_FLOOR};
pub use session_pool::{CachedSession, PoolConfig, SessionPool};
pub use tagged::{AtomicTaggedPtr, TaggedPtr};
