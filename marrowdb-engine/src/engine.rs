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

//! Storage engine abstraction
//!
//! Defines the traits the pooling layer is written against, allowing
//! MarrowDB to adapt different embedded storage engines (the in-memory
//! reference engine in `mem`, or an FFI-backed production engine).
//!
//! The shape mirrors the engine's own object model: a connection-level
//! [`Engine`] opens transactional [`EngineSession`]s, and each session opens
//! [`EngineCursor`]s bound to a table URI. Sessions and cursors are both
//! expensive to create, which is why everything above this module is about
//! recycling them.

use marrowdb_core::{EngineError, Result};

/// Reserved table id for the engine's metadata cursor. `SessionPool`'s id
/// allocator starts at 1, so this can never collide.
pub const METADATA_TABLE_ID: u64 = 0;

/// Cursor-open configuration.
///
/// Record-store cursors run with the engine default (`overwrite = true`);
/// every other cursor is opened with `overwrite = false` so a duplicate
/// insert surfaces as an error instead of silently clobbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorConfig {
    pub overwrite: bool,
}

impl CursorConfig {
    /// Configuration for record-store cursors (engine default).
    pub const fn record_store() -> Self {
        Self { overwrite: true }
    }

    /// Configuration for all other table cursors.
    pub const fn table() -> Self {
        Self { overwrite: false }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self::record_store()
    }
}

/// Connection-level handle to an embedded storage engine.
///
/// The engine outlives every pool built on top of it; the pool holds it
/// behind an `Arc` and never tears it down.
pub trait Engine: Send + Sync + 'static {
    type Session: EngineSession;

    /// Open a new transactional session (snapshot isolation).
    fn open_session(&self) -> Result<Self::Session>;

    /// Whether the engine has table drops queued behind open cursors.
    fn drops_queued(&self) -> bool {
        false
    }

    /// Retry every queued table drop. Piggybacked on session release.
    fn drop_all_queued(&self) {}
}

/// One engine transactional context.
pub trait EngineSession: Send + 'static {
    type Cursor: EngineCursor;

    /// Open a cursor on `uri`. `Err(NotFound)` is a recoverable outcome
    /// meaning the table does not exist; any other error is unexpected.
    fn open_cursor(&self, uri: &str, config: CursorConfig) -> Result<Self::Cursor>;

    /// Size of the transaction range this session currently pins. Zero for
    /// an idle session; anything else means transactional state is live.
    fn pinned_range(&self) -> Result<u64>;

    /// Close the session, releasing all engine-side resources.
    fn close(self) -> Result<()>;
}

/// An iterator bound to a table URI within a session.
pub trait EngineCursor: Send + 'static {
    /// Return the cursor to an idle position, dropping any held resources
    /// but keeping it open for reuse.
    fn reset(&mut self) -> Result<()>;

    /// Close the cursor.
    fn close(self) -> Result<()>;
}

/// An engine call that must not fail has failed. The engine's state model
/// does not tolerate silent partial failures, so there is no local recovery:
/// record a diagnostic and abort the operation by panicking.
#[cold]
#[inline(never)]
pub(crate) fn engine_fatal(op: &'static str, err: EngineError) -> ! {
    tracing::error!(target: "marrowdb::engine", op, %err, "unrecoverable engine failure");
    panic!("unrecoverable engine failure during {op}: {err}");
}
