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

//! Error types for MarrowDB

use std::io;
use thiserror::Error;

/// Errors reported by an embedded storage engine.
///
/// `NotFound` is the only variant the adapter treats as recoverable; it is
/// the engine's answer to opening a cursor on a table that does not exist.
/// Every other variant signals a state the adapter cannot repair locally.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate key in {0}")]
    DuplicateKey(String),

    #[error("engine busy: {0}")]
    Busy(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("engine call failed with code {code}: {context}")]
    Backend { code: i32, context: String },
}

impl EngineError {
    /// True when the error is the benign "table does not exist" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
