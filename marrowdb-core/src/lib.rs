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

//! MarrowDB Core
//!
//! Fundamental types shared by every MarrowDB crate. Today that is the
//! engine error taxonomy and the crate-wide `Result` alias; the adapter
//! layers build on these without knowing which storage engine backs them.

pub mod error;

pub use error::{EngineError, Result};
