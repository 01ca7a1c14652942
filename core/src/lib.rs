/*
 * This file is a part of jio
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! `jiocore`: atomic, durable, multi-writer byte-range transactions on a
//! regular file, without requiring filesystem-level journaling.
//!
//! A [`Session`] owns a main file and (unless opened read-only) a sibling
//! journal directory. Callers build a [`Transaction`], append reads and
//! writes, then [`Transaction::commit`] it; a failed commit is automatically
//! rolled back from the captured pre-images when possible. [`fsck`] recovers
//! a journal directory left behind by an unclean shutdown.

pub mod codec;
pub mod config;
pub mod error;
pub mod fsck;
pub mod journal;
pub mod linger;
pub mod lock;
pub mod session;
pub mod sys;
pub mod tid;
pub mod transaction;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use fsck::{fsck, FsckOptions, FsckResult};
pub use session::{OpenFlags, Session};
pub use transaction::Transaction;
