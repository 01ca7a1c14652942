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

//! Crate-wide error type.
//!
//! Grounded on the `Error`/`ErrorKind` split used throughout
//! `engine/fractal/error.rs` in the teacher codebase, simplified: we drop the
//! `origin`/`Dmsg` context-tracing machinery (there is no subsystem registry
//! here to attribute errors to) and keep a single optional context string.

use std::fmt;
use std::io;

/// Coarse error classification, matching the taxonomy callers need to branch
/// on (see the error handling design: input/resource/concurrency/io/corruption).
#[derive(Debug)]
pub enum ErrorKind {
    /// Bad arguments to an add/new call: zero-length write, read-only
    /// session, per-transaction size ceiling exceeded.
    Input,
    /// Allocation, descriptor, or lock-file creation failure.
    Resource,
    /// Deadlock detected while acquiring range locks.
    Concurrency,
    /// An I/O failure that left no inconsistent on-disk state behind.
    Io(io::Error),
    /// A commit failed after the journal was durable, but was repaired by an
    /// internal rollback using the captured pre-images.
    Recovered,
    /// A commit or rollback failed in a way that could not be repaired; the
    /// journal may have been marked broken. The caller must treat the
    /// session as suspect and run recovery.
    Unrecovered,
    /// Detected only during fsck: the journal directory itself is missing,
    /// unreadable, or otherwise cannot be used (distinct from a single
    /// record being corrupt, which is reported through the tally, not an
    /// error).
    Corruption,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Input => write!(f, "invalid input"),
            ErrorKind::Resource => write!(f, "resource allocation failure"),
            ErrorKind::Concurrency => write!(f, "concurrency conflict (deadlock avoided)"),
            ErrorKind::Io(e) => write!(f, "i/o error: {e}"),
            ErrorKind::Recovered => write!(f, "transaction rolled back after failed commit"),
            ErrorKind::Unrecovered => write!(f, "transaction left in an unrecovered state"),
            ErrorKind::Corruption => write!(f, "journal directory is unusable"),
        }
    }
}

/// A [`ErrorKind`] plus an optional human-readable breadcrumb.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, context: None }
    }

    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self { kind, context: Some(context.into()) }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_unrecovered(&self) -> bool {
        matches!(self.kind, ErrorKind::Unrecovered)
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self.kind, ErrorKind::Recovered)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}: {}", ctx, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(ErrorKind::Io(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
