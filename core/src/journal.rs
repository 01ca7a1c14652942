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

//! Journal operation: create, write, pre-commit, commit, and free a single
//! on-disk transaction record.
//!
//! Grounded on `journal_new`/`journal_add_op`/`journal_pre_commit`/
//! `journal_commit`/`journal_free` in `libjio/journal.c`, including the
//! broken-sentinel escalation ladder in `journal_free`'s failure path
//! (unlink → truncate → poison trailer → mark broken).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use crate::codec::{Checksum, Header, OpHeader, Trailer, HEADER_LEN};
use crate::error::{Error, ErrorKind, Result};
use crate::session::FileSession;
use crate::sys::{self, LockMode};

/// Name of the sentinel file that fences off new transactions until
/// recovery clears it.
pub const BROKEN_SENTINEL: &str = "broken";

pub struct JournalOp {
    trans_id: u32,
    file: File,
    path: PathBuf,
    checksum: Checksum,
    numops: u32,
    cursor: u64,
}

impl JournalOp {
    pub fn trans_id(&self) -> u32 {
        self.trans_id
    }

    /// Creates a new on-disk record: refuses if the journal is broken,
    /// allocates a transaction id, creates the record file exclusively at
    /// mode 0600, takes an exclusive whole-file range lock on it, and
    /// writes the header, seeding the running checksum.
    pub fn new(session: &FileSession, flags: u16) -> Result<JournalOp> {
        if session.is_broken()? {
            return Err(Error::with_context(
                ErrorKind::Resource,
                "journal directory is marked broken; run recovery before starting new transactions",
            ));
        }

        let trans_id = session.acquire_tid()?;
        let path = session.record_path(trans_id)?;

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) => {
                let _ = session.release_tid();
                return Err(e.into());
            }
        };

        if let Err(e) = sys::lock_range(&file, LockMode::Exclusive, 0, 0) {
            drop(file);
            let _ = std::fs::remove_file(&path);
            let _ = session.release_tid();
            return Err(e.into());
        }

        let header = Header { version: crate::codec::VERSION, flags, trans_id };
        let encoded = header.encode();
        if let Err(e) = sys::pwrite_all_at(&file, &encoded, 0) {
            drop(file);
            let _ = std::fs::remove_file(&path);
            let _ = session.release_tid();
            return Err(e.into());
        }

        let mut checksum = Checksum::new();
        checksum.update(&encoded);

        Ok(JournalOp {
            trans_id,
            file,
            path,
            checksum,
            numops: 0,
            cursor: HEADER_LEN as u64,
        })
    }

    /// Appends one write operation's header and payload via a gather-write,
    /// folding both into the running checksum.
    pub fn add_op(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let header = OpHeader { len: buf.len() as u32, offset };
        let encoded = header.encode();
        sys::pwritev_all_at(&self.file, &[&encoded, buf], self.cursor)?;
        self.checksum.update(&encoded);
        self.checksum.update(buf);
        self.cursor += encoded.len() as u64 + buf.len() as u64;
        self.numops += 1;
        Ok(())
    }

    /// Hints the OS to begin flushing the record's dirty pages, without
    /// waiting. Best-effort: unsupported platforms are a silent no-op.
    pub fn pre_commit(&self) {
        let _ = sys::sync_range_submit(&self.file, 0, self.cursor);
    }

    /// Appends the sentinel and trailer, then makes the record durable:
    /// `fsync` the record file, then `fsync` the journal directory (with
    /// the one-time-warning global-sync fallback).
    pub fn commit(&mut self, session: &FileSession) -> Result<()> {
        let sentinel = OpHeader::SENTINEL.encode();
        self.checksum.update(&sentinel);
        let trailer = Trailer { numops: self.numops, checksum: self.checksum.finish() };
        let trailer_encoded = trailer.encode();

        sys::pwritev_all_at(&self.file, &[&sentinel, &trailer_encoded], self.cursor)?;
        self.cursor += (sentinel.len() + trailer_encoded.len()) as u64;

        sys::fsync(&self.file)?;
        session.fsync_journal_dir()?;
        Ok(())
    }

    /// Reclaims the record. If `data_is_safe` is false the record file is
    /// left untouched (the caller is handling a failure separately and may
    /// still need it); the descriptor is still closed and the transaction
    /// id is always released, mirroring the reference implementation's
    /// `journal_free`, which recomputes the shared counter from whatever is
    /// still on disk regardless of whether this call unlinked anything.
    pub fn free(self, session: &FileSession, data_is_safe: bool) -> Result<()> {
        let JournalOp { trans_id, file, path, .. } = self;

        if data_is_safe {
            if std::fs::remove_file(&path).is_err() {
                if file.set_len(0).is_err() {
                    let poisoned = Trailer::poisoned().encode();
                    let poison_failed =
                        sys::pwrite_all_at(&file, &poisoned, 0).is_err() || sys::fdatasync(&file).is_err();
                    if poison_failed {
                        log::error!(
                            "record {trans_id} could not be unlinked, truncated, or poisoned; marking journal broken"
                        );
                        session.mark_broken()?;
                    }
                }
            }
        }

        if let Err(e) = session.fsync_journal_dir() {
            session.mark_broken()?;
            drop(file);
            let _ = session.release_tid();
            return Err(e);
        }

        drop(file);
        session.release_tid()?;
        Ok(())
    }
}
