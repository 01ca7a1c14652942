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

//! Transaction engine: building a transaction from operations, and the
//! commit/rollback protocol that coordinates locks, the journal, and the
//! main file.
//!
//! Grounded on `jtrans_new`/`jtrans_add_common`/`jtrans_commit`/
//! `jtrans_rollback` in `libjio/trans.c`. The operation list is a `Vec`
//! instead of a doubly-linked list (design note in §9: "express as an
//! ordered sequence with O(1) push-back and reverse iteration"), and reads
//! vs. writes are a two-variant sum rather than a shared, cast-abused
//! buffer field (§9's second re-architecture note).

use std::io;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::journal::JournalOp;
use crate::lock::{self, RangeKind};
use crate::session::{
    FileSession, Session, J_COMMITTED, J_LINGER, J_NOLOCK, J_NOROLLBACK, J_RDONLY, J_ROLLBACKED,
    J_ROLLBACKING,
};
use crate::sys;

struct PreImage {
    bytes: Vec<u8>,
}

/// One operation in a transaction. Reads borrow the caller's buffer for the
/// lifetime of the transaction (they're never journaled); writes own a copy
/// of their payload plus, once captured at commit time, the on-file bytes
/// they're about to overwrite.
enum Operation<'a> {
    Read { offset: u64, buf: &'a mut [u8] },
    Write { offset: u64, buf: Vec<u8>, prev_image: Option<PreImage> },
}

/// A mutable, append-only list of operations targeting one file session.
pub struct Transaction<'a> {
    session: Arc<FileSession>,
    flags: u16,
    ops: Vec<Operation<'a>>,
    write_bytes: u64,
}

impl<'a> Transaction<'a> {
    /// Allocates an empty transaction. `extra_flags` are OR'd with the
    /// session's own flags (so a read-only session always yields a
    /// read-only transaction, regardless of what the caller passes).
    pub fn new(session: &Session, extra_flags: u16) -> Transaction<'a> {
        Transaction {
            session: session.inner().clone(),
            flags: session.inner().flags() | extra_flags,
            ops: Vec::new(),
            write_bytes: 0,
        }
    }

    /// Copies `buf` into a new write operation. Rejected in read-only
    /// sessions, for zero-length writes, and if the running total of
    /// write bytes in this transaction would exceed the configured
    /// per-transaction ceiling.
    pub fn add_w(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if self.flags & J_RDONLY != 0 {
            return Err(Error::with_context(ErrorKind::Input, "write not allowed on a read-only session"));
        }
        if buf.is_empty() {
            return Err(Error::with_context(ErrorKind::Input, "zero-length write"));
        }
        let total = self.write_bytes + buf.len() as u64;
        if total > self.session.config().max_trans_size {
            return Err(Error::with_context(ErrorKind::Input, "transaction write size ceiling exceeded"));
        }
        self.write_bytes = total;
        self.ops.push(Operation::Write { offset, buf: buf.to_vec(), prev_image: None });
        Ok(())
    }

    /// Appends a read operation referencing the caller's buffer. Not
    /// journaled; executed under the same range locks at commit time so it
    /// observes a snapshot consistent with this transaction's own writes.
    pub fn add_r(&mut self, buf: &'a mut [u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::with_context(ErrorKind::Input, "zero-length read"));
        }
        self.ops.push(Operation::Read { offset, buf });
        Ok(())
    }

    /// Drops owned buffers and the transaction. A no-op beyond ordinary
    /// drop glue; kept as an explicit method to mirror the caller API
    /// surface (`trans_free`).
    pub fn free(self) {}

    fn numops_w(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, Operation::Write { .. })).count()
    }

    fn ranges(&self) -> Vec<lock::Range> {
        self.ops
            .iter()
            .map(|op| match op {
                Operation::Read { offset, buf } => {
                    lock::Range { offset: *offset, len: buf.len() as u64, kind: RangeKind::Read }
                }
                Operation::Write { offset, buf, .. } => {
                    lock::Range { offset: *offset, len: buf.len() as u64, kind: RangeKind::Write }
                }
            })
            .collect()
    }

    /// Runs the commit protocol (§4.5). Returns the number of bytes
    /// written on success; on an internally-recovered failure returns an
    /// [`ErrorKind::Recovered`] error, and on a failure that could not be
    /// repaired returns [`ErrorKind::Unrecovered`] (the journal may have
    /// been marked broken).
    pub fn commit(&mut self) -> Result<u64> {
        self.flags &= !(J_COMMITTED | J_ROLLBACKED);
        self.run_commit()
    }

    /// Synthesizes a new transaction whose writes are this transaction's
    /// previous-image buffers in reverse order, and commits it. Rejected if
    /// the rollback-skip flag was set at construction or the transaction is
    /// empty.
    pub fn rollback(&mut self) -> Result<u64> {
        if self.flags & J_NOROLLBACK != 0 {
            return Err(Error::with_context(ErrorKind::Input, "rollback disabled for this transaction"));
        }
        if self.ops.is_empty() {
            return Err(Error::with_context(ErrorKind::Input, "nothing to roll back"));
        }
        let mut rb = self.build_rollback_transaction(self.flags);
        let result = rb.run_commit();
        if result.is_ok() {
            self.flags |= J_ROLLBACKED;
        }
        result
    }

    fn build_rollback_transaction(&self, flags: u16) -> Transaction<'a> {
        let mut ops = Vec::new();
        let mut write_bytes = 0u64;
        for op in self.ops.iter().rev() {
            let Operation::Write { offset, buf, prev_image } = op else { continue };
            let Some(pre) = prev_image else { continue };

            if (pre.bytes.len() as u64) < buf.len() as u64 {
                // This write extended the file; rolling it back means
                // cutting the extension back off, not just restoring bytes.
                if let Err(e) = self.session.main_file().set_len(offset + pre.bytes.len() as u64) {
                    log::warn!("rollback: failed to truncate file back to pre-image length: {e}");
                }
            }

            if !pre.bytes.is_empty() {
                write_bytes += pre.bytes.len() as u64;
                ops.push(Operation::Write { offset: *offset, buf: pre.bytes.clone(), prev_image: None });
            }
        }
        Transaction { session: self.session.clone(), flags, ops, write_bytes }
    }

    fn run_commit(&mut self) -> Result<u64> {
        if self.ops.is_empty() {
            return Err(Error::with_context(ErrorKind::Input, "empty transaction"));
        }
        if self.flags & J_RDONLY != 0 && self.numops_w() > 0 {
            return Err(Error::with_context(ErrorKind::Input, "write not allowed on a read-only session"));
        }

        let ranges = self.ranges();
        let lock_skip = self.flags & J_NOLOCK != 0;
        if !lock_skip {
            lock::lock_all(self.session.main_file(), &ranges)?;
        }

        let outcome = self.commit_body();

        if !lock_skip {
            lock::unlock_all(self.session.main_file(), &ranges);
        }

        outcome
    }

    fn commit_body(&mut self) -> Result<u64> {
        let mut jop: Option<JournalOp> = None;

        let body_result: Result<u64> = (|| {
            if self.numops_w() > 0 {
                let mut j = JournalOp::new(&self.session, self.flags)?;
                for op in &self.ops {
                    if let Operation::Write { offset, buf, .. } = op {
                        j.add_op(buf, *offset)?;
                    }
                }
                j.pre_commit();
                jop = Some(j);
            }

            if self.flags & J_NOROLLBACK == 0 {
                for op in self.ops.iter_mut() {
                    if let Operation::Write { offset, buf, prev_image } = op {
                        let mut pre = vec![0u8; buf.len()];
                        let n = sys::pread_at(self.session.main_file(), &mut pre, *offset)?;
                        pre.truncate(n);
                        *prev_image = Some(PreImage { bytes: pre });
                    }
                }
            }

            if let Some(j) = jop.as_mut() {
                j.commit(&self.session)?;
            }

            let range_sync_capable = sys::has_range_sync() && self.flags & J_LINGER == 0;
            let mut written = 0u64;
            for op in self.ops.iter_mut() {
                match op {
                    Operation::Read { offset, buf } => {
                        let n = sys::pread_at(self.session.main_file(), buf, *offset)?;
                        if n < buf.len() {
                            return Err(Error::with_context(
                                ErrorKind::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "short read")),
                                "read operation read past end of file",
                            ));
                        }
                    }
                    Operation::Write { offset, buf, .. } => {
                        sys::pwrite_all_at(self.session.main_file(), buf, *offset)?;
                        written += buf.len() as u64;
                        if range_sync_capable {
                            sys::sync_range_submit(self.session.main_file(), *offset, buf.len() as u64)?;
                        }
                    }
                }
            }

            if jop.is_some() && self.flags & J_LINGER != 0 {
                let j = jop.take().unwrap();
                self.session.enqueue_lingering(j, written);
            } else if jop.is_some() {
                if range_sync_capable {
                    for op in &self.ops {
                        if let Operation::Write { offset, buf, .. } = op {
                            sys::sync_range_wait(self.session.main_file(), *offset, buf.len() as u64)?;
                        }
                    }
                } else {
                    sys::fdatasync(self.session.main_file())?;
                }
            }

            self.flags |= J_COMMITTED;
            Ok(written)
        })();

        match body_result {
            Ok(written) => {
                if let Some(j) = jop.take() {
                    j.free(&self.session, true)?;
                }
                Ok(written)
            }
            Err(e) => self.handle_commit_failure(e, jop),
        }
    }

    fn handle_commit_failure(&mut self, e: Error, mut jop: Option<JournalOp>) -> Result<u64> {
        if self.flags & J_ROLLBACKING != 0 {
            if let Some(j) = jop.take() {
                let _ = j.free(&self.session, false);
            }
            return Err(e);
        }

        self.flags |= J_NOLOCK | J_ROLLBACKING;
        let mut rb = self.build_rollback_transaction(self.flags);
        match rb.run_commit() {
            Ok(_) => {
                self.flags |= J_ROLLBACKED;
                if let Some(j) = jop.take() {
                    let _ = j.free(&self.session, true);
                }
                Err(Error::with_context(ErrorKind::Recovered, e.to_string()))
            }
            Err(rollback_err) => {
                if let Some(j) = jop.take() {
                    let _ = j.free(&self.session, false);
                }
                let _ = self.session.mark_broken();
                Err(Error::with_context(
                    ErrorKind::Unrecovered,
                    format!("commit failed ({e}) and rollback also failed ({rollback_err})"),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OpenFlags;

    fn open_rw(path: &std::path::Path) -> Session {
        Session::open(path, true, true, 0o600, OpenFlags::default()).unwrap()
    }

    #[test]
    fn commit_makes_writes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let session = open_rw(&path);

        let mut txn = Transaction::new(&session, 0);
        txn.add_w(b"AAAA", 0).unwrap();
        txn.add_w(b"BBBB", 4).unwrap();
        let written = txn.commit().unwrap();
        assert_eq!(written, 8);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[..8], b"AAAABBBB");

        let jdir = session.inner().journal_dir_path().unwrap();
        let entries: Vec<_> = std::fs::read_dir(&jdir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("lock")]);

        session.close().unwrap();
    }

    #[test]
    fn rollback_restores_preimage_and_truncates_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let session = open_rw(&path);

        let mut txn = Transaction::new(&session, 0);
        txn.add_w(b"AAAA", 0).unwrap();
        txn.add_w(b"BBBB", 4).unwrap();
        txn.commit().unwrap();

        txn.rollback().unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 0);

        session.close().unwrap();
    }

    #[test]
    fn same_transaction_read_after_write_sees_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let session = open_rw(&path);

        let mut txn = Transaction::new(&session, 0);
        txn.add_w(b"HELLO", 0).unwrap();
        let mut readback = [0u8; 5];
        txn.add_r(&mut readback, 0).unwrap();
        txn.commit().unwrap();
        assert_eq!(&readback, b"HELLO");

        session.close().unwrap();
    }
}
