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

//! Recovery (fsck): scan a journal directory, classify every candidate
//! record, replay the ones that decode cleanly, and optionally clean up
//! what's left.
//!
//! Grounded on `jfsck`/`jfsck_cleanup`/`fill_trans` in `libjio/check.c`. The
//! replay step here applies a decoded record's writes directly to the main
//! file rather than re-entering the commit pipeline through a brand-new
//! journal record (the reference implementation's `jtrans_commit` call does
//! the latter, leaving the original record file to be swept up by cleanup
//! instead of unlinking it itself — see DESIGN.md Open Question O1).

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::codec::{self, DecodeResult, DecodedRecordData};
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::journal::BROKEN_SENTINEL;
use crate::sys::{self, LockMode, SharedWord};
use crate::tid;

/// Tally of every record classification, plus the total scanned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FsckResult {
    pub total: u32,
    pub invalid: u32,
    pub in_progress: u32,
    pub broken: u32,
    pub corrupt: u32,
    pub apply_error: u32,
    pub reapplied: u32,
}

pub struct FsckOptions {
    /// Explicit journal directory; defaults to the standard sibling
    /// location derived from `target` when unset.
    pub journal_dir: Option<PathBuf>,
    /// Remove the journal directory entirely once every record has been
    /// classified.
    pub cleanup: bool,
}

impl Default for FsckOptions {
    fn default() -> Self {
        Self { journal_dir: None, cleanup: true }
    }
}

/// Runs recovery against `target`. See module docs and §4.8 of the design
/// for the exact per-record classification rules.
pub fn fsck(target: &Path, options: &FsckOptions) -> Result<FsckResult> {
    let main_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target)
        .map_err(|e| Error::with_context(ErrorKind::Io(e), format!("cannot open {}", target.display())))?;

    if let Err(e) = sys::lock_range(&main_file, LockMode::Exclusive, 0, 0) {
        log::warn!(
            "fsck: could not take a whole-file lock on {} ({e}); proceeding without it",
            target.display()
        );
    }

    let config = Config::default();
    let jdir = options.journal_dir.clone().unwrap_or_else(|| config.journal_dir_for(target));
    let meta = fs::symlink_metadata(&jdir).map_err(|e| {
        Error::with_context(ErrorKind::Corruption, format!("journal directory {} unusable: {e}", jdir.display()))
    })?;
    if !meta.is_dir() {
        return Err(Error::with_context(
            ErrorKind::Corruption,
            format!("{} exists and is not a directory", jdir.display()),
        ));
    }

    let lock_path = jdir.join("lock");
    let lock_file = OpenOptions::new().read(true).write(true).create(true).mode(0o600).open(&lock_path)?;
    if lock_file.metadata()?.len() != std::mem::size_of::<u32>() as u64 {
        lock_file.set_len(std::mem::size_of::<u32>() as u64)?;
    }
    let counter = SharedWord::map(&lock_file)?;

    let maxtid = tid::rescan_and_store_max(&counter, &jdir)?;

    let broken_path = jdir.join(BROKEN_SENTINEL);
    match fs::remove_file(&broken_path) {
        Ok(()) => log::info!("fsck: cleared broken sentinel at {}", broken_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("fsck: failed to remove broken sentinel: {e}"),
    }

    let mut result = FsckResult::default();
    for id in 1..=maxtid {
        result.total += 1;
        classify_one(&main_file, &jdir, id, &mut result);
    }

    let cleanup_result = if options.cleanup { cleanup_journal_dir(&jdir) } else { Ok(()) };

    let _ = sys::lock_range(&main_file, LockMode::Unlock, 0, 0);

    log::info!(
        "fsck {}: total={} invalid={} in_progress={} broken={} corrupt={} apply_error={} reapplied={}",
        target.display(),
        result.total,
        result.invalid,
        result.in_progress,
        result.broken,
        result.corrupt,
        result.apply_error,
        result.reapplied,
    );

    cleanup_result.map(|()| result)
}

fn classify_one(main_file: &File, jdir: &Path, id: u32, result: &mut FsckResult) {
    let path = jdir.join(id.to_string());

    let mut record_file = match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(f) => f,
        Err(_) => {
            result.invalid += 1;
            return;
        }
    };

    match sys::try_lock_range(&record_file, LockMode::Exclusive, 0, 0) {
        Ok(true) => {}
        Ok(false) => {
            result.in_progress += 1;
            return;
        }
        Err(e) => {
            log::warn!("fsck: lock attempt on {} failed: {e}", path.display());
            result.in_progress += 1;
            return;
        }
    }

    let mut buf = Vec::new();
    if record_file.read_to_end(&mut buf).is_err() {
        result.broken += 1;
        return;
    }

    match codec::decode_record(&buf) {
        DecodeResult::StructurallyBroken => {
            log::warn!("fsck: record {} is structurally broken", path.display());
            result.broken += 1;
            let _ = fs::remove_file(&path);
        }
        DecodeResult::ChecksumMismatch => {
            log::warn!("fsck: record {} failed checksum verification", path.display());
            result.corrupt += 1;
            let _ = fs::remove_file(&path);
        }
        DecodeResult::Ok(handle) => {
            let replayed = replay(main_file, &buf, &handle.0);
            let unlinked = fs::remove_file(&path).is_ok();
            if replayed && unlinked {
                result.reapplied += 1;
            } else {
                log::warn!(
                    "fsck: record {} {}",
                    path.display(),
                    if !replayed { "failed to replay" } else { "replayed but could not be unlinked" }
                );
                result.apply_error += 1;
            }
        }
    }
}

fn replay(main_file: &File, buf: &[u8], record: &DecodedRecordData) -> bool {
    for (offset, range) in &record.ops {
        if sys::pwrite_all_at(main_file, &buf[range.clone()], *offset).is_err() {
            return false;
        }
    }
    sys::fdatasync(main_file).is_ok()
}

/// Mirrors `jfsck_cleanup`'s exact selection rule: only entries named `lock`
/// or that parse as a positive transaction id are removed. Anything else
/// (stray files a caller may have left in the directory) is left alone, and
/// the directory itself is only removed once it's down to nothing.
fn cleanup_journal_dir(jdir: &Path) -> Result<()> {
    let entries = match fs::read_dir(jdir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name == "lock" || tid::parse_tid_filename(&name).is_some() {
            fs::remove_file(jdir.join(&name))?;
        }
    }
    fs::remove_dir(jdir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{OpenFlags, Session};
    use crate::transaction::Transaction;

    #[test]
    fn fsck_on_clean_journal_reports_zero_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let session = Session::open(&path, true, true, 0o600, OpenFlags::default()).unwrap();
        let mut txn = Transaction::new(&session, 0);
        txn.add_w(b"hello", 0).unwrap();
        txn.commit().unwrap();
        session.close().unwrap();

        let result = fsck(&path, &FsckOptions::default()).unwrap();
        assert_eq!(result, FsckResult::default());
    }

    #[test]
    fn fsck_reapplies_a_record_left_stranded_before_main_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        std::fs::write(&path, []).unwrap();

        let config = Config::default();
        let jdir = config.journal_dir_for(&path);
        std::fs::create_dir_all(&jdir).unwrap();
        std::fs::write(jdir.join("lock"), 0u32.to_ne_bytes()).unwrap();

        let mut record = Vec::new();
        record.extend_from_slice(&codec::Header { version: codec::VERSION, flags: 0, trans_id: 1 }.encode());
        let mut csum = codec::Checksum::new();
        csum.update(&record);
        let op = codec::OpHeader { len: 5, offset: 0 };
        let enc = op.encode();
        csum.update(&enc);
        csum.update(b"hello");
        record.extend_from_slice(&enc);
        record.extend_from_slice(b"hello");
        let sentinel = codec::OpHeader::SENTINEL.encode();
        csum.update(&sentinel);
        record.extend_from_slice(&sentinel);
        let trailer = codec::Trailer { numops: 1, checksum: csum.finish() };
        record.extend_from_slice(&trailer.encode());
        std::fs::write(jdir.join("1"), &record).unwrap();

        let result = fsck(&path, &FsckOptions { journal_dir: None, cleanup: false }).unwrap();
        assert_eq!(result.reapplied, 1);
        assert_eq!(result.total, 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn fsck_detects_a_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        std::fs::write(&path, []).unwrap();

        let config = Config::default();
        let jdir = config.journal_dir_for(&path);
        std::fs::create_dir_all(&jdir).unwrap();
        std::fs::write(jdir.join("lock"), 0u32.to_ne_bytes()).unwrap();

        let mut record = Vec::new();
        record.extend_from_slice(&codec::Header { version: codec::VERSION, flags: 0, trans_id: 1 }.encode());
        record.extend_from_slice(&codec::OpHeader::SENTINEL.encode());
        record.extend_from_slice(&codec::Trailer { numops: 0, checksum: 0xdead_beef }.encode());
        std::fs::write(jdir.join("1"), &record).unwrap();

        let result = fsck(&path, &FsckOptions { journal_dir: None, cleanup: false }).unwrap();
        assert_eq!(result.corrupt, 1);
        assert_eq!(std::fs::read(&path).unwrap().len(), 0);
    }
}
