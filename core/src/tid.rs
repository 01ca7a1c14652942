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

//! Transaction-id allocation, backed by a shared memory-mapped counter in
//! the journal directory's `lock` file.
//!
//! Grounded on `get_tid()`/`free_tid()` in `libjio/journal.c`: both acquire
//! an exclusive whole-file advisory lock on `lock` for their critical
//! section, so allocation is serialized across cooperating processes, not
//! just threads within one.

use std::ffi::OsStr;
use std::fs::File;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};
use crate::sys::{self, LockMode, SharedWord};

/// Parses a journal-directory entry name as a transaction id: a plain
/// decimal, positive `u32`. Anything else (`lock`, `broken`, garbage) is
/// `None` and is ignored by both the allocator and fsck.
pub fn parse_tid_filename(name: &OsStr) -> Option<u32> {
    let s = name.to_str()?;
    let v: u32 = s.parse().ok()?;
    if v > 0 {
        Some(v)
    } else {
        None
    }
}

/// Allocates the next transaction id. Fails if incrementing the counter
/// would wrap it to zero.
pub fn acquire(lock_file: &File, counter: &SharedWord) -> Result<u32> {
    sys::lock_range(lock_file, LockMode::Exclusive, 0, 0)?;
    let result = (|| {
        let cur = counter.load();
        let next = cur.wrapping_add(1);
        if next == 0 {
            return Err(Error::with_context(
                ErrorKind::Resource,
                "transaction id counter would wrap to zero",
            ));
        }
        counter.store(next);
        Ok(next)
    })();
    sys::lock_range(lock_file, LockMode::Unlock, 0, 0)?;
    result
}

/// Releases a transaction id that is no longer live. Rewinds the shared
/// counter to the greatest id still present on disk (or zero if the
/// journal directory holds no transaction files), tolerating a spuriously
/// high counter value in between releases.
pub fn release(lock_file: &File, counter: &SharedWord, journal_dir: &Path) -> Result<()> {
    sys::lock_range(lock_file, LockMode::Exclusive, 0, 0)?;
    let result = (|| {
        let mut max_seen: u32 = 0;
        for entry in std::fs::read_dir(journal_dir)? {
            let entry = entry?;
            if let Some(id) = parse_tid_filename(&entry.file_name()) {
                max_seen = max_seen.max(id);
            }
        }
        counter.store(max_seen);
        Ok(())
    })();
    sys::lock_range(lock_file, LockMode::Unlock, 0, 0)?;
    result
}

/// Scans the journal directory for the greatest transaction id present, and
/// writes it back into the shared counter. Used by recovery, which must
/// ensure freshly-created records during the recovery pass cannot collide
/// with ids still on disk.
pub fn rescan_and_store_max(counter: &SharedWord, journal_dir: &Path) -> Result<u32> {
    let mut max_seen: u32 = 0;
    for entry in std::fs::read_dir(journal_dir)? {
        let entry = entry?;
        if let Some(id) = parse_tid_filename(&entry.file_name()) {
            max_seen = max_seen.max(id);
        }
    }
    counter.store(max_seen);
    Ok(max_seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_numeric_and_non_positive_names() {
        assert_eq!(parse_tid_filename(OsStr::new("lock")), None);
        assert_eq!(parse_tid_filename(OsStr::new("broken")), None);
        assert_eq!(parse_tid_filename(OsStr::new("0")), None);
        assert_eq!(parse_tid_filename(OsStr::new("-3")), None);
        assert_eq!(parse_tid_filename(OsStr::new("12")), Some(12));
    }

    #[test]
    fn acquire_allocates_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("lock");
        let lock_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .unwrap();
        lock_file.set_len(4).unwrap();
        let counter = SharedWord::map(&lock_file).unwrap();
        counter.store(0);

        let a = acquire(&lock_file, &counter).unwrap();
        let b = acquire(&lock_file, &counter).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn release_rewinds_to_max_present_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("lock");
        let lock_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .unwrap();
        lock_file.set_len(4).unwrap();
        let counter = SharedWord::map(&lock_file).unwrap();
        counter.store(5);

        std::fs::write(dir.path().join("3"), b"").unwrap();
        release(&lock_file, &counter, dir.path()).unwrap();
        assert_eq!(counter.load(), 3);

        release(&lock_file, &counter, dir.path()).unwrap();
        std::fs::remove_file(dir.path().join("3")).unwrap();
        release(&lock_file, &counter, dir.path()).unwrap();
        assert_eq!(counter.load(), 0);
    }
}
