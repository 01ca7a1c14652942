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

//! Advisory byte-range locking for the main file, with the deadlock-avoiding
//! acquisition order described in the commit protocol.
//!
//! Grounded on `lock_file_ranges()` in `libjio/trans.c`: lock/unlock always
//! proceeds smallest-offset-first so that two cooperating transactions
//! racing on overlapping ranges can never form a lock cycle between each
//! other.

use std::fs::File;
use std::io;

use crate::error::{Error, ErrorKind, Result};
use crate::sys::{self, LockMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub offset: u64,
    pub len: u64,
    pub kind: RangeKind,
}

fn mode_for(kind: RangeKind) -> LockMode {
    match kind {
        RangeKind::Read => LockMode::Shared,
        RangeKind::Write => LockMode::Exclusive,
    }
}

fn classify(e: io::Error) -> Error {
    if e.raw_os_error() == Some(libc::EDEADLK) {
        Error::with_context(ErrorKind::Concurrency, "deadlock detected acquiring range lock")
    } else {
        e.into()
    }
}

/// Acquires a lock for every range, in increasing-offset order (ties broken
/// by the ranges' original position), blocking as needed. On any failure,
/// unwinds every lock already taken and returns the error.
pub fn lock_all(file: &File, ranges: &[Range]) -> Result<()> {
    let mut order: Vec<usize> = (0..ranges.len()).collect();
    order.sort_by_key(|&i| ranges[i].offset);

    let mut acquired: Vec<usize> = Vec::with_capacity(ranges.len());
    for &i in &order {
        let r = ranges[i];
        match sys::lock_range(file, mode_for(r.kind), r.offset, r.len) {
            Ok(()) => acquired.push(i),
            Err(e) => {
                for &j in acquired.iter().rev() {
                    let r = ranges[j];
                    let _ = sys::lock_range(file, LockMode::Unlock, r.offset, r.len);
                }
                return Err(classify(e));
            }
        }
    }
    Ok(())
}

/// Releases every range's lock, ignoring individual failures (there is
/// nothing more useful to do with an unlock failure at this point; it's
/// logged and swallowed so the rest of the teardown can proceed).
pub fn unlock_all(file: &File, ranges: &[Range]) {
    for r in ranges {
        if let Err(e) = sys::lock_range(file, LockMode::Unlock, r.offset, r.len) {
            log::warn!("failed to release range lock at offset {}: {e}", r.offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_and_unlocks_disjoint_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let file = File::options().read(true).write(true).create(true).open(&path).unwrap();
        file.set_len(4096).unwrap();

        let ranges = vec![
            Range { offset: 100, len: 10, kind: RangeKind::Write },
            Range { offset: 0, len: 10, kind: RangeKind::Read },
        ];
        lock_all(&file, &ranges).unwrap();
        unlock_all(&file, &ranges);
    }
}
