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

//! Thin wrappers around the POSIX primitives the engine depends on:
//! advisory byte-range locking, positional read/write, directory fsync
//! (with a one-time-warning global-sync fallback), range-sync submit/wait,
//! and the shared memory mapping behind the TID counter.
//!
//! Grounded on `libjio/unix.c` (`plockf`, `spread`, `spwrite`, `fsync_dir`)
//! and `libjio/compat.c` (range-sync compatibility shims). Exposed as plain
//! functions rather than a trait object: only unix is supported, matching
//! the teacher's own `[target.'cfg(unix)'.dependencies]` scoping for `libc`.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    Unlock,
}

fn to_flock_type(mode: LockMode) -> libc::c_short {
    match mode {
        LockMode::Shared => libc::F_RDLCK as libc::c_short,
        LockMode::Exclusive => libc::F_WRLCK as libc::c_short,
        LockMode::Unlock => libc::F_UNLCK as libc::c_short,
    }
}

fn flock_struct(mode: LockMode, offset: i64, len: i64) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = to_flock_type(mode);
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

/// Blocking advisory byte-range lock/unlock (`fcntl(F_SETLKW)`) covering
/// `[offset, offset+len)`; `len == 0` means "to the end of file."
pub fn lock_range(file: &File, mode: LockMode, offset: u64, len: u64) -> io::Result<()> {
    let mut fl = flock_struct(mode, offset as i64, len as i64);
    let rv = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &mut fl as *mut _) };
    if rv == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking variant (`fcntl(F_SETLK)`); returns `Ok(false)` rather than
/// an error when the lock is already held elsewhere.
pub fn try_lock_range(file: &File, mode: LockMode, offset: u64, len: u64) -> io::Result<bool> {
    let mut fl = flock_struct(mode, offset as i64, len as i64);
    let rv = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl as *mut _) };
    if rv == -1 {
        let e = io::Error::last_os_error();
        if e.kind() == io::ErrorKind::WouldBlock
            || e.raw_os_error() == Some(libc::EACCES)
            || e.raw_os_error() == Some(libc::EAGAIN)
        {
            return Ok(false);
        }
        return Err(e);
    }
    Ok(true)
}

/// Positional read; short reads are returned as-is so the caller can detect
/// "reading past current end-of-file" (used when capturing pre-images of a
/// write that extends the file).
pub fn pread_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    loop {
        match file.read_at(buf, offset) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Positional write-all: retries until every byte is written or an error
/// that isn't `EINTR` occurs.
pub fn pwrite_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !buf.is_empty() {
        match file.write_at(buf, offset) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Gather-write: writes each slice in order starting at `offset`, as if
/// they were one contiguous buffer. `std` has no portable `pwritev`, so
/// this is a straightforward sequential fallback; the slices are small
/// (an operation header plus its payload) so the extra syscalls are cheap.
pub fn pwritev_all_at(file: &File, bufs: &[&[u8]], offset: u64) -> io::Result<()> {
    let mut off = offset;
    for buf in bufs {
        pwrite_all_at(file, buf, off)?;
        off += buf.len() as u64;
    }
    Ok(())
}

pub fn fdatasync(file: &File) -> io::Result<()> {
    let rv = unsafe { libc::fdatasync(file.as_raw_fd()) };
    if rv == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn fsync(file: &File) -> io::Result<()> {
    let rv = unsafe { libc::fsync(file.as_raw_fd()) };
    if rv == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

static WARNED_DIR_FSYNC_FALLBACK: AtomicBool = AtomicBool::new(false);

/// `fsync` a directory so that file creation/unlink/rename within it is
/// durable. Some filesystems reject `fsync` on a directory descriptor with
/// `EINVAL`/`ENOSYS`; in that case we fall back to a whole-machine `sync()`
/// and warn exactly once per process.
pub fn fsync_dir(dir: &File, strict: bool) -> io::Result<()> {
    let rv = unsafe { libc::fsync(dir.as_raw_fd()) };
    if rv == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    let unsupported = matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOSYS));
    if !unsupported || strict {
        return Err(err);
    }
    if !WARNED_DIR_FSYNC_FALLBACK.swap(true, Ordering::SeqCst) {
        log::warn!(
            "directory fsync is not supported on this filesystem; falling back to a \
             process-wide sync() (this warning is only logged once per process)"
        );
    }
    unsafe { libc::sync() };
    Ok(())
}

/// Best-effort read-ahead hint; lack of support is not an error.
pub fn fadvise_willneed(file: &File, offset: u64, len: u64) {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            len as libc::off_t,
            libc::POSIX_FADV_WILLNEED,
        );
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, offset, len);
    }
}

/// True on platforms where [`sync_range_submit`]/[`sync_range_wait`] do
/// real asynchronous work rather than being no-ops.
pub fn has_range_sync() -> bool {
    cfg!(target_os = "linux")
}

/// Submits an asynchronous range-sync for `[offset, offset+len)` without
/// waiting for completion (Linux's `sync_file_range`). Returns `Ok(false)`
/// when unsupported so the caller falls back to a full `fdatasync`.
pub fn sync_range_submit(file: &File, offset: u64, len: u64) -> io::Result<bool> {
    #[cfg(target_os = "linux")]
    {
        let rv = unsafe {
            libc::sync_file_range(
                file.as_raw_fd(),
                offset as libc::off64_t,
                len as libc::off64_t,
                libc::SYNC_FILE_RANGE_WRITE,
            )
        };
        if rv == -1 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::ENOSYS) {
                return Ok(false);
            }
            return Err(e);
        }
        Ok(true)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, offset, len);
        Ok(false)
    }
}

/// Waits for a previously submitted range-sync to complete.
pub fn sync_range_wait(file: &File, offset: u64, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rv = unsafe {
            libc::sync_file_range(
                file.as_raw_fd(),
                offset as libc::off64_t,
                len as libc::off64_t,
                libc::SYNC_FILE_RANGE_WAIT_BEFORE
                    | libc::SYNC_FILE_RANGE_WRITE
                    | libc::SYNC_FILE_RANGE_WAIT_AFTER,
            )
        };
        if rv == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, offset, len);
        Ok(())
    }
}

/// A single machine word mapped `MAP_SHARED` over a file descriptor, used
/// for the cross-process TID counter. Access is volatile; callers are
/// responsible for serializing updates with an external advisory lock (see
/// [`crate::tid`]) since a bare mapped word provides no atomicity across
/// processes by itself.
pub struct SharedWord {
    ptr: *mut u32,
}

unsafe impl Send for SharedWord {}
unsafe impl Sync for SharedWord {}

impl SharedWord {
    pub fn map(file: &File) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                std::mem::size_of::<u32>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr: ptr as *mut u32 })
    }

    pub fn load(&self) -> u32 {
        unsafe { std::ptr::read_volatile(self.ptr) }
    }

    pub fn store(&self, value: u32) {
        unsafe { std::ptr::write_volatile(self.ptr, value) }
    }
}

impl Drop for SharedWord {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, std::mem::size_of::<u32>());
        }
    }
}
