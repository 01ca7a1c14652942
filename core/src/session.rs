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

//! File session: open/close lifecycle, journal directory management, and
//! the public handle callers interact with.
//!
//! Grounded on `jopen`/`jclose`/`jmove_journal`/`jsync` in
//! `libjio/trans.c`, restructured around ownership instead of manual
//! malloc/free and `pthread_mutex_t` pairs: the two mutexes in the source
//! (`fs->lock` for seek-dependent calls, `fs->ltlock` for the lingering
//! list) become `parking_lot::Mutex` fields with the same scope.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::journal::{JournalOp, BROKEN_SENTINEL};
use crate::linger::{self, Autosync};
use crate::sys::{self, LockMode, SharedWord};
use crate::tid;

/// Open-mode flags for [`Session::open`], mirroring `jopen`'s `jflags`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Skip range locking for every transaction on this session.
    pub nolock: bool,
    /// Skip pre-image capture (and therefore rollback) for every
    /// transaction on this session.
    pub norollback: bool,
    /// Default every transaction on this session to lingering mode.
    pub linger: bool,
}

impl OpenFlags {
    pub(crate) fn bits(self) -> u16 {
        (self.nolock as u16 * J_NOLOCK)
            | (self.norollback as u16 * J_NOROLLBACK)
            | (self.linger as u16 * J_LINGER)
    }
}

pub(crate) const J_NOLOCK: u16 = 1;
pub(crate) const J_NOROLLBACK: u16 = 2;
pub(crate) const J_LINGER: u16 = 4;
pub(crate) const J_COMMITTED: u16 = 8;
pub(crate) const J_ROLLBACKED: u16 = 16;
pub(crate) const J_ROLLBACKING: u16 = 32;
pub(crate) const J_RDONLY: u16 = 64;

/// The journal directory's location plus the handles that move with it;
/// grouped so [`Session::move_journal`] can atomically swap all of them at
/// once.
pub(crate) struct JournalLocation {
    pub(crate) path: PathBuf,
    pub(crate) dir_file: File,
    pub(crate) lock_file: File,
    pub(crate) counter: SharedWord,
}

/// Internal, reference-counted session state. Shared via `Arc` so the
/// autosync worker thread (see [`crate::linger`]) can outlive the call that
/// started it without borrow issues; [`Session`] is the public handle
/// wrapping it. `journal` is `None` exactly when the session is read-only:
/// a read-only session never creates or touches a journal directory.
pub struct FileSession {
    pub(crate) main_file: File,
    pub(crate) main_path: PathBuf,
    pub(crate) journal: Option<RwLock<JournalLocation>>,
    pub(crate) lingering: Mutex<VecDeque<JournalOp>>,
    pub(crate) lingering_bytes: Mutex<u64>,
    pub(crate) autosync: Mutex<Option<Autosync>>,
    pub(crate) config: Config,
    pub(crate) read_only: bool,
    pub(crate) default_flags: u16,
    /// Guards seek-position-dependent operations (outside this spec's core
    /// scope, but the mutex is part of the data model in §3).
    pub(crate) seek_lock: Mutex<()>,
}

impl FileSession {
    pub fn flags(&self) -> u16 {
        let rdonly = if self.read_only { J_RDONLY } else { 0 };
        rdonly | self.default_flags
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn main_path(&self) -> &Path {
        &self.main_path
    }

    pub fn main_file(&self) -> &File {
        &self.main_file
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn journal(&self) -> Result<&RwLock<JournalLocation>> {
        self.journal
            .as_ref()
            .ok_or_else(|| Error::with_context(ErrorKind::Input, "session is read-only; no journal directory"))
    }

    pub(crate) fn journal_dir_path(&self) -> Result<PathBuf> {
        Ok(self.journal()?.read().path.clone())
    }

    pub(crate) fn fsync_journal_dir(&self) -> Result<()> {
        sys::fsync_dir(&self.journal()?.read().dir_file, self.config.strict_directory_fsync)
            .map_err(Into::into)
    }

    pub(crate) fn acquire_tid(&self) -> Result<u32> {
        let loc = self.journal()?.read();
        tid::acquire(&loc.lock_file, &loc.counter)
    }

    pub(crate) fn release_tid(&self) -> Result<()> {
        let loc = self.journal()?.read();
        tid::release(&loc.lock_file, &loc.counter, &loc.path)
    }

    pub(crate) fn record_path(&self, trans_id: u32) -> Result<PathBuf> {
        Ok(self.journal_dir_path()?.join(trans_id.to_string()))
    }

    pub fn is_broken(&self) -> Result<bool> {
        Ok(self.journal_dir_path()?.join(BROKEN_SENTINEL).try_exists()?)
    }

    pub fn mark_broken(&self) -> Result<()> {
        let path = self.journal_dir_path()?.join(BROKEN_SENTINEL);
        OpenOptions::new().write(true).create(true).mode(0o600).open(&path)?;
        log::error!("journal directory {} marked broken", path.parent().unwrap().display());
        Ok(())
    }

    pub(crate) fn clear_broken(&self) -> Result<()> {
        let path = self.journal_dir_path()?.join(BROKEN_SENTINEL);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends a just-committed journal op to the lingering list, bumping
    /// the byte counter and notifying autosync if it's running.
    pub(crate) fn enqueue_lingering(&self, jop: JournalOp, written: u64) {
        self.lingering.lock().push_back(jop);
        *self.lingering_bytes.lock() += written;
        if let Some(autosync) = self.autosync.lock().as_ref() {
            autosync.notify_bytes_check();
        }
    }
}

/// Public handle to an open file session. Cheap to clone (an `Arc` bump);
/// every clone refers to the same underlying session.
#[derive(Clone)]
pub struct Session(pub(crate) Arc<FileSession>);

impl Session {
    /// Opens `path`, creating it if `create` is set. `open_write` selects
    /// read/write access; any write intent forces read/write because
    /// commit needs to read pre-images even for transactions that only
    /// ever read.
    pub fn open(
        path: impl AsRef<Path>,
        open_write: bool,
        create: bool,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<Session> {
        let default_flags = flags.bits();
        let path = path.as_ref().to_path_buf();

        let mut opts = OpenOptions::new();
        opts.read(true);
        if open_write {
            opts.write(true);
        }
        if create {
            opts.create(true).mode(mode);
        }
        let main_file = opts.open(&path)?;

        if !open_write {
            let inner = FileSession {
                main_file,
                main_path: path,
                journal: None,
                lingering: Mutex::new(VecDeque::new()),
                lingering_bytes: Mutex::new(0),
                autosync: Mutex::new(None),
                config: Config::default(),
                read_only: true,
                default_flags,
                seek_lock: Mutex::new(()),
            };
            return Ok(Session(Arc::new(inner)));
        }

        let config = Config::default();
        let jdir = config.journal_dir_for(&path);
        std::fs::create_dir_all(&jdir).ok();
        let meta = std::fs::symlink_metadata(&jdir)?;
        if !meta.is_dir() {
            return Err(Error::with_context(
                ErrorKind::Resource,
                format!("journal path {} exists and is not a directory", jdir.display()),
            ));
        }

        let dir_file = File::open(&jdir)?;

        let lock_path = jdir.join("lock");
        let lock_file = OpenOptions::new().read(true).write(true).create(true).mode(0o600).open(&lock_path)?;

        sys::lock_range(&lock_file, LockMode::Exclusive, 0, 0)?;
        let needs_init = lock_file.metadata()?.len() != std::mem::size_of::<u32>() as u64;
        if needs_init {
            lock_file.set_len(std::mem::size_of::<u32>() as u64)?;
            sys::pwrite_all_at(&lock_file, &0u32.to_ne_bytes(), 0)?;
        }
        sys::lock_range(&lock_file, LockMode::Unlock, 0, 0)?;

        let counter = SharedWord::map(&lock_file)?;

        let inner = FileSession {
            main_file,
            main_path: path,
            journal: Some(RwLock::new(JournalLocation { path: jdir, dir_file, lock_file, counter })),
            lingering: Mutex::new(VecDeque::new()),
            lingering_bytes: Mutex::new(0),
            autosync: Mutex::new(None),
            config,
            read_only: false,
            default_flags,
            seek_lock: Mutex::new(()),
        };
        Ok(Session(Arc::new(inner)))
    }

    pub fn inner(&self) -> &Arc<FileSession> {
        &self.0
    }

    /// Fully durable flush: `fdatasync`s the main file then frees every
    /// lingering record.
    pub fn sync(&self) -> Result<()> {
        if self.0.read_only {
            return Ok(());
        }
        linger::jsync(&self.0)
    }

    pub fn autosync_start(&self, max_secs: u64, max_bytes: u64) -> Result<()> {
        if max_secs == 0 || max_bytes == 0 {
            return Err(Error::new(ErrorKind::Input));
        }
        let mut guard = self.0.autosync.lock();
        if guard.is_some() {
            return Err(Error::with_context(ErrorKind::Resource, "autosync already running"));
        }
        *guard = Some(Autosync::start(self.0.clone(), max_secs, max_bytes));
        Ok(())
    }

    pub fn autosync_stop(&self) -> Result<()> {
        let worker = self.0.autosync.lock().take();
        match worker {
            Some(w) => w.stop(),
            None => Ok(()),
        }
    }

    /// Relocates the journal directory. The caller must ensure the session
    /// is quiescent (no in-flight transactions) before calling this.
    pub fn move_journal(&self, new_path: impl AsRef<Path>) -> Result<()> {
        if self.0.read_only {
            return Err(Error::new(ErrorKind::Input));
        }
        self.sync()?;

        let new_path = new_path.as_ref().to_path_buf();
        let journal = self.0.journal()?;
        let mut loc = journal.write();
        let old_path = loc.path.clone();

        match std::fs::rename(&old_path, &new_path) {
            Ok(()) => {
                loc.path = new_path;
                Ok(())
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOTEMPTY) | Some(libc::EEXIST)) => {
                let new_dir_file = File::open(&new_path)?;
                let new_lock_path = new_path.join("lock");
                let new_lock_file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .mode(0o600)
                    .open(&new_lock_path)?;
                let new_counter = SharedWord::map(&new_lock_file)?;

                let old_lock_path = old_path.join("lock");
                let _ = std::fs::remove_file(&old_lock_path);
                std::fs::remove_dir(&old_path)?;

                *loc = JournalLocation {
                    path: new_path,
                    dir_file: new_dir_file,
                    lock_file: new_lock_file,
                    counter: new_counter,
                };
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stops autosync, flushes lingering records, and drops the session.
    /// Both steps are attempted even if the first fails, mirroring
    /// `jclose`'s best-effort teardown; the first error encountered (if
    /// any) is returned.
    pub fn close(self) -> Result<()> {
        let mut result = Ok(());
        if let Err(e) = self.autosync_stop() {
            result = Err(e);
        }
        if !self.0.read_only {
            if let Err(e) = self.sync() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_journal_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let session = Session::open(&path, true, true, 0o600, OpenFlags::default()).unwrap();
        let jdir = session.0.journal_dir_path().unwrap();
        assert!(jdir.is_dir());
        assert!(jdir.join("lock").is_file());
        session.close().unwrap();
    }

    #[test]
    fn read_only_session_has_no_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        std::fs::write(&path, b"hello").unwrap();
        let session = Session::open(&path, false, false, 0, OpenFlags::default()).unwrap();
        assert!(session.0.journal_dir_path().is_err());
    }
}
