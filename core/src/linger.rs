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

//! Lingering transactions and the autosync background worker.
//!
//! Grounded on `jsync()` (session flush) and the `autosync_thread`/
//! `jfs_autosync_start`/`jfs_autosync_stop`/`autosync_check` quartet in
//! `libjio/autosync.c`. The thread primitive is `std::thread` plus
//! `parking_lot`'s `Mutex`/`Condvar`, matching the teacher's choice of
//! `parking_lot` over the stdlib equivalents elsewhere in the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::session::FileSession;
use crate::sys;

/// Flushes the main file, then frees every lingering record in FIFO order.
/// Entries are popped from the queue as they're processed; if freeing one
/// fails, the remaining entries (if any were already queued behind it) stay
/// put for the next flush. The byte counter is reset only once the queue is
/// fully drained.
pub fn jsync(session: &FileSession) -> Result<()> {
    sys::fdatasync(&session.main_file)?;

    loop {
        let next = session.lingering.lock().pop_front();
        let Some(jop) = next else { break };
        jop.free(session, true)?;
    }

    *session.lingering_bytes.lock() = 0;
    Ok(())
}

struct AutosyncState {
    must_die: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
    max_secs: u64,
    max_bytes: u64,
}

/// Handle to a running autosync worker. Dropping it without calling
/// [`stop`](Autosync::stop) leaks the thread (it will run until the process
/// exits); callers are expected to always stop it explicitly, as
/// [`FileSession::close`](crate::session::FileSession) does.
pub struct Autosync {
    state: Arc<AutosyncState>,
    thread: Option<JoinHandle<bool>>,
}

impl Autosync {
    pub fn start(session: Arc<FileSession>, max_secs: u64, max_bytes: u64) -> Autosync {
        let state = Arc::new(AutosyncState {
            must_die: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            max_secs,
            max_bytes,
        });
        let worker_state = state.clone();
        let thread = std::thread::spawn(move || autosync_loop(session, worker_state));
        Autosync { state, thread: Some(thread) }
    }

    /// Wakes the worker to re-check the lingering byte counter. Must be
    /// called after bumping the counter while still holding the session's
    /// lingering-list lock, matching `autosync_check()`'s contract in the
    /// source.
    pub fn notify_bytes_check(&self) {
        self.state.condvar.notify_one();
    }

    /// Signals the worker to exit and joins it, returning an error if any
    /// flush it performed failed.
    pub fn stop(mut self) -> Result<()> {
        self.state.must_die.store(true, Ordering::SeqCst);
        self.state.condvar.notify_one();
        match self.thread.take().expect("stop called once").join() {
            Ok(had_errors) => {
                if had_errors {
                    Err(Error::with_context(ErrorKind::Io(std::io::Error::other(
                        "autosync worker encountered a flush error",
                    )), "autosync"))
                } else {
                    Ok(())
                }
            }
            Err(_) => Err(Error::with_context(ErrorKind::Resource, "autosync worker panicked")),
        }
    }
}

fn autosync_loop(session: Arc<FileSession>, state: Arc<AutosyncState>) -> bool {
    let mut had_errors = false;
    let timeout = Duration::from_secs(state.max_secs.max(1));

    loop {
        let mut guard = state.mutex.lock();
        let result = state.condvar.wait_for(&mut guard, timeout);
        drop(guard);

        if state.must_die.load(Ordering::SeqCst) {
            break;
        }

        if !result.timed_out() {
            // Woken by a notify rather than the timeout: this is either a
            // spurious wakeup or a byte-threshold crossing. Re-check the
            // counter and go back to sleep if we're still under budget.
            let bytes = *session.lingering_bytes.lock();
            if bytes < state.max_bytes {
                continue;
            }
        }

        if let Err(e) = jsync(&session) {
            log::warn!("autosync flush failed: {e}");
            had_errors = true;
        }
    }

    had_errors
}
