/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! A binary (non-reentrant) semaphore used as the `ready_signal` in the
//! "mutex" wait strategy of SPEC_FULL.md §4.5. Plain `std::sync::{Mutex,
//! Condvar}` rather than a pthread mutex held-across-threads -- the
//! original unlocks a mutex from a different thread than locked it, which
//! is undefined behavior for a real mutex and only happened to work
//! because glibc's mutex implementation didn't check the owner. A
//! condvar-guarded flag expresses the same protocol safely.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Semaphore {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl Semaphore {
    /// A semaphore starts "acquired" (not ready) -- the pipeline waits on
    /// it immediately after dispatch, and the worker releases it once
    /// `get_args` has copied the call arguments out of the transport.
    pub fn new_acquired() -> Semaphore {
        Semaphore {
            ready: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Called by the worker thread once it no longer needs exclusive
    /// access to the transport's codec state.
    pub fn release(&self) {
        let mut ready = self.ready.lock().unwrap();
        *ready = true;
        self.cv.notify_one();
    }

    /// Wait, in `timeout`-sized slices, until released or `deadline_ok`
    /// returns false (used to re-check an overall timeout or a
    /// `progress` milestone that made the wait moot). Returns true if
    /// released, false if `deadline_ok` cut the wait short.
    pub fn acquire_timeout(&self, slice: Duration, mut should_continue: impl FnMut() -> bool) -> bool {
        let mut ready = self.ready.lock().unwrap();
        loop {
            if *ready {
                *ready = false;
                return true;
            }
            if !should_continue() {
                return false;
            }
            let (guard, _timeout_result) = self.cv.wait_timeout(ready, slice).unwrap();
            ready = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn release_unblocks_waiter() {
        let sem = Arc::new(Semaphore::new_acquired());
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sem2.release();
        });
        let got = sem.acquire_timeout(Duration::from_millis(5), || true);
        assert!(got);
        handle.join().unwrap();
    }

    #[test]
    fn acquire_gives_up_when_should_continue_is_false() {
        let sem = Semaphore::new_acquired();
        let mut calls = 0;
        let got = sem.acquire_timeout(Duration::from_millis(1), || {
            calls += 1;
            calls < 3
        });
        assert!(!got);
        assert_eq!(calls, 3);
    }
}
