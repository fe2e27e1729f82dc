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

//! The transport registry: a bijection between stable IDs and live
//! transports, plus an fd-indexed view for non-clone transports.
//! SPEC_FULL.md §4.2.
//!
//! The original's slot arrays used `((void*)-1)` as a tombstone
//! sentinel mixed in with real pointers and `nullptr` for "never
//! occupied"; that three-way overload is replaced here with an
//! explicit `Slot` sum type, per the redesign flag in SPEC_FULL.md §9.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{FailFast, RpcError};
use crate::idalloc::IdAllocator;
use crate::transport::Transport;

const INITIAL_ID_CAPACITY: usize = 64;
const MAX_ID_CAPACITY: usize = 1 << 20;

enum Slot {
    Empty,
    Tombstone,
    Occupied(Arc<Transport>),
}

struct RegistryInner {
    table: Vec<Slot>,
    socket_table: HashMap<RawFd, usize>,
    ids: IdAllocator,
    count: usize,
}

impl RegistryInner {
    fn new() -> RegistryInner {
        RegistryInner {
            table: Vec::new(),
            socket_table: HashMap::new(),
            ids: IdAllocator::new(INITIAL_ID_CAPACITY, MAX_ID_CAPACITY),
            count: 0,
        }
    }

    fn slot_vacant(&self, id: usize) -> bool {
        match self.table.get(id) {
            None => true,
            Some(Slot::Empty) | Some(Slot::Tombstone) => true,
            Some(Slot::Occupied(t)) => t.progress.has_milestone(crate::progress::RETURN),
        }
    }

    fn ensure_capacity(&mut self, id: usize) {
        if self.table.len() <= id {
            self.table.resize_with(id + 1, || Slot::Empty);
        }
    }
}

/// The transport registry. `version` is bumped on every mutation so
/// readers can cheaply detect that the `view` snapshot is stale; a
/// separate `view` mirror lets tracing code read without contending on
/// `registry_lock` (SPEC_FULL.md §3, §5 lock ordering position 2).
pub struct Registry {
    inner: Mutex<RegistryInner>,
    view: RwLock<Vec<Arc<Transport>>>,
    version: AtomicU64,
    failfast: FailFast,
}

impl Registry {
    pub fn new(failfast: FailFast) -> Registry {
        Registry {
            inner: Mutex::new(RegistryInner::new()),
            view: RwLock::new(Vec::new()),
            version: AtomicU64::new(0),
            failfast,
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Assigns a stable ID if the transport doesn't have one, installs
    /// it in `table` (and `socket_table` if it owns an fd), and bumps
    /// `version`. `AlreadyRegistered` per the **socket availability
    /// rule**: a slot already holding a live, non-returned transport at
    /// that fd blocks registration.
    pub fn register(&self, t: Arc<Transport>) -> Result<usize, RpcError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(fd) = t.fd() {
            if let Some(&existing_id) = inner.socket_table.get(&fd) {
                if !inner.slot_vacant(existing_id) {
                    return Err(RpcError::invariant(format!(
                        "fd {} already registered to a live transport",
                        fd
                    )));
                }
            }
        }

        let id = if t.id() == crate::transport::INVALID_ID {
            let id = inner.ids.allocate()?;
            t.set_id(id);
            id
        } else {
            t.id()
        };

        inner.ensure_capacity(id);
        inner.table[id] = Slot::Occupied(t.clone());
        if let Some(fd) = t.fd() {
            inner.socket_table.insert(fd, id);
        }
        inner.count += 1;
        self.version.fetch_add(1, Ordering::AcqRel);
        drop(inner);
        self.publish();
        Ok(id)
    }

    /// Removes `t` from `table` and `socket_table`, releases its ID,
    /// and decrements its parent's refcount if `t` is a clone.
    pub fn unregister(&self, t: &Transport) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        let id = t.id();
        match inner.table.get(id) {
            Some(Slot::Occupied(existing)) if std::ptr::eq(existing.as_ref(), t) => {}
            _ => {
                return Err(self
                    .failfast
                    .invariant(format!("unregister: id {} does not match the live table entry", id)));
            }
        }
        inner.table[id] = Slot::Tombstone;
        if let Some(fd) = t.fd() {
            inner.socket_table.remove(&fd);
        }
        inner.ids.release(id);
        inner.count = inner.count.saturating_sub(1);
        self.version.fetch_add(1, Ordering::AcqRel);

        if let Some(parent_id) = t.parent_id {
            if let Some(Slot::Occupied(parent)) = inner.table.get(parent_id) {
                parent.refcount.fetch_sub(1, Ordering::AcqRel);
            }
        }

        drop(inner);
        self.publish();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    pub fn get(&self, id: usize) -> Option<Arc<Transport>> {
        let inner = self.inner.lock().unwrap();
        match inner.table.get(id) {
            Some(Slot::Occupied(t)) => Some(t.clone()),
            _ => None,
        }
    }

    pub fn get_by_fd(&self, fd: RawFd) -> Option<Arc<Transport>> {
        let inner = self.inner.lock().unwrap();
        let id = *inner.socket_table.get(&fd)?;
        match inner.table.get(id) {
            Some(Slot::Occupied(t)) => Some(t.clone()),
            _ => None,
        }
    }

    /// Copies the live table into `view` under a read lock (held only
    /// by this method, not callers) so snapshot readers never take
    /// `registry_lock`.
    fn publish(&self) {
        let inner = self.inner.lock().unwrap();
        let snapshot: Vec<Arc<Transport>> = inner
            .table
            .iter()
            .filter_map(|s| match s {
                Slot::Occupied(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        drop(inner);
        *self.view.write().unwrap() = snapshot;
    }

    pub fn snapshot(&self) -> Vec<Arc<Transport>> {
        self.view.read().unwrap().clone()
    }

    /// Consistency sweep covering invariants I1-I4 (SPEC_FULL.md §3).
    /// Aborts in `FailFast::Abort` mode, returns `Err` in
    /// `FailFast::Report` mode.
    pub fn fsck(&self) -> Result<(), RpcError> {
        let inner = self.inner.lock().unwrap();
        for (id, slot) in inner.table.iter().enumerate() {
            if let Slot::Occupied(t) = slot {
                if t.id() != id {
                    let msg = format!("transport at slot {} reports id {}", id, t.id());
                    drop(inner);
                    return Err(self.failfast.invariant(msg));
                }
                if !t.check_integrity() {
                    let msg = format!("transport {} failed integrity check", id);
                    drop(inner);
                    return Err(self.failfast.invariant(msg));
                }
                if let Some(fd) = t.fd() {
                    if inner.socket_table.get(&fd) != Some(&id) {
                        let msg = format!("fd {} not indexed back to transport {}", fd, id);
                        drop(inner);
                        return Err(self.failfast.invariant(msg));
                    }
                }
            }
        }
        Ok(())
    }
}
