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

//! The mark-and-sweep reaper. SPEC_FULL.md §4.9. The mark set is a bit
//! set over transport IDs, disjointly locked from the registry proper
//! (`gc_lock` sits below `registry_lock` in the SPEC_FULL.md §5 lock
//! order).

use std::sync::Mutex;

use log::debug;

use crate::bitset::BitSet;
use crate::registry::Registry;

pub struct Reaper {
    marked: Mutex<BitSet>,
}

impl Reaper {
    pub fn new() -> Reaper {
        Reaper { marked: Mutex::new(BitSet::new(64)) }
    }

    /// Schedules a transport for destruction on the next sweep.
    pub fn mark_for_gc(&self, id: usize) {
        let mut marked = self.marked.lock().unwrap();
        if id >= marked.capacity() {
            marked.grow((id + 1).next_power_of_two());
        }
        marked.set(id);
    }

    pub fn is_marked(&self, id: usize) -> bool {
        let marked = self.marked.lock().unwrap();
        id < marked.capacity() && marked.test(id)
    }

    /// Destroys every marked transport that invariant I4 allows: clones
    /// unconditionally, owners only once `refcount == 0`. Transports
    /// that can't yet be reclaimed stay marked for the next sweep.
    pub fn reap_all(&self, registry: &Registry) {
        let ids: Vec<usize> = {
            let marked = self.marked.lock().unwrap();
            marked.iter().collect()
        };

        for id in ids {
            let t = match registry.get(id) {
                Some(t) => t,
                None => {
                    self.clear(id);
                    continue;
                }
            };

            let reclaimable = t.role.is_clone() || t.refcount.load(std::sync::atomic::Ordering::Acquire) == 0;
            if !reclaimable {
                continue;
            }

            if let Err(e) = registry.unregister(&t) {
                debug!("gc: unregister of transport {} failed: {}", id, e);
                continue;
            }
            self.clear(id);
            debug!("gc: reclaimed transport {}", id);
        }
    }

    fn clear(&self, id: usize) {
        let mut marked = self.marked.lock().unwrap();
        if id < marked.capacity() {
            marked.clear(id);
        }
    }
}

impl Default for Reaper {
    fn default() -> Reaper {
        Reaper::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailFast;
    use crate::transport::udp::UdpCloneState;
    use crate::transport::{Role, Transport, TransportKind};
    use std::sync::Arc;

    fn clone_transport(parent_id: usize) -> Arc<Transport> {
        Arc::new(Transport::new(
            Role::CloneUdp,
            0,
            Some(parent_id),
            TransportKind::UdpClone(UdpCloneState::new()),
        ))
    }

    #[test]
    fn marked_clone_is_reaped_unconditionally() {
        let reg = Registry::new(FailFast::Report);
        let t = clone_transport(crate::transport::INVALID_ID);
        let id = reg.register(t).unwrap();

        let reaper = Reaper::new();
        reaper.mark_for_gc(id);
        reaper.reap_all(&reg);

        assert_eq!(reg.count(), 0);
        assert!(!reaper.is_marked(id));
    }

    #[test]
    fn marked_owner_with_live_refs_stays_marked() {
        let reg = Registry::new(FailFast::Report);
        let t = Arc::new(Transport::new(
            Role::ConnectionUdp,
            0,
            None,
            TransportKind::UdpClone(UdpCloneState::new()),
        ));
        t.refcount.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        let id = reg.register(t).unwrap();

        let reaper = Reaper::new();
        reaper.mark_for_gc(id);
        reaper.reap_all(&reg);

        assert_eq!(reg.count(), 1);
        assert!(reaper.is_marked(id));
    }
}
