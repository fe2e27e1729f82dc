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

//! Allocation of small dense integer IDs for transports. Allocation and
//! release must only ever happen while the caller holds the registry lock
//! (see `registry::Registry`); this module does no locking of its own.

use crate::bitset::BitSet;
use crate::error::RpcError;

const GROWTH_FACTOR: usize = 2;

/// Allocates the smallest unused ID in `[0, capacity)`, growing the
/// backing bit set geometrically rather than failing outright -- the
/// original's fixed-size `xports` array is the one part of `svc.c` this
/// crate intentionally does not carry forward, since an Vec-backed
/// registry has no reason to impose a hard transport ceiling.
pub struct IdAllocator {
    ids: BitSet,
    max_cap: usize,
}

impl IdAllocator {
    pub fn new(initial_cap: usize, max_cap: usize) -> IdAllocator {
        IdAllocator {
            ids: BitSet::new(initial_cap),
            max_cap,
        }
    }

    pub fn allocate(&mut self) -> Result<usize, RpcError> {
        if let Some(id) = self.ids.first_unset() {
            self.ids.set(id);
            return Ok(id);
        }

        let next_cap = (self.ids.capacity() * GROWTH_FACTOR).max(1);
        if next_cap > self.max_cap {
            return Err(RpcError::resource("transport id space exhausted"));
        }
        self.ids.grow(next_cap);
        let id = self
            .ids
            .first_unset()
            .expect("bit set grew but has no free bit");
        self.ids.set(id);
        Ok(id)
    }

    pub fn release(&mut self, id: usize) {
        self.ids.clear(id);
    }

    pub fn is_allocated(&self, id: usize) -> bool {
        self.ids.test(id)
    }

    pub fn count(&self) -> usize {
        self.ids.count()
    }

    pub fn capacity(&self) -> usize {
        self.ids.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_low_to_high_and_reuses_released() {
        let mut a = IdAllocator::new(4, 64);
        assert_eq!(a.allocate().unwrap(), 0);
        assert_eq!(a.allocate().unwrap(), 1);
        a.release(0);
        assert_eq!(a.allocate().unwrap(), 0);
        assert_eq!(a.allocate().unwrap(), 2);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut a = IdAllocator::new(2, 64);
        let ids: Vec<usize> = (0..10).map(|_| a.allocate().unwrap()).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn fails_when_max_capacity_exhausted() {
        let mut a = IdAllocator::new(1, 1);
        assert_eq!(a.allocate().unwrap(), 0);
        assert!(a.allocate().is_err());
    }
}
