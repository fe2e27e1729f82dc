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

//! The per-request milestone bitset, modeled as a cross-thread
//! communication channel (SPEC_FULL.md §9) rather than reusing a mutex's
//! side effects to signal progress. Bits never clear once set within a
//! request -- a monotone join-semilattice, per invariant I5.

use std::sync::atomic::{AtomicU32, Ordering};

pub const RECV: u32 = 1 << 0;
pub const READ: u32 = 1 << 1;
pub const GETARGS: u32 = 1 << 2;
pub const DISPATCH: u32 = 1 << 3;
pub const REPLY: u32 = 1 << 4;
pub const FREEARGS: u32 = 1 << 5;
pub const WAIT: u32 = 1 << 6;
pub const RETURN: u32 = 1 << 7;

/// Atomic milestone bitset for one transport's in-flight request.
#[derive(Debug, Default)]
pub struct Progress(AtomicU32);

impl Progress {
    pub fn new() -> Progress {
        Progress(AtomicU32::new(0))
    }

    /// Set a milestone bit. The worker's write of `GETARGS` happens-before
    /// the poll thread's subsequent acquire-load, per SPEC_FULL.md §5.
    pub fn set_milestone(&self, bit: u32) {
        self.0.fetch_or(bit, Ordering::Release);
    }

    pub fn has_milestone(&self, bit: u32) -> bool {
        self.0.load(Ordering::Acquire) & bit != 0
    }

    pub fn has_any(&self, bits: u32) -> bool {
        self.0.load(Ordering::Acquire) & bits != 0
    }

    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Reset to the empty state. Only valid on a reusable connection
    /// transport whose `RETURN` bit is set and which the poll thread
    /// alone is resetting (invariant asserted by `fsck`, not enforced by
    /// the type system -- see the Open Questions resolution in DESIGN.md).
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_never_regress() {
        let p = Progress::new();
        p.set_milestone(RECV);
        p.set_milestone(GETARGS);
        assert!(p.has_milestone(RECV));
        assert!(p.has_milestone(GETARGS));
        assert_eq!(p.bits(), RECV | GETARGS);
    }

    #[test]
    fn reset_clears_all_bits() {
        let p = Progress::new();
        p.set_milestone(RECV | RETURN);
        p.reset();
        assert_eq!(p.bits(), 0);
    }

    #[test]
    fn has_any_matches_composite_masks() {
        let p = Progress::new();
        p.set_milestone(GETARGS);
        assert!(p.has_any(GETARGS | RETURN));
        assert!(!p.has_any(RETURN | REPLY));
    }
}
