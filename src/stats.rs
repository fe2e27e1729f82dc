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

//! Process-wide atomic counters, exposed read-only via `Stats::snapshot`
//! (SPEC_FULL.md §5). Relaxed ordering is sufficient here -- these are
//! statistics, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    requests_received: AtomicU64,
    requests_dispatched: AtomicU64,
    get_args_calls: AtomicU64,
    reply_calls: AtomicU64,
    free_args_calls: AtomicU64,
    return_calls: AtomicU64,
    rate_limit_waits: AtomicU64,
}

/// A point-in-time copy of every counter, safe to log or export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_received: u64,
    pub requests_dispatched: u64,
    pub get_args_calls: u64,
    pub reply_calls: u64,
    pub free_args_calls: u64,
    pub return_calls: u64,
    pub rate_limit_waits: u64,
}

macro_rules! counter_methods {
    ($($field:ident),+ $(,)?) => {
        impl Stats {
            $(
                pub fn $field(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )+

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $(
                        $field: self.$field.load(Ordering::Relaxed),
                    )+
                }
            }
        }
    };
}

counter_methods!(
    requests_received,
    requests_dispatched,
    get_args_calls,
    reply_calls,
    free_args_calls,
    return_calls,
    rate_limit_waits,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = Stats::default();
        stats.requests_received();
        stats.requests_received();
        stats.reply_calls();

        let snap = stats.snapshot();
        assert_eq!(snap.requests_received, 2);
        assert_eq!(snap.reply_calls, 1);
        assert_eq!(snap.get_args_calls, 0);
    }
}
