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

//! The poll array: a dense `Vec<libc::pollfd>` rebuilt from the registry
//! each run-loop iteration, filtered by `busy` (SPEC_FULL.md §4.3). Never
//! reused as a membership bit set -- that's what `BitSet`/`IdAllocator`
//! are for (redesign flag, SPEC_FULL.md §9).

use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::poll::{PollFd, PollFlags};

use crate::registry::Registry;
use crate::transport::Transport;

/// One entry in the rebuilt poll array alongside the transport it came
/// from, so the run loop can hand the right transport to the pipeline
/// once `poll` reports it ready without a second registry lookup.
pub struct PollEntry {
    pub fd: RawFd,
    pub transport: Arc<Transport>,
}

/// Rebuilds the poll array from the registry's current snapshot,
/// dropping transports that are `busy` (owned by an in-flight request)
/// or that don't currently own an fd (UDP clones, which never poll).
pub fn build(registry: &Registry) -> Vec<PollEntry> {
    registry
        .snapshot()
        .into_iter()
        .filter(|t| !t.is_busy())
        .filter_map(|t| t.fd().map(|fd| PollEntry { fd, transport: t }))
        .collect()
}

/// Converts a built poll array into the `nix::poll::PollFd` slice that
/// `poll(2)` actually wants, keeping entry order aligned so results can
/// be zipped back against `entries` after the call returns.
pub fn to_pollfds(entries: &[PollEntry]) -> Vec<PollFd> {
    entries.iter().map(|e| PollFd::new(e.fd, PollFlags::POLLIN)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailFast;
    use crate::transport::udp::UdpCloneState;
    use crate::transport::{Role, Transport, TransportKind};

    #[test]
    fn busy_tcp_rendezvous_is_excluded_but_idle_is_included() {
        use crate::transport::tcp::TcpRendezvousState;

        let reg = Registry::new(FailFast::Report);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let t = Arc::new(Transport::new(
            Role::RendezvousTcp,
            0,
            None,
            TransportKind::TcpRendezvous(TcpRendezvousState::new(listener, None)),
        ));
        reg.register(t.clone()).unwrap();

        assert_eq!(build(&reg).len(), 1);
        t.set_busy(true);
        assert!(build(&reg).is_empty());
    }

    #[test]
    fn busy_transports_are_excluded_from_the_poll_array() {
        let reg = Registry::new(FailFast::Report);
        let t = Arc::new(Transport::new(
            Role::CloneUdp,
            0,
            None,
            TransportKind::UdpClone(UdpCloneState::new()),
        ));
        reg.register(t.clone()).unwrap();

        // UDP clones never own an fd, so they're excluded from the poll
        // array regardless of `busy` -- confirm a non-busy clone yields
        // no entries, then confirm marking it busy keeps it that way.
        assert!(build(&reg).is_empty());
        t.set_busy(true);
        assert!(build(&reg).is_empty());
    }
}
