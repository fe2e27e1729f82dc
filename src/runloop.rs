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

//! The single poll thread's run loop: rebuild the poll array, block in
//! `poll(2)`, hand ready transports to the pipeline, sweep the reaper,
//! repeat. SPEC_FULL.md §4.3.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::poll::poll;

use crate::gc::Reaper;
use crate::pipeline::Pipeline;
use crate::pollset;
use crate::registry::Registry;

/// Cooperative shutdown flag, checked once per iteration. `request_shutdown`
/// (the public API, SPEC_FULL.md §6) sets this; it is never cleared once
/// set, matching the one-shot nature of process shutdown.
#[derive(Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub fn new() -> ShutdownFlag {
        ShutdownFlag(AtomicBool::new(false))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Rebuilds the poll array from the registry, blocks in `poll(2)` for up
/// to `poll_timeout`, and hands every ready transport to the pipeline in
/// turn. A `poll_timeout` that elapses with nothing ready still runs the
/// reaper sweep, so GC makes progress even under an idle server.
pub fn run(pipeline: &Pipeline, registry: &Registry, reaper: &Reaper, poll_timeout: Duration, shutdown: &ShutdownFlag) {
    while !shutdown.is_set() {
        run_once(pipeline, registry, reaper, poll_timeout);
    }
}

/// One iteration of the loop body, split out so tests can drive it
/// directly without spinning a background thread. Follows SPEC_FULL.md
/// §4.3's step order: reap, rate-limit, rebuild the poll array, poll,
/// dispatch.
pub fn run_once(pipeline: &Pipeline, registry: &Registry, reaper: &Reaper, poll_timeout: Duration) {
    reaper.reap_all(registry);
    rate_limit(pipeline, registry);

    #[cfg(debug_assertions)]
    if let Err(e) = registry.fsck() {
        log::error!("registry consistency check failed: {}", e);
    }

    let entries = pollset::build(registry);
    if entries.is_empty() {
        std::thread::sleep(poll_timeout.min(Duration::from_millis(10)));
        return;
    }

    let mut pollfds = pollset::to_pollfds(&entries);
    let timeout_ms = poll_timeout.as_millis().min(i32::MAX as u128) as i32;
    match poll(&mut pollfds, timeout_ms) {
        Ok(0) => {}
        Ok(_) => {
            for (entry, pfd) in entries.iter().zip(pollfds.iter()) {
                let revents = pfd.revents().unwrap_or_else(nix::poll::PollFlags::empty);
                if !revents.is_empty() {
                    pipeline.on_ready(entry.transport.clone());
                }
            }
        }
        Err(e) => {
            log::warn!("poll failed: {}", e);
        }
    }
}

/// Caps concurrency at roughly one busy transport per hardware thread
/// (SPEC_FULL.md §4.3 step 2, P5): while `n_busy` exceeds
/// `available_parallelism()`, sleep `rate_limit_sleep` and recount,
/// breaking out the moment two consecutive samples agree so a plateau
/// (rather than active draining) doesn't spin the poll thread forever.
fn rate_limit(pipeline: &Pipeline, registry: &Registry) {
    let ceiling = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let mut n_busy = count_busy(registry);
    let mut prev = None;
    while n_busy > ceiling {
        if prev == Some(n_busy) {
            break;
        }
        prev = Some(n_busy);
        pipeline.stats.rate_limit_waits();
        std::thread::sleep(pipeline.config.rate_limit_sleep);
        n_busy = count_busy(registry);
    }
}

fn count_busy(registry: &Registry) -> usize {
    registry.snapshot().iter().filter(|t| t.is_busy()).count()
}

/// Runs the loop on a dedicated OS thread, returning a handle the caller
/// can join after calling `ShutdownFlag::request`. This is the shape
/// `create_tcp_server`/`create_udp_server` callers use in practice; `run`
/// itself stays synchronous so tests can single-step `run_once`.
pub fn spawn(pipeline: Arc<Pipeline>, registry: Arc<Registry>, reaper: Arc<Reaper>, poll_timeout: Duration, shutdown: Arc<ShutdownFlag>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        run(&pipeline, &registry, &reaper, poll_timeout, &shutdown);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NullAuthenticator;
    use crate::callout::CalloutTable;
    use crate::config::Config;
    use crate::error::FailFast;
    use crate::pipeline::SpawnPerRequestPool;
    use crate::stats::Stats;
    use crate::transport::tcp::TcpRendezvousState;
    use crate::transport::{Role, Transport, TransportKind};
    use std::net::TcpListener;

    fn test_pipeline(registry: Arc<Registry>) -> Pipeline {
        Pipeline {
            registry,
            callouts: Arc::new(CalloutTable::new()),
            reaper: Arc::new(Reaper::new()),
            stats: Arc::new(Stats::default()),
            config: Config::for_tests(),
            authenticator: Arc::new(NullAuthenticator),
            workers: Arc::new(SpawnPerRequestPool),
        }
    }

    #[test]
    fn an_idle_iteration_does_not_panic_and_still_sweeps_gc() {
        let registry = Arc::new(Registry::new(FailFast::Report));
        let reaper = Reaper::new();
        let pipeline = test_pipeline(registry.clone());
        run_once(&pipeline, &registry, &reaper, Duration::from_millis(5));
    }

    #[test]
    fn a_pending_connection_is_accepted_within_one_iteration() {
        let registry = Arc::new(Registry::new(FailFast::Report));
        let reaper = Reaper::new();
        let pipeline = test_pipeline(registry.clone());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let rendezvous = Arc::new(Transport::new(
            Role::RendezvousTcp,
            addr.port(),
            None,
            TransportKind::TcpRendezvous(TcpRendezvousState::new(listener, None)),
        ));
        registry.register(rendezvous).unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        // Give the kernel a moment to complete the handshake, then drive
        // one iteration; poll(2) itself will also wait up to the timeout.
        std::thread::sleep(Duration::from_millis(20));
        run_once(&pipeline, &registry, &reaper, Duration::from_millis(200));

        assert_eq!(registry.count(), 2); // rendezvous + accepted connection
    }
}
