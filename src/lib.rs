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

//! A multi-threaded ONC-RPC (SunRPC, RFC 5531) server runtime: one poll
//! thread, any number of application-owned worker threads, a transport
//! registry with mark-and-sweep reclamation, and pluggable
//! authentication, name-service registration, and concurrency policy.
//! See SPEC_FULL.md for the full module-by-module design.

pub mod auth;
pub mod bitset;
pub mod callout;
pub mod codec;
pub mod config;
pub mod error;
pub mod gc;
pub mod idalloc;
pub mod pipeline;
pub mod pmap;
pub mod pollset;
pub mod progress;
pub mod registry;
pub mod runloop;
pub mod semaphore;
pub mod stats;
pub mod transport;

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;

use auth::{Authenticator, NullAuthenticator};
use callout::{CalloutTable, Dispatch, PmapProtocol};
use codec::{RpcProg, RpcVers};
use config::Config;
use error::RpcError;
use gc::Reaper;
use pipeline::{Pipeline, SpawnPerRequestPool, WorkerPool};
use pmap::{NullPortMapper, PortMapper};
use registry::Registry;
use runloop::ShutdownFlag;
use stats::StatsSnapshot;
use transport::tcp::TcpRendezvousState;
use transport::udp::UdpConnectionState;
use transport::{Role, Transport, TransportKind};

/// Default datagram receive buffer; large enough for any call this
/// crate's minimal codec can produce, matching the original's
/// `UDPMSGSIZE`.
pub const DEFAULT_UDP_RECV_BUF: usize = 65_536;

/// A running (or not-yet-started) RPC service: the registry, callout
/// table, reaper, stats, and policy objects a poll loop needs. Construct
/// one with `Server::new`, register transports and programs, then call
/// `run_loop` or `spawn_loop`.
pub struct Server {
    pub registry: Arc<Registry>,
    pub callouts: Arc<CalloutTable>,
    pub reaper: Arc<Reaper>,
    pub stats: Arc<Stats>,
    pub config: Config,
    pub authenticator: Arc<dyn Authenticator>,
    pub port_mapper: Arc<dyn PortMapper>,
    pub workers: Arc<dyn WorkerPool>,
    shutdown: Arc<ShutdownFlag>,
}

// `Stats` is re-exported at crate root for API ergonomics; the type
// itself still lives in `stats`.
pub use stats::Stats;

impl Server {
    pub fn new(config: Config) -> Server {
        let failfast = config.failfast();
        Server {
            registry: Arc::new(Registry::new(failfast)),
            callouts: Arc::new(CalloutTable::new()),
            reaper: Arc::new(Reaper::new()),
            stats: Arc::new(Stats::default()),
            config,
            authenticator: Arc::new(NullAuthenticator),
            port_mapper: Arc::new(NullPortMapper),
            workers: Arc::new(SpawnPerRequestPool),
            shutdown: Arc::new(ShutdownFlag::new()),
        }
    }

    /// Installs a custom `Authenticator`, replacing the default
    /// accept-everything `NullAuthenticator`. Must be called before
    /// `run_loop`/`spawn_loop`.
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Server {
        self.authenticator = auth;
        self
    }

    pub fn with_port_mapper(mut self, pmap: Arc<dyn PortMapper>) -> Server {
        self.port_mapper = pmap;
        self
    }

    /// Installs a custom `WorkerPool`, replacing the default
    /// spawn-a-thread-per-request policy.
    pub fn with_worker_pool(mut self, workers: Arc<dyn WorkerPool>) -> Server {
        self.workers = workers;
        self
    }

    /// Binds a TCP listener and registers it as a rendezvous transport.
    /// Returns the registry id; the accepted connections it later
    /// spawns get their own ids.
    pub fn create_tcp_server(&self, addr: SocketAddr) -> Result<usize, RpcError> {
        let listener = TcpListener::bind(addr).map_err(|e| RpcError::transport_fatal(format!("bind failed: {}", e)))?;
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(addr.port());
        let fd_range = self.config.fd_range;
        let t = Arc::new(Transport::new(
            Role::RendezvousTcp,
            port,
            None,
            TransportKind::TcpRendezvous(TcpRendezvousState::new(listener, fd_range)),
        ));
        self.registry.register(t)
    }

    /// Binds a UDP socket and registers it as a connection transport.
    pub fn create_udp_server(&self, addr: SocketAddr) -> Result<usize, RpcError> {
        let socket = UdpSocket::bind(addr).map_err(|e| RpcError::transport_fatal(format!("bind failed: {}", e)))?;
        let port = socket.local_addr().map(|a| a.port()).unwrap_or(addr.port());
        let t = Arc::new(Transport::new(
            Role::ConnectionUdp,
            port,
            None,
            TransportKind::UdpConnection(UdpConnectionState::new(socket, DEFAULT_UDP_RECV_BUF)),
        ));
        self.registry.register(t)
    }

    /// Enables the retransmit reply cache on a previously created UDP
    /// transport (SPEC_FULL.md §4.8).
    pub fn enable_udp_reply_cache(&self, transport_id: usize, capacity: usize) -> Result<(), RpcError> {
        let t = self
            .registry
            .get(transport_id)
            .ok_or_else(|| RpcError::application(format!("no such transport: {}", transport_id)))?;
        let mut state = t.state.lock().unwrap();
        match &mut state.kind {
            TransportKind::UdpConnection(u) => {
                u.enable_cache(capacity);
                Ok(())
            }
            _ => Err(RpcError::application("reply cache only applies to a UDP connection transport")),
        }
    }

    /// Registers a `(program, version)` dispatch function, and reflects
    /// it to the name service unless `pmap` is `PmapProtocol::None`.
    pub fn register_program(
        &self,
        prog: RpcProg,
        vers: RpcVers,
        dispatch: impl Dispatch + 'static,
        pmap: PmapProtocol,
        port: u16,
    ) -> Result<(), RpcError> {
        self.callouts.register(prog, vers, dispatch, pmap)?;
        if pmap != PmapProtocol::None {
            self.port_mapper.set(prog, vers, pmap, port)?;
        }
        Ok(())
    }

    pub fn unregister_program(&self, prog: RpcProg, vers: RpcVers) -> Result<(), RpcError> {
        if let Some(pmap) = self.callouts.pmap_protocol_of(prog, vers) {
            if pmap != PmapProtocol::None {
                self.port_mapper.unset(prog, vers)?;
            }
        }
        self.callouts.unregister(prog, vers);
        Ok(())
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline {
            registry: self.registry.clone(),
            callouts: self.callouts.clone(),
            reaper: self.reaper.clone(),
            stats: self.stats.clone(),
            config: self.config.clone(),
            authenticator: self.authenticator.clone(),
            workers: self.workers.clone(),
        }
    }

    /// Runs the poll loop on the calling thread until `request_shutdown`
    /// is called from another thread.
    pub fn run_loop(&self) {
        let pipeline = self.pipeline();
        runloop::run(&pipeline, &self.registry, &self.reaper, self.config.poll_timeout, &self.shutdown);
    }

    /// Runs the poll loop on a dedicated thread, returning a join handle.
    pub fn spawn_loop(self: &Arc<Server>) -> std::thread::JoinHandle<()> {
        let server = self.clone();
        std::thread::spawn(move || server.run_loop())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Reply-shaping constructors a dispatch function returns from its
/// `Result<(), RpcError>` to steer which `accept_stat` the pipeline
/// sends, without the handler needing to know the wire encoding
/// (SPEC_FULL.md §6).
pub mod reply {
    use crate::error::RpcError;

    /// The call's arguments didn't decode the way this procedure expects.
    pub fn garbage_args(msg: impl Into<String>) -> RpcError {
        RpcError::protocol(msg)
    }

    /// An internal failure unrelated to the call's arguments.
    pub fn system_error(msg: impl Into<String>) -> RpcError {
        RpcError::application(msg)
    }

    /// This program/version doesn't implement the requested procedure
    /// number.
    pub fn no_procedure(msg: impl Into<String>) -> RpcError {
        RpcError::proc_unavail(msg)
    }

    /// A handler-level authorization failure discovered after program
    /// dispatch (e.g. an access-control check the procedure itself
    /// performs). Surfaces as a generic `SystemErr` on the wire -- RFC
    /// 5531 only has a slot for auth rejection on the call as a whole,
    /// sent before dispatch via `Authenticator`.
    pub fn auth_error(msg: impl Into<String>) -> RpcError {
        RpcError::Auth(msg.into())
    }
}
