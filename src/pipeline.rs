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

//! The request pipeline: `on_ready(fd)` drives one transport through
//! receive, authenticate, match, dispatch, wait, reply. SPEC_FULL.md
//! §4.4.
//!
//! Workers are owned by the application, not spawned by this crate
//! (SPEC_FULL.md §5) -- `on_ready` hands completed-call work to an
//! injected `WorkerPool` rather than calling `std::thread::spawn`
//! itself, so the `server` binary and the test harness can supply
//! whatever pool they like.
//!
//! This crate's minimal codec (§4.11) has no per-program argument types
//! to decode separately from the handler body, so `get_args` and the
//! user dispatch happen inside one `Dispatch::call` invocation rather
//! than as discrete library-visible steps. The milestone bits are still
//! set and released individually around that call (`GETARGS` right
//! before it runs, `DISPATCH`/`REPLY`/`FREEARGS` right after it
//! returns), so the wait semantics of SPEC_FULL.md §4.5-4.6 hold exactly
//! as specified even though the boundary between "reading args" and
//! "running the handler" collapses to a single call.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::auth::{AuthStatus, Authenticator};
use crate::callout::{CalloutTable, Lookup};
use crate::codec::{
    decode_call_message, encode_reply_message, AcceptStat, AuthStat, CallHeader, Decoder, Encoder, OpaqueAuth,
    RejectStat, ReplyBody, ReplyHeader, AUTH_NULL,
};
use crate::config::{Config, MtMode, WaitMethod};
use crate::error::RpcError;
use crate::gc::Reaper;
use crate::progress;
use crate::registry::Registry;
use crate::stats::Stats;
use crate::transport::tcp::{RecvOutcome as TcpOutcome, TcpConnectionState};
use crate::transport::udp::{RecvOutcome as UdpOutcome, UdpCloneState};
use crate::transport::{Role, Transport, TransportKind};

/// Where completed-call work runs. The library never spawns these
/// threads itself; `SpawnPerRequestPool` is the simplest faithful
/// implementation ("unbounded worker threads", SPEC_FULL.md §5) and is
/// what the `server` binary and test harness install by default.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

pub struct SpawnPerRequestPool;

impl WorkerPool for SpawnPerRequestPool {
    fn submit(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        std::thread::spawn(job);
    }
}

pub struct Pipeline {
    pub registry: Arc<Registry>,
    pub callouts: Arc<CalloutTable>,
    pub reaper: Arc<Reaper>,
    pub stats: Arc<Stats>,
    pub config: Config,
    pub authenticator: Arc<dyn Authenticator>,
    pub workers: Arc<dyn WorkerPool>,
}

impl Pipeline {
    /// Services one ready transport. Rendezvous transports accept;
    /// connection transports receive and (for TCP) service every
    /// record already buffered from the read that triggered this call,
    /// so batched calls need no extra poll iterations.
    pub fn on_ready(&self, t: Arc<Transport>) {
        match t.role {
            Role::RendezvousTcp => self.on_tcp_rendezvous_ready(t),
            Role::ConnectionTcp => self.on_tcp_connection_ready(t),
            Role::ConnectionUdp => self.on_udp_connection_ready(t),
            Role::CloneUdp => {
                log::error!("poll loop observed a clone transport directly; clones never own an fd");
            }
        }
    }

    fn on_tcp_rendezvous_ready(&self, t: Arc<Transport>) {
        let outcome = {
            let state = t.state.lock().unwrap();
            match &state.kind {
                TransportKind::TcpRendezvous(r) => r.accept_once(),
                _ => return,
            }
        };
        match outcome {
            Ok(TcpOutcome::Accepted(stream, _peer)) => {
                let conn = TcpConnectionState::new(stream, self.config.tcp_read_timeout);
                let conn_t = Arc::new(Transport::new(Role::ConnectionTcp, t.port, None, TransportKind::TcpConnection(conn)));
                if let Err(e) = self.registry.register(conn_t) {
                    log::warn!("failed to register accepted connection: {}", e);
                }
            }
            Ok(TcpOutcome::WouldBlock) | Ok(TcpOutcome::Message(_)) | Ok(TcpOutcome::Dead) => {}
            Err(e) => {
                log::debug!("accept failed: {}", e);
                std::thread::sleep(self.config.accept_backoff);
            }
        }
    }

    fn on_tcp_connection_ready(&self, t: Arc<Transport>) {
        if t.progress.has_milestone(progress::RETURN) {
            t.progress.reset();
        }
        t.set_busy(true);

        let outcome = {
            let mut state = t.state.lock().unwrap();
            match &mut state.kind {
                TransportKind::TcpConnection(c) => c.recv_request(),
                _ => return,
            }
        };

        match outcome {
            Ok(TcpOutcome::Message(msg)) => {
                t.progress.set_milestone(progress::RECV);
                self.stats.requests_received();
                self.dispatch_and_wait(t.clone(), t.clone(), msg, None);
                self.drain_buffered_tcp_batch(&t);
            }
            Ok(TcpOutcome::WouldBlock) => {
                t.set_busy(false);
            }
            Ok(TcpOutcome::Dead) => {
                self.reaper.mark_for_gc(t.id());
                t.set_busy(false);
            }
            Ok(TcpOutcome::Accepted(..)) => unreachable!("a connection transport never accepts"),
            Err(e) => {
                log::warn!("tcp recv failed on transport {}: {}", t.id(), e);
                self.reaper.mark_for_gc(t.id());
                t.set_busy(false);
            }
        }
    }

    /// After the first record on a connection is serviced, pull out any
    /// further whole records that a single `read(2)` already buffered
    /// (SPEC_FULL.md §8 scenario 3) without another poll iteration.
    fn drain_buffered_tcp_batch(&self, t: &Arc<Transport>) {
        loop {
            // Worker-thread waits in `dispatch_and_wait` may still be
            // running for the prior record in FullyConcurrent mode; the
            // transport's codec buffer, however, is only ever touched
            // by the poll thread between dispatches in this crate's
            // design (a worker only reaches into the transport to call
            // the reply helpers, which go through `send_reply` and
            // don't touch the assembler), so draining here is safe.
            let next = {
                let mut state = t.state.lock().unwrap();
                match &mut state.kind {
                    TransportKind::TcpConnection(c) => c.assembler.take_message(),
                    _ => Ok(None),
                }
            };
            match next {
                Ok(Some(msg)) => {
                    t.set_busy(true);
                    t.progress.set_milestone(progress::RECV);
                    self.stats.requests_received();
                    self.dispatch_and_wait(t.clone(), t.clone(), msg, None);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("batch drain failed on transport {}: {}", t.id(), e);
                    break;
                }
            }
        }
    }

    fn on_udp_connection_ready(&self, t: Arc<Transport>) {
        if t.progress.has_milestone(progress::RETURN) {
            t.progress.reset();
        }

        let outcome = {
            let mut state = t.state.lock().unwrap();
            match &mut state.kind {
                TransportKind::UdpConnection(u) => u.recv_request(),
                _ => return,
            }
        };

        match outcome {
            Ok(UdpOutcome::Message(bytes, peer)) => {
                t.progress.set_milestone(progress::RECV);
                self.stats.requests_received();

                if self.config.mtmode == MtMode::Serial {
                    t.set_busy(true);
                    self.dispatch_and_wait(t.clone(), t.clone(), bytes, Some(peer));
                } else {
                    match self.clone_udp(&t) {
                        Ok(clone_t) => self.dispatch_and_wait(t.clone(), clone_t, bytes, Some(peer)),
                        Err(e) => log::warn!("udp clone failed, servicing inline: {}", e),
                    }
                }
            }
            Ok(UdpOutcome::Replayed) | Ok(UdpOutcome::WouldBlock) => {}
            Err(e) => {
                log::warn!("udp recv failed on transport {}: {}", t.id(), e);
            }
        }
    }

    /// Creates and registers a UDP clone of `parent`: its own scratch
    /// area, no socket of its own, `refcount` 0 until registration
    /// bumps the parent's (SPEC_FULL.md §4.4).
    fn clone_udp(&self, parent: &Arc<Transport>) -> Result<Arc<Transport>, RpcError> {
        let clone = Transport::new(
            Role::CloneUdp,
            parent.port,
            Some(parent.id()),
            TransportKind::UdpClone(UdpCloneState::new()),
        );
        let clone = Arc::new(clone);
        self.registry.register(clone.clone())?;
        parent.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(clone)
    }

    /// Decodes the call header, authenticates, looks up the program,
    /// submits the work to the worker pool, and waits according to the
    /// configured concurrency mode. `owner` is the transport the reply
    /// actually goes out on (the UDP parent's socket for a clone, the
    /// connection itself for TCP and serial UDP); `worker_transport` is
    /// what carries the milestone bits the wait targets.
    fn dispatch_and_wait(&self, owner: Arc<Transport>, worker_transport: Arc<Transport>, raw: Bytes, peer: Option<SocketAddr>) {
        let mut dec = Decoder::new(&raw);
        let call = match decode_call_message(&mut dec) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("malformed call on transport {}: {}", owner.id(), e);
                self.finish_without_dispatch(&owner, &worker_transport);
                return;
            }
        };

        if call.cred.flavor != AUTH_NULL {
            match self.authenticator.authenticate(&call) {
                Ok(AuthStatus::Accepted) => {}
                Ok(status) => {
                    let reply = auth_rejection(&call, status);
                    self.send_reply(&owner, &call, peer, reply, &raw);
                    self.finish_without_dispatch(&owner, &worker_transport);
                    return;
                }
                Err(e) => {
                    log::warn!("authenticator error: {}", e);
                    let reply = auth_rejection(&call, AuthStatus::BadCred);
                    self.send_reply(&owner, &call, peer, reply, &raw);
                    self.finish_without_dispatch(&owner, &worker_transport);
                    return;
                }
            }
        }

        let args = dec.tail().to_vec();
        let pipeline = self.clone_handles();
        let owner_for_job = owner.clone();
        let worker_for_job = worker_transport.clone();
        let mtmode = self.config.mtmode;
        let raw_for_job = raw.clone();

        let workers = pipeline.workers.clone();
        workers.submit(Box::new(move || {
            worker_for_job.progress.set_milestone(progress::GETARGS);
            worker_for_job.ready_signal.release();
            pipeline.stats.get_args_calls();

            let mut arg_dec = Decoder::new(&args);
            let mut body_enc = Encoder::new();
            let lookup = pipeline
                .callouts
                .dispatch(call.prog, call.vers, call.proc_, &mut arg_dec, &mut body_enc);
            worker_for_job.progress.set_milestone(progress::DISPATCH);
            pipeline.stats.requests_dispatched();

            let header = reply_header_for_lookup(&call, &lookup);
            let body = if matches!(lookup, Lookup::Found(Ok(()))) { body_enc.into_bytes() } else { Bytes::new() };
            pipeline.send_reply(&owner_for_job, &call, peer, PreparedReply { header, body }, &raw_for_job);
            worker_for_job.progress.set_milestone(progress::REPLY);
            pipeline.stats.reply_calls();

            worker_for_job.progress.set_milestone(progress::FREEARGS);
            pipeline.stats.free_args_calls();

            pipeline.finalize(&worker_for_job);
            worker_for_job.progress.set_milestone(progress::RETURN);
            pipeline.stats.return_calls();
            worker_for_job.ready_signal.release();
            owner_for_job.set_busy(false);
        }));

        self.wait_for_mode(mtmode, &worker_transport);
    }

    fn finish_without_dispatch(&self, owner: &Arc<Transport>, worker_transport: &Arc<Transport>) {
        worker_transport.progress.set_milestone(progress::GETARGS | progress::DISPATCH | progress::REPLY | progress::FREEARGS);
        self.finalize(worker_transport);
        worker_transport.progress.set_milestone(progress::RETURN);
        owner.set_busy(false);
    }

    fn wait_for_mode(&self, mtmode: MtMode, worker_transport: &Arc<Transport>) {
        let wait_method = match worker_transport.role {
            Role::ConnectionTcp => self.config.wait_method_tcp,
            _ => self.config.wait_method_udp,
        };
        match mtmode {
            MtMode::Serial => self.wait_for_milestone(worker_transport, progress::RETURN, wait_method),
            MtMode::Hybrid => self.wait_for_milestone(worker_transport, progress::GETARGS, wait_method),
            MtMode::FullyConcurrent => {}
        }
    }

    fn wait_for_milestone(&self, t: &Arc<Transport>, bit: u32, method: WaitMethod) {
        match method {
            WaitMethod::Mutex => {
                t.ready_signal.acquire_timeout(self.config.jiffy(), || !t.progress.has_milestone(bit));
            }
            WaitMethod::Usleep => {
                while !t.progress.has_milestone(bit) {
                    std::thread::sleep(self.config.jiffy().max(Duration::from_micros(1)));
                }
            }
        }
    }

    /// Marks a clone for reclamation; leaves a reusable connection's
    /// progress alone so the poll thread (never a worker) performs the
    /// reset, per the Open Question decision in SPEC_FULL.md §9.
    fn finalize(&self, worker_transport: &Arc<Transport>) {
        if worker_transport.role.is_clone() {
            self.reaper.mark_for_gc(worker_transport.id());
        }
    }

    /// `original` is the raw request datagram, needed only to rebuild the
    /// UDP reply cache's key (SPEC_FULL.md §4.8); TCP ignores it.
    fn send_reply(&self, owner: &Arc<Transport>, call: &CallHeader, peer: Option<SocketAddr>, reply: PreparedReply, original: &[u8]) {
        let mut framed = BytesMut::with_capacity(reply.header.len() + reply.body.len());
        framed.extend_from_slice(&reply.header);
        framed.extend_from_slice(&reply.body);
        let framed = framed.freeze();

        let mut state = owner.state.lock().unwrap();
        match &mut state.kind {
            TransportKind::TcpConnection(c) => {
                if let Err(e) = c.send_record(&framed) {
                    log::warn!("tcp reply failed for transport {} (xid {}): {}", owner.id(), call.xid, e);
                }
            }
            TransportKind::UdpConnection(u) => {
                if let Some(peer) = peer {
                    if let Err(e) = u.send_to(&framed, peer) {
                        log::warn!("udp reply failed for transport {} (xid {}): {}", owner.id(), call.xid, e);
                    } else {
                        u.cache_reply(original, peer, framed);
                    }
                }
            }
            _ => log::warn!("send_reply called on a transport with no I/O owner"),
        }
    }

    fn clone_handles(&self) -> Pipeline {
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
}

struct PreparedReply {
    header: Bytes,
    body: Bytes,
}

fn reply_header_for_lookup(call: &CallHeader, lookup: &Lookup) -> Bytes {
    let body = match lookup {
        Lookup::Found(Ok(())) => ReplyBody::Accepted { verf: OpaqueAuth::null(), stat: AcceptStat::Success },
        Lookup::Found(Err(RpcError::Protocol(_))) => {
            ReplyBody::Accepted { verf: OpaqueAuth::null(), stat: AcceptStat::GarbageArgs }
        }
        Lookup::Found(Err(RpcError::ProcUnavail(_))) => {
            ReplyBody::Accepted { verf: OpaqueAuth::null(), stat: AcceptStat::ProcUnavail }
        }
        // A handler-level auth rejection has no RFC wire representation
        // distinct from a generic failure once the call has already been
        // accepted past program/version matching; real per-call auth
        // rejection happens earlier, before dispatch, via `Authenticator`.
        Lookup::Found(Err(_)) => ReplyBody::Accepted { verf: OpaqueAuth::null(), stat: AcceptStat::SystemErr },
        Lookup::VersionMismatch { low, high } => {
            ReplyBody::Accepted { verf: OpaqueAuth::null(), stat: AcceptStat::ProgMismatch { low: *low, high: *high } }
        }
        Lookup::ProgramUnavailable => ReplyBody::Accepted { verf: OpaqueAuth::null(), stat: AcceptStat::ProgUnavail },
    };
    let header = ReplyHeader { xid: call.xid, body };
    let mut enc = Encoder::new();
    encode_reply_message(&header, &mut enc);
    enc.into_bytes()
}

fn auth_rejection(call: &CallHeader, status: AuthStatus) -> PreparedReply {
    let why = match status {
        AuthStatus::BadCred => AuthStat::BadCred,
        AuthStatus::RejectedCred => AuthStat::RejectedCred,
        AuthStatus::BadVerf => AuthStat::BadVerf,
        AuthStatus::RejectedVerf => AuthStat::RejectedVerf,
        AuthStatus::TooWeak => AuthStat::TooWeak,
        AuthStatus::Accepted => AuthStat::BadCred,
    };
    let header = ReplyHeader { xid: call.xid, body: ReplyBody::Rejected(RejectStat::AuthError(why)) };
    let mut enc = Encoder::new();
    encode_reply_message(&header, &mut enc);
    PreparedReply { header: enc.into_bytes(), body: Bytes::new() }
}
