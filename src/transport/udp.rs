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

//! UDP datagram transport, per-request clone semantics, and the optional
//! reply cache. SPEC_FULL.md §4.8.
//!
//! `IP_PKTINFO` reflection of the destination address (mentioned as
//! optional in SPEC_FULL.md §4.8) is not implemented: this crate binds
//! one socket per transport rather than a wildcard listener shared
//! across addresses, so there is no ambiguity about which local address
//! a reply should come from. A deployment that needs `INADDR_ANY`
//! binding with accurate reply source addresses would add it at the
//! `UdpConnectionState::send_to` call site; noted in DESIGN.md rather
//! than guessed at.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::Bytes;

use crate::codec::{Decoder, RpcProc, RpcProg, RpcVers, Xid};
use crate::error::RpcError;

pub struct UdpConnectionState {
    pub fd: RawFd,
    pub socket: UdpSocket,
    pub recv_buf_cap: usize,
    pub cache: Option<ReplyCache>,
}

/// A UDP clone owns no fd and no peer address of its own -- all reply
/// I/O for a clone routes through the parent transport's socket
/// (`pipeline::send_reply` dispatches on `owner`, never on the clone),
/// so this marker type carries nothing but the role tag in
/// `TransportKind::UdpClone`.
pub struct UdpCloneState;

pub enum RecvOutcome {
    /// A new call that needs dispatch; carries the raw datagram.
    Message(Bytes, SocketAddr),
    /// A cache hit was retransmitted; no dispatch needed.
    Replayed,
    WouldBlock,
}

impl UdpConnectionState {
    pub fn new(socket: UdpSocket, recv_buf_cap: usize) -> UdpConnectionState {
        socket.set_nonblocking(true).ok();
        UdpConnectionState {
            fd: socket.as_raw_fd(),
            socket,
            recv_buf_cap,
            cache: None,
        }
    }

    pub fn enable_cache(&mut self, capacity: usize) {
        self.cache = Some(ReplyCache::new(capacity));
    }

    /// Receive one datagram. If the reply cache is enabled and holds an
    /// entry for this request's key, the cached reply is retransmitted
    /// immediately and no new work is reported -- `recv` "reports no new
    /// work" per SPEC_FULL.md §4.8.
    pub fn recv_request(&mut self) -> Result<RecvOutcome, RpcError> {
        let mut buf = vec![0u8; self.recv_buf_cap];
        match self.socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                buf.truncate(n);
                let bytes = Bytes::from(buf);
                if let Some(cache) = &mut self.cache {
                    if let Some(key) = cache_key_of(&bytes, peer) {
                        if let Some(cached) = cache.get(&key) {
                            self.socket
                                .send_to(cached, peer)
                                .map_err(|e| RpcError::transport_fatal(format!("sendto failed: {}", e)))?;
                            return Ok(RecvOutcome::Replayed);
                        }
                    }
                }
                Ok(RecvOutcome::Message(bytes, peer))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
            Err(e) => Err(RpcError::transport_fatal(format!("recvfrom failed: {}", e))),
        }
    }

    pub fn send_to(&self, payload: &[u8], peer: SocketAddr) -> Result<(), RpcError> {
        self.socket
            .send_to(payload, peer)
            .map_err(|e| RpcError::transport_fatal(format!("sendto failed: {}", e)))?;
        Ok(())
    }

    /// Record a reply in the cache, keyed by the call that produced it.
    pub fn cache_reply(&mut self, call_bytes: &[u8], peer: SocketAddr, reply: Bytes) {
        if let Some(cache) = &mut self.cache {
            if let Some(key) = cache_key_of(call_bytes, peer) {
                cache.insert(key, reply);
            }
        }
    }
}

impl UdpCloneState {
    pub fn new() -> UdpCloneState {
        UdpCloneState
    }
}

impl Default for UdpCloneState {
    fn default() -> UdpCloneState {
        UdpCloneState::new()
    }
}

/// `(xid, prog, vers, proc, peer)` -- the reply cache's lookup key,
/// SPEC_FULL.md §4.8.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub xid: Xid,
    pub prog: RpcProg,
    pub vers: RpcVers,
    pub proc_: RpcProc,
    pub peer: SocketAddr,
}

fn cache_key_of(datagram: &[u8], peer: SocketAddr) -> Option<CacheKey> {
    let mut dec = Decoder::new(datagram);
    let call = crate::codec::decode_call_message(&mut dec).ok()?;
    Some(CacheKey { xid: call.xid, prog: call.prog, vers: call.vers, proc_: call.proc_, peer })
}

/// Fixed-capacity FIFO reply cache. A `HashMap` plays the role of the
/// original's `4N`-bucket chained hash table -- Rust's standard map
/// already chains/open-addresses internally with the same expected O(1)
/// lookup, so reimplementing a fixed-bucket-count table buys nothing;
/// the FIFO eviction ring is the part of the design that actually
/// matters and is kept explicit below.
pub struct ReplyCache {
    capacity: usize,
    entries: HashMap<CacheKey, Bytes>,
    order: VecDeque<CacheKey>,
}

impl ReplyCache {
    pub fn new(capacity: usize) -> ReplyCache {
        ReplyCache {
            capacity,
            entries: HashMap::with_capacity(capacity * 2),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&Bytes> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: CacheKey, reply: Bytes) {
        if self.entries.contains_key(&key) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, reply);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(xid: u32) -> CacheKey {
        CacheKey {
            xid,
            prog: 1,
            vers: 1,
            proc_: 1,
            peer: "127.0.0.1:1234".parse().unwrap(),
        }
    }

    #[test]
    fn cache_evicts_oldest_first() {
        let mut cache = ReplyCache::new(2);
        cache.insert(key(1), Bytes::from_static(b"a"));
        cache.insert(key(2), Bytes::from_static(b"b"));
        cache.insert(key(3), Bytes::from_static(b"c"));
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.get(&key(2)).unwrap(), &Bytes::from_static(b"b"));
        assert_eq!(cache.get(&key(3)).unwrap(), &Bytes::from_static(b"c"));
    }

    #[test]
    fn duplicate_insert_does_not_disturb_order() {
        let mut cache = ReplyCache::new(2);
        cache.insert(key(1), Bytes::from_static(b"a"));
        cache.insert(key(1), Bytes::from_static(b"a-again"));
        cache.insert(key(2), Bytes::from_static(b"b"));
        cache.insert(key(3), Bytes::from_static(b"c"));
        // key(1) was the oldest surviving entry and should be evicted,
        // not key(2), since the duplicate insert of key(1) is a no-op.
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
    }
}
