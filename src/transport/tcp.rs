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

//! TCP rendezvous (listen/accept) and connection transports.
//! SPEC_FULL.md §4.7.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg};
use nix::poll::{poll, PollFd, PollFlags};

use crate::codec::RecordAssembler;
use crate::config::FdRange;
use crate::error::RpcError;

pub struct TcpRendezvousState {
    pub fd: RawFd,
    pub listener: TcpListener,
    pub fd_range: Option<FdRange>,
}

pub struct TcpConnectionState {
    pub fd: RawFd,
    pub stream: TcpStream,
    pub assembler: RecordAssembler,
    pub read_timeout: Duration,
}

/// Outcome of one attempt to receive from a rendezvous or connection
/// transport, resolving the Open Question in SPEC_FULL.md §9 about the
/// original's overloaded boolean return from `rendezvous_request`.
pub enum RecvOutcome {
    Accepted(TcpStream, std::net::SocketAddr),
    Message(bytes::Bytes),
    WouldBlock,
    Dead,
}

impl TcpRendezvousState {
    pub fn new(listener: TcpListener, fd_range: Option<FdRange>) -> TcpRendezvousState {
        listener.set_nonblocking(true).ok();
        TcpRendezvousState { fd: listener.as_raw_fd(), listener, fd_range }
    }

    /// Accept one pending connection, optionally relocating its fd into
    /// the configured window via `fcntl(F_DUPFD)` + `close` the way
    /// `svc_tcp.c`'s `fd_range` support does.
    pub fn accept_once(&self) -> Result<RecvOutcome, RpcError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                let stream = relocate(stream, self.fd_range)?;
                Ok(RecvOutcome::Accepted(stream, peer))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                Err(RpcError::resource("accept: EMFILE"))
            }
            Err(e) => Err(RpcError::transport_fatal(format!("accept failed: {}", e))),
        }
    }
}

fn relocate(stream: TcpStream, range: Option<FdRange>) -> Result<TcpStream, RpcError> {
    let range = match range {
        Some(r) => r,
        None => return Ok(stream),
    };
    let old_fd = stream.as_raw_fd();
    let target = if range.ascending { range.lo } else { range.hi };
    match fcntl(old_fd, FcntlArg::F_DUPFD(target)) {
        Ok(new_fd) => {
            drop(stream);
            // SAFETY: new_fd was just returned by fcntl(F_DUPFD) and is
            // owned by nobody else yet.
            Ok(unsafe { TcpStream::from_raw_fd(new_fd) })
        }
        Err(_) => Ok(stream),
    }
}

impl TcpConnectionState {
    pub fn new(stream: TcpStream, read_timeout: Duration) -> TcpConnectionState {
        stream.set_nonblocking(true).ok();
        TcpConnectionState {
            fd: stream.as_raw_fd(),
            stream,
            assembler: RecordAssembler::new(),
            read_timeout,
        }
    }

    /// Receive one complete, record-marked RPC message. Internally polls
    /// the fd with a 35s inactivity deadline (configurable for tests),
    /// reading and feeding the assembler until a full message is ready;
    /// a message already fully buffered from a prior batched read is
    /// returned without blocking at all, which is how TCP batch calls
    /// (SPEC_FULL.md §8 scenario 3) get serviced without extra poll
    /// iterations.
    pub fn recv_request(&mut self) -> Result<RecvOutcome, RpcError> {
        if let Some(msg) = self.assembler.take_message()? {
            return Ok(RecvOutcome::Message(msg));
        }

        let deadline = Instant::now() + self.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(RecvOutcome::Dead);
            }

            let mut fds = [PollFd::new(self.fd, PollFlags::POLLIN)];
            let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
            let rv = poll(&mut fds, timeout_ms)
                .map_err(|e| RpcError::transport_fatal(format!("poll failed: {}", e)))?;
            if rv == 0 {
                return Ok(RecvOutcome::Dead);
            }
            let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Ok(RecvOutcome::Dead);
            }

            let mut buf = [0u8; 8192];
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(RecvOutcome::Dead),
                Ok(n) => {
                    self.assembler.feed(&buf[..n]);
                    if let Some(msg) = self.assembler.take_message()? {
                        return Ok(RecvOutcome::Message(msg));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(RpcError::transport_fatal(format!("read failed: {}", e))),
            }
        }
    }

    pub fn send_record(&mut self, payload: &[u8]) -> Result<(), RpcError> {
        let framed = crate::codec::encode_record(payload);
        self.stream
            .write_all(&framed)
            .map_err(|e| RpcError::transport_fatal(format!("write failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;

    #[test]
    fn record_round_trips_over_a_real_socket_pair() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut server_state = TcpConnectionState::new(server, Duration::from_millis(500));
        let mut client_stream = client;

        let framed = crate::codec::encode_record(b"ping");
        client_stream.write_all(&framed).unwrap();

        match server_state.recv_request().unwrap() {
            RecvOutcome::Message(msg) => assert_eq!(&msg[..], b"ping"),
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn dead_connection_is_reported_on_timeout() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut server_state = TcpConnectionState::new(server, Duration::from_millis(30));
        match server_state.recv_request().unwrap() {
            RecvOutcome::Dead => {}
            _ => panic!("expected Dead on inactivity timeout"),
        }
    }
}
