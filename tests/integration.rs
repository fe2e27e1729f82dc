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

//! End-to-end scenarios against the public `Server` API, over real
//! loopback sockets. Each scenario uses `Config::for_tests()` (or a small
//! variant of it) so the suite runs in well under a second rather than
//! against production timeouts.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use svcmt::callout::PmapProtocol;
use svcmt::codec::{Decoder, Encoder, RecordAssembler, AUTH_NULL, RPC_VERSION};
use svcmt::config::{Config, MtMode};
use svcmt::error::RpcError;
use svcmt::Server;

const ECHO_PROG: u32 = 0x2000_0001;
const ECHO_VERS: u32 = 1;
const ECHO_PROC: u32 = 1;

fn echo(_proc_: u32, args: &mut Decoder, reply: &mut Encoder) -> Result<(), RpcError> {
    let v = args.decode_u32()?;
    reply.encode_u32(v);
    Ok(())
}

fn always_ok(_proc_: u32, _args: &mut Decoder, _reply: &mut Encoder) -> Result<(), RpcError> {
    Ok(())
}

fn encode_call(xid: u32, prog: u32, vers: u32, proc_: u32, arg: u32) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encode_u32(xid);
    enc.encode_u32(0); // CALL
    enc.encode_u32(RPC_VERSION);
    enc.encode_u32(prog);
    enc.encode_u32(vers);
    enc.encode_u32(proc_);
    enc.encode_u32(AUTH_NULL);
    enc.encode_opaque(&[]);
    enc.encode_u32(AUTH_NULL);
    enc.encode_opaque(&[]);
    enc.encode_u32(arg);
    enc.into_bytes().to_vec()
}

#[derive(Debug, PartialEq)]
enum Verdict {
    Success(u32),
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    Denied,
}

fn decode_reply(bytes: &[u8]) -> (u32, Verdict) {
    let mut dec = Decoder::new(bytes);
    let xid = dec.decode_u32().unwrap();
    assert_eq!(dec.decode_u32().unwrap(), 1, "expected a REPLY message");
    let reply_stat = dec.decode_u32().unwrap();
    if reply_stat != 0 {
        return (xid, Verdict::Denied);
    }
    let _verf_flavor = dec.decode_u32().unwrap();
    let _verf_body = dec.decode_opaque().unwrap();
    let verdict = match dec.decode_u32().unwrap() {
        0 => Verdict::Success(dec.decode_u32().unwrap()),
        1 => Verdict::ProgUnavail,
        2 => Verdict::ProgMismatch { low: dec.decode_u32().unwrap(), high: dec.decode_u32().unwrap() },
        3 => Verdict::ProcUnavail,
        4 => Verdict::GarbageArgs,
        5 => Verdict::SystemErr,
        other => panic!("unknown accept_stat {}", other),
    };
    (xid, verdict)
}

fn udp_server(config: Config) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(config));
    let id = server.create_udp_server("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = server.registry.get(id).unwrap().port;
    (server, format!("127.0.0.1:{}", port).parse().unwrap())
}

fn tcp_server(config: Config) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(config));
    let id = server.create_tcp_server("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = server.registry.get(id).unwrap().port;
    (server, format!("127.0.0.1:{}", port).parse().unwrap())
}

fn read_one_record(stream: &mut TcpStream) -> Vec<u8> {
    let mut asm = RecordAssembler::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(msg) = asm.take_message().unwrap() {
            return msg.to_vec();
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "peer closed before a full record arrived");
        asm.feed(&buf[..n]);
    }
}

#[test]
fn udp_echo_in_hybrid_mode_replies_and_reclaims_its_clone() {
    let (server, addr) = udp_server(Config::for_tests());
    server.register_program(ECHO_PROG, ECHO_VERS, echo, PmapProtocol::None, 0).unwrap();
    assert_eq!(server.config.mtmode, MtMode::Hybrid);
    let handle = server.clone().spawn_loop();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.send_to(&encode_call(1, ECHO_PROG, ECHO_VERS, ECHO_PROC, 42), addr).unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(decode_reply(&buf[..n]), (1, Verdict::Success(42)));

    // The clone transport the hybrid dispatch created should be reaped
    // within a few poll/gc sweeps, leaving only the UDP connection itself.
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while server.registry.count() > 1 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.registry.count(), 1);

    server.request_shutdown();
    handle.join().unwrap();
}

#[test]
fn udp_retransmit_is_served_from_the_cache_without_a_second_dispatch() {
    let (server, addr) = udp_server(Config::for_tests());
    server.register_program(ECHO_PROG, ECHO_VERS, echo, PmapProtocol::None, 0).unwrap();
    let udp_id = server.registry.snapshot().into_iter().find(|t| t.port == addr.port()).unwrap().id();
    server.enable_udp_reply_cache(udp_id, 16).unwrap();

    let handle = server.clone().spawn_loop();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let call = encode_call(7, ECHO_PROG, ECHO_VERS, ECHO_PROC, 99);

    client.send_to(&call, addr).unwrap();
    let mut buf1 = [0u8; 1024];
    let (n1, _) = client.recv_from(&mut buf1).unwrap();

    client.send_to(&call, addr).unwrap();
    let mut buf2 = [0u8; 1024];
    let (n2, _) = client.recv_from(&mut buf2).unwrap();

    assert_eq!(&buf1[..n1], &buf2[..n2], "retransmit must be byte-for-byte identical");
    assert_eq!(decode_reply(&buf1[..n1]), (7, Verdict::Success(99)));

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(server.stats().requests_dispatched, 1, "the second send should be served from the cache");

    server.request_shutdown();
    handle.join().unwrap();
}

#[test]
fn tcp_batched_records_are_serviced_in_submission_order() {
    let mut config = Config::for_tests();
    config.mtmode = MtMode::Serial; // serial waits for RETURN, guaranteeing order
    let (server, addr) = tcp_server(config);
    server.register_program(ECHO_PROG, ECHO_VERS, echo, PmapProtocol::None, 0).unwrap();
    let handle = server.clone().spawn_loop();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut batch = Vec::new();
    batch.extend_from_slice(&svcmt::codec::encode_record(&encode_call(1, ECHO_PROG, ECHO_VERS, ECHO_PROC, 10)));
    batch.extend_from_slice(&svcmt::codec::encode_record(&encode_call(2, ECHO_PROG, ECHO_VERS, ECHO_PROC, 20)));
    client.write_all(&batch).unwrap();

    let first = read_one_record(&mut client);
    let second = read_one_record(&mut client);
    assert_eq!(decode_reply(&first), (1, Verdict::Success(10)));
    assert_eq!(decode_reply(&second), (2, Verdict::Success(20)));

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(server.stats().requests_dispatched, 2);

    server.request_shutdown();
    handle.join().unwrap();
}

#[test]
fn a_call_to_an_unregistered_program_gets_prog_unavail() {
    let (server, addr) = udp_server(Config::for_tests());
    let handle = server.clone().spawn_loop();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.send_to(&encode_call(1, 0x4242, 1, 1, 0), addr).unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(decode_reply(&buf[..n]), (1, Verdict::ProgUnavail));

    server.request_shutdown();
    handle.join().unwrap();
}

#[test]
fn a_call_at_an_unsupported_version_gets_prog_mismatch_with_observed_bounds() {
    let (server, addr) = udp_server(Config::for_tests());
    server.register_program(ECHO_PROG, 2, always_ok, PmapProtocol::None, 0).unwrap();
    server.register_program(ECHO_PROG, 4, always_ok, PmapProtocol::None, 0).unwrap();
    let handle = server.clone().spawn_loop();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.send_to(&encode_call(1, ECHO_PROG, 3, 1, 0), addr).unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(decode_reply(&buf[..n]), (1, Verdict::ProgMismatch { low: 2, high: 4 }));

    server.request_shutdown();
    handle.join().unwrap();
}

#[test]
fn a_tcp_peer_that_dies_mid_record_is_reclaimed_without_affecting_other_transports() {
    let mut config = Config::for_tests();
    config.tcp_read_timeout = Duration::from_millis(100);
    let (server, addr) = tcp_server(config);
    server.register_program(ECHO_PROG, ECHO_VERS, echo, PmapProtocol::None, 0).unwrap();
    let handle = server.clone().spawn_loop();

    let dying = TcpStream::connect(addr).unwrap();
    // A record header claiming 100 bytes, but only 2 are ever sent.
    let mut header_and_partial = Vec::new();
    header_and_partial.extend_from_slice(&(0x8000_0000u32 | 100).to_be_bytes());
    header_and_partial.extend_from_slice(b"xy");
    (&dying).write_all(&header_and_partial).unwrap();
    drop(dying);

    let other = TcpStream::connect(addr).unwrap();

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(server.registry.count(), 2, "rendezvous + the still-live second connection");
    drop(other);

    server.request_shutdown();
    handle.join().unwrap();
}
