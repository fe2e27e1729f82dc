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

//! A minimal XDR subset (SPEC_FULL.md §4.11): scalar primitives, opaque
//! byte blobs, and ONC-RPC v2 call/reply header framing per RFC 5531.
//! No arrays, unions, or floating point -- the pipeline only ever needs
//! to decode a call header plus an opaque argument blob and encode a
//! reply header plus an opaque result blob. A real deployment would
//! plug in a conformant XDR library behind this same boundary; this
//! crate is not that library (see SPEC_FULL.md §1 non-goals).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::RpcError;

pub type Xid = u32;
pub type RpcProg = u32;
pub type RpcVers = u32;
pub type RpcProc = u32;

pub const RPC_VERSION: u32 = 2;
pub const AUTH_NULL: u32 = 0;

/// Growable little encoder over a `BytesMut`.
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder { buf: BytesMut::new() }
    }

    pub fn encode_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn encode_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// XDR opaque: 4-byte length prefix, data, zero-padded to a 4-byte
    /// boundary.
    pub fn encode_opaque(&mut self, data: &[u8]) {
        self.encode_u32(data.len() as u32);
        self.buf.put_slice(data);
        let pad = (4 - (data.len() % 4)) % 4;
        const ZEROES: [u8; 3] = [0; 3];
        self.buf.put_slice(&ZEROES[..pad]);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for Encoder {
    fn default() -> Encoder {
        Encoder::new()
    }
}

/// Cursor-based decoder over a borrowed byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn eof(&self) -> bool {
        self.buf.remaining() == 0
    }

    pub fn decode_u32(&mut self) -> Result<u32, RpcError> {
        if self.buf.remaining() < 4 {
            return Err(RpcError::protocol("truncated u32"));
        }
        Ok(self.buf.get_u32())
    }

    pub fn decode_u64(&mut self) -> Result<u64, RpcError> {
        if self.buf.remaining() < 8 {
            return Err(RpcError::protocol("truncated u64"));
        }
        Ok(self.buf.get_u64())
    }

    pub fn decode_opaque(&mut self) -> Result<Vec<u8>, RpcError> {
        let len = self.decode_u32()? as usize;
        let pad = (4 - (len % 4)) % 4;
        if self.buf.remaining() < len + pad {
            return Err(RpcError::protocol("truncated opaque"));
        }
        let mut data = vec![0u8; len];
        self.buf.copy_to_slice(&mut data);
        self.buf.advance(pad);
        Ok(data)
    }

    /// Skip the remainder of the current record without interpreting it
    /// (used when a dispatch function never consumes its arguments).
    pub fn skip_record(&mut self) {
        let n = self.buf.remaining();
        self.buf.advance(n);
    }

    /// The unconsumed tail, handed to a dispatch function as its raw
    /// argument bytes.
    pub fn tail(&self) -> &'a [u8] {
        self.buf
    }
}

/// RFC 5531 `opaque_auth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    pub fn null() -> OpaqueAuth {
        OpaqueAuth { flavor: AUTH_NULL, body: Vec::new() }
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.encode_u32(self.flavor);
        enc.encode_opaque(&self.body);
    }

    fn decode(dec: &mut Decoder) -> Result<OpaqueAuth, RpcError> {
        let flavor = dec.decode_u32()?;
        let body = dec.decode_opaque()?;
        Ok(OpaqueAuth { flavor, body })
    }
}

/// RFC 5531 `call_body`, the part of `rpc_msg` the pipeline consults to
/// do program/version matching and authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: Xid,
    pub prog: RpcProg,
    pub vers: RpcVers,
    pub proc_: RpcProc,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

pub fn decode_call_message(dec: &mut Decoder) -> Result<CallHeader, RpcError> {
    let xid = dec.decode_u32()?;
    let msg_type = dec.decode_u32()?;
    if msg_type != 0 {
        return Err(RpcError::protocol("not a CALL message"));
    }
    let rpcvers = dec.decode_u32()?;
    if rpcvers != RPC_VERSION {
        return Err(RpcError::protocol("unsupported rpc version"));
    }
    let prog = dec.decode_u32()?;
    let vers = dec.decode_u32()?;
    let proc_ = dec.decode_u32()?;
    let cred = OpaqueAuth::decode(dec)?;
    let verf = OpaqueAuth::decode(dec)?;
    Ok(CallHeader { xid, prog, vers, proc_, cred, verf })
}

/// RFC 5531 `accept_stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    Success,
    ProgUnavail,
    ProgMismatch { low: RpcVers, high: RpcVers },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

/// RFC 5531 `auth_stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStat {
    BadCred,
    RejectedCred,
    BadVerf,
    RejectedVerf,
    TooWeak,
}

/// RFC 5531 `reject_stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStat {
    RpcMismatch { low: u32, high: u32 },
    AuthError(AuthStat),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Accepted { verf: OpaqueAuth, stat: AcceptStat },
    Rejected(RejectStat),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: Xid,
    pub body: ReplyBody,
}

fn accept_stat_code(stat: &AcceptStat) -> u32 {
    match stat {
        AcceptStat::Success => 0,
        AcceptStat::ProgUnavail => 1,
        AcceptStat::ProgMismatch { .. } => 2,
        AcceptStat::ProcUnavail => 3,
        AcceptStat::GarbageArgs => 4,
        AcceptStat::SystemErr => 5,
    }
}

fn auth_stat_code(stat: AuthStat) -> u32 {
    match stat {
        AuthStat::BadCred => 1,
        AuthStat::RejectedCred => 2,
        AuthStat::BadVerf => 3,
        AuthStat::RejectedVerf => 4,
        AuthStat::TooWeak => 5,
    }
}

pub fn encode_reply_message(reply: &ReplyHeader, enc: &mut Encoder) {
    enc.encode_u32(reply.xid);
    enc.encode_u32(1); // msg_type == REPLY
    match &reply.body {
        ReplyBody::Accepted { verf, stat } => {
            enc.encode_u32(0); // MSG_ACCEPTED
            verf.encode(enc);
            enc.encode_u32(accept_stat_code(stat));
            if let AcceptStat::ProgMismatch { low, high } = stat {
                enc.encode_u32(*low);
                enc.encode_u32(*high);
            }
        }
        ReplyBody::Rejected(reject) => {
            enc.encode_u32(1); // MSG_DENIED
            match reject {
                RejectStat::RpcMismatch { low, high } => {
                    enc.encode_u32(0);
                    enc.encode_u32(*low);
                    enc.encode_u32(*high);
                }
                RejectStat::AuthError(why) => {
                    enc.encode_u32(1);
                    enc.encode_u32(auth_stat_code(*why));
                }
            }
        }
    }
}

/// TCP record marking (RFC 5531 §11): a 4-byte fragment header whose top
/// bit marks the last fragment of a message and whose low 31 bits give
/// the fragment's byte length. This crate only ever emits a single
/// fragment per message; it still parses multi-fragment input so a
/// well-behaved peer that does fragment is handled correctly.
pub fn encode_record(payload: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(payload.len() + 4);
    let header = 0x8000_0000u32 | (payload.len() as u32 & 0x7fff_ffff);
    framed.put_u32(header);
    framed.put_slice(payload);
    framed.freeze()
}

/// Incrementally reassembles record-marked fragments arriving from a
/// stream socket. Not a framing *decoder* over a fixed buffer (TCP reads
/// are a byte stream, not discrete records) -- `feed` is called with
/// however many bytes `read(2)` returned, and `take_message` returns a
/// complete message once the last fragment has arrived.
#[derive(Default)]
pub struct RecordAssembler {
    incoming: BytesMut,
    message: BytesMut,
    awaiting_header: bool,
    fragment_remaining: usize,
    last_fragment: bool,
}

impl RecordAssembler {
    pub fn new() -> RecordAssembler {
        RecordAssembler {
            incoming: BytesMut::new(),
            message: BytesMut::new(),
            awaiting_header: true,
            fragment_remaining: 0,
            last_fragment: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Returns a complete, reassembled message once the final fragment
    /// marker has been seen, draining consumed bytes from the internal
    /// buffer as it goes.
    pub fn take_message(&mut self) -> Result<Option<Bytes>, RpcError> {
        loop {
            if self.awaiting_header {
                if self.incoming.len() < 4 {
                    return Ok(None);
                }
                let header = self.incoming.get_u32();
                self.last_fragment = header & 0x8000_0000 != 0;
                self.fragment_remaining = (header & 0x7fff_ffff) as usize;
                self.awaiting_header = false;
            }

            if self.incoming.len() < self.fragment_remaining {
                return Ok(None);
            }

            let chunk = self.incoming.split_to(self.fragment_remaining);
            self.message.extend_from_slice(&chunk);
            self.awaiting_header = true;

            if self.last_fragment {
                let msg = self.message.split().freeze();
                return Ok(Some(msg));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_round_trips_with_padding() {
        let mut enc = Encoder::new();
        enc.encode_opaque(b"abc");
        let bytes = enc.into_bytes();
        assert_eq!(bytes.len(), 4 + 4); // len prefix + 3 bytes padded to 4
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.decode_opaque().unwrap(), b"abc".to_vec());
        assert!(dec.eof());
    }

    #[test]
    fn call_header_round_trips() {
        let mut raw = BytesMut::new();
        raw.put_u32(7); // xid
        raw.put_u32(0); // CALL
        raw.put_u32(RPC_VERSION);
        raw.put_u32(0x2000_0001); // prog
        raw.put_u32(1); // vers
        raw.put_u32(1); // proc
        raw.put_u32(AUTH_NULL);
        raw.put_u32(0);
        raw.put_u32(AUTH_NULL);
        raw.put_u32(0);
        let mut dec = Decoder::new(&raw);
        let hdr = decode_call_message(&mut dec).unwrap();
        assert_eq!(hdr.xid, 7);
        assert_eq!(hdr.prog, 0x2000_0001);
        assert_eq!(hdr.vers, 1);
        assert_eq!(hdr.proc_, 1);
    }

    #[test]
    fn reply_accepted_success_encodes_zero_stat() {
        let reply = ReplyHeader {
            xid: 42,
            body: ReplyBody::Accepted { verf: OpaqueAuth::null(), stat: AcceptStat::Success },
        };
        let mut enc = Encoder::new();
        encode_reply_message(&reply, &mut enc);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.decode_u32().unwrap(), 42);
        assert_eq!(dec.decode_u32().unwrap(), 1); // REPLY
        assert_eq!(dec.decode_u32().unwrap(), 0); // MSG_ACCEPTED
    }

    #[test]
    fn record_assembler_waits_for_last_fragment() {
        let mut asm = RecordAssembler::new();
        let payload = b"hello world";
        let framed = encode_record(payload);
        asm.feed(&framed[..4]);
        assert!(asm.take_message().unwrap().is_none());
        asm.feed(&framed[4..]);
        let msg = asm.take_message().unwrap().unwrap();
        assert_eq!(&msg[..], payload);
    }

    #[test]
    fn record_assembler_handles_byte_at_a_time_delivery() {
        let mut asm = RecordAssembler::new();
        let framed = encode_record(b"xy");
        for b in framed.iter() {
            asm.feed(&[*b]);
        }
        let msg = asm.take_message().unwrap().unwrap();
        assert_eq!(&msg[..], b"xy");
    }
}
