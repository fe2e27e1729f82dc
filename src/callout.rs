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

//! The service callout table: `(program, version) -> dispatch_fn`
//! registrations, linearly scanned the way `svc_find` scans its linked
//! list (SPEC_FULL.md §4.2, §4.4). A `Vec` replaces the original's
//! singly linked list; Rust gains nothing from a hand-rolled list here
//! and the scan order is identical either way.

use std::sync::RwLock;

use crate::codec::{Decoder, Encoder, RpcProc, RpcProg, RpcVers};
use crate::error::RpcError;

/// What a dispatch function is handed: the decoded call arguments and an
/// encoder to write the result into. Matches `get_args`/`reply`'s role
/// in SPEC_FULL.md §6, collapsed into one call for the common case where
/// a dispatch function wants both steps back to back.
pub trait Dispatch: Send + Sync {
    fn call(&self, proc_: RpcProc, args: &mut Decoder, reply: &mut Encoder) -> Result<(), RpcError>;
}

impl<F> Dispatch for F
where
    F: Fn(RpcProc, &mut Decoder, &mut Encoder) -> Result<(), RpcError> + Send + Sync,
{
    fn call(&self, proc_: RpcProc, args: &mut Decoder, reply: &mut Encoder) -> Result<(), RpcError> {
        (self)(proc_, args, reply)
    }
}

/// Whether a program registration should also be reflected to the name
/// service (SPEC_FULL.md §6's `pmap_protocol_or_none`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapProtocol {
    None,
    Tcp,
    Udp,
}

struct Entry {
    prog: RpcProg,
    vers: RpcVers,
    dispatch: Box<dyn Dispatch>,
    pmap: PmapProtocol,
}

/// The callout table. One per running service; shared by the pipeline
/// (read-mostly lookups) and the public `register_program`/
/// `unregister_program` API (infrequent writes), hence `RwLock` rather
/// than the `registry_lock`-adjacent `Mutex` used for the transport
/// table itself.
#[derive(Default)]
pub struct CalloutTable {
    entries: RwLock<Vec<Entry>>,
}

/// Outcome of a `(prog, vers)` lookup, distinguishing "no such program"
/// from "program exists, but not at this version" so the pipeline can
/// build the right RPC reply (`PROG_UNAVAIL` vs `PROG_MISMATCH`,
/// SPEC_FULL.md §4.4). `Found` carries the dispatch function's result
/// directly since `dispatch()` already ran it under the read lock.
pub enum Lookup {
    Found(Result<(), RpcError>),
    VersionMismatch { low: RpcVers, high: RpcVers },
    ProgramUnavailable,
}

impl CalloutTable {
    pub fn new() -> CalloutTable {
        CalloutTable { entries: RwLock::new(Vec::new()) }
    }

    pub fn register(
        &self,
        prog: RpcProg,
        vers: RpcVers,
        dispatch: impl Dispatch + 'static,
        pmap: PmapProtocol,
    ) -> Result<(), RpcError> {
        let mut entries = self.entries.write().unwrap();
        if entries.iter().any(|e| e.prog == prog && e.vers == vers) {
            return Err(RpcError::application(format!(
                "program {:#x} version {} already registered",
                prog, vers
            )));
        }
        entries.push(Entry { prog, vers, dispatch: Box::new(dispatch), pmap });
        Ok(())
    }

    pub fn unregister(&self, prog: RpcProg, vers: RpcVers) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|e| !(e.prog == prog && e.vers == vers));
    }

    /// Runs the matching entry's dispatch function under the read lock,
    /// or tells the caller why there wasn't one -- avoids handing out a
    /// reference that would outlive the lock guard.
    pub fn dispatch(
        &self,
        prog: RpcProg,
        vers: RpcVers,
        proc_: RpcProc,
        args: &mut Decoder,
        reply: &mut Encoder,
    ) -> Lookup {
        let entries = self.entries.read().unwrap();
        match entries.iter().find(|e| e.prog == prog && e.vers == vers) {
            Some(e) => Lookup::Found(e.dispatch.call(proc_, args, reply)),
            None => {
                let matching: Vec<RpcVers> = entries.iter().filter(|e| e.prog == prog).map(|e| e.vers).collect();
                if matching.is_empty() {
                    Lookup::ProgramUnavailable
                } else {
                    let low = *matching.iter().min().unwrap();
                    let high = *matching.iter().max().unwrap();
                    Lookup::VersionMismatch { low, high }
                }
            }
        }
    }

    /// Whether `prog`/`vers` should also be reflected to the name
    /// service on registration, consulted by the public API's
    /// `register_program` before it calls a `PortMapper`.
    pub fn pmap_protocol_of(&self, prog: RpcProg, vers: RpcVers) -> Option<PmapProtocol> {
        let entries = self.entries.read().unwrap();
        entries.iter().find(|e| e.prog == prog && e.vers == vers).map(|e| e.pmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn echo(_proc_: RpcProc, args: &mut Decoder, reply: &mut Encoder) -> Result<(), RpcError> {
        let v = args.decode_u32()?;
        reply.encode_u32(v);
        Ok(())
    }

    #[test]
    fn finds_registered_program() {
        let table = CalloutTable::new();
        table.register(0x2000_0001, 1, echo, PmapProtocol::None).unwrap();

        let raw = 42u32.to_be_bytes();
        let mut dec = Decoder::new(&raw);
        let mut enc = Encoder::new();
        match table.dispatch(0x2000_0001, 1, 1, &mut dec, &mut enc) {
            Lookup::Found(_) => {}
            _ => panic!("expected a match"),
        }
        let out: Bytes = enc.into_bytes();
        assert_eq!(&out[..], &42u32.to_be_bytes());
    }

    #[test]
    fn reports_version_mismatch_with_observed_bounds() {
        let table = CalloutTable::new();
        table.register(0x2000_0001, 2, echo, PmapProtocol::None).unwrap();
        table.register(0x2000_0001, 4, echo, PmapProtocol::None).unwrap();

        let raw = 0u32.to_be_bytes();
        let mut dec = Decoder::new(&raw);
        let mut enc = Encoder::new();
        match table.dispatch(0x2000_0001, 3, 1, &mut dec, &mut enc) {
            Lookup::VersionMismatch { low, high } => {
                assert_eq!(low, 2);
                assert_eq!(high, 4);
            }
            _ => panic!("expected a version mismatch"),
        }
    }

    #[test]
    fn reports_program_unavailable() {
        let table = CalloutTable::new();
        let raw = 0u32.to_be_bytes();
        let mut dec = Decoder::new(&raw);
        let mut enc = Encoder::new();
        match table.dispatch(0x4242, 1, 1, &mut dec, &mut enc) {
            Lookup::ProgramUnavailable => {}
            _ => panic!("expected program unavailable"),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = CalloutTable::new();
        table.register(1, 1, echo, PmapProtocol::None).unwrap();
        assert!(table.register(1, 1, echo, PmapProtocol::None).is_err());
    }
}
