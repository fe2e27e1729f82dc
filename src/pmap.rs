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

//! Name-service (rpcbind/portmapper) registration, modeled as a
//! pluggable trait per SPEC_FULL.md §6. The real rpcbind wire protocol
//! is out of scope; `NullPortMapper` is the only implementation shipped
//! in-crate.

use crate::callout::PmapProtocol;
use crate::codec::{RpcProg, RpcVers};
use crate::error::RpcError;

pub trait PortMapper: Send + Sync {
    fn set(&self, prog: RpcProg, vers: RpcVers, protocol: PmapProtocol, port: u16) -> Result<(), RpcError>;
    fn unset(&self, prog: RpcProg, vers: RpcVers) -> Result<(), RpcError>;
}

/// No-op name-service registration. `register_program` calls this
/// whenever the caller passes `PmapProtocol::None`, and it is also the
/// default `PortMapper` for a `Config` that never names a different one.
pub struct NullPortMapper;

impl PortMapper for NullPortMapper {
    fn set(&self, _prog: RpcProg, _vers: RpcVers, _protocol: PmapProtocol, _port: u16) -> Result<(), RpcError> {
        Ok(())
    }

    fn unset(&self, _prog: RpcProg, _vers: RpcVers) -> Result<(), RpcError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_port_mapper_is_always_a_no_op() {
        let pmap = NullPortMapper;
        assert!(pmap.set(1, 1, PmapProtocol::Udp, 1111).is_ok());
        assert!(pmap.unset(1, 1).is_ok());
    }
}
