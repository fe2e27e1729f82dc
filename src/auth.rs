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

//! Pluggable request authentication (SPEC_FULL.md §6). The pipeline only
//! ever consults this when a call's credential flavor isn't
//! `AUTH_NULL`; the null-flavor short circuit lives in
//! `pipeline::authenticate`, not here, so that a custom `Authenticator`
//! never has to special-case the common case itself.

use crate::codec::CallHeader;
use crate::error::RpcError;

/// Why a credential was rejected, mapped directly onto RFC 5531's
/// `auth_stat` by the pipeline when it builds the `MSG_DENIED` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Accepted,
    BadCred,
    RejectedCred,
    BadVerf,
    RejectedVerf,
    TooWeak,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, call: &CallHeader) -> Result<AuthStatus, RpcError>;
}

/// Accepts every call. Installed by default; only reached for non-NULL
/// credential flavors, since the pipeline never calls out to an
/// `Authenticator` at all when `cred.flavor == AUTH_NULL`.
pub struct NullAuthenticator;

impl Authenticator for NullAuthenticator {
    fn authenticate(&self, _call: &CallHeader) -> Result<AuthStatus, RpcError> {
        Ok(AuthStatus::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpaqueAuth;

    fn call_with_flavor(flavor: u32) -> CallHeader {
        CallHeader {
            xid: 1,
            prog: 1,
            vers: 1,
            proc_: 1,
            cred: OpaqueAuth { flavor, body: Vec::new() },
            verf: OpaqueAuth::null(),
        }
    }

    #[test]
    fn null_authenticator_always_accepts() {
        let auth = NullAuthenticator;
        let call = call_with_flavor(99);
        assert_eq!(auth.authenticate(&call).unwrap(), AuthStatus::Accepted);
    }
}
