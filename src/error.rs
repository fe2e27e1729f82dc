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

//! Error taxonomy for the runtime, and the `failfast` policy that decides
//! whether an invariant violation aborts the process or is reported.

use std::fmt;

/// Errors produced by the registry, pipeline, and transports.
///
/// The taxonomy mirrors the propagation policy of the original `svc.c`:
/// `Protocol`/`Application`/`Auth` are recovered locally by sending an RPC
/// reply, `TransportFatal` retires the transport, `Resource` either backs
/// off or escalates depending on `failfast`, and `InvariantViolation` is
/// never silently swallowed in debug builds.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("application error: {0}")]
    Application(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("transport fatal: {0}")]
    TransportFatal(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("procedure unavailable: {0}")]
    ProcUnavail(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    pub fn protocol<M: Into<String>>(msg: M) -> RpcError {
        RpcError::Protocol(msg.into())
    }

    pub fn application<M: Into<String>>(msg: M) -> RpcError {
        RpcError::Application(msg.into())
    }

    pub fn transport_fatal<M: Into<String>>(msg: M) -> RpcError {
        RpcError::TransportFatal(msg.into())
    }

    pub fn resource<M: Into<String>>(msg: M) -> RpcError {
        RpcError::Resource(msg.into())
    }

    pub fn proc_unavail<M: Into<String>>(msg: M) -> RpcError {
        RpcError::ProcUnavail(msg.into())
    }

    pub fn invariant<M: Into<String>>(msg: M) -> RpcError {
        RpcError::InvariantViolation(msg.into())
    }
}

/// Whether invariant violations (bad magic, duplicate registration,
/// refcount mismatches, ...) abort the process or are reported as errors.
///
/// `Abort` is the default in debug builds, matching `svc_config.c`'s
/// `failfast` knob, which defaults on while the library is under
/// development and off in a production build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailFast {
    Abort,
    Report,
}

impl Default for FailFast {
    fn default() -> FailFast {
        if cfg!(debug_assertions) {
            FailFast::Abort
        } else {
            FailFast::Report
        }
    }
}

impl FailFast {
    /// Handle an invariant violation according to policy. Under `Abort`
    /// this logs and aborts the process; under `Report` it logs and
    /// returns the error to the caller.
    pub fn invariant(&self, msg: impl fmt::Display) -> RpcError {
        log::error!("invariant violation: {}", msg);
        match self {
            FailFast::Abort => {
                log::error!("failfast=abort: terminating process");
                std::process::abort();
            }
            FailFast::Report => RpcError::invariant(msg.to_string()),
        }
    }
}
