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

//! A minimal ECHO service: registers program `0x2000_0001` version `1`
//! procedure `1` on both TCP and UDP, then runs the poll loop on the
//! main thread until Ctrl-C. Demonstrates the public API end to end;
//! not a deployment template.

use std::net::SocketAddr;
use std::sync::Arc;

use svcmt::callout::PmapProtocol;
use svcmt::codec::{Decoder, Encoder};
use svcmt::config::Config;
use svcmt::error::RpcError;
use svcmt::Server;

const ECHO_PROG: u32 = 0x2000_0001;
const ECHO_VERS: u32 = 1;
const ECHO_PROC: u32 = 1;

fn echo(proc_: u32, args: &mut Decoder, reply: &mut Encoder) -> Result<(), RpcError> {
    if proc_ != ECHO_PROC {
        return Err(svcmt::reply::no_procedure(format!("no such procedure {}", proc_)));
    }
    let body = args.decode_opaque()?;
    reply.encode_opaque(&body);
    Ok(())
}

fn main() {
    env_logger::init();

    let config = Config::default();
    log::set_max_level(config.trace_level_filter());

    let server = Arc::new(Server::new(config));

    let tcp_addr: SocketAddr = "0.0.0.0:20000".parse().unwrap();
    let udp_addr: SocketAddr = "0.0.0.0:20000".parse().unwrap();
    server.create_tcp_server(tcp_addr).expect("bind tcp");
    let udp_id = server.create_udp_server(udp_addr).expect("bind udp");
    server.enable_udp_reply_cache(udp_id, 1024).expect("enable udp cache");

    server
        .register_program(ECHO_PROG, ECHO_VERS, echo, PmapProtocol::None, 20000)
        .expect("register echo program");

    log::info!("listening on {} (tcp+udp)", tcp_addr);

    let handle = server.clone().spawn_loop();

    let shutdown_server = server.clone();
    ctrlc_shutdown(move || shutdown_server.request_shutdown());

    handle.join().expect("run loop panicked");
    log::info!("final stats: {:?}", server.stats());
}

/// Installs a `SIGINT` handler that calls `on_signal` once. No signal
/// crate in the dependency stack for this; `libc::signal` is already a
/// direct dependency for the poll/fcntl path, so reuse it here too.
fn ctrlc_shutdown(on_signal: impl Fn() + Send + 'static) {
    use std::sync::Mutex;
    static HANDLER: Mutex<Option<Box<dyn Fn() + Send>>> = Mutex::new(None);
    *HANDLER.lock().unwrap() = Some(Box::new(on_signal));

    extern "C" fn dispatch(_sig: libc::c_int) {
        if let Ok(guard) = HANDLER.lock() {
            if let Some(f) = guard.as_ref() {
                f();
            }
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, dispatch as usize);
    }
}
