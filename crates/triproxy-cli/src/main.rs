//! triproxy: single-port HTTP/CONNECT/SOCKS5 forward proxy
//!
//! Thin binary wiring the command surface, logging, and config loading
//! glue around `triproxy-core`'s listener and relay engine.

mod cli;
mod logging;

fn main() {
    if let Err(err) = cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
