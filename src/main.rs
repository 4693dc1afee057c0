#![allow(unsafe_op_in_unsafe_fn)]

use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod library;
use library::{
    server::{self, Server},
    server_internals::DEFAULT_ADDR,
    utils::{http::HttpRequest, kernel},
};
use std::{
    env::args,
    io::{self, Write},
};
use tracing::Level;
use tracing_subscriber::fmt;

fn bootstrap_logs(level: Level) {
    fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .compact()
        .with_ansi(true)
        .init();
}

const STATUS_SUCCESS: &[u8] = b"HTTP/1.1 200 OK\r\n";
const CONTENT_TYPE_TEXT: &[u8] = b"Content-Type: text/plain\r\n";
const BASE_HEADERS: &[u8] = b"Connection: close\r\n\r\n";
const BODY: &[u8] = b"Hello World!";

impl Server {
    /// Writes the reply for one request into `out` and returns its length,
    /// or 0 when it does not fit. Every request, parsed or not, gets the same
    /// plain-text greeting.
    pub fn handler(_request: Option<&HttpRequest>, out: &mut [u8]) -> usize {
        let capacity = out.len();
        let mut cursor: &mut [u8] = out;
        if write_response(&mut cursor).is_err() {
            tracing::error!("Response does not fit in {} bytes", capacity);
            return 0;
        }
        capacity - cursor.len()
    }
}

fn write_response(cursor: &mut &mut [u8]) -> io::Result<()> {
    cursor.write_all(STATUS_SUCCESS)?;
    cursor.write_all(CONTENT_TYPE_TEXT)?;
    write!(cursor, "Content-Length: {}\r\n", BODY.len())?;
    cursor.write_all(BASE_HEADERS)?;
    cursor.write_all(BODY)
}

fn main() {
    let args: Vec<String> = args().collect();
    let level = if args.iter().any(|arg| arg == "--trace") {
        Level::TRACE
    } else if args.iter().any(|arg| arg == "--verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    bootstrap_logs(level);

    let addr = match args.iter().position(|arg| arg == "--port") {
        Some(i) => match args.get(i + 1).and_then(|port| port.parse::<u16>().ok()) {
            Some(port) => format!("0.0.0.0:{port}"),
            None => kernel::fatal("--port expects a number between 0 and 65535"),
        },
        None => DEFAULT_ADDR.to_owned(),
    };

    let server: Server = Server::new(&addr)
        .set_backlog(3)
        .set_uring_size(256)
        .set_request_buffer_size(8192)
        .build();

    if let Err(err) = server::run(server) {
        kernel::fatal(&format!("Server stopped: {err}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_writes_fixed_greeting() {
        let mut out = [0u8; 256];
        let len = Server::handler(None, &mut out);
        let expected: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 12\r\nConnection: close\r\n\r\nHello World!";
        assert_eq!(&out[..len], expected);
    }

    #[test]
    fn handler_refuses_truncated_response() {
        let mut out = [0u8; 20];
        assert_eq!(Server::handler(None, &mut out), 0);

        // One byte short of the full reply is still refused.
        let mut full = [0u8; 256];
        let len = Server::handler(None, &mut full);
        let mut short = vec![0u8; len - 1];
        assert_eq!(Server::handler(None, &mut short), 0);
        let mut exact = vec![0u8; len];
        assert_eq!(Server::handler(None, &mut exact), len);
    }
}
