use crate::library::{
    arena::{ARENA_DEFAULT_COMMIT_SIZE, ARENA_DEFAULT_RESERVE_SIZE},
    connection::{self, REQUEST_BUFFER_SIZE},
    scratch::SCRATCH_ARENA_SIZE,
    server_internals::{DEFAULT_ADDR, DEFAULT_BACKLOG, ServerInternal},
    thread_context::{ThreadContext, ThreadSettings},
    uring::DEFAULT_QUEUE_DEPTH,
    utils::kernel,
};
use std::{
    io,
    net::TcpListener,
    os::fd::{AsRawFd, RawFd},
    thread,
};
use tracing::{debug, error, info};

#[derive(Clone, Debug)]
pub struct Server {
    addr: String,
    backlog: i32,
    uring_size: u32,
    request_buffer_size: u32,
    scratch_size: u64,
    arena_reserve: u64,
    arena_commit: u64,
}
impl ServerInternal for Server {}

impl Server {
    /// One worker: a ring, an arena and a scratch pool, all driven by a single
    /// blocking wait on the completion queue.
    pub fn serve(&self, listener: TcpListener, thread_id: u32) -> io::Result<()> {
        let server_fd: RawFd = listener.as_raw_fd();
        let mut ctx = ThreadContext::new(thread_id, server_fd, self.thread_settings())
            .unwrap_or_else(|err| kernel::fatal(&format!("Failed to initialize io_uring - {err}")));

        info!("Start accepting on FD:{server_fd}");
        if let Err(err) = connection::submit_accept(&mut ctx) {
            error!("Initial accept submission failed: {err}");
        }
        loop {
            let cqe = ctx.ring.wait_for_completion().unwrap_or_else(|err| {
                kernel::fatal(&format!("Error while getting entry from completion queue: {err}"))
            });
            connection::handle_completion(&mut ctx, cqe);
            debug!(
                "Served {} | scratch arenas: {} created, {} idle | SQ pending: {}",
                ctx.served,
                ctx.scratch_pool().created(),
                ctx.scratch_pool().idle(),
                ctx.ring.pending_submissions()
            );
        }
    }

    fn thread_settings(&self) -> ThreadSettings {
        ThreadSettings {
            arena_reserve: self.arena_reserve,
            arena_commit: self.arena_commit,
            scratch_size: self.scratch_size,
            uring_size: self.uring_size,
            request_buffer_size: self.request_buffer_size,
        }
    }
}

// Public server endpoints
impl Server {
    pub fn new(addr: &str) -> Server {
        Server {
            addr: addr.to_owned(),
            backlog: DEFAULT_BACKLOG,
            uring_size: DEFAULT_QUEUE_DEPTH,
            request_buffer_size: REQUEST_BUFFER_SIZE,
            scratch_size: SCRATCH_ARENA_SIZE,
            arena_reserve: ARENA_DEFAULT_RESERVE_SIZE,
            arena_commit: ARENA_DEFAULT_COMMIT_SIZE,
        }
    }
    #[inline(always)]
    pub fn get_addr(&self) -> &str {
        &self.addr
    }
    #[inline(always)]
    pub fn get_backlog(&self) -> i32 {
        self.backlog
    }
    #[inline(always)]
    pub fn set_backlog(&mut self, backlog: i32) -> &mut Self {
        self.backlog = backlog;
        self
    }
    #[inline(always)]
    pub fn set_uring_size(&mut self, uring_size: u32) -> &mut Self {
        self.uring_size = uring_size;
        self
    }
    #[inline(always)]
    pub fn set_request_buffer_size(&mut self, size: u32) -> &mut Self {
        self.request_buffer_size = size;
        self
    }
    #[inline(always)]
    pub fn set_scratch_size(&mut self, size: u64) -> &mut Self {
        self.scratch_size = size;
        self
    }
    #[inline(always)]
    pub fn set_arena_reserve(&mut self, size: u64) -> &mut Self {
        self.arena_reserve = size;
        self
    }
    #[inline(always)]
    pub fn set_arena_commit(&mut self, size: u64) -> &mut Self {
        self.arena_commit = size;
        self
    }
    #[inline(always)]
    pub fn build(&mut self) -> Self {
        self.clone()
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new(DEFAULT_ADDR)
    }
}

pub fn run(server: Server) -> io::Result<()> {
    info!("Starting server - listening on {}", server.addr);
    let listener: TcpListener = server.build_listener(&server.addr, server.backlog)?;
    let worker = thread::Builder::new()
        .name("Ringserve-0".to_owned())
        .spawn(move || server.serve(listener, 0))?;
    match worker.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("worker thread panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::uring::Ring;
    use std::{
        io::{Read, Write},
        net::{SocketAddr, TcpStream},
        time::Duration,
    };

    const EXPECTED: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 12\r\n\
Connection: close\r\n\
\r\n\
Hello World!";

    // Containers often forbid io_uring; skip rather than fail there.
    fn start_server() -> Option<SocketAddr> {
        if let Err(err) = Ring::new(8) {
            eprintln!("skipping: io_uring unavailable ({err})");
            return None;
        }
        let server = Server::new("127.0.0.1:0").set_backlog(16).build();
        let listener = server.build_listener(server.get_addr(), server.get_backlog()).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || server.serve(listener, 0));
        Some(addr)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn exchange(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).unwrap();
        let mut response = Vec::new();
        // The server closes after writing, so EOF ends the response.
        stream.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn serves_fixed_response_then_closes() {
        let Some(addr) = start_server() else { return };
        let mut stream = connect(addr);
        let response = exchange(&mut stream, b"GET /anything HTTP/1.1\r\nHost: test\r\n\r\n");
        assert_eq!(response, EXPECTED);

        // Garbage gets the same answer.
        let mut stream = connect(addr);
        assert_eq!(exchange(&mut stream, &[0xAB; 4000]), EXPECTED);
    }

    #[test]
    fn idle_client_does_not_block_the_next_one() {
        let Some(addr) = start_server() else { return };
        let mut first = connect(addr);
        let mut second = connect(addr);
        assert_eq!(exchange(&mut second, b"GET /second HTTP/1.1\r\n\r\n"), EXPECTED);
        assert_eq!(exchange(&mut first, b"GET /first HTTP/1.1\r\n\r\n"), EXPECTED);
    }

    #[test]
    fn many_sequential_connections_recycle_scratch() {
        let Some(addr) = start_server() else { return };
        for i in 0..64 {
            let mut stream = connect(addr);
            let request = format!("GET /{i} HTTP/1.1\r\n\r\n");
            assert_eq!(exchange(&mut stream, request.as_bytes()), EXPECTED);
        }
    }

    #[test]
    fn listener_rejects_bad_addresses() {
        let server = Server::default();
        assert!(server.build_listener("not an address", 3).is_err());
        assert!(server.build_listener("[::1]:0", 3).is_err());
    }
}
