//! Per-connection state machine: Accept -> Read -> Write -> close.
//!
//! Every in-flight [`Request`] lives inside the scratch arena it owns, and its
//! address is the `user_data` tag of whatever operation it is waiting on.
//! Completions may arrive in any order; dispatch is purely by that tag.

use crate::library::{
    scratch::Scratch,
    server::Server,
    thread_context::ThreadContext,
    uring::{Ring, abi::CompletionEntry, kernel_cmds},
    utils::{http::parse_request, kernel},
};
use std::{
    io,
    mem::size_of,
    net::{Ipv4Addr, SocketAddrV4},
    os::fd::RawFd,
    ptr::{self, NonNull},
    slice,
};
use tracing::{debug, error, trace, warn};

pub const REQUEST_BUFFER_SIZE: u32 = 8192;
pub const RESPONSE_BUFFER_SIZE: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Accept,
    Read,
    Write,
}

impl EventType {
    /// What a request waits for after this event completes. `None` once the
    /// write is done and the connection is closed.
    pub const fn next(self) -> Option<EventType> {
        match self {
            EventType::Accept => Some(EventType::Read),
            EventType::Read => Some(EventType::Write),
            EventType::Write => None,
        }
    }
}

/// Raw view of a buffer inside a scratch arena.
#[derive(Debug, Clone, Copy)]
pub struct IoBuffer {
    ptr: *mut u8,
    capacity: u32,
    len: u32,
}

impl IoBuffer {
    const EMPTY: IoBuffer = IoBuffer {
        ptr: ptr::null_mut(),
        capacity: 0,
        len: 0,
    };

    fn allocate(scratch: &mut Scratch, capacity: u32) -> Option<IoBuffer> {
        let ptr = scratch.push(capacity as u64, 16)?;
        Some(IoBuffer {
            ptr: ptr.as_ptr(),
            capacity,
            len: 0,
        })
    }

    /// # Safety
    /// The owning scratch arena must still be checked out.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        slice::from_raw_parts(self.ptr, self.len as usize)
    }

    /// # Safety
    /// As [`IoBuffer::as_slice`], and nothing else may alias the buffer.
    pub unsafe fn spare_mut<'a>(&mut self) -> &'a mut [u8] {
        slice::from_raw_parts_mut(self.ptr, self.capacity as usize)
    }
}

pub struct Request {
    pub event_type: EventType,
    pub client_fd: RawFd,
    pub client_address: libc::sockaddr_in,
    pub client_address_len: libc::socklen_t,
    pub request: IoBuffer,
    pub response: IoBuffer,
    scratch: Scratch,
}

impl Request {
    #[inline(always)]
    fn user_data(request: NonNull<Request>) -> u64 {
        request.as_ptr() as u64
    }

    /// Moves to the next event and returns it.
    fn advance(&mut self) -> Option<EventType> {
        let next = self.event_type.next()?;
        self.event_type = next;
        Some(next)
    }

    pub fn peer(&self) -> SocketAddrV4 {
        peer_address(&self.client_address)
    }
}

fn peer_address(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    )
}

// Draws a scratch arena and builds a fresh Accept request inside it.
fn new_request(ctx: &mut ThreadContext) -> NonNull<Request> {
    let Some(mut scratch) = ctx.acquire_scratch() else {
        kernel::fatal("out of memory for scratch arenas");
    };
    let Some(slot) = scratch.push_array_zero::<Request>(1) else {
        kernel::fatal("scratch arena too small for a request");
    };
    unsafe {
        slot.as_ptr().write(Request {
            event_type: EventType::Accept,
            client_fd: -1,
            client_address: std::mem::zeroed(),
            client_address_len: size_of::<libc::sockaddr_in>() as libc::socklen_t,
            request: IoBuffer::EMPTY,
            response: IoBuffer::EMPTY,
            scratch,
        });
    }
    slot
}

/// Draws a scratch arena, builds an Accept request inside it and submits it.
pub fn submit_accept(ctx: &mut ThreadContext) -> io::Result<()> {
    let slot = new_request(ctx);
    unsafe {
        let request = &mut *slot.as_ptr();
        let (sqe, tail) = ctx.ring.get_submission_entry();
        kernel_cmds::accept(
            sqe,
            ctx.server_fd,
            &mut request.client_address,
            &mut request.client_address_len,
            Request::user_data(slot),
        );
        // The entry is published even if enter fails; the next enter picks it
        // up, so the request must stay alive either way.
        ctx.ring.publish_submission(tail)
    }
}

unsafe fn submit_read(ring: &mut Ring, request: NonNull<Request>) -> io::Result<()> {
    let req = &mut *request.as_ptr();
    let (sqe, tail) = ring.get_submission_entry();
    kernel_cmds::read(sqe, req.client_fd, req.request.ptr, req.request.capacity, Request::user_data(request));
    ring.publish_submission(tail)
}

unsafe fn submit_write(ring: &mut Ring, request: NonNull<Request>) -> io::Result<()> {
    let req = &mut *request.as_ptr();
    let (sqe, tail) = ring.get_submission_entry();
    kernel_cmds::write(sqe, req.client_fd, req.response.ptr, req.response.len, Request::user_data(request));
    ring.publish_submission(tail)
}

/// Routes one completion to the handler for the event its request was
/// waiting on.
pub fn handle_completion(ctx: &mut ThreadContext, cqe: CompletionEntry) {
    let Some(request) = NonNull::new(cqe.user_data as *mut Request) else {
        warn!("Completion without a request tag: {:?}", cqe);
        return;
    };
    let event = unsafe { request.as_ref().event_type };
    trace!("Completion for {:?} (res {})", event, cqe.res);
    let outcome = unsafe {
        match event {
            EventType::Accept => on_accept(ctx, request, cqe.res),
            EventType::Read => on_read(ctx, request, cqe.res),
            EventType::Write => on_write(ctx, request, cqe.res),
        }
    };
    if let Err(err) = outcome {
        error!("Submission after {:?} failed: {err}", event);
    }
}

unsafe fn on_accept(ctx: &mut ThreadContext, request: NonNull<Request>, res: i32) -> io::Result<()> {
    // Keep exactly one accept outstanding.
    if let Err(err) = submit_accept(ctx) {
        error!("Re-arming accept failed: {err}");
    }
    if res < 0 {
        warn!("Accept failed: {}", io::Error::from_raw_os_error(-res));
        retire(ctx, request);
        return Ok(());
    }

    let req = &mut *request.as_ptr();
    req.client_fd = res;
    req.advance();
    debug!("Accepted FD:{} from {}", res, req.peer());

    match IoBuffer::allocate(&mut req.scratch, ctx.request_buffer_size) {
        Some(buffer) => req.request = buffer,
        None => {
            error!("No room for a {} byte request buffer", ctx.request_buffer_size);
            close_connection(ctx, request);
            return Ok(());
        }
    }
    submit_read(&mut ctx.ring, request)
}

unsafe fn on_read(ctx: &mut ThreadContext, request: NonNull<Request>, res: i32) -> io::Result<()> {
    let req = &mut *request.as_ptr();
    if res < 0 {
        warn!("Read on FD:{} failed: {}", req.client_fd, io::Error::from_raw_os_error(-res));
        close_connection(ctx, request);
        return Ok(());
    }
    if res == 0 {
        debug!("FD:{} closed by peer before sending", req.client_fd);
        close_connection(ctx, request);
        return Ok(());
    }

    req.request.len = res as u32;
    req.advance();
    debug!("Read {} bytes from FD:{}", res, req.client_fd);

    let Some(mut response) = IoBuffer::allocate(&mut req.scratch, RESPONSE_BUFFER_SIZE) else {
        error!("No room for a response buffer");
        close_connection(ctx, request);
        return Ok(());
    };
    let incoming = req.request.as_slice();
    let parsed = parse_request(incoming);
    match &parsed {
        Some(http) => debug!(
            "{} {} (host: {})",
            http.method.as_str(),
            String::from_utf8_lossy(http.path),
            String::from_utf8_lossy(http.header(b"host").unwrap_or_default())
        ),
        None => debug!("Unparsed request ({} bytes)", incoming.len()),
    }
    response.len = Server::handler(parsed.as_ref(), response.spare_mut()) as u32;
    if response.len == 0 {
        warn!("No response for FD:{}, closing", req.client_fd);
        close_connection(ctx, request);
        return Ok(());
    }
    req.response = response;
    submit_write(&mut ctx.ring, request)
}

unsafe fn on_write(ctx: &mut ThreadContext, request: NonNull<Request>, res: i32) -> io::Result<()> {
    let req = request.as_ref();
    debug_assert!(req.event_type.next().is_none());
    if res < 0 {
        warn!("Write on FD:{} failed: {}", req.client_fd, io::Error::from_raw_os_error(-res));
    } else if (res as u32) < req.response.len {
        warn!("Short write on FD:{}: {} of {} bytes", req.client_fd, res, req.response.len);
    } else {
        debug!("Wrote {} bytes to FD:{}", res, req.client_fd);
    }
    ctx.served += 1;
    close_connection(ctx, request);
    Ok(())
}

unsafe fn close_connection(ctx: &mut ThreadContext, request: NonNull<Request>) {
    let fd = request.as_ref().client_fd;
    if fd >= 0 {
        if let Err(err) = kernel::close(fd) {
            error!("Closing FD:{fd} failed: {err}");
        }
    }
    retire(ctx, request);
}

// Hands the request's scratch arena back. The request itself lives in that
// arena and must not be touched afterwards.
unsafe fn retire(ctx: &mut ThreadContext, request: NonNull<Request>) {
    let scratch = ptr::read(&(*request.as_ptr()).scratch);
    ctx.release_scratch(scratch);
}
