use crate::library::uring::abi::SubmissionEntry;
use io_uring::opcode;
use std::os::fd::RawFd;
use tracing::trace;

// The io-uring crate only lends us its opcode numbers; entries are written
// straight into our own mapped SQ.

// Offset -1 means "use the file position", which for sockets is just a stream.
const STREAM_OFFSET: u64 = u64::MAX;

#[inline(always)]
pub unsafe fn accept(
    sqe: &mut SubmissionEntry,
    listener_fd: RawFd,
    addr: *mut libc::sockaddr_in,
    addr_len: *mut libc::socklen_t,
    user_data: u64,
) {
    trace!("Kernel Call: Accept");
    sqe.prepare(opcode::Accept::CODE);
    sqe.fd = listener_fd;
    sqe.addr = addr as u64;
    sqe.off = addr_len as u64;
    sqe.op_flags = libc::SOCK_CLOEXEC as u32;
    sqe.user_data = user_data;
}

#[inline(always)]
pub unsafe fn read(sqe: &mut SubmissionEntry, client_fd: RawFd, buffer: *mut u8, len: u32, user_data: u64) {
    trace!("Kernel Call: Read");
    trace!("    Read up to {} bytes", len);
    sqe.prepare(opcode::Read::CODE);
    sqe.fd = client_fd;
    sqe.addr = buffer as u64;
    sqe.len = len;
    sqe.off = STREAM_OFFSET;
    sqe.user_data = user_data;
}

#[inline(always)]
pub unsafe fn write(sqe: &mut SubmissionEntry, client_fd: RawFd, data: *const u8, len: u32, user_data: u64) {
    trace!("Kernel Call: Write");
    trace!("    Write {} bytes", len);
    sqe.prepare(opcode::Write::CODE);
    sqe.fd = client_fd;
    sqe.addr = data as u64;
    sqe.len = len;
    sqe.off = STREAM_OFFSET;
    sqe.user_data = user_data;
}
