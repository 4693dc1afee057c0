use crate::library::uring::abi::IoUringParams;
use std::{
    io,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    ptr::{self, NonNull},
};
use tracing::{error, trace};

// Everything in here talks to the kernel directly. The rest of the crate only
// sees typed results.

/// `io_uring_setup(2)`. Fills `params` with the offsets the kernel chose.
pub fn io_uring_setup(entries: u32, params: &mut IoUringParams) -> io::Result<OwnedFd> {
    trace!("Kernel Call: io_uring_setup ({entries} entries)");
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_long,
            params as *mut IoUringParams as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

/// `io_uring_enter(2)` without a signal mask. Returns the number of consumed
/// submissions.
pub fn io_uring_enter(fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> io::Result<u32> {
    trace!("Kernel Call: io_uring_enter (submit {to_submit}, wait {min_complete})");
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd as libc::c_long,
            to_submit as libc::c_long,
            min_complete as libc::c_long,
            flags as libc::c_long,
            ptr::null::<libc::sigset_t>(),
            0 as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

/// Shared read/write mapping of one of the ring regions exposed by `fd`.
pub fn map_ring_region(fd: RawFd, len: usize, offset: u64) -> io::Result<NonNull<u8>> {
    trace!("Kernel Call: mmap ring region ({len} bytes @ {offset:#x})");
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

/// # Safety
/// `ptr`/`len` must describe a mapping obtained from [`map_ring_region`] that
/// nothing references anymore.
pub unsafe fn unmap_ring_region(ptr: NonNull<u8>, len: usize) {
    if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
        error!("munmap of ring region failed: {}", io::Error::last_os_error());
    }
}

pub fn close(fd: RawFd) -> io::Result<()> {
    trace!("Kernel Call: close FD:{fd}");
    if unsafe { libc::close(fd) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The engine has no way to recover from this. Log and abort.
pub fn fatal(message: &str) -> ! {
    error!("FATAL: {message}");
    unsafe { libc::abort() }
}
