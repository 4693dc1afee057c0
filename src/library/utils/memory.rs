use std::{io, ptr, ptr::NonNull};
use tracing::trace;

pub const KILOBYTE: u64 = 1024;
pub const MEGABYTE: u64 = 1024 * KILOBYTE;
pub const PAGE_SIZE: u64 = 4096;

// `b` must be a power of two.
#[inline(always)]
pub const fn align_pow2(x: u64, b: u64) -> u64 {
    (x + b - 1) & !(b - 1)
}

/// Reserves `size` bytes of address space with no access rights.
/// Nothing is backed by physical pages until [`commit`] is called on a range.
pub fn reserve(size: u64) -> Option<NonNull<u8>> {
    trace!("Reserve {} bytes", size);
    let result = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if result == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(result as *mut u8)
}

/// Grants read/write access to an already reserved range.
///
/// # Safety
/// `ptr..ptr + size` must lie inside a range returned by [`reserve`].
pub unsafe fn commit(ptr: *mut u8, size: u64) -> io::Result<()> {
    trace!("Commit {} bytes at {:p}", size, ptr);
    if libc::mprotect(ptr as *mut libc::c_void, size as usize, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drops the physical pages behind a range; the address space stays reserved.
///
/// # Safety
/// `ptr..ptr + size` must lie inside a range returned by [`reserve`] and no live
/// reference may point into it.
#[allow(dead_code)]
pub unsafe fn decommit(ptr: *mut u8, size: u64) -> io::Result<()> {
    trace!("Decommit {} bytes at {:p}", size, ptr);
    if libc::madvise(ptr as *mut libc::c_void, size as usize, libc::MADV_DONTNEED) != 0 {
        return Err(io::Error::last_os_error());
    }
    if libc::mprotect(ptr as *mut libc::c_void, size as usize, libc::PROT_NONE) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Returns a whole reservation to the OS.
///
/// # Safety
/// `ptr` and `size` must describe exactly one range returned by [`reserve`].
pub unsafe fn release(ptr: *mut u8, size: u64) -> io::Result<()> {
    trace!("Release {} bytes at {:p}", size, ptr);
    if libc::munmap(ptr as *mut libc::c_void, size as usize) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up_to_power_of_two() {
        assert_eq!(align_pow2(0, 8), 0);
        assert_eq!(align_pow2(1, 8), 8);
        assert_eq!(align_pow2(8, 8), 8);
        assert_eq!(align_pow2(4097, PAGE_SIZE), 2 * PAGE_SIZE);
    }

    #[test]
    fn reserve_commit_decommit_release() {
        let size = 16 * PAGE_SIZE;
        let base = reserve(size).expect("reserve");
        unsafe {
            commit(base.as_ptr(), 2 * PAGE_SIZE).unwrap();
            base.as_ptr().write(7);
            base.as_ptr().add(2 * PAGE_SIZE as usize - 1).write(9);
            assert_eq!(*base.as_ptr(), 7);
            decommit(base.as_ptr(), 2 * PAGE_SIZE).unwrap();
            commit(base.as_ptr(), PAGE_SIZE).unwrap();
            // Decommitted pages come back zeroed.
            assert_eq!(*base.as_ptr(), 0);
            release(base.as_ptr(), size).unwrap();
        }
    }
}
