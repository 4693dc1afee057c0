pub mod abi;
pub mod kernel_cmds;

use crate::library::utils::kernel::{self, io_uring_enter, io_uring_setup, map_ring_region};
use abi::{
    CompletionEntry, IORING_ENTER_GETEVENTS, IORING_FEAT_SINGLE_MMAP, IORING_OFF_CQ_RING,
    IORING_OFF_SQ_RING, IORING_OFF_SQES, IoUringParams, SubmissionEntry,
};
use std::{
    io,
    mem::size_of,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};
use tracing::{info, trace};

pub const DEFAULT_QUEUE_DEPTH: u32 = 256;

// One shared mapping of a ring region. Unmapped when dropped.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn new(fd: RawFd, len: usize, offset: u64) -> io::Result<Mapping> {
        let ptr = map_ring_region(fd, len, offset)?;
        Ok(Mapping { ptr, len })
    }

    #[inline(always)]
    unsafe fn at<T>(&self, offset: u32) -> *mut T {
        self.ptr.as_ptr().add(offset as usize) as *mut T
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { kernel::unmap_ring_region(self.ptr, self.len) };
    }
}

/// User-space view of the submission queue. We own the tail, the kernel owns
/// the head.
pub struct SubmissionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    mask: u32,
    sqes: *mut SubmissionEntry,
}

impl SubmissionQueue {
    /// # Safety
    /// All pointers must stay valid for the lifetime of the queue and `sqes`
    /// must hold `mask + 1` entries.
    pub(crate) unsafe fn from_raw(
        head: *const AtomicU32,
        tail: *const AtomicU32,
        mask: u32,
        sqes: *mut SubmissionEntry,
    ) -> Self {
        SubmissionQueue { head, tail, mask, sqes }
    }

    /// Slot for the next submission plus the tail value to publish once the
    /// slot is filled.
    #[inline(always)]
    pub fn get_submission_entry(&mut self) -> (&mut SubmissionEntry, u32) {
        let tail = unsafe { (*self.tail).load(Ordering::Acquire) };
        let index = tail & self.mask;
        (unsafe { &mut *self.sqes.add(index as usize) }, tail)
    }

    /// Makes the entry written at `tail` visible to the kernel.
    #[inline(always)]
    pub fn advance(&mut self, tail: u32) {
        unsafe { (*self.tail).store(tail.wrapping_add(1), Ordering::Release) };
    }

    /// Entries published but not yet consumed by the kernel.
    pub fn pending(&self) -> u32 {
        unsafe {
            let tail = (*self.tail).load(Ordering::Acquire);
            tail.wrapping_sub((*self.head).load(Ordering::Acquire))
        }
    }
}

/// User-space view of the completion queue. The kernel owns the tail, we own
/// the head.
pub struct CompletionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    mask: u32,
    cqes: *const CompletionEntry,
}

impl CompletionQueue {
    /// # Safety
    /// All pointers must stay valid for the lifetime of the queue and `cqes`
    /// must hold `mask + 1` entries.
    pub(crate) unsafe fn from_raw(
        head: *const AtomicU32,
        tail: *const AtomicU32,
        mask: u32,
        cqes: *const CompletionEntry,
    ) -> Self {
        CompletionQueue { head, tail, mask, cqes }
    }

    /// Pops the oldest completion if the kernel has posted one.
    #[inline(always)]
    pub fn pop(&mut self) -> Option<CompletionEntry> {
        unsafe {
            let head = (*self.head).load(Ordering::Acquire);
            let tail = (*self.tail).load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let cqe = *self.cqes.add((head & self.mask) as usize);
            (*self.head).store(head.wrapping_add(1), Ordering::Release);
            Some(cqe)
        }
    }
}

/// A kernel io_uring instance with its three memory regions mapped.
pub struct Ring {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    _sq_map: Mapping,
    _cq_map: Option<Mapping>,
    _sqe_map: Mapping,
    fd: OwnedFd,
}

impl Ring {
    pub fn new(entries: u32) -> io::Result<Ring> {
        let mut params = IoUringParams::default();
        let fd = io_uring_setup(entries, &mut params)?;
        let raw_fd = fd.as_raw_fd();
        info!(
            "Uring ready: {} SQ entries, {} CQ entries, features {:#x}",
            params.sq_entries, params.cq_entries, params.features
        );

        let mut sq_len = params.sq_off.array as usize + params.sq_entries as usize * size_of::<u32>();
        let mut cq_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * size_of::<CompletionEntry>();
        let single_mmap = params.features & IORING_FEAT_SINGLE_MMAP != 0;
        if single_mmap {
            sq_len = sq_len.max(cq_len);
            cq_len = sq_len;
        }

        let sq_map = Mapping::new(raw_fd, sq_len, IORING_OFF_SQ_RING)?;
        let cq_map = if single_mmap {
            trace!("Kernel shares one mapping for SQ and CQ rings");
            None
        } else {
            Some(Mapping::new(raw_fd, cq_len, IORING_OFF_CQ_RING)?)
        };
        let sqe_map = Mapping::new(
            raw_fd,
            params.sq_entries as usize * size_of::<SubmissionEntry>(),
            IORING_OFF_SQES,
        )?;

        let (sq, cq) = unsafe {
            let cq_ring = cq_map.as_ref().unwrap_or(&sq_map);
            let sq_off = &params.sq_off;
            let cq_off = &params.cq_off;

            // Slot i of the index array always points at entry i.
            let array = sq_map.at::<u32>(sq_off.array);
            for i in 0..params.sq_entries {
                array.add(i as usize).write(i);
            }

            let sq = SubmissionQueue::from_raw(
                sq_map.at::<AtomicU32>(sq_off.head),
                sq_map.at::<AtomicU32>(sq_off.tail),
                *sq_map.at::<u32>(sq_off.ring_mask),
                sqe_map.ptr.as_ptr() as *mut SubmissionEntry,
            );
            let cq = CompletionQueue::from_raw(
                cq_ring.at::<AtomicU32>(cq_off.head),
                cq_ring.at::<AtomicU32>(cq_off.tail),
                *cq_ring.at::<u32>(cq_off.ring_mask),
                cq_ring.at::<CompletionEntry>(cq_off.cqes),
            );
            (sq, cq)
        };

        Ok(Ring {
            sq,
            cq,
            _sq_map: sq_map,
            _cq_map: cq_map,
            _sqe_map: sqe_map,
            fd,
        })
    }

    #[inline(always)]
    pub fn get_submission_entry(&mut self) -> (&mut SubmissionEntry, u32) {
        self.sq.get_submission_entry()
    }

    /// Publishes the entry at `tail` and asks the kernel to consume it.
    pub fn publish_submission(&mut self, tail: u32) -> io::Result<()> {
        self.sq.advance(tail);
        io_uring_enter(self.fd.as_raw_fd(), 1, 0, 0)?;
        Ok(())
    }

    /// Blocks until the kernel posts a completion and returns it. Entries left
    /// unsubmitted by an earlier failed enter are handed over on the way.
    pub fn wait_for_completion(&mut self) -> io::Result<CompletionEntry> {
        loop {
            if let Some(cqe) = self.cq.pop() {
                trace!("New CQE: {:?}", cqe);
                return Ok(cqe);
            }
            let to_submit = self.sq.pending();
            match io_uring_enter(self.fd.as_raw_fd(), to_submit, 1, IORING_ENTER_GETEVENTS) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub fn pending_submissions(&self) -> u32 {
        self.sq.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_indices_wrap_with_mask() {
        const N: u32 = 8;
        let head = AtomicU32::new(0);
        let tail = AtomicU32::new(0);
        let mut sqes = vec![SubmissionEntry::default(); N as usize];
        let base = sqes.as_mut_ptr();
        let mut sq = unsafe { SubmissionQueue::from_raw(&head, &tail, N - 1, base) };

        let mut seen = Vec::new();
        for _ in 0..=N {
            let (entry, t) = sq.get_submission_entry();
            let index = (entry as *mut SubmissionEntry as usize - base as usize)
                / size_of::<SubmissionEntry>();
            seen.push(index as u32);
            sq.advance(t);
            // Pretend the kernel consumed it.
            head.store(t.wrapping_add(1), Ordering::Release);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6, 7, 0]);
        assert_eq!(tail.load(Ordering::Acquire), N + 1);
    }

    #[test]
    fn submission_tail_wraps_around_u32() {
        let head = AtomicU32::new(u32::MAX);
        let tail = AtomicU32::new(u32::MAX);
        let mut sqes = vec![SubmissionEntry::default(); 4];
        let mut sq = unsafe { SubmissionQueue::from_raw(&head, &tail, 3, sqes.as_mut_ptr()) };

        let (entry, t) = sq.get_submission_entry();
        entry.prepare(1);
        assert_eq!(t, u32::MAX);
        sq.advance(t);
        assert_eq!(tail.load(Ordering::Acquire), 0);
        assert_eq!(sq.pending(), 1);
        assert_eq!(sqes[3].opcode, 1);
    }

    #[test]
    fn completions_pop_in_posted_order() {
        let head = AtomicU32::new(0);
        let tail = AtomicU32::new(0);
        let mut cqes = vec![CompletionEntry::default(); 4];
        for (i, cqe) in cqes.iter_mut().enumerate() {
            cqe.user_data = 100 + i as u64;
            cqe.res = i as i32;
        }
        let mut cq = unsafe { CompletionQueue::from_raw(&head, &tail, 3, cqes.as_ptr()) };

        assert!(cq.pop().is_none());
        tail.store(2, Ordering::Release);
        assert_eq!(cq.pop().map(|c| c.user_data), Some(100));
        assert_eq!(cq.pop().map(|c| c.user_data), Some(101));
        assert!(cq.pop().is_none());
        assert_eq!(head.load(Ordering::Acquire), 2);

        // Wraps back to slot 0 after the fourth entry.
        head.store(4, Ordering::Release);
        tail.store(5, Ordering::Release);
        assert_eq!(cq.pop().map(|c| c.user_data), Some(100));
    }
}
