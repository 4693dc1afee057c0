use crate::library::{
    arena::{Arena, ArenaHeader},
    utils::memory::{KILOBYTE, PAGE_SIZE},
};
use std::{
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};
use tracing::trace;

pub const SCRATCH_ARENA_SIZE: u64 = 64 * KILOBYTE;

/// Connection-scoped arena. Its memory is carved out of a thread's permanent
/// arena, so dropping it frees nothing; hand it back to the pool instead.
pub struct Scratch(Arena);

impl Deref for Scratch {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        &self.0
    }
}

impl DerefMut for Scratch {
    fn deref_mut(&mut self) -> &mut Arena {
        &mut self.0
    }
}

/// Idle scratch arenas, linked through the `next_free` field of their headers.
pub struct ScratchPool {
    head: *mut ArenaHeader,
    scratch_size: u64,
    idle: usize,
    created: usize,
}

impl ScratchPool {
    pub fn new(scratch_size: u64) -> Self {
        ScratchPool {
            head: ptr::null_mut(),
            scratch_size: scratch_size.next_multiple_of(PAGE_SIZE),
            idle: 0,
            created: 0,
        }
    }

    /// Reuses an idle scratch arena, or carves a new one out of `permanent`.
    /// `None` when `permanent` cannot grow.
    pub fn acquire(&mut self, permanent: &mut Arena) -> Option<Scratch> {
        if let Some(head) = NonNull::new(self.head) {
            unsafe {
                self.head = (*head.as_ptr()).next_free;
                (*head.as_ptr()).next_free = ptr::null_mut();
            }
            self.idle -= 1;
            trace!("Reuse scratch arena {:p}", head.as_ptr());
            return Some(Scratch(unsafe { Arena::from_raw(head) }));
        }
        let buffer = permanent.push(self.scratch_size, PAGE_SIZE)?;
        self.created += 1;
        trace!("New scratch arena {:p} ({} total)", buffer.as_ptr(), self.created);
        Some(Scratch(unsafe { Arena::create_in(buffer, self.scratch_size) }))
    }

    /// Clears `scratch` and parks it at the head of the free list.
    pub fn release(&mut self, mut scratch: Scratch) {
        scratch.clear();
        let raw = scratch.0.into_raw();
        unsafe { (*raw.as_ptr()).next_free = self.head };
        self.head = raw.as_ptr();
        self.idle += 1;
    }

    pub fn idle(&self) -> usize {
        self.idle
    }

    pub fn created(&self) -> usize {
        self.created
    }
}
