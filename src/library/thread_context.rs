use crate::library::{
    arena::{ARENA_DEFAULT_COMMIT_SIZE, ARENA_DEFAULT_RESERVE_SIZE, Arena},
    connection::REQUEST_BUFFER_SIZE,
    scratch::{SCRATCH_ARENA_SIZE, Scratch, ScratchPool},
    uring::{DEFAULT_QUEUE_DEPTH, Ring},
};
use std::{io, os::fd::RawFd};
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct ThreadSettings {
    pub arena_reserve: u64,
    pub arena_commit: u64,
    pub scratch_size: u64,
    pub uring_size: u32,
    pub request_buffer_size: u32,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        ThreadSettings {
            arena_reserve: ARENA_DEFAULT_RESERVE_SIZE,
            arena_commit: ARENA_DEFAULT_COMMIT_SIZE,
            scratch_size: SCRATCH_ARENA_SIZE,
            uring_size: DEFAULT_QUEUE_DEPTH,
            request_buffer_size: REQUEST_BUFFER_SIZE,
        }
    }
}

/// Everything one worker owns. Nothing in here is shared with other threads
/// except the listening socket, which is only borrowed.
pub struct ThreadContext {
    pub thread_id: u32,
    pub ring: Ring,
    pub permanent_arena: Arena,
    scratch_pool: ScratchPool,
    pub server_fd: RawFd,
    pub request_buffer_size: u32,
    pub served: u64,
}

impl ThreadContext {
    pub fn new(thread_id: u32, server_fd: RawFd, settings: ThreadSettings) -> io::Result<ThreadContext> {
        info!(
            "Thread {} context: arena {} bytes reserved, scratch {} bytes, ring depth {}",
            thread_id, settings.arena_reserve, settings.scratch_size, settings.uring_size
        );
        let permanent_arena = Arena::create(settings.arena_reserve, settings.arena_commit, true)?;
        let ring = Ring::new(settings.uring_size)?;
        Ok(ThreadContext {
            thread_id,
            ring,
            permanent_arena,
            scratch_pool: ScratchPool::new(settings.scratch_size),
            server_fd,
            request_buffer_size: settings.request_buffer_size,
            served: 0,
        })
    }

    #[inline(always)]
    pub fn acquire_scratch(&mut self) -> Option<Scratch> {
        self.scratch_pool.acquire(&mut self.permanent_arena)
    }

    #[inline(always)]
    pub fn release_scratch(&mut self, scratch: Scratch) {
        self.scratch_pool.release(scratch);
    }

    pub fn scratch_pool(&self) -> &ScratchPool {
        &self.scratch_pool
    }
}
