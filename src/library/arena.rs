//! Linear allocator over reserved virtual memory.
//!
//! Every block starts with its own [`ArenaHeader`], so allocation offsets begin
//! at [`ARENA_HEADER_SIZE`]. A chained arena grows by linking a fresh block in
//! front of the active one; positions stay logical across the whole chain
//! (`block.base_pos + block.pos`), which is what [`Arena::pop_to`] works on.

use crate::library::utils::memory::{self, KILOBYTE, MEGABYTE, PAGE_SIZE, align_pow2};
use std::{io, marker::PhantomData, mem::ManuallyDrop, ptr, ptr::NonNull};
use tracing::{error, trace};

pub const ARENA_HEADER_SIZE: u64 = 128;
pub const ARENA_DEFAULT_RESERVE_SIZE: u64 = 64 * MEGABYTE;
pub const ARENA_DEFAULT_COMMIT_SIZE: u64 = 64 * KILOBYTE;

#[repr(C)]
pub(crate) struct ArenaHeader {
    prev: *mut ArenaHeader,
    // Only meaningful on the root block.
    current: *mut ArenaHeader,
    // Intrusive free-list link. Valid only while the arena sits idle in a
    // scratch pool.
    pub(crate) next_free: *mut ArenaHeader,
    reserve_size: u64,
    commit_size: u64,
    base_pos: u64,
    pos: u64,
    committed: u64,
    chained: bool,
    owns_memory: bool,
}

const _: () = assert!(size_of::<ArenaHeader>() as u64 <= ARENA_HEADER_SIZE);

/// Snapshot of one block in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub base_pos: u64,
    pub pos: u64,
    pub committed: u64,
    pub reserve_size: u64,
    pub commit_size: u64,
}

pub struct Arena {
    root: NonNull<ArenaHeader>,
}

impl Arena {
    /// Reserves `reserve_size` bytes and commits the first `commit_size`.
    /// Both sizes are rounded up to whole pages.
    pub fn create(reserve_size: u64, commit_size: u64, chained: bool) -> io::Result<Arena> {
        let reserve_size = reserve_size.max(ARENA_HEADER_SIZE).next_multiple_of(PAGE_SIZE);
        let commit_size = commit_size.max(ARENA_HEADER_SIZE).next_multiple_of(PAGE_SIZE).min(reserve_size);
        trace!(
            "Create arena: reserve {} bytes, commit {} bytes, chained: {}",
            reserve_size, commit_size, chained
        );
        let root = allocate_block(reserve_size, commit_size, chained).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "failed to reserve arena memory")
        })?;
        Ok(Arena { root })
    }

    /// Builds a fixed-size, non-chained arena inside memory someone else owns.
    /// Dropping the arena leaves the buffer alone.
    ///
    /// # Safety
    /// `buffer` must be readable, writable, aligned for [`ArenaHeader`] and
    /// valid for `size` bytes for as long as the arena (or anything pushed
    /// from it) is used.
    pub unsafe fn create_in(buffer: NonNull<u8>, size: u64) -> Arena {
        assert!(size >= ARENA_HEADER_SIZE, "arena buffer smaller than its header");
        let root = init_block(buffer, size, size, size, false, false);
        Arena { root }
    }

    /// Bump-allocates `size` bytes aligned to `align` (a power of two).
    /// Returns `None` when the memory cannot be provided.
    pub fn push(&mut self, size: u64, align: u64) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        unsafe {
            let root = self.root.as_ptr();
            let mut current = (*root).current;
            let mut pos_pre = align_pow2((*current).pos, align);
            let mut pos_pst = pos_pre.checked_add(size)?;

            if pos_pst > (*current).reserve_size {
                if !(*root).chained {
                    trace!("Arena full: {} of {} bytes", pos_pst, (*current).reserve_size);
                    return None;
                }
                let mut reserve_size = (*root).reserve_size;
                let mut commit_size = (*root).commit_size;
                let needed = align_pow2(ARENA_HEADER_SIZE, align).checked_add(size)?;
                if needed > reserve_size {
                    reserve_size = needed.checked_next_multiple_of(PAGE_SIZE)?;
                    commit_size = commit_size.min(reserve_size);
                }
                trace!("Chain new arena block ({} bytes)", reserve_size);
                let block = allocate_block(reserve_size, commit_size, true)?.as_ptr();
                (*block).base_pos = (*current).base_pos + (*current).reserve_size;
                (*block).prev = current;
                (*root).current = block;
                current = block;
                pos_pre = align_pow2((*current).pos, align);
                pos_pst = pos_pre.checked_add(size)?;
            }

            if pos_pst > (*current).committed {
                let target = pos_pst
                    .next_multiple_of((*current).commit_size)
                    .min((*current).reserve_size);
                let start = (current as *mut u8).add((*current).committed as usize);
                if let Err(err) = memory::commit(start, target - (*current).committed) {
                    error!("Failed to grow arena: {err}");
                    return None;
                }
                (*current).committed = target;
            }

            (*current).pos = pos_pst;
            NonNull::new((current as *mut u8).add(pos_pre as usize))
        }
    }

    /// [`Arena::push`] with the returned region zero-filled.
    pub fn push_zero(&mut self, size: u64, align: u64) -> Option<NonNull<u8>> {
        let ptr = self.push(size, align)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size as usize) };
        Some(ptr)
    }

    /// Zeroed, properly aligned storage for `count` values of `T`.
    pub fn push_array_zero<T>(&mut self, count: usize) -> Option<NonNull<T>> {
        let size = size_of::<T>().checked_mul(count)? as u64;
        self.push_zero(size, align_of::<T>() as u64).map(NonNull::cast)
    }

    /// Logical position across the whole chain.
    pub fn pos(&self) -> u64 {
        unsafe {
            let current = (*self.root.as_ptr()).current;
            (*current).base_pos + (*current).pos
        }
    }

    /// Rewinds to `pos`, releasing every chained block that starts at or past
    /// it. Rewinding forward is a bug and panics.
    pub fn pop_to(&mut self, pos: u64) {
        let target = pos.max(ARENA_HEADER_SIZE);
        let current_pos = self.pos();
        assert!(target <= current_pos, "arena: pop to {target} past current position {current_pos}");
        unsafe {
            let root = self.root.as_ptr();
            let mut current = (*root).current;
            while (*current).base_pos >= target {
                let prev = (*current).prev;
                release_block(current);
                current = prev;
            }
            (*root).current = current;
            (*current).pos = (target - (*current).base_pos).max(ARENA_HEADER_SIZE);
        }
    }

    #[allow(dead_code)]
    pub fn pop(&mut self, amount: u64) {
        self.pop_to(self.pos().saturating_sub(amount));
    }

    pub fn clear(&mut self) {
        self.pop_to(0);
    }

    /// Address of the root header; stable for the arena's whole life.
    pub fn id(&self) -> usize {
        self.root.as_ptr() as usize
    }

    /// Active block first, then back through `prev` to the root.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            next: unsafe { (*self.root.as_ptr()).current },
            _arena: PhantomData,
        }
    }

    pub(crate) fn into_raw(self) -> NonNull<ArenaHeader> {
        ManuallyDrop::new(self).root
    }

    /// # Safety
    /// `root` must come from [`Arena::into_raw`] and not be in use elsewhere.
    pub(crate) unsafe fn from_raw(root: NonNull<ArenaHeader>) -> Arena {
        Arena { root }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            let mut current = (*self.root.as_ptr()).current;
            while !current.is_null() {
                let prev = (*current).prev;
                release_block(current);
                current = prev;
            }
        }
    }
}

pub struct Blocks<'a> {
    next: *const ArenaHeader,
    _arena: PhantomData<&'a Arena>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.next.is_null() {
            return None;
        }
        unsafe {
            let block = &*self.next;
            self.next = block.prev;
            Some(BlockInfo {
                base_pos: block.base_pos,
                pos: block.pos,
                committed: block.committed,
                reserve_size: block.reserve_size,
                commit_size: block.commit_size,
            })
        }
    }
}

fn allocate_block(reserve_size: u64, commit_size: u64, chained: bool) -> Option<NonNull<ArenaHeader>> {
    let base = memory::reserve(reserve_size)?;
    unsafe {
        if let Err(err) = memory::commit(base.as_ptr(), commit_size) {
            error!("Failed to commit initial arena pages: {err}");
            let _ = memory::release(base.as_ptr(), reserve_size);
            return None;
        }
        Some(init_block(base, reserve_size, commit_size, commit_size, chained, true))
    }
}

unsafe fn init_block(
    base: NonNull<u8>,
    reserve_size: u64,
    commit_size: u64,
    committed: u64,
    chained: bool,
    owns_memory: bool,
) -> NonNull<ArenaHeader> {
    let header = base.cast::<ArenaHeader>();
    header.as_ptr().write(ArenaHeader {
        prev: ptr::null_mut(),
        current: header.as_ptr(),
        next_free: ptr::null_mut(),
        reserve_size,
        commit_size,
        base_pos: 0,
        pos: ARENA_HEADER_SIZE,
        committed,
        chained,
        owns_memory,
    });
    header
}

unsafe fn release_block(block: *mut ArenaHeader) {
    if !(*block).owns_memory {
        return;
    }
    let size = (*block).reserve_size;
    if let Err(err) = memory::release(block as *mut u8, size) {
        error!("Failed to release arena block: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_start_after_header() {
        let mut arena = Arena::create(MEGABYTE, 64 * KILOBYTE, false).unwrap();
        assert_eq!(arena.pos(), ARENA_HEADER_SIZE);
        let first = arena.push(1, 1).unwrap();
        let block = arena.blocks().next().unwrap();
        assert_eq!(block.pos, ARENA_HEADER_SIZE + 1);
        // The header lives at offset zero of the block.
        let base = first.as_ptr() as usize - ARENA_HEADER_SIZE as usize;
        assert_eq!(base % PAGE_SIZE as usize, 0);
    }

    #[test]
    fn sizes_round_up_to_pages() {
        let arena = Arena::create(10_000, 100, true).unwrap();
        let block = arena.blocks().next().unwrap();
        assert_eq!(block.reserve_size, 3 * PAGE_SIZE);
        assert_eq!(block.commit_size, PAGE_SIZE);
        assert_eq!(block.committed, PAGE_SIZE);
    }

    #[test]
    fn pushes_accumulate_and_commit_in_steps() {
        let commit = 16 * KILOBYTE;
        let reserve = MEGABYTE;
        let mut arena = Arena::create(reserve, commit, true).unwrap();
        let sizes = [24u64, 4096, 8, 40_000, 1000, 200_000, 64];
        let mut expected = ARENA_HEADER_SIZE;
        for size in sizes {
            let ptr = arena.push(size, 8).unwrap();
            unsafe { ptr.as_ptr().add(size as usize - 1).write(0xAA) };
            expected = align_pow2(expected, 8) + size;
            let block = arena.blocks().next().unwrap();
            assert_eq!(arena.pos(), expected);
            assert_eq!(block.committed % commit, 0);
            assert!(block.committed <= block.reserve_size);
            assert!(block.committed >= block.pos);
        }
        assert_eq!(arena.blocks().count(), 1);
    }

    #[test]
    fn alignment_is_honoured() {
        let mut arena = Arena::create(MEGABYTE, 64 * KILOBYTE, false).unwrap();
        arena.push(3, 1).unwrap();
        let ptr = arena.push(16, 64).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        assert_eq!(arena.pos(), align_pow2(ARENA_HEADER_SIZE + 3, 64) + 16);
    }

    #[test]
    fn oversized_push_chains_a_block() {
        let reserve = 64 * KILOBYTE;
        let mut arena = Arena::create(reserve, 4 * KILOBYTE, true).unwrap();
        let small = arena.push(100, 8).unwrap();
        unsafe { small.as_ptr().write(1) };

        let request = 200 * KILOBYTE;
        let big = arena.push(request, 8).unwrap();
        unsafe { big.as_ptr().add(request as usize - 1).write(2) };

        let blocks: Vec<BlockInfo> = arena.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].reserve_size >= ARENA_HEADER_SIZE + request);
        assert_eq!(blocks[0].base_pos, reserve);
        assert_eq!(blocks[1].reserve_size, reserve);
        assert_eq!(blocks[1].pos, ARENA_HEADER_SIZE + 100);
        assert_eq!(arena.pos(), reserve + ARENA_HEADER_SIZE + request);
        // Older memory is untouched.
        assert_eq!(unsafe { *small.as_ptr() }, 1);
    }

    #[test]
    fn filling_a_block_moves_on_to_the_next() {
        let reserve = 16 * KILOBYTE;
        let mut arena = Arena::create(reserve, 4 * KILOBYTE, true).unwrap();
        for _ in 0..10 {
            arena.push(4 * KILOBYTE, 8).unwrap();
        }
        let blocks: Vec<BlockInfo> = arena.blocks().collect();
        assert!(blocks.len() > 1);
        assert!(blocks.iter().all(|b| b.reserve_size == reserve));
    }

    #[test]
    fn unchained_arena_refuses_to_overflow() {
        let mut arena = Arena::create(8 * KILOBYTE, 4 * KILOBYTE, false).unwrap();
        assert!(arena.push(8 * KILOBYTE, 8).is_none());
        let before = arena.pos();
        assert!(arena.push(1024, 8).is_some());
        assert_eq!(arena.pos(), before + 1024);
    }

    #[test]
    fn huge_sizes_are_refused_without_wrapping() {
        for chained in [false, true] {
            let mut arena = Arena::create(MEGABYTE, 64 * KILOBYTE, chained).unwrap();
            arena.push(24, 8).unwrap();
            let before = arena.pos();
            assert!(arena.push(u64::MAX - 64, 8).is_none());
            assert!(arena.push(u64::MAX, 1).is_none());
            assert!(arena.push_array_zero::<u64>(usize::MAX).is_none());
            assert_eq!(arena.pos(), before);
            assert_eq!(arena.blocks().count(), 1);

            // Still usable, and the header was left alone.
            assert!(arena.push(16, 8).is_some());
            assert_eq!(arena.pos(), before + 16);
        }
    }

    #[test]
    fn pop_then_push_reuses_addresses() {
        let mut arena = Arena::create(MEGABYTE, 64 * KILOBYTE, false).unwrap();
        arena.push(64, 8).unwrap();
        let mark = arena.pos();
        let a = arena.push(128, 8).unwrap();
        let b = arena.push(256, 8).unwrap();
        arena.pop_to(mark);
        assert_eq!(arena.pos(), mark);
        assert_eq!(arena.push(128, 8).unwrap(), a);
        assert_eq!(arena.push(256, 8).unwrap(), b);
    }

    #[test]
    fn pop_to_releases_chained_blocks() {
        let reserve = 16 * KILOBYTE;
        let mut arena = Arena::create(reserve, 4 * KILOBYTE, true).unwrap();
        arena.push(1000, 8).unwrap();
        let mark = arena.pos();
        arena.push(64 * KILOBYTE, 8).unwrap();
        arena.push(64 * KILOBYTE, 8).unwrap();
        assert_eq!(arena.blocks().count(), 3);

        arena.pop_to(mark);
        assert_eq!(arena.blocks().count(), 1);
        assert_eq!(arena.pos(), mark);
        arena.push(10, 1).unwrap();
        assert_eq!(arena.pos(), mark + 10);
    }

    #[test]
    fn pop_saturates_and_clear_resets() {
        let mut arena = Arena::create(MEGABYTE, 64 * KILOBYTE, true).unwrap();
        arena.push(500, 1).unwrap();
        arena.pop(100);
        assert_eq!(arena.pos(), ARENA_HEADER_SIZE + 400);
        arena.pop(u64::MAX);
        assert_eq!(arena.pos(), ARENA_HEADER_SIZE);

        arena.push(2 * MEGABYTE, 8).unwrap();
        assert_eq!(arena.blocks().count(), 2);
        arena.clear();
        assert_eq!(arena.blocks().count(), 1);
        assert_eq!(arena.pos(), ARENA_HEADER_SIZE);
    }

    #[test]
    #[should_panic(expected = "past current position")]
    fn popping_forward_panics() {
        let mut arena = Arena::create(MEGABYTE, 64 * KILOBYTE, false).unwrap();
        arena.push(16, 8).unwrap();
        arena.pop_to(ARENA_HEADER_SIZE + 1000);
    }

    #[test]
    fn push_zero_clears_reused_memory() {
        let mut arena = Arena::create(MEGABYTE, 64 * KILOBYTE, false).unwrap();
        let mark = arena.pos();
        let dirty = arena.push(256, 8).unwrap();
        unsafe { ptr::write_bytes(dirty.as_ptr(), 0xFF, 256) };
        arena.pop_to(mark);
        let clean = arena.push_zero(256, 8).unwrap();
        assert_eq!(clean, dirty);
        let bytes = unsafe { std::slice::from_raw_parts(clean.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn arena_over_borrowed_buffer() {
        let mut backing = vec![0u64; 1024];
        let size = (backing.len() * size_of::<u64>()) as u64;
        let buffer = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        {
            let mut arena = unsafe { Arena::create_in(buffer, size) };
            let values = arena.push_array_zero::<u32>(4).unwrap();
            unsafe { values.as_ptr().write(0xBEEF) };
            assert!(arena.push(size, 8).is_none());
        }
        // Dropping the arena left the buffer in place.
        assert_ne!(backing[(ARENA_HEADER_SIZE / 8) as usize], 0);
    }
}
