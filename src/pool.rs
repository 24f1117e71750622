// src/pool.rs
//! Budgeted memory pool for resident asset bytes.
//!
//! One contiguous arena sized to the streaming budget. Allocation is
//! best-fit over a free list with a split threshold, falling back to bumping
//! the tail; frees coalesce abutting ranges and return tail-adjacent space.
//!
//! Callers never hold raw pointers into the arena. `alloc` hands out a
//! generational [`BlockHandle`]; the offset behind a handle lives in the
//! pool's own table, which is what `defragment` rewrites when it compacts
//! live blocks into a contiguous prefix. A handle freed (or superseded by a
//! newer generation) resolves to `None` instead of dangling.

use serde::Serialize;

use crate::error::{Result, StreamError};

/// All allocations are aligned to this many bytes.
pub const POOL_ALIGNMENT: usize = 16;
/// A free block is split only when the remainder would exceed this.
const SPLIT_THRESHOLD: usize = 256;
/// Upper bound on the scratch buffer used while compacting.
const DEFRAG_STAGING_SIZE: usize = 64 * 1024 * 1024;

#[inline]
fn align_up(size: usize) -> usize {
    (size + (POOL_ALIGNMENT - 1)) & !(POOL_ALIGNMENT - 1)
}

// ============================================================================
// Handles
// ============================================================================

/// Generational reference to a pool block. Copyable, never dereferenced
/// directly; resolve through the pool that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    index: u32,
    generation: u32,
}

impl BlockHandle {
    pub const INVALID: BlockHandle = BlockHandle {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

#[derive(Debug)]
struct BlockSlot {
    offset: usize,
    size: usize,
    generation: u32,
    live: bool,
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    offset: usize,
    size: usize,
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub used: usize,
    pub available: usize,
    /// Bytes between the high-water mark and the end of the arena.
    pub free_tail: usize,
    pub free_list_bytes: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
    /// Share of free-list bytes not sitting in the single largest block;
    /// 0.0 when the free list is empty or one block.
    pub fragmentation: f32,
}

pub struct MemoryPool {
    storage: Box<[u8]>,
    /// High-water mark; `[tail, capacity)` has never been handed out.
    tail: usize,
    /// Sum of live block sizes (slack from unsplit blocks included).
    used: usize,
    free_list: Vec<FreeBlock>,
    slots: Vec<BlockSlot>,
    free_slots: Vec<u32>,
}

impl MemoryPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            tail: 0,
            used: 0,
            free_list: Vec::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used
    }

    /// Allocate `size` bytes (rounded up to the pool alignment). Prefers the
    /// smallest free block that fits, splitting it when the remainder is
    /// worth keeping; otherwise bumps the tail.
    pub fn alloc(&mut self, size: usize) -> Result<BlockHandle> {
        let size = align_up(size.max(1));

        let mut best: Option<usize> = None;
        for (i, block) in self.free_list.iter().enumerate() {
            if block.size < size {
                continue;
            }
            let better = match best {
                None => true,
                Some(j) => {
                    let current = self.free_list[j];
                    block.size < current.size
                        || (block.size == current.size && block.offset < current.offset)
                }
            };
            if better {
                best = Some(i);
            }
        }

        let (offset, granted) = if let Some(i) = best {
            let block = self.free_list[i];
            if block.size > size + SPLIT_THRESHOLD {
                self.free_list[i] = FreeBlock {
                    offset: block.offset + size,
                    size: block.size - size,
                };
                (block.offset, size)
            } else {
                // Too small to split; the slack travels with the allocation.
                self.free_list.swap_remove(i);
                (block.offset, block.size)
            }
        } else if self.capacity() - self.tail >= size {
            let offset = self.tail;
            self.tail += size;
            (offset, size)
        } else {
            return Err(StreamError::OutOfMemory {
                requested: size,
                available: self.available(),
            });
        };

        self.used += granted;
        Ok(self.claim_slot(offset, granted))
    }

    /// Release a block. Returns the number of bytes given back, or `None`
    /// for a stale or invalid handle.
    pub fn free(&mut self, handle: BlockHandle) -> Option<usize> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if !slot.live || slot.generation != handle.generation {
            return None;
        }
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        let (offset, size) = (slot.offset, slot.size);
        self.free_slots.push(handle.index);
        self.used -= size;
        self.free_list.insert(0, FreeBlock { offset, size });
        self.coalesce();
        Some(size)
    }

    /// Adjacency pass over the free list: merge blocks whose byte ranges
    /// abut, then hand any block ending at the high-water mark back to the
    /// tail.
    fn coalesce(&mut self) {
        self.free_list.sort_by_key(|b| b.offset);
        let mut merged: Vec<FreeBlock> = Vec::with_capacity(self.free_list.len());
        for block in self.free_list.drain(..) {
            match merged.last_mut() {
                Some(last) if last.offset + last.size == block.offset => {
                    last.size += block.size;
                }
                _ => merged.push(block),
            }
        }
        // Free blocks are disjoint, so at most the final block can touch
        // the tail.
        if let Some(&last) = merged.last() {
            if last.offset + last.size == self.tail {
                self.tail = last.offset;
                merged.pop();
            }
        }
        self.free_list = merged;
    }

    /// Resolve a handle to its bytes.
    pub fn get(&self, handle: BlockHandle) -> Option<&[u8]> {
        let slot = self.slots.get(handle.index as usize)?;
        if !slot.live || slot.generation != handle.generation {
            return None;
        }
        Some(&self.storage[slot.offset..slot.offset + slot.size])
    }

    /// Copy `data` into a block. Fails on stale handles or overflow.
    pub fn write(&mut self, handle: BlockHandle, data: &[u8]) -> bool {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return false;
        };
        if !slot.live || slot.generation != handle.generation || data.len() > slot.size {
            return false;
        }
        let offset = slot.offset;
        self.storage[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    /// Compact every live block into a contiguous prefix, collapse the free
    /// list, and pull the tail back. Handles stay valid; only the offsets
    /// behind them change. Returns the number of bytes relocated.
    ///
    /// The whole pass runs under the caller's exclusive pool lock; nothing
    /// may resolve handles while blocks are in motion.
    pub fn defragment(&mut self) -> usize {
        let mut live: Vec<u32> = (0..self.slots.len() as u32)
            .filter(|&i| self.slots[i as usize].live)
            .collect();
        live.sort_by_key(|&i| self.slots[i as usize].offset);

        let staging_len = DEFRAG_STAGING_SIZE.min(self.storage.len().max(1));
        let mut staging = vec![0u8; staging_len];
        let mut cursor = 0usize;
        let mut moved = 0usize;

        for index in live {
            let (offset, size) = {
                let slot = &self.slots[index as usize];
                (slot.offset, slot.size)
            };
            if offset != cursor {
                debug_assert!(offset > cursor);
                let mut copied = 0usize;
                while copied < size {
                    let chunk = (size - copied).min(staging.len());
                    staging[..chunk]
                        .copy_from_slice(&self.storage[offset + copied..offset + copied + chunk]);
                    self.storage[cursor + copied..cursor + copied + chunk]
                        .copy_from_slice(&staging[..chunk]);
                    copied += chunk;
                }
                self.slots[index as usize].offset = cursor;
                moved += size;
            }
            cursor += size;
        }

        self.tail = cursor;
        self.free_list.clear();
        moved
    }

    pub fn stats(&self) -> PoolStats {
        let free_list_bytes: usize = self.free_list.iter().map(|b| b.size).sum();
        let largest_free = self.free_list.iter().map(|b| b.size).max().unwrap_or(0);
        let fragmentation = if free_list_bytes == 0 {
            0.0
        } else {
            1.0 - largest_free as f32 / free_list_bytes as f32
        };
        PoolStats {
            capacity: self.capacity(),
            used: self.used,
            available: self.available(),
            free_tail: self.capacity() - self.tail,
            free_list_bytes,
            free_blocks: self.free_list.len(),
            largest_free,
            fragmentation,
        }
    }

    /// Number of currently live allocations.
    pub fn live_blocks(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    fn claim_slot(&mut self, offset: usize, size: usize) -> BlockHandle {
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.offset = offset;
            slot.size = size;
            slot.live = true;
            BlockHandle {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(BlockSlot {
                offset,
                size,
                generation: 0,
                live: true,
            });
            BlockHandle {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    #[cfg(test)]
    fn free_ranges(&self) -> Vec<(usize, usize)> {
        self.free_list.iter().map(|b| (b.offset, b.size)).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
