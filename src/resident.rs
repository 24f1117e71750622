// src/resident.rs
//! Resident-asset table: O(1) id lookup plus LRU eviction order.
//!
//! Records live in an arena of slots. Two non-owning index structures lay
//! over it: a power-of-two bucket array with separate chaining (xxh3 of the
//! asset id, masked), and an intrusive doubly linked LRU list threaded
//! through the slots (head = least recently used, tail = most recently
//! used). Every record is in exactly one bucket chain and one LRU position.
//!
//! The table itself is not synchronized; the engine serializes it behind a
//! single mutex and keeps hold times short. Reference counts are atomics so
//! they can be read without the lock, but eviction re-checks them under it.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::format::MAX_LODS;
use crate::pool::{BlockHandle, MemoryPool};

pub const BUCKET_COUNT: usize = 4096;
const NIL: u32 = u32::MAX;

#[inline]
fn bucket_of(id: u64) -> usize {
    (xxhash_rust::xxh3::xxh3_64(&id.to_le_bytes()) as usize) & (BUCKET_COUNT - 1)
}

// ============================================================================
// Records
// ============================================================================

/// One loaded LOD: a pool block plus the exact payload length (the block may
/// carry alignment slack).
#[derive(Debug, Clone, Copy)]
pub struct LodBuffer {
    pub handle: BlockHandle,
    pub len: usize,
}

#[derive(Debug)]
pub struct ResidentAsset {
    pub id: u64,
    pub asset_type: u32,
    /// Lowest (highest-quality) LOD index with a loaded buffer.
    pub current_lod: u32,
    pub lods: [Option<LodBuffer>; MAX_LODS],
    /// Sum of payload lengths across loaded LODs.
    pub total_bytes: usize,
    pub last_access_frame: u64,
    pub ref_count: AtomicU32,
}

impl ResidentAsset {
    fn new(id: u64, asset_type: u32) -> Self {
        Self {
            id,
            asset_type,
            current_lod: 0,
            lods: [None; MAX_LODS],
            total_bytes: 0,
            last_access_frame: 0,
            ref_count: AtomicU32::new(0),
        }
    }

    /// Best available quality at or above the requested LOD, i.e. the lowest
    /// loaded index that does not exceed `lod`.
    pub fn best_buffer_for(&self, lod: u32) -> Option<(u32, LodBuffer)> {
        let limit = (lod as usize).min(MAX_LODS - 1);
        for i in 0..=limit {
            if let Some(buf) = self.lods[i] {
                return Some((i as u32, buf));
            }
        }
        None
    }

    fn recompute_current_lod(&mut self) {
        self.current_lod = self
            .lods
            .iter()
            .position(|l| l.is_some())
            .unwrap_or(0) as u32;
    }
}

/// Line item for the state dump.
#[derive(Debug, Clone, Copy)]
pub struct ResidentSummary {
    pub id: u64,
    pub asset_type: u32,
    pub current_lod: u32,
    pub total_bytes: usize,
    pub ref_count: u32,
    pub last_access_frame: u64,
}

// ============================================================================
// Table
// ============================================================================

struct TableSlot {
    asset: Option<ResidentAsset>,
    hash_next: u32,
    lru_prev: u32,
    lru_next: u32,
}

pub struct ResidentTable {
    slots: Vec<TableSlot>,
    free_slots: Vec<u32>,
    buckets: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
    len: usize,
    resident_bytes: usize,
}

impl ResidentTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![NIL; BUCKET_COUNT],
            lru_head: NIL,
            lru_tail: NIL,
            len: 0,
            resident_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total payload bytes across all resident LOD buffers.
    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    fn find(&self, id: u64) -> Option<u32> {
        let mut cursor = self.buckets[bucket_of(id)];
        while cursor != NIL {
            let slot = &self.slots[cursor as usize];
            if slot.asset.as_ref().map(|a| a.id) == Some(id) {
                return Some(cursor);
            }
            cursor = slot.hash_next;
        }
        None
    }

    pub fn get(&self, id: u64) -> Option<&ResidentAsset> {
        self.find(id)
            .and_then(|i| self.slots[i as usize].asset.as_ref())
    }

    /// Resident at the requested quality or better?
    pub fn is_resident(&self, id: u64, lod: u32) -> bool {
        self.get(id)
            .map(|a| a.best_buffer_for(lod).is_some())
            .unwrap_or(false)
    }

    /// Promote to most-recently-used and stamp the access frame.
    pub fn touch(&mut self, id: u64, frame: u64) -> bool {
        let Some(index) = self.find(id) else {
            return false;
        };
        self.lru_unlink(index);
        self.lru_push_tail(index);
        if let Some(asset) = self.slots[index as usize].asset.as_mut() {
            asset.last_access_frame = frame;
        }
        true
    }

    /// Install a loaded LOD buffer, creating the record on first load.
    /// Replaces (and frees) any buffer already attached at that LOD slot.
    /// Returns the bytes released by the replacement, if any.
    pub fn install_lod(
        &mut self,
        id: u64,
        asset_type: u32,
        lod: u32,
        buffer: LodBuffer,
        frame: u64,
        pool: &mut MemoryPool,
    ) -> usize {
        let lod = (lod as usize).min(MAX_LODS - 1);
        let index = match self.find(id) {
            Some(i) => i,
            None => self.insert_record(ResidentAsset::new(id, asset_type)),
        };

        let mut released = 0usize;
        {
            let asset = self.slots[index as usize]
                .asset
                .as_mut()
                .expect("slot chained into a bucket always holds a record");
            if let Some(old) = asset.lods[lod].take() {
                released = pool.free(old.handle).unwrap_or(0);
                asset.total_bytes -= old.len;
                self.resident_bytes -= old.len;
            }
            asset.lods[lod] = Some(buffer);
            asset.total_bytes += buffer.len;
            asset.last_access_frame = frame;
            asset.recompute_current_lod();
        }
        self.resident_bytes += buffer.len;
        self.lru_unlink(index);
        self.lru_push_tail(index);
        released
    }

    /// Pin against eviction.
    pub fn lock(&mut self, id: u64) -> bool {
        match self.find(id) {
            Some(i) => {
                if let Some(asset) = self.slots[i as usize].asset.as_ref() {
                    asset.ref_count.fetch_add(1, Ordering::AcqRel);
                }
                true
            }
            None => false,
        }
    }

    pub fn unlock(&mut self, id: u64) -> bool {
        match self.find(id) {
            Some(i) => {
                if let Some(asset) = self.slots[i as usize].asset.as_ref() {
                    let prev = asset.ref_count.fetch_sub(1, Ordering::AcqRel);
                    debug_assert!(prev > 0, "unlock without matching lock");
                }
                true
            }
            None => false,
        }
    }

    /// Walk from the least-recently-used end, freeing every LOD buffer of
    /// unpinned assets back to the pool until at least `bytes_needed` bytes
    /// are released or the list runs out. Returns the bytes actually freed.
    pub fn evict_lru(&mut self, bytes_needed: usize, pool: &mut MemoryPool) -> usize {
        let mut freed = 0usize;
        let mut cursor = self.lru_head;

        while cursor != NIL && freed < bytes_needed {
            let next = self.slots[cursor as usize].lru_next;

            let pinned = self.slots[cursor as usize]
                .asset
                .as_ref()
                .map(|a| a.ref_count.load(Ordering::Acquire) > 0)
                .unwrap_or(true);

            if !pinned {
                freed += self.remove_at(cursor, pool);
            }
            cursor = next;
        }

        freed
    }

    /// Drop a specific asset regardless of LRU position (still refuses
    /// pinned records). Returns the freed bytes.
    pub fn remove(&mut self, id: u64, pool: &mut MemoryPool) -> usize {
        match self.find(id) {
            Some(i) => {
                let pinned = self.slots[i as usize]
                    .asset
                    .as_ref()
                    .map(|a| a.ref_count.load(Ordering::Acquire) > 0)
                    .unwrap_or(true);
                if pinned {
                    0
                } else {
                    self.remove_at(i, pool)
                }
            }
            None => 0,
        }
    }

    pub fn summaries(&self) -> Vec<ResidentSummary> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.lru_head;
        while cursor != NIL {
            let slot = &self.slots[cursor as usize];
            if let Some(asset) = slot.asset.as_ref() {
                out.push(ResidentSummary {
                    id: asset.id,
                    asset_type: asset.asset_type,
                    current_lod: asset.current_lod,
                    total_bytes: asset.total_bytes,
                    ref_count: asset.ref_count.load(Ordering::Relaxed),
                    last_access_frame: asset.last_access_frame,
                });
            }
            cursor = slot.lru_next;
        }
        out
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn insert_record(&mut self, asset: ResidentAsset) -> u32 {
        let bucket = bucket_of(asset.id);
        let index = if let Some(i) = self.free_slots.pop() {
            let slot = &mut self.slots[i as usize];
            slot.asset = Some(asset);
            i
        } else {
            self.slots.push(TableSlot {
                asset: Some(asset),
                hash_next: NIL,
                lru_prev: NIL,
                lru_next: NIL,
            });
            (self.slots.len() - 1) as u32
        };

        self.slots[index as usize].hash_next = self.buckets[bucket];
        self.buckets[bucket] = index;
        self.lru_push_tail(index);
        self.len += 1;
        index
    }

    /// Free every LOD buffer and unlink the record. Returns freed pool bytes.
    fn remove_at(&mut self, index: u32, pool: &mut MemoryPool) -> usize {
        let mut freed = 0usize;
        let id;
        {
            let asset = self.slots[index as usize]
                .asset
                .as_mut()
                .expect("removing an empty slot");
            id = asset.id;
            for lod in asset.lods.iter_mut() {
                if let Some(buf) = lod.take() {
                    freed += pool.free(buf.handle).unwrap_or(0);
                    self.resident_bytes -= buf.len;
                }
            }
        }

        self.hash_unlink(id, index);
        self.lru_unlink(index);
        self.slots[index as usize].asset = None;
        self.free_slots.push(index);
        self.len -= 1;
        freed
    }

    fn hash_unlink(&mut self, id: u64, index: u32) {
        let bucket = bucket_of(id);
        let mut cursor = self.buckets[bucket];
        if cursor == index {
            self.buckets[bucket] = self.slots[index as usize].hash_next;
            return;
        }
        while cursor != NIL {
            let next = self.slots[cursor as usize].hash_next;
            if next == index {
                self.slots[cursor as usize].hash_next = self.slots[index as usize].hash_next;
                return;
            }
            cursor = next;
        }
        debug_assert!(false, "record missing from its bucket chain");
    }

    fn lru_unlink(&mut self, index: u32) {
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.lru_prev, slot.lru_next)
        };
        if prev != NIL {
            self.slots[prev as usize].lru_next = next;
        } else if self.lru_head == index {
            self.lru_head = next;
        }
        if next != NIL {
            self.slots[next as usize].lru_prev = prev;
        } else if self.lru_tail == index {
            self.lru_tail = prev;
        }
        let slot = &mut self.slots[index as usize];
        slot.lru_prev = NIL;
        slot.lru_next = NIL;
    }

    fn lru_push_tail(&mut self, index: u32) {
        let old_tail = self.lru_tail;
        {
            let slot = &mut self.slots[index as usize];
            slot.lru_prev = old_tail;
            slot.lru_next = NIL;
        }
        if old_tail != NIL {
            self.slots[old_tail as usize].lru_next = index;
        }
        self.lru_tail = index;
        if self.lru_head == NIL {
            self.lru_head = index;
        }
    }

    #[cfg(test)]
    fn lru_order(&self) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cursor = self.lru_head;
        while cursor != NIL {
            if let Some(a) = self.slots[cursor as usize].asset.as_ref() {
                out.push(a.id);
            }
            cursor = self.slots[cursor as usize].lru_next;
        }
        out
    }
}

impl Default for ResidentTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn install(table: &mut ResidentTable, pool: &mut MemoryPool, id: u64, lod: u32, len: usize) {
        let handle = pool.alloc(len).unwrap();
        table.install_lod(id, 0, lod, LodBuffer { handle, len }, 0, pool);
    }

    #[test]
    fn test_install_and_lookup() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        install(&mut table, &mut pool, 0x1234, 0, 1024);

        assert_eq!(table.len(), 1);
        assert!(table.is_resident(0x1234, 0));
        assert!(table.is_resident(0x1234, 3));
        assert!(!table.is_resident(0x9999, 0));
        assert_eq!(table.resident_bytes(), 1024);

        let asset = table.get(0x1234).unwrap();
        assert_eq!(asset.current_lod, 0);
        assert_eq!(asset.total_bytes, 1024);
    }

    #[test]
    fn test_coarser_lod_does_not_satisfy_finer_request() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        install(&mut table, &mut pool, 7, 2, 256);

        assert!(table.is_resident(7, 2));
        assert!(table.is_resident(7, 4));
        assert!(!table.is_resident(7, 0));
        assert_eq!(table.get(7).unwrap().current_lod, 2);
    }

    #[test]
    fn test_replacing_lod_frees_old_buffer() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        install(&mut table, &mut pool, 7, 1, 512);
        let used_after_first = pool.used();
        install(&mut table, &mut pool, 7, 1, 2048);

        assert_eq!(table.len(), 1);
        assert_eq!(table.resident_bytes(), 2048);
        // Old 512-byte block went back to the pool.
        assert_eq!(pool.used(), used_after_first - 512 + 2048);
    }

    #[test]
    fn test_touch_moves_to_mru() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        for id in 1..=3u64 {
            install(&mut table, &mut pool, id, 0, 64);
        }
        assert_eq!(table.lru_order(), vec![1, 2, 3]);

        table.touch(1, 42);
        assert_eq!(table.lru_order(), vec![2, 3, 1]);
        assert_eq!(table.get(1).unwrap().last_access_frame, 42);
    }

    #[test]
    fn test_evict_lru_in_order() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        for id in 1..=4u64 {
            install(&mut table, &mut pool, id, 0, 1024);
        }

        // Need 2 KiB: the two oldest go.
        let freed = table.evict_lru(2048, &mut pool);
        assert_eq!(freed, 2048);
        assert!(!table.is_resident(1, 4));
        assert!(!table.is_resident(2, 4));
        assert!(table.is_resident(3, 4));
        assert!(table.is_resident(4, 4));
        assert_eq!(table.resident_bytes(), 2048);
    }

    #[test]
    fn test_evict_skips_pinned() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        for id in 1..=3u64 {
            install(&mut table, &mut pool, id, 0, 1024);
        }
        assert!(table.lock(1));

        let freed = table.evict_lru(1024, &mut pool);
        assert_eq!(freed, 1024);
        assert!(table.is_resident(1, 4), "pinned asset must survive");
        assert!(!table.is_resident(2, 4));

        table.unlock(1);
        let freed = table.evict_lru(1024, &mut pool);
        assert_eq!(freed, 1024);
        assert!(!table.is_resident(1, 4));
    }

    #[test]
    fn test_evict_exhausts_list_without_enough_bytes() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        install(&mut table, &mut pool, 1, 0, 1024);

        let freed = table.evict_lru(1 << 20, &mut pool);
        assert_eq!(freed, 1024);
        assert!(table.is_empty());
        assert_eq!(table.resident_bytes(), 0);
    }

    #[test]
    fn test_remove_refuses_pinned() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        install(&mut table, &mut pool, 1, 0, 128);
        table.lock(1);
        assert_eq!(table.remove(1, &mut pool), 0);
        table.unlock(1);
        assert_eq!(table.remove(1, &mut pool), 128);
    }

    #[test]
    fn test_slot_reuse_after_eviction() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        for round in 0..3 {
            for id in 0..8u64 {
                install(&mut table, &mut pool, id + round * 100, 0, 64);
            }
            let freed = table.evict_lru(usize::MAX, &mut pool);
            assert_eq!(freed, 8 * 64);
            assert!(table.is_empty());
        }
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn test_summaries_in_lru_order() {
        let mut pool = MemoryPool::new(64 * 1024);
        let mut table = ResidentTable::new();
        install(&mut table, &mut pool, 10, 0, 64);
        install(&mut table, &mut pool, 20, 1, 128);
        table.touch(10, 5);

        let summaries = table.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, 20);
        assert_eq!(summaries[1].id, 10);
        assert_eq!(summaries[0].current_lod, 1);
        assert_eq!(summaries[1].last_access_frame, 5);
    }
}
