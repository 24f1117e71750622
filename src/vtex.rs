// src/vtex.rs
//! Virtual-texture manager.
//!
//! A virtual texture presents a logical image up to 16K on a side as a
//! sparse grid of fixed-size pages plus a mip pyramid. Page payloads stream
//! through the regular scheduler under synthesized asset ids; resident pages
//! occupy slots in a dedicated page cache whose budget is separate from the
//! general pool. A low-resolution indirection map projects sample
//! coordinates to `(cache slot, mip)` or marks them absent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::request::{Priority, RequestHandle};
use crate::scheduler::EngineShared;

/// Logical texture dimensions are capped here.
pub const VT_MAX_DIM: u32 = 16384;
/// Indirection map edge length; each cell is 4 bytes.
pub const INDIRECTION_DIM: usize = 2048;
/// Bytes per texel assumed for page sizing.
const TEXEL_BYTES: usize = 4;

/// Synthesized asset id for a page: texture identity in the high word,
/// `y`/`x` packed below.
pub fn page_asset_id(identity: u32, x: u32, y: u32) -> u64 {
    ((identity as u64) << 32) | ((y as u64) << 16) | x as u64
}

// ============================================================================
// Pages
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct VtPage {
    /// Slot in the page cache while resident.
    pub cache_slot: Option<u32>,
    pub last_access_frame: u64,
    pub locked: bool,
    pub ref_count: u32,
    pub resident: bool,
}

/// One mip level's page grid, sparse by row.
struct PageGrid {
    pages_x: u32,
    pages_y: u32,
    rows: Vec<Option<Vec<VtPage>>>,
}

impl PageGrid {
    fn new(pages_x: u32, pages_y: u32) -> Self {
        Self {
            pages_x,
            pages_y,
            rows: (0..pages_y).map(|_| None).collect(),
        }
    }

    fn page(&self, x: u32, y: u32) -> Option<&VtPage> {
        self.rows
            .get(y as usize)?
            .as_ref()?
            .get(x as usize)
    }

    fn page_mut(&mut self, x: u32, y: u32) -> Option<&mut VtPage> {
        if x >= self.pages_x || y >= self.pages_y {
            return None;
        }
        let pages_x = self.pages_x as usize;
        let row = self.rows.get_mut(y as usize)?;
        row.get_or_insert_with(|| vec![VtPage::default(); pages_x])
            .get_mut(x as usize)
    }
}

struct VtState {
    mips: Vec<PageGrid>,
    indirection: Vec<u8>,
}

pub struct VirtualTexture {
    pub identity: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub page_size: u32,
    pub mip_count: u32,
    state: Mutex<VtState>,
}

impl VirtualTexture {
    fn new(identity: u32, width: u32, height: u32, format: u32, page_size: u32) -> Self {
        let mut mips = Vec::new();
        let mut mip_w = width;
        let mut mip_h = height;
        loop {
            let pages_x = mip_w.div_ceil(page_size).max(1);
            let pages_y = mip_h.div_ceil(page_size).max(1);
            mips.push(PageGrid::new(pages_x, pages_y));
            if pages_x == 1 && pages_y == 1 {
                break;
            }
            mip_w = (mip_w / 2).max(1);
            mip_h = (mip_h / 2).max(1);
        }
        let mip_count = mips.len() as u32;
        Self {
            identity,
            width,
            height,
            format,
            page_size,
            mip_count,
            state: Mutex::new(VtState {
                mips,
                indirection: vec![0u8; INDIRECTION_DIM * INDIRECTION_DIM * 4],
            }),
        }
    }

    pub fn pages_x(&self, mip: u32) -> u32 {
        self.state.lock().mips[mip as usize].pages_x
    }

    pub fn pages_y(&self, mip: u32) -> u32 {
        self.state.lock().mips[mip as usize].pages_y
    }

    pub fn page_info(&self, x: u32, y: u32, mip: u32) -> Option<VtPage> {
        let state = self.state.lock();
        state.mips.get(mip as usize)?.page(x, y).copied()
    }

    /// Read one indirection cell as `(lo, hi, mip, flags)`.
    pub fn indirection_cell(&self, cx: usize, cy: usize) -> [u8; 4] {
        let state = self.state.lock();
        let base = (cy * INDIRECTION_DIM + cx) * 4;
        let mut out = [0u8; 4];
        out.copy_from_slice(&state.indirection[base..base + 4]);
        out
    }

    /// Pin a page against cache eviction.
    pub fn lock_page(&self, x: u32, y: u32, mip: u32) {
        let mut state = self.state.lock();
        if let Some(page) = state.mips.get_mut(mip as usize).and_then(|g| g.page_mut(x, y)) {
            page.locked = true;
            page.ref_count += 1;
        }
    }

    pub fn unlock_page(&self, x: u32, y: u32, mip: u32) {
        let mut state = self.state.lock();
        if let Some(page) = state.mips.get_mut(mip as usize).and_then(|g| g.page_mut(x, y)) {
            page.ref_count = page.ref_count.saturating_sub(1);
            if page.ref_count == 0 {
                page.locked = false;
            }
        }
    }
}

// ============================================================================
// Page cache
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotOwner {
    identity: u32,
    x: u32,
    y: u32,
    mip: u32,
}

struct VtSlotCache {
    page_bytes: usize,
    slots: Vec<Option<Vec<u8>>>,
    owners: Vec<Option<SlotOwner>>,
    /// Front = oldest resident page.
    lru: VecDeque<u32>,
}

impl VtSlotCache {
    fn new(slot_count: usize, page_bytes: usize) -> Self {
        Self {
            page_bytes,
            slots: (0..slot_count).map(|_| None).collect(),
            owners: vec![None; slot_count],
            lru: VecDeque::new(),
        }
    }

    fn free_slot(&self) -> Option<u32> {
        self.owners
            .iter()
            .position(|o| o.is_none())
            .map(|i| i as u32)
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct VirtualTextureManager {
    page_size: u32,
    textures: RwLock<Vec<Arc<VirtualTexture>>>,
    cache: Mutex<VtSlotCache>,
    next_identity: AtomicU32,
}

impl VirtualTextureManager {
    pub fn new(page_size: u32, cache_capacity: usize) -> Self {
        let page_bytes = (page_size as usize * page_size as usize * TEXEL_BYTES).max(1);
        let slot_count = (cache_capacity / page_bytes).max(1);
        Self {
            page_size,
            textures: RwLock::new(Vec::new()),
            cache: Mutex::new(VtSlotCache::new(slot_count, page_bytes)),
            next_identity: AtomicU32::new(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn slot_count(&self) -> usize {
        self.cache.lock().owners.len()
    }

    /// Allocate a new virtual texture and return its identity.
    pub fn create(&self, width: u32, height: u32, format: u32) -> Option<Arc<VirtualTexture>> {
        if width == 0 || height == 0 || width > VT_MAX_DIM || height > VT_MAX_DIM {
            log::warn!("rejecting virtual texture {width}x{height}");
            return None;
        }
        let identity = self.next_identity.fetch_add(1, Ordering::Relaxed);
        let texture = Arc::new(VirtualTexture::new(
            identity,
            width,
            height,
            format,
            self.page_size,
        ));
        self.textures.write().push(Arc::clone(&texture));
        Some(texture)
    }

    pub fn get(&self, identity: u32) -> Option<Arc<VirtualTexture>> {
        self.textures
            .read()
            .iter()
            .find(|t| t.identity == identity)
            .cloned()
    }

    /// Stage a High-priority stream request for one page. Returns `None`
    /// when the coordinates are invalid, the page is already resident, or a
    /// request is already in flight.
    pub(crate) fn request_page(
        self: &Arc<Self>,
        shared: &EngineShared,
        texture: &Arc<VirtualTexture>,
        x: u32,
        y: u32,
        mip: u32,
    ) -> Option<RequestHandle> {
        if mip >= texture.mip_count {
            return None;
        }
        {
            let state = texture.state.lock();
            let grid = &state.mips[mip as usize];
            if x >= grid.pages_x || y >= grid.pages_y {
                return None;
            }
            if grid.page(x, y).map(|p| p.resident).unwrap_or(false) {
                return None;
            }
        }

        let page_id = page_asset_id(texture.identity, x, y);
        if shared.is_inflight(page_id, mip) {
            return None;
        }

        let manager = Arc::clone(self);
        let texture = Arc::clone(texture);
        let frame = shared.current_frame();
        let completion = Box::new(move |bytes: &[u8]| {
            manager.install_page(&texture, x, y, mip, bytes, frame);
        });
        Some(shared.enqueue(page_id, Priority::High, mip, Some(completion)))
    }

    /// Copy decoded page bytes into a cache slot and mark the page resident.
    fn install_page(
        &self,
        texture: &Arc<VirtualTexture>,
        x: u32,
        y: u32,
        mip: u32,
        bytes: &[u8],
        frame: u64,
    ) {
        let Some(slot) = self.acquire_slot(SlotOwner {
            identity: texture.identity,
            x,
            y,
            mip,
        }) else {
            log::warn!(
                "vt {}: no evictable page slot for ({x},{y}) mip {mip}",
                texture.identity
            );
            return;
        };

        {
            let mut cache = self.cache.lock();
            let page_bytes = cache.page_bytes;
            let storage = cache.slots[slot as usize].get_or_insert_with(|| vec![0u8; page_bytes]);
            let n = bytes.len().min(storage.len());
            storage[..n].copy_from_slice(&bytes[..n]);
            storage[n..].fill(0);
        }

        let mut state = texture.state.lock();
        if let Some(page) = state.mips.get_mut(mip as usize).and_then(|g| g.page_mut(x, y)) {
            page.cache_slot = Some(slot);
            page.resident = true;
            page.last_access_frame = frame;
        }
    }

    /// Find a slot: free first, then LRU-evict the oldest unpinned page.
    fn acquire_slot(&self, new_owner: SlotOwner) -> Option<u32> {
        let attempts = self.slot_count();
        for _ in 0..=attempts {
            let candidate = {
                let mut cache = self.cache.lock();
                if let Some(free) = cache.free_slot() {
                    cache.owners[free as usize] = Some(new_owner);
                    cache.lru.push_back(free);
                    return Some(free);
                }
                cache.lru.pop_front().map(|slot| (slot, cache.owners[slot as usize]))
            };

            let Some((slot, owner)) = candidate else {
                return None;
            };
            let Some(owner) = owner else {
                // Slot lost its owner between bookkeeping steps; take it.
                let mut cache = self.cache.lock();
                cache.owners[slot as usize] = Some(new_owner);
                cache.lru.push_back(slot);
                return Some(slot);
            };

            if self.page_pinned(&owner) {
                self.cache.lock().lru.push_back(slot);
                continue;
            }

            self.clear_page(&owner);
            let mut cache = self.cache.lock();
            cache.owners[slot as usize] = Some(new_owner);
            cache.lru.push_back(slot);
            return Some(slot);
        }
        None
    }

    fn page_pinned(&self, owner: &SlotOwner) -> bool {
        self.get(owner.identity)
            .and_then(|t| t.page_info(owner.x, owner.y, owner.mip))
            .map(|p| p.locked || p.ref_count > 0)
            .unwrap_or(false)
    }

    fn clear_page(&self, owner: &SlotOwner) {
        if let Some(texture) = self.get(owner.identity) {
            let mut state = texture.state.lock();
            if let Some(page) = state
                .mips
                .get_mut(owner.mip as usize)
                .and_then(|g| g.page_mut(owner.x, owner.y))
            {
                page.resident = false;
                page.cache_slot = None;
            }
        }
    }

    /// Rewrite the indirection map: each cell publishes the cache slot and
    /// mip of the finest resident page covering it, flagged valid (`0xFF`);
    /// cells with no resident covering page at any mip are zeroed.
    pub fn update_indirection(&self, texture: &VirtualTexture) {
        let mut state = texture.state.lock();
        let VtState { mips, indirection } = &mut *state;
        let page_size = texture.page_size as u64;

        for cy in 0..INDIRECTION_DIM {
            let texel_y = (cy as u64 * texture.height as u64) / INDIRECTION_DIM as u64;
            for cx in 0..INDIRECTION_DIM {
                let texel_x = (cx as u64 * texture.width as u64) / INDIRECTION_DIM as u64;

                // Coarse pages stand in for fine ones that are still
                // streaming, so walk the pyramid fine-to-coarse and take
                // the first resident covering page.
                let mut covering = None;
                for (mip, grid) in mips.iter().enumerate() {
                    let page_x = ((texel_x >> mip) / page_size) as u32;
                    let page_y = ((texel_y >> mip) / page_size) as u32;
                    if let Some(slot) = grid
                        .page(page_x, page_y)
                        .filter(|p| p.resident)
                        .and_then(|p| p.cache_slot)
                    {
                        covering = Some((slot, mip as u8));
                        break;
                    }
                }

                let cell = &mut indirection[(cy * INDIRECTION_DIM + cx) * 4..][..4];
                match covering {
                    Some((slot, mip)) => {
                        cell[0] = (slot & 0xFF) as u8;
                        cell[1] = ((slot >> 8) & 0xFF) as u8;
                        cell[2] = mip;
                        cell[3] = 0xFF;
                    }
                    None => cell.copy_from_slice(&[0, 0, 0, 0]),
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
