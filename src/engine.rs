// src/engine.rs
//! The streaming engine facade.
//!
//! [`StreamingEngine`] owns every subsystem: the budgeted pool, resident
//! table, spatial index, request queue, worker pool, async I/O thread,
//! virtual-texture manager and prefetch controller. The host drives it with
//! one [`update`](StreamingEngine::update) per frame and queries resident
//! data by asset id and LOD; everything else happens on the engine's own
//! threads.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use glam::Vec3;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::{StreamingConfig, StreamingRing};
use crate::error::Result;
use crate::io::IoEngine;
use crate::pool::{MemoryPool, PoolStats};
use crate::prefetch::PrefetchController;
use crate::reader::{default_resolver, AssetReader, DiskBackend, IoBackend, PathResolver};
use crate::request::{CompletionFn, Priority, RequestHandle, RequestQueue};
use crate::resident::ResidentTable;
use crate::scheduler::{spawn_workers, EngineShared};
use crate::spatial::SpatialIndex;
use crate::stats::{format_bytes, StatsSnapshot, StreamingStats, ALERT_WINDOW_FRAMES};
use crate::vtex::VirtualTextureManager;

/// Cap on requests emitted by one host-driven `prefetch_radius` sweep.
const SWEEP_CAP: usize = 256;

// ============================================================================
// Resident data view
// ============================================================================

/// Zero-copy view of a resident LOD payload. Holds the pool's read lock for
/// its lifetime; drop it before the next engine call that might evict or
/// defragment.
pub struct AssetData<'a> {
    guard: parking_lot::MappedRwLockReadGuard<'a, [u8]>,
}

impl std::ops::Deref for AssetData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl AsRef<[u8]> for AssetData<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.guard
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct StreamingEngine {
    shared: Arc<EngineShared>,
    vt: Arc<VirtualTextureManager>,
    prefetch: Mutex<PrefetchController>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamingEngine {
    /// Bring the engine up with the given configuration.
    pub fn new(config: StreamingConfig) -> Self {
        let resolver = default_resolver(config.asset_root.clone());
        Self::with_parts(config, Arc::new(DiskBackend), resolver)
    }

    /// Defaults with a specific resident budget.
    pub fn with_budget(budget_bytes: usize) -> Self {
        Self::new(StreamingConfig {
            memory_budget: budget_bytes,
            ..Default::default()
        })
    }

    pub fn builder() -> StreamingEngineBuilder {
        StreamingEngineBuilder::new()
    }

    fn with_parts(
        config: StreamingConfig,
        backend: Arc<dyn IoBackend>,
        resolver: PathResolver,
    ) -> Self {
        let config = config.sanitized();
        let shared = Arc::new(EngineShared {
            pool: RwLock::new(MemoryPool::new(config.memory_budget)),
            table: Mutex::new(ResidentTable::new()),
            queue: RequestQueue::new(),
            stats: StreamingStats::new(),
            reader: AssetReader::new(backend, resolver),
            io: IoEngine::spawn(),
            spatial: Mutex::new(SpatialIndex::new(config.world_half_extent)),
            frame: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            inflight: Mutex::new(HashSet::new()),
            config,
        });

        let workers = spawn_workers(&shared, shared.config.worker_threads);
        let prefetch = PrefetchController::new(
            shared.config.streaming_rings.clone(),
            shared.config.fov,
        );
        let vt = Arc::new(VirtualTextureManager::new(
            shared.config.vt_page_size,
            shared.config.vt_cache_capacity,
        ));

        log::info!(
            "streaming engine up: budget {}, {} workers, {} rings",
            format_bytes(shared.config.memory_budget as u64),
            shared.config.worker_threads,
            shared.config.streaming_rings.len()
        );

        Self {
            shared,
            vt,
            prefetch: Mutex::new(prefetch),
            workers: Mutex::new(workers),
        }
    }

    // ------------------------------------------------------------------
    // Frame loop
    // ------------------------------------------------------------------

    /// Advance one frame: refresh the camera predictor, run the streaming
    /// rings, close idle file handles, evaluate operational alerts, and
    /// defragment the pool when it crosses the configured thresholds.
    pub fn update(&self, camera_pos: Vec3, camera_vel: Vec3, dt: f32) {
        if self.shared.is_shutdown() {
            return;
        }
        let frame = self.shared.frame.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.reader.close_idle(frame);
        self.prefetch
            .lock()
            .update(&self.shared, camera_pos, camera_vel, dt);
        if frame % ALERT_WINDOW_FRAMES == 0 {
            self.shared.stats.check_alerts();
        }
        self.maybe_defragment();
    }

    pub fn frame(&self) -> u64 {
        self.shared.current_frame()
    }

    fn maybe_defragment(&self) {
        let (fragmentation, free_tail) = {
            let stats = self.shared.pool.read().stats();
            (stats.fragmentation, stats.free_tail)
        };
        let config = &self.shared.config;
        if fragmentation > config.defrag_fragmentation_trigger
            && free_tail < config.defrag_free_tail_trigger
        {
            let moved = self.defragment();
            log::info!(
                "pool defragmented: {} relocated (fragmentation was {:.0}%)",
                format_bytes(moved as u64),
                fragmentation * 100.0
            );
        }
    }

    /// Compact the pool now. Blocks every pool access for the duration.
    pub fn defragment(&self) -> usize {
        self.shared.pool.write().defragment()
    }

    // ------------------------------------------------------------------
    // Requests and residency
    // ------------------------------------------------------------------

    /// Stage a load for `(id, lod)`; the handle reports progress.
    pub fn request_asset(&self, id: u64, priority: Priority, lod: u32) -> RequestHandle {
        self.shared.enqueue(id, priority, lod, None)
    }

    /// Like [`request_asset`](Self::request_asset), additionally firing
    /// `callback` with the loaded bytes on success. Failed or dropped
    /// requests never invoke it.
    pub fn request_asset_with_callback(
        &self,
        id: u64,
        priority: Priority,
        lod: u32,
        callback: CompletionFn,
    ) -> RequestHandle {
        self.shared.enqueue(id, priority, lod, Some(callback))
    }

    /// Make an asset visible to the prefetch rings.
    pub fn register_asset(&self, id: u64, center: Vec3, radius: f32) {
        self.shared.spatial.lock().insert(id, center, radius);
    }

    /// Resident at the requested quality or better?
    pub fn is_resident(&self, id: u64, lod: u32) -> bool {
        self.shared.table.lock().is_resident(id, lod)
    }

    /// Borrow the resident bytes for `(id, lod)`, touching the LRU. Returns
    /// the requested LOD or a finer one if that is what's loaded.
    pub fn get_asset_data(&self, id: u64, lod: u32) -> Option<AssetData<'_>> {
        let buffer = {
            let mut table = self.shared.table.lock();
            let buffer = table
                .get(id)
                .and_then(|asset| asset.best_buffer_for(lod))
                .map(|(_, buffer)| buffer);
            if buffer.is_some() {
                table.touch(id, self.shared.current_frame());
            }
            buffer
        }?;

        let pool = self.shared.pool.read();
        let guard = RwLockReadGuard::try_map(pool, |p| {
            p.get(buffer.handle).map(|bytes| &bytes[..buffer.len])
        })
        .ok()?;
        Some(AssetData { guard })
    }

    /// Pin an asset against eviction. Balanced by [`unlock_asset`](Self::unlock_asset).
    pub fn lock_asset(&self, id: u64) -> bool {
        self.shared.table.lock().lock(id)
    }

    pub fn unlock_asset(&self, id: u64) -> bool {
        self.shared.table.lock().unlock(id)
    }

    // ------------------------------------------------------------------
    // Prefetch control
    // ------------------------------------------------------------------

    pub fn configure_rings(&self, rings: Vec<StreamingRing>) {
        self.prefetch.lock().set_rings(rings);
    }

    /// One-shot prefetch sweep around an arbitrary point.
    pub fn prefetch_radius(&self, center: Vec3, radius: f32) -> usize {
        self.prefetch
            .lock()
            .sweep(&self.shared, center, radius, Priority::Prefetch, SWEEP_CAP)
    }

    /// Seed the constant-acceleration camera predictor.
    pub fn update_camera_prediction(&self, position: Vec3, velocity: Vec3, acceleration: Vec3) {
        self.prefetch.lock().set_motion(position, velocity, acceleration);
    }

    // ------------------------------------------------------------------
    // Virtual textures
    // ------------------------------------------------------------------

    /// Create a virtual texture; returns its identity.
    pub fn create_virtual_texture(&self, width: u32, height: u32, format: u32) -> Option<u32> {
        self.vt.create(width, height, format).map(|t| t.identity)
    }

    /// Stage a High-priority load for one page.
    pub fn request_vt_page(&self, vt: u32, x: u32, y: u32, mip: u32) -> Option<RequestHandle> {
        let texture = self.vt.get(vt)?;
        self.vt.request_page(&self.shared, &texture, x, y, mip)
    }

    /// Rewrite a texture's indirection map from current page residency.
    pub fn update_vt_indirection(&self, vt: u32) -> bool {
        match self.vt.get(vt) {
            Some(texture) => {
                self.vt.update_indirection(&texture);
                true
            }
            None => false,
        }
    }

    pub fn virtual_textures(&self) -> &Arc<VirtualTextureManager> {
        &self.vt
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// `(used, available, fragmentation)` for the resident pool.
    pub fn get_memory_stats(&self) -> (usize, usize, f32) {
        let stats = self.shared.pool.read().stats();
        (stats.used, stats.available, stats.fragmentation)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.read().stats()
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.shared.pool.read().used())
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    /// Write a textual snapshot of counters, memory, queue depths and
    /// resident assets to `path`.
    pub fn dump_state(&self, path: &Path) -> Result<()> {
        let snapshot = self.get_stats();
        let pool = self.pool_stats();
        let depths = self.shared.queue.depths();
        let summaries = self.shared.table.lock().summaries();

        let mut text = String::new();
        let _ = writeln!(text, "=== streaming state (frame {}) ===", self.frame());
        let _ = writeln!(text, "{snapshot}");
        let _ = writeln!(
            text,
            "pool: {} / {} used, tail {}, {} free blocks ({}), fragmentation {:.1}%",
            format_bytes(pool.used as u64),
            format_bytes(pool.capacity as u64),
            format_bytes(pool.free_tail as u64),
            pool.free_blocks,
            format_bytes(pool.free_list_bytes as u64),
            pool.fragmentation * 100.0,
        );
        let _ = writeln!(
            text,
            "queue depths: critical={} high={} normal={} prefetch={} low={}",
            depths[0], depths[1], depths[2], depths[3], depths[4]
        );
        let _ = writeln!(
            text,
            "file handles: {}",
            self.shared.reader.cached_handles()
        );
        let _ = writeln!(text, "resident assets ({}):", summaries.len());
        for s in &summaries {
            let _ = writeln!(
                text,
                "  {:#018x} type={} lod={} bytes={} refs={} last_frame={}",
                s.id, s.asset_type, s.current_lod, s.total_bytes, s.ref_count, s.last_access_frame
            );
        }

        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn queue_depths(&self) -> [usize; crate::request::PRIORITY_COUNT] {
        self.shared.queue.depths()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop every engine thread. Pending requests are dropped without their
    /// callbacks firing; handles stay `Pending`. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.shared.queue.drain();
        if dropped > 0 {
            log::debug!("shutdown dropped {dropped} pending requests");
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        self.shared.io.shutdown();
        log::info!("streaming engine stopped");
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct StreamingEngineBuilder {
    config: StreamingConfig,
    backend: Option<Arc<dyn IoBackend>>,
    resolver: Option<PathResolver>,
}

impl StreamingEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: StreamingConfig::default(),
            backend: None,
            resolver: None,
        }
    }

    pub fn config(mut self, config: StreamingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.config.memory_budget = bytes;
        self
    }

    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    pub fn asset_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.config.asset_root = root.into();
        self
    }

    pub fn streaming_rings(mut self, rings: Vec<StreamingRing>) -> Self {
        self.config.streaming_rings = rings;
        self
    }

    pub fn vt_page_size(mut self, texels: u32) -> Self {
        self.config.vt_page_size = texels;
        self
    }

    pub fn vt_cache_capacity(mut self, bytes: usize) -> Self {
        self.config.vt_cache_capacity = bytes;
        self
    }

    /// Swap the filesystem for another positional-read backend.
    pub fn io_backend(mut self, backend: Arc<dyn IoBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override how asset ids map to paths.
    pub fn path_resolver(mut self, resolver: PathResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> StreamingEngine {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(DiskBackend) as Arc<dyn IoBackend>);
        let resolver = self
            .resolver
            .unwrap_or_else(|| default_resolver(self.config.asset_root.clone()));
        StreamingEngine::with_parts(self.config, backend, resolver)
    }
}

impl Default for StreamingEngineBuilder {
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
    use crate::codec::Compression;
    use crate::format::AssetFileBuilder;
    use crate::request::RequestStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine_in(dir: &Path, budget: usize) -> StreamingEngine {
        StreamingEngine::builder()
            .asset_root(dir)
            .memory_budget(budget)
            .worker_threads(2)
            .build()
    }

    fn stage(dir: &Path, id: u64, data: Vec<u8>) {
        AssetFileBuilder::new(id)
            .lod(data, Compression::Lz4, 1.0)
            .write_to(&dir.join(format!("{id:016x}.asset")))
            .unwrap();
    }

    #[test]
    fn test_request_load_and_read_back() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 253) as u8).collect();
        stage(dir.path(), 0xA1, data.clone());

        let engine = engine_in(dir.path(), 16 * 1024 * 1024);
        let handle = engine.request_asset(0xA1, Priority::Critical, 0);
        assert_eq!(handle.wait(Duration::from_secs(5)), RequestStatus::Complete);

        assert!(engine.is_resident(0xA1, 0));
        let view = engine.get_asset_data(0xA1, 0).unwrap();
        assert_eq!(&*view, &data[..]);
        drop(view);

        let (used, _, _) = engine.get_memory_stats();
        assert_eq!(used, 4096);
    }

    #[test]
    fn test_request_missing_asset_fails() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(dir.path(), 1024 * 1024);
        let handle = engine.request_asset(0xFF, Priority::Normal, 0);
        assert_eq!(handle.wait(Duration::from_secs(5)), RequestStatus::Failed);
        assert_eq!(engine.get_stats().failed_requests, 1);
    }

    #[test]
    fn test_lock_blocks_eviction_until_unlock() {
        let dir = TempDir::new().unwrap();
        for id in 1..=3u64 {
            stage(dir.path(), id, vec![id as u8; 1024]);
        }
        let engine = engine_in(dir.path(), 2048);

        for id in 1..=2u64 {
            let handle = engine.request_asset(id, Priority::Critical, 0);
            assert_eq!(handle.wait(Duration::from_secs(5)), RequestStatus::Complete);
        }
        assert!(engine.lock_asset(1));

        // Asset 1 is pinned; loading 3 must push out 2 instead.
        let handle = engine.request_asset(3, Priority::Critical, 0);
        assert_eq!(handle.wait(Duration::from_secs(5)), RequestStatus::Complete);
        assert!(engine.is_resident(1, 4));
        assert!(!engine.is_resident(2, 4));
        assert!(engine.unlock_asset(1));
    }

    #[test]
    fn test_update_prefetches_registered_assets() {
        let dir = TempDir::new().unwrap();
        stage(dir.path(), 0x51, vec![3u8; 512]);

        let engine = engine_in(dir.path(), 1024 * 1024);
        engine.register_asset(0x51, Vec3::new(10.0, 0.0, 0.0), 5.0);

        // Camera sits on top of the asset: the innermost ring stages it.
        engine.update(Vec3::ZERO, Vec3::ZERO, 1.0 / 60.0);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !engine.is_resident(0x51, 4) {
            assert!(
                std::time::Instant::now() < deadline,
                "prefetched asset never became resident"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_dump_state_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        stage(dir.path(), 0x61, vec![1u8; 256]);
        let engine = engine_in(dir.path(), 1024 * 1024);
        engine
            .request_asset(0x61, Priority::High, 0)
            .wait(Duration::from_secs(5));

        let dump_path = dir.path().join("state.txt");
        engine.dump_state(&dump_path).unwrap();
        let text = std::fs::read_to_string(&dump_path).unwrap();
        assert!(text.contains("streaming state"));
        assert!(text.contains("0x0000000000000061"));
        assert!(text.contains("queue depths"));
    }

    #[test]
    fn test_shutdown_drops_pending_work() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(dir.path(), 1024 * 1024);
        engine.shutdown();

        // Requests after shutdown come back already failed.
        let handle = engine.request_asset(1, Priority::Critical, 0);
        assert_eq!(handle.status(), RequestStatus::Failed);

        // Second shutdown is a no-op.
        engine.shutdown();
    }

    #[test]
    fn test_vt_page_streams_through_engine() {
        let dir = TempDir::new().unwrap();
        let engine = StreamingEngine::builder()
            .asset_root(dir.path())
            .memory_budget(8 * 1024 * 1024)
            .vt_page_size(64)
            .vt_cache_capacity(4 * 64 * 64 * 4)
            .worker_threads(1)
            .build();

        let vt = engine.create_virtual_texture(256, 256, 0).unwrap();
        // Page (1, 0) of this texture lives under its synthesized id.
        let page_id = crate::vtex::page_asset_id(vt, 1, 0);
        stage(dir.path(), page_id, vec![0x7Fu8; 64 * 64 * 4]);

        let handle = engine.request_vt_page(vt, 1, 0, 0).unwrap();
        assert_eq!(handle.wait(Duration::from_secs(5)), RequestStatus::Complete);

        let texture = engine.virtual_textures().get(vt).unwrap();
        let page = texture.page_info(1, 0, 0).unwrap();
        assert!(page.resident);

        assert!(engine.update_vt_indirection(vt));
        // Duplicate requests for a resident page are refused.
        assert!(engine.request_vt_page(vt, 1, 0, 0).is_none());
    }
}
