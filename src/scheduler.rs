// src/scheduler.rs
//! Streaming scheduler: shared engine state plus the worker pool.
//!
//! Workers pop the highest-priority staged request and run it to completion
//! on their own stack: resolve the file, pull the stored bytes through the
//! async I/O engine (decompression overlaps other workers' reads), allocate
//! a pool block with a single LRU-eviction retry, and install the result
//! into the resident table. Failures are absorbed here; the host only sees
//! the request handle flip to `Failed`.
//!
//! Lock discipline: the resident-table mutex is taken before the pool lock
//! whenever both are needed, hold times stay short, and neither lock is
//! ever held across disk I/O.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::StreamingConfig;
use crate::error::{Result, StreamError};
use crate::io::IoEngine;
use crate::pool::MemoryPool;
use crate::reader::{AssetReader, LoadedLod};
use crate::request::{
    CompletionFn, Priority, RequestHandle, RequestQueue, RequestStatus, StreamRequest,
};
use crate::resident::{LodBuffer, ResidentTable};
use crate::spatial::SpatialIndex;
use crate::stats::StreamingStats;

/// Idle workers nap this long between queue polls.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct EngineShared {
    pub config: StreamingConfig,
    pub pool: RwLock<MemoryPool>,
    pub table: Mutex<ResidentTable>,
    pub queue: RequestQueue,
    pub stats: StreamingStats,
    pub reader: AssetReader,
    pub io: IoEngine,
    pub spatial: Mutex<SpatialIndex>,
    pub frame: AtomicU64,
    pub shutdown: AtomicBool,
    /// `(asset_id, lod)` pairs staged or being processed; lets the
    /// prefetcher avoid re-requesting work already underway.
    pub inflight: Mutex<HashSet<(u64, u32)>>,
}

impl EngineShared {
    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_inflight(&self, id: u64, lod: u32) -> bool {
        self.inflight.lock().contains(&(id, lod))
    }

    /// Stage a request and hand back its status handle. After shutdown the
    /// handle comes back already `Failed` and nothing is queued.
    pub fn enqueue(
        &self,
        id: u64,
        priority: Priority,
        lod: u32,
        completion: Option<CompletionFn>,
    ) -> RequestHandle {
        let mut request = StreamRequest::new(id, priority, lod, self.current_frame());
        if let Some(completion) = completion {
            request = request.with_completion(completion);
        }
        let handle = request.handle.clone();

        if self.is_shutdown() {
            handle.set_status(RequestStatus::Failed);
            return handle;
        }

        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.inflight.lock().insert((id, lod));
        self.queue.push(request);
        handle
    }
}

// ============================================================================
// Workers
// ============================================================================

pub(crate) fn spawn_workers(shared: &Arc<EngineShared>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let shared = Arc::clone(shared);
            std::thread::Builder::new()
                .name(format!("zh-worker-{i}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn streaming worker")
        })
        .collect()
}

fn worker_loop(shared: Arc<EngineShared>) {
    while !shared.is_shutdown() {
        match shared.queue.pop_next() {
            Some(request) => process_request(&shared, request),
            None => std::thread::sleep(IDLE_SLEEP),
        }
    }
}

pub(crate) fn process_request(shared: &EngineShared, mut request: StreamRequest) {
    request.handle.set_status(RequestStatus::Loading);
    let key = (request.id, request.lod);
    let frame = shared.current_frame();

    // Fast path: already resident at the requested quality or better.
    let hit = {
        let mut table = shared.table.lock();
        let buffer = table
            .get(request.id)
            .and_then(|asset| asset.best_buffer_for(request.lod))
            .map(|(_, buffer)| buffer);
        if buffer.is_some() {
            table.touch(request.id, frame);
        }
        buffer
    };

    if let Some(buffer) = hit {
        shared.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        finish_complete(shared, &mut request, buffer);
        shared.inflight.lock().remove(&key);
        return;
    }
    shared.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

    let start = Instant::now();
    match load_and_install(shared, &request, frame) {
        Ok(loaded) => {
            shared
                .stats
                .record_load_time(start.elapsed().as_micros() as u64);
            shared
                .stats
                .completed_requests
                .fetch_add(1, Ordering::Relaxed);
            shared
                .stats
                .bytes_loaded
                .fetch_add(loaded.bytes.len() as u64, Ordering::Relaxed);
            shared.stats.observe_memory(shared.pool.read().used());

            if let Some(callback) = request.completion.take() {
                callback(&loaded.bytes);
            }
            request.handle.set_status(RequestStatus::Complete);

            queue_dependencies(shared, &loaded, &request);
        }
        Err(err) => {
            log::warn!(
                "stream request {:#018x} lod {} failed: {err}",
                request.id,
                request.lod
            );
            shared.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
            request.handle.set_status(RequestStatus::Failed);
        }
    }
    shared.inflight.lock().remove(&key);
}

/// Fire the callback against the resident bytes and mark the request done.
fn finish_complete(shared: &EngineShared, request: &mut StreamRequest, buffer: LodBuffer) {
    if let Some(callback) = request.completion.take() {
        let pool = shared.pool.read();
        if let Some(block) = pool.get(buffer.handle) {
            callback(&block[..buffer.len]);
        }
    }
    request.handle.set_status(RequestStatus::Complete);
}

/// The load path: read + decode, allocate (with one eviction retry), copy
/// into the pool, and publish in the resident table.
fn load_and_install(shared: &EngineShared, request: &StreamRequest, frame: u64) -> Result<LoadedLod> {
    if shared.is_shutdown() {
        return Err(StreamError::Shutdown);
    }

    let loaded = shared
        .reader
        .read_lod(&shared.io, request.id, request.lod, frame)?;
    let size = loaded.bytes.len();

    let first_try = { shared.pool.write().alloc(size) };
    let handle = match first_try {
        Ok(handle) => handle,
        Err(first_err) => {
            // One retry after making room. With nothing evictable the
            // original failure stands.
            let goal = {
                let pool = shared.pool.read();
                let available = pool.available();
                if available >= size {
                    // Enough bytes exist but no contiguous run; free more.
                    size
                } else {
                    size - available
                }
            };
            let freed = {
                let mut table = shared.table.lock();
                let mut pool = shared.pool.write();
                table.evict_lru(goal, &mut pool)
            };
            shared
                .stats
                .bytes_evicted
                .fetch_add(freed as u64, Ordering::Relaxed);
            if freed == 0 {
                return Err(first_err);
            }
            shared.pool.write().alloc(size)?
        }
    };

    let buffer = LodBuffer { handle, len: size };
    {
        let mut pool = shared.pool.write();
        pool.write(handle, &loaded.bytes);
    }
    {
        let mut table = shared.table.lock();
        let mut pool = shared.pool.write();
        table.install_lod(
            request.id,
            loaded.header.asset_type,
            loaded.lod,
            buffer,
            frame,
            &mut pool,
        );
    }

    Ok(loaded)
}

/// Stage not-yet-resident dependencies at prefetch priority.
fn queue_dependencies(shared: &EngineShared, loaded: &LoadedLod, request: &StreamRequest) {
    for &dep in loaded.header.dependencies() {
        if dep == 0 || dep == request.id {
            continue;
        }
        let resident = shared.table.lock().is_resident(dep, request.lod);
        if resident || shared.is_inflight(dep, request.lod) {
            continue;
        }
        shared.enqueue(dep, Priority::Prefetch, request.lod, None);
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
    use crate::reader::{default_resolver, DiskBackend};
    use tempfile::TempDir;

    fn test_shared(dir: &std::path::Path, budget: usize) -> Arc<EngineShared> {
        let config = StreamingConfig {
            memory_budget: budget,
            asset_root: dir.to_path_buf(),
            ..Default::default()
        };
        Arc::new(EngineShared {
            pool: RwLock::new(MemoryPool::new(config.memory_budget)),
            table: Mutex::new(ResidentTable::new()),
            queue: RequestQueue::new(),
            stats: StreamingStats::new(),
            reader: AssetReader::new(
                Arc::new(DiskBackend),
                default_resolver(dir.to_path_buf()),
            ),
            io: IoEngine::spawn(),
            spatial: Mutex::new(SpatialIndex::new(config.world_half_extent)),
            frame: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            inflight: Mutex::new(HashSet::new()),
            config,
        })
    }

    fn stage(dir: &std::path::Path, id: u64, data: Vec<u8>) {
        AssetFileBuilder::new(id)
            .lod(data, Compression::Lz4, 1.0)
            .write_to(&dir.join(format!("{id:016x}.asset")))
            .unwrap();
    }

    #[test]
    fn test_process_request_installs_asset() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        stage(dir.path(), 0x77, data.clone());

        let shared = test_shared(dir.path(), 16 * 1024 * 1024);
        let handle = shared.enqueue(0x77, Priority::Critical, 0, None);
        let request = shared.queue.pop_next().unwrap();
        process_request(&shared, request);

        assert_eq!(handle.status(), RequestStatus::Complete);
        assert!(shared.table.lock().is_resident(0x77, 0));
        assert_eq!(shared.pool.read().used(), 1024);
        assert_eq!(
            shared.stats.completed_requests.load(Ordering::Relaxed),
            1
        );
        assert!(!shared.is_inflight(0x77, 0));
    }

    #[test]
    fn test_missing_file_fails_request() {
        let dir = TempDir::new().unwrap();
        let shared = test_shared(dir.path(), 1024 * 1024);
        let handle = shared.enqueue(0xBEEF, Priority::Normal, 0, None);
        let request = shared.queue.pop_next().unwrap();
        process_request(&shared, request);

        assert_eq!(handle.status(), RequestStatus::Failed);
        assert_eq!(shared.stats.failed_requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_second_request_hits_cache() {
        let dir = TempDir::new().unwrap();
        stage(dir.path(), 1, vec![5u8; 512]);

        let shared = test_shared(dir.path(), 1024 * 1024);
        for _ in 0..2 {
            shared.enqueue(1, Priority::Normal, 0, None);
            let request = shared.queue.pop_next().unwrap();
            process_request(&shared, request);
        }

        assert_eq!(shared.stats.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(shared.stats.cache_misses.load(Ordering::Relaxed), 1);
        assert_eq!(shared.pool.read().used(), 512);
    }

    #[test]
    fn test_eviction_retry_makes_room() {
        let dir = TempDir::new().unwrap();
        for id in 1..=3u64 {
            stage(dir.path(), id, vec![id as u8; 1024]);
        }

        // Pool fits only two 1 KiB payloads.
        let shared = test_shared(dir.path(), 2048);
        for id in 1..=3u64 {
            shared.enqueue(id, Priority::Normal, 0, None);
            let request = shared.queue.pop_next().unwrap();
            process_request(&shared, request);
        }

        let table = shared.table.lock();
        assert!(!table.is_resident(1, 4), "oldest asset should be evicted");
        assert!(table.is_resident(2, 4));
        assert!(table.is_resident(3, 4));
        drop(table);
        assert_eq!(shared.stats.bytes_evicted.load(Ordering::Relaxed), 1024);
        assert_eq!(shared.stats.failed_requests.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_pinned_assets_survive_pressure() {
        let dir = TempDir::new().unwrap();
        for id in 1..=3u64 {
            stage(dir.path(), id, vec![id as u8; 1024]);
        }

        let shared = test_shared(dir.path(), 2048);
        for id in 1..=2u64 {
            shared.enqueue(id, Priority::Normal, 0, None);
            let request = shared.queue.pop_next().unwrap();
            process_request(&shared, request);
        }
        shared.table.lock().lock(1);
        shared.table.lock().lock(2);

        // Everything evictable is pinned: the third load must fail.
        let handle = shared.enqueue(3, Priority::Normal, 0, None);
        let request = shared.queue.pop_next().unwrap();
        process_request(&shared, request);

        assert_eq!(handle.status(), RequestStatus::Failed);
        assert!(shared.table.lock().is_resident(1, 4));
        assert!(shared.table.lock().is_resident(2, 4));
    }

    #[test]
    fn test_completion_callback_sees_payload() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        stage(dir.path(), 9, data.clone());

        let shared = test_shared(dir.path(), 1024 * 1024);
        let (tx, rx) = crossbeam_channel::bounded(1);
        shared.enqueue(
            9,
            Priority::High,
            0,
            Some(Box::new(move |bytes: &[u8]| {
                let _ = tx.send(bytes.to_vec());
            })),
        );
        let request = shared.queue.pop_next().unwrap();
        process_request(&shared, request);

        assert_eq!(rx.try_recv().unwrap(), data);
    }

    #[test]
    fn test_dependency_prefetch_enqueued() {
        let dir = TempDir::new().unwrap();
        stage(dir.path(), 0x20, vec![1u8; 64]);
        AssetFileBuilder::new(0x10)
            .dependency(0x20)
            .lod(vec![0u8; 64], Compression::None, 1.0)
            .write_to(&dir.path().join(format!("{:016x}.asset", 0x10u64)))
            .unwrap();

        let shared = test_shared(dir.path(), 1024 * 1024);
        shared.enqueue(0x10, Priority::Normal, 0, None);
        let request = shared.queue.pop_next().unwrap();
        process_request(&shared, request);

        // The dependency is now staged at prefetch priority.
        let next = shared.queue.pop_next().unwrap();
        assert_eq!(next.id, 0x20);
        assert_eq!(next.priority, Priority::Prefetch);
    }
}
