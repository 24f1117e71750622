// src/reader.rs
//! Asset file access: path resolution, a pooled file-handle cache, and the
//! LOD block reader.
//!
//! The platform seam is deliberately tiny: [`RandomAccessFile`] is one
//! positional read plus a length query, and [`IoBackend`] turns a path into
//! such a file. The default backend is plain `std::fs`; embedded targets or
//! tests swap in their own.
//!
//! Open files (and their parsed headers) are cached in an LRU of 32 entries;
//! entries idle for 3600 frames are closed from the per-frame maintenance
//! pass.

use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::codec::{self, Compression};
use crate::error::{Result, StreamError};
use crate::format::{AssetHeader, HEADER_SIZE};
use crate::io::IoEngine;

/// Open file handles kept warm.
pub const FILE_CACHE_CAPACITY: usize = 32;
/// Handles unused for this many frames are closed.
pub const FILE_IDLE_FRAMES: u64 = 3600;

// ============================================================================
// Platform seam
// ============================================================================

pub trait RandomAccessFile: Send + Sync + std::fmt::Debug {
    /// Read into `buf` at an absolute offset, returning the bytes read
    /// (zero at end of file). Never moves a shared cursor.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn len(&self) -> io::Result<u64>;
}

impl RandomAccessFile for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::read_at(self, buf, offset)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_read(self, buf, offset)
        }
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// Fill `buf` completely or fail with [`StreamError::ReadTruncated`].
pub fn read_exact_at(file: &dyn RandomAccessFile, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read_at(offset + filled as u64, &mut buf[filled..])?;
        if n == 0 {
            return Err(StreamError::ReadTruncated {
                wanted: buf.len(),
                got: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

pub trait IoBackend: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Arc<dyn RandomAccessFile>>;
}

/// Plain-filesystem backend.
pub struct DiskBackend;

impl IoBackend for DiskBackend {
    fn open(&self, path: &Path) -> io::Result<Arc<dyn RandomAccessFile>> {
        Ok(Arc::new(File::open(path)?))
    }
}

// ============================================================================
// Path resolution
// ============================================================================

pub type PathResolver = Box<dyn Fn(u64) -> PathBuf + Send + Sync>;

/// The stock `{asset_id:016x}.asset` layout under a root directory.
pub fn default_resolver(root: PathBuf) -> PathResolver {
    Box::new(move |id| root.join(format!("{id:016x}.asset")))
}

// ============================================================================
// Reader
// ============================================================================

struct CachedFile {
    file: Arc<dyn RandomAccessFile>,
    header: Arc<AssetHeader>,
    last_used_frame: u64,
}

/// A fully decoded LOD payload plus the header it came from.
#[derive(Debug)]
pub struct LoadedLod {
    pub header: Arc<AssetHeader>,
    /// The LOD actually read (requests past the table clamp).
    pub lod: u32,
    pub bytes: Vec<u8>,
}

pub struct AssetReader {
    backend: Arc<dyn IoBackend>,
    resolver: PathResolver,
    cache: Mutex<LruCache<u64, CachedFile>>,
}

impl AssetReader {
    pub fn new(backend: Arc<dyn IoBackend>, resolver: PathResolver) -> Self {
        let capacity =
            NonZeroUsize::new(FILE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            resolver,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Open (or fetch from cache) the asset's file and parsed header.
    pub fn open(&self, id: u64, frame: u64) -> Result<(Arc<dyn RandomAccessFile>, Arc<AssetHeader>)> {
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get_mut(&id) {
                entry.last_used_frame = frame;
                return Ok((Arc::clone(&entry.file), Arc::clone(&entry.header)));
            }
        }

        // Cache miss: do the open and header read without holding the lock.
        let path = (self.resolver)(id);
        let file = self
            .backend
            .open(&path)
            .map_err(|_| StreamError::NotFound(id))?;

        let mut header_bytes = vec![0u8; HEADER_SIZE];
        read_exact_at(file.as_ref(), 0, &mut header_bytes)?;
        let header = AssetHeader::parse(&header_bytes)?;
        if header.asset_id != id {
            return Err(StreamError::HeaderInvalid(format!(
                "file {} claims id {:#018x}, expected {:#018x}",
                path.display(),
                header.asset_id,
                id
            )));
        }
        let header = Arc::new(header);

        let mut cache = self.cache.lock();
        cache.put(
            id,
            CachedFile {
                file: Arc::clone(&file),
                header: Arc::clone(&header),
                last_used_frame: frame,
            },
        );
        Ok((file, header))
    }

    /// Read and decode one LOD: resolve the file, clamp the LOD, fetch the
    /// stored bytes through the I/O engine, decompress, and verify the
    /// decoded length against the header.
    pub fn read_lod(&self, io: &IoEngine, id: u64, lod: u32, frame: u64) -> Result<LoadedLod> {
        let (file, header) = self.open(id, frame)?;
        let lod = header.clamp_lod(lod);
        let entry = *header.lod(lod as usize).ok_or_else(|| {
            StreamError::HeaderInvalid(format!("lod {lod} missing from table"))
        })?;
        let method = entry
            .compression()
            .ok_or_else(|| StreamError::HeaderInvalid(format!(
                "unknown compression id {}",
                entry.compression
            )))?;

        let data_size = entry.data_size as usize;
        let offset = HEADER_SIZE as u64 + entry.data_offset as u64;
        let mut bytes = vec![0u8; data_size];

        if method == Compression::None {
            let stored = io.read_blocking(file, offset, data_size)?;
            bytes.copy_from_slice(&stored);
        } else {
            let packed = io.read_blocking(file, offset, entry.compressed_size as usize)?;
            let produced = codec::decompress_into(method, &packed, &mut bytes)?;
            if produced != data_size {
                // A malformed block that decodes "successfully" to the
                // wrong length is corruption too; drop the handle so a
                // repaired file gets a fresh open.
                self.evict(id);
                return Err(StreamError::Compression(format!(
                    "lod {lod} decoded to {produced} bytes, expected {data_size}"
                )));
            }
        }

        Ok(LoadedLod { header, lod, bytes })
    }

    /// Drop an asset's cached handle (bad header, replaced file, ...).
    pub fn evict(&self, id: u64) {
        self.cache.lock().pop(&id);
    }

    /// Close handles that have not served a read for [`FILE_IDLE_FRAMES`].
    /// Returns the number of handles closed.
    pub fn close_idle(&self, current_frame: u64) -> usize {
        let mut cache = self.cache.lock();
        let stale: Vec<u64> = cache
            .iter()
            .filter(|(_, entry)| {
                current_frame.saturating_sub(entry.last_used_frame) >= FILE_IDLE_FRAMES
            })
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            cache.pop(id);
        }
        stale.len()
    }

    pub fn cached_handles(&self) -> usize {
        self.cache.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
