// src/format.rs
//! On-disk asset container ("HMAS") parsing and writing.
//!
//! The header is a fixed 412-byte little-endian block: identity and sizing
//! fields, a five-slot LOD table, sixteen dependency slots, a 64-byte
//! NUL-padded name and a trailing checksum. Payload bytes follow the header
//! directly; each LOD's byte range is `[header_end + data_offset,
//! header_end + data_offset + compressed_size)`.
//!
//! The writer is the parser's exact dual and exists for tooling and the test
//! suite; shipping bundles are produced elsewhere.

use std::path::Path;

use xxhash_rust::xxh3::xxh3_64;

use crate::codec::{self, Compression};
use crate::error::{Result, StreamError};

// ============================================================================
// Layout constants
// ============================================================================

/// 'HMAS' in little-endian byte order.
pub const ASSET_MAGIC: u32 = 0x534D_4148;
pub const ASSET_VERSION: u32 = 1;
pub const MAX_LODS: usize = 5;
pub const MAX_DEPENDENCIES: usize = 16;
pub const ASSET_NAME_LEN: usize = 64;

const LOD_ENTRY_SIZE: usize = 32;
const LOD_TABLE_OFFSET: usize = 52;
const DEPENDENCY_COUNT_OFFSET: usize = LOD_TABLE_OFFSET + MAX_LODS * LOD_ENTRY_SIZE; // 212
const DEPENDENCY_TABLE_OFFSET: usize = DEPENDENCY_COUNT_OFFSET + 4; // 216
const NAME_OFFSET: usize = DEPENDENCY_TABLE_OFFSET + MAX_DEPENDENCIES * 8; // 344
const CHECKSUM_OFFSET: usize = NAME_OFFSET + ASSET_NAME_LEN; // 408

/// Total header size; payload starts here.
pub const HEADER_SIZE: usize = CHECKSUM_OFFSET + 4; // 412

// ============================================================================
// Header model
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LodEntry {
    pub data_offset: u32,
    pub data_size: u32,
    pub compressed_size: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    pub screen_size_threshold: f32,
    pub compression: u32,
}

impl LodEntry {
    pub fn compression(&self) -> Option<Compression> {
        Compression::from_u32(self.compression)
    }

    /// Bytes occupied on disk: compressed size, or the raw size for
    /// identity-coded LODs that store zero there.
    pub fn stored_size(&self) -> u32 {
        if self.compressed_size != 0 {
            self.compressed_size
        } else {
            self.data_size
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssetHeader {
    pub version: u32,
    pub asset_id: u64,
    pub asset_type: u32,
    pub flags: u32,
    pub compression: u32,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub lod_count: u32,
    pub lods: [LodEntry; MAX_LODS],
    pub dependency_count: u32,
    pub dependencies: [u64; MAX_DEPENDENCIES],
    pub name: String,
    pub checksum: u32,
}

#[inline]
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[inline]
fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

impl AssetHeader {
    /// Parse and validate a header block. `bytes` must hold at least
    /// [`HEADER_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StreamError::ReadTruncated {
                wanted: HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let magic = read_u32(bytes, 0);
        if magic != ASSET_MAGIC {
            return Err(StreamError::HeaderInvalid(format!(
                "bad magic {magic:#010x}"
            )));
        }
        let version = read_u32(bytes, 4);
        if version != ASSET_VERSION {
            return Err(StreamError::HeaderInvalid(format!(
                "unsupported version {version}"
            )));
        }
        let lod_count = read_u32(bytes, 48);
        if lod_count == 0 || lod_count as usize > MAX_LODS {
            return Err(StreamError::HeaderInvalid(format!(
                "lod count {lod_count} outside 1..={MAX_LODS}"
            )));
        }

        let mut lods = [LodEntry::default(); MAX_LODS];
        for (i, lod) in lods.iter_mut().enumerate() {
            let base = LOD_TABLE_OFFSET + i * LOD_ENTRY_SIZE;
            *lod = LodEntry {
                data_offset: read_u32(bytes, base),
                data_size: read_u32(bytes, base + 4),
                compressed_size: read_u32(bytes, base + 8),
                vertex_count: read_u32(bytes, base + 12),
                index_count: read_u32(bytes, base + 16),
                screen_size_threshold: f32::from_bits(read_u32(bytes, base + 20)),
                compression: read_u32(bytes, base + 24),
            };
        }
        for lod in lods.iter().take(lod_count as usize) {
            if lod.compression().is_none() {
                return Err(StreamError::HeaderInvalid(format!(
                    "unknown compression id {}",
                    lod.compression
                )));
            }
        }

        let dependency_count = read_u32(bytes, DEPENDENCY_COUNT_OFFSET).min(MAX_DEPENDENCIES as u32);
        let mut dependencies = [0u64; MAX_DEPENDENCIES];
        for (i, dep) in dependencies.iter_mut().enumerate() {
            *dep = read_u64(bytes, DEPENDENCY_TABLE_OFFSET + i * 8);
        }

        let name_bytes = &bytes[NAME_OFFSET..NAME_OFFSET + ASSET_NAME_LEN];
        let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(ASSET_NAME_LEN);
        let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();

        Ok(Self {
            version,
            asset_id: read_u64(bytes, 8),
            asset_type: read_u32(bytes, 16),
            flags: read_u32(bytes, 20),
            compression: read_u32(bytes, 24),
            uncompressed_size: read_u64(bytes, 32),
            compressed_size: read_u64(bytes, 40),
            lod_count,
            lods,
            dependency_count,
            dependencies,
            name,
            checksum: read_u32(bytes, CHECKSUM_OFFSET),
        })
    }

    /// Serialize the header into exactly [`HEADER_SIZE`] bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&ASSET_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.asset_id.to_le_bytes());
        out[16..20].copy_from_slice(&self.asset_type.to_le_bytes());
        out[20..24].copy_from_slice(&self.flags.to_le_bytes());
        out[24..28].copy_from_slice(&self.compression.to_le_bytes());
        // 28..32 reserved
        out[32..40].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out[40..48].copy_from_slice(&self.compressed_size.to_le_bytes());
        out[48..52].copy_from_slice(&self.lod_count.to_le_bytes());

        for (i, lod) in self.lods.iter().enumerate() {
            let base = LOD_TABLE_OFFSET + i * LOD_ENTRY_SIZE;
            out[base..base + 4].copy_from_slice(&lod.data_offset.to_le_bytes());
            out[base + 4..base + 8].copy_from_slice(&lod.data_size.to_le_bytes());
            out[base + 8..base + 12].copy_from_slice(&lod.compressed_size.to_le_bytes());
            out[base + 12..base + 16].copy_from_slice(&lod.vertex_count.to_le_bytes());
            out[base + 16..base + 20].copy_from_slice(&lod.index_count.to_le_bytes());
            out[base + 20..base + 24]
                .copy_from_slice(&lod.screen_size_threshold.to_bits().to_le_bytes());
            out[base + 24..base + 28].copy_from_slice(&lod.compression.to_le_bytes());
            // per-LOD reserved word stays zero
        }

        out[DEPENDENCY_COUNT_OFFSET..DEPENDENCY_COUNT_OFFSET + 4]
            .copy_from_slice(&self.dependency_count.to_le_bytes());
        for (i, dep) in self.dependencies.iter().enumerate() {
            let base = DEPENDENCY_TABLE_OFFSET + i * 8;
            out[base..base + 8].copy_from_slice(&dep.to_le_bytes());
        }

        let name_bytes = self.name.as_bytes();
        let copy = name_bytes.len().min(ASSET_NAME_LEN - 1);
        out[NAME_OFFSET..NAME_OFFSET + copy].copy_from_slice(&name_bytes[..copy]);

        out[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    pub fn lod(&self, lod: usize) -> Option<&LodEntry> {
        if lod < self.lod_count as usize {
            Some(&self.lods[lod])
        } else {
            None
        }
    }

    /// Requested LODs past the table clamp to the coarsest available.
    pub fn clamp_lod(&self, lod: u32) -> u32 {
        lod.min(self.lod_count.saturating_sub(1))
    }

    pub fn dependencies(&self) -> &[u64] {
        &self.dependencies[..self.dependency_count as usize]
    }
}

// ============================================================================
// File builder (tooling / tests)
// ============================================================================

/// Assembles a complete `.asset` file from raw LOD payloads, compressing
/// each one and laying out the header tables.
pub struct AssetFileBuilder {
    asset_id: u64,
    asset_type: u32,
    name: String,
    dependencies: Vec<u64>,
    lods: Vec<(Vec<u8>, Compression, f32)>,
}

impl AssetFileBuilder {
    pub fn new(asset_id: u64) -> Self {
        Self {
            asset_id,
            asset_type: 0,
            name: String::new(),
            dependencies: Vec::new(),
            lods: Vec::new(),
        }
    }

    pub fn asset_type(mut self, asset_type: u32) -> Self {
        self.asset_type = asset_type;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dependency(mut self, id: u64) -> Self {
        self.dependencies.push(id);
        self
    }

    /// Append a LOD, highest quality first.
    pub fn lod(mut self, data: Vec<u8>, compression: Compression, screen_size_threshold: f32) -> Self {
        self.lods.push((data, compression, screen_size_threshold));
        self
    }

    /// Produce the header plus payload blob.
    pub fn build(self) -> Result<(AssetHeader, Vec<u8>)> {
        if self.lods.is_empty() || self.lods.len() > MAX_LODS {
            return Err(StreamError::HeaderInvalid(format!(
                "builder needs 1..={MAX_LODS} lods, got {}",
                self.lods.len()
            )));
        }
        if self.dependencies.len() > MAX_DEPENDENCIES {
            return Err(StreamError::HeaderInvalid(format!(
                "builder allows at most {MAX_DEPENDENCIES} dependencies, got {}",
                self.dependencies.len()
            )));
        }

        let mut payload = Vec::new();
        let mut lods = [LodEntry::default(); MAX_LODS];
        let mut uncompressed_total = 0u64;

        for (i, (data, compression, threshold)) in self.lods.iter().enumerate() {
            let packed = codec::compress(*compression, data);
            lods[i] = LodEntry {
                data_offset: payload.len() as u32,
                data_size: data.len() as u32,
                compressed_size: packed.len() as u32,
                vertex_count: 0,
                index_count: 0,
                screen_size_threshold: *threshold,
                compression: *compression as u32,
            };
            uncompressed_total += data.len() as u64;
            payload.extend_from_slice(&packed);
        }

        let mut dependencies = [0u64; MAX_DEPENDENCIES];
        dependencies[..self.dependencies.len()].copy_from_slice(&self.dependencies);

        let header = AssetHeader {
            version: ASSET_VERSION,
            asset_id: self.asset_id,
            asset_type: self.asset_type,
            flags: 0,
            compression: self.lods[0].1 as u32,
            uncompressed_size: uncompressed_total,
            compressed_size: payload.len() as u64,
            lod_count: self.lods.len() as u32,
            lods,
            dependency_count: self.dependencies.len() as u32,
            dependencies,
            name: self.name,
            checksum: xxh3_64(&payload) as u32,
        };
        Ok((header, payload))
    }

    /// Build and write the file in one go.
    pub fn write_to(self, path: &Path) -> Result<()> {
        let (header, payload) = self.build()?;
        write_asset_file(path, &header, &payload)
    }
}

pub fn write_asset_file(path: &Path, header: &AssetHeader, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut bytes = header.to_bytes();
    bytes.extend_from_slice(payload);
    std::fs::write(path, bytes)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
