// src/lib.rs
//! # zerohitch
//!
//! An asset streaming engine for worlds whose content does not fit in
//! memory: a fixed-budget pool with defragmentation, an LRU-ordered
//! resident table, an octree spatial index, priority-scheduled worker
//! threads over an async I/O engine, on-the-fly decompression, virtual
//! texturing, and ring-based predictive prefetching, all tuned so a frame
//! never waits on the disk.
//!
//! ## Quick start
//!
//! ```no_run
//! use zerohitch::{Priority, StreamingEngine};
//!
//! let engine = StreamingEngine::builder()
//!     .asset_root("assets/streaming")
//!     .memory_budget(256 * 1024 * 1024)
//!     .build();
//!
//! let handle = engine.request_asset(0x1234, Priority::Critical, 0);
//! // ... each frame:
//! engine.update(glam::Vec3::ZERO, glam::Vec3::ZERO, 1.0 / 60.0);
//! if let Some(bytes) = engine.get_asset_data(0x1234, 0) {
//!     // bytes derefs to &[u8]
//!     let _ = bytes.len();
//! }
//! # let _ = handle;
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod io;
pub mod pool;
pub mod prefetch;
pub mod reader;
pub mod request;
pub mod resident;
mod scheduler;
pub mod spatial;
pub mod stats;
pub mod vtex;

pub use config::{default_rings, StreamingConfig, StreamingRing};
pub use engine::{AssetData, StreamingEngine, StreamingEngineBuilder};
pub use error::{Result, StreamError};
pub use format::{AssetFileBuilder, AssetHeader, HEADER_SIZE, MAX_LODS};
pub use pool::PoolStats;
pub use prefetch::calculate_lod;
pub use request::{CompletionFn, Priority, RequestHandle, RequestStatus};
pub use stats::StatsSnapshot;
