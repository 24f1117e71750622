// src/config.rs
//! Streaming engine configuration.
//!
//! Every tuning knob the engine reads lives here so a host can construct the
//! whole thing from a single struct (or a JSON tuning file shipped next to
//! the asset bundles). Defaults target a ~2 GiB resident budget.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::request::Priority;

// ---------- Constants ----------

pub const DEFAULT_MEMORY_BUDGET: usize = 2 * 1024 * 1024 * 1024; // 2 GiB
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_PREFETCH_RADIUS: f32 = 500.0;
pub const DEFAULT_VT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_VT_CACHE_CAPACITY: usize = 1024 * 1024 * 1024; // 1 GiB
pub const DEFAULT_DEFRAG_FRAGMENTATION_TRIGGER: f32 = 0.30;
pub const DEFAULT_DEFRAG_FREE_TAIL_TRIGGER: usize = 256 * 1024 * 1024; // 256 MiB

/// A concentric shell around the camera with its own request priority and a
/// cap on how many assets it may touch per frame. Rings are ordered from
/// innermost to outermost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamingRing {
    pub inner_radius: f32,
    pub outer_radius: f32,
    pub priority: Priority,
    pub max_assets: usize,
}

/// The default four-ring layout: everything within 50 m is load-or-die,
/// the outermost shell is speculative.
pub fn default_rings() -> Vec<StreamingRing> {
    vec![
        StreamingRing {
            inner_radius: 0.0,
            outer_radius: 50.0,
            priority: Priority::Critical,
            max_assets: 32,
        },
        StreamingRing {
            inner_radius: 50.0,
            outer_radius: 150.0,
            priority: Priority::High,
            max_assets: 64,
        },
        StreamingRing {
            inner_radius: 150.0,
            outer_radius: 300.0,
            priority: Priority::Normal,
            max_assets: 128,
        },
        StreamingRing {
            inner_radius: 300.0,
            outer_radius: 500.0,
            priority: Priority::Prefetch,
            max_assets: 256,
        },
    ]
}

// ---------- Config ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    /// Resident-asset budget in bytes; the memory pool arena is exactly this big.
    pub memory_budget: usize,
    /// Number of streaming worker threads.
    pub worker_threads: usize,
    /// Radius used by one-shot prefetch sweeps and predictive queries.
    pub prefetch_radius: f32,
    /// Ordered innermost-to-outermost streaming rings.
    pub streaming_rings: Vec<StreamingRing>,
    /// Virtual-texture page edge length in texels.
    pub vt_page_size: u32,
    /// Separate budget for the virtual-texture page cache.
    pub vt_cache_capacity: usize,
    /// Defragment when `fragmentation > trigger` ...
    pub defrag_fragmentation_trigger: f32,
    /// ... and the unallocated tail has shrunk below this many bytes.
    pub defrag_free_tail_trigger: usize,
    /// Root directory resolved against `{asset_id:016x}.asset`.
    pub asset_root: PathBuf,
    /// Half-extent of the spatial index's world cube, in world units.
    pub world_half_extent: f32,
    /// Vertical field of view (radians) used for screen-size LOD selection.
    pub fov: f32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            memory_budget: DEFAULT_MEMORY_BUDGET,
            worker_threads: DEFAULT_WORKER_THREADS,
            prefetch_radius: DEFAULT_PREFETCH_RADIUS,
            streaming_rings: default_rings(),
            vt_page_size: DEFAULT_VT_PAGE_SIZE,
            vt_cache_capacity: DEFAULT_VT_CACHE_CAPACITY,
            defrag_fragmentation_trigger: DEFAULT_DEFRAG_FRAGMENTATION_TRIGGER,
            defrag_free_tail_trigger: DEFAULT_DEFRAG_FREE_TAIL_TRIGGER,
            asset_root: PathBuf::from("assets/streaming"),
            world_half_extent: 10_000.0,
            fov: std::f32::consts::FRAC_PI_2,
        }
    }
}

impl StreamingConfig {
    /// Parse a JSON tuning blob. Unknown fields are rejected so typos in a
    /// shipped tuning file fail loudly instead of silently using defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| StreamError::HeaderInvalid(format!("config parse: {e}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Clamp obviously broken values instead of erroring; a zero-thread
    /// engine can never make progress.
    pub fn sanitized(mut self) -> Self {
        self.worker_threads = self.worker_threads.max(1);
        self.memory_budget = self.memory_budget.max(crate::pool::POOL_ALIGNMENT);
        self.vt_page_size = self.vt_page_size.max(16);
        if self.streaming_rings.is_empty() {
            self.streaming_rings = default_rings();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let cfg = StreamingConfig::default();
        assert_eq!(cfg.memory_budget, 2 * 1024 * 1024 * 1024);
        assert_eq!(cfg.worker_threads, 4);
        assert_eq!(cfg.streaming_rings.len(), 4);
        assert_eq!(cfg.streaming_rings[0].priority, Priority::Critical);
        assert!(cfg.streaming_rings[3].outer_radius > cfg.streaming_rings[0].outer_radius);
    }

    #[test]
    fn test_rings_ordered_inner_to_outer() {
        let rings = default_rings();
        for pair in rings.windows(2) {
            assert!(pair[0].outer_radius <= pair[1].inner_radius + f32::EPSILON);
        }
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = StreamingConfig {
            memory_budget: 256 * 1024 * 1024,
            worker_threads: 2,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed = StreamingConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.memory_budget, 256 * 1024 * 1024);
        assert_eq!(parsed.worker_threads, 2);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed = StreamingConfig::from_json_str(r#"{"worker_threads": 8}"#).unwrap();
        assert_eq!(parsed.worker_threads, 8);
        assert_eq!(parsed.memory_budget, DEFAULT_MEMORY_BUDGET);
    }

    #[test]
    fn test_sanitized_fixes_zeroes() {
        let cfg = StreamingConfig {
            worker_threads: 0,
            memory_budget: 0,
            streaming_rings: Vec::new(),
            ..Default::default()
        };
        let cfg = cfg.sanitized();
        assert_eq!(cfg.worker_threads, 1);
        assert!(cfg.memory_budget > 0);
        assert!(!cfg.streaming_rings.is_empty());
    }
}
