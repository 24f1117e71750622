// src/prefetch.rs
//! Prefetch controller: turns camera motion into priority-tagged requests.
//!
//! Every frame the controller extrapolates a short window of future camera
//! positions (constant-acceleration model), sweeps the configured streaming
//! rings innermost-first against the spatial index, picks a LOD per asset
//! from projected screen size, and stages requests at each ring's priority.
//! Assets already resident at the target quality, or already in flight, are
//! skipped. A final speculative sweep runs at the farthest predicted
//! position so sustained motion warms assets before any ring reaches them.

use std::collections::HashSet;

use glam::Vec3;

use crate::config::StreamingRing;
use crate::format::MAX_LODS;
use crate::request::Priority;
use crate::scheduler::EngineShared;

/// Number of future camera positions projected each update.
pub const PREDICTION_STEPS: usize = 8;
/// Spacing of the projected positions.
pub const PREDICTION_DT: f32 = 1.0 / 60.0;
/// Cap on requests emitted by one speculative (predicted-position) sweep.
const PREDICTIVE_SWEEP_CAP: usize = 64;

// ============================================================================
// LOD selection
// ============================================================================

/// Map projected screen size to a LOD index: 0 at `> 0.5`, then halving
/// thresholds down to the coarsest tier.
pub fn calculate_lod(object_radius: f32, distance: f32, fov: f32) -> u32 {
    if distance <= f32::EPSILON {
        return 0;
    }
    let screen_size = (2.0 * object_radius) / (distance * (fov * 0.5).tan());
    if screen_size > 0.5 {
        0
    } else if screen_size > 0.25 {
        1
    } else if screen_size > 0.125 {
        2
    } else if screen_size > 0.0625 {
        3
    } else {
        (MAX_LODS - 1) as u32
    }
}

// ============================================================================
// Camera prediction
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct CameraState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub predicted: [Vec3; PREDICTION_STEPS],
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            predicted: [Vec3::ZERO; PREDICTION_STEPS],
        }
    }
}

impl CameraState {
    /// Refresh the pose and re-project the prediction window.
    pub fn update(&mut self, position: Vec3, velocity: Vec3) {
        self.position = position;
        self.velocity = velocity;
        for (i, slot) in self.predicted.iter_mut().enumerate() {
            let t = (i + 1) as f32 * PREDICTION_DT;
            *slot = position + velocity * t + 0.5 * self.acceleration * t * t;
        }
    }

    /// Farthest projected position.
    pub fn horizon(&self) -> Vec3 {
        self.predicted[PREDICTION_STEPS - 1]
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct PrefetchController {
    rings: Vec<StreamingRing>,
    camera: CameraState,
    fov: f32,
    /// Query scratch, reused across frames.
    scratch: Vec<u64>,
    /// Ids handled this frame; inner rings win ties with outer ones.
    seen: HashSet<u64>,
}

impl PrefetchController {
    pub fn new(rings: Vec<StreamingRing>, fov: f32) -> Self {
        Self {
            rings,
            camera: CameraState::default(),
            fov,
            scratch: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn camera(&self) -> &CameraState {
        &self.camera
    }

    pub fn set_rings(&mut self, rings: Vec<StreamingRing>) {
        self.rings = rings;
    }

    /// Feed the constant-acceleration predictor.
    pub fn set_motion(&mut self, position: Vec3, velocity: Vec3, acceleration: Vec3) {
        self.camera.acceleration = acceleration;
        self.camera.update(position, velocity);
    }

    /// Per-frame pass. Returns the number of requests staged.
    pub(crate) fn update(
        &mut self,
        shared: &EngineShared,
        position: Vec3,
        velocity: Vec3,
        _dt: f32,
    ) -> usize {
        self.camera.update(position, velocity);
        self.seen.clear();

        let mut emitted = 0;
        for ring_index in 0..self.rings.len() {
            let ring = self.rings[ring_index];
            emitted += self.sweep_once(shared, position, ring.outer_radius, ring.priority, ring.max_assets);
        }

        // Speculative pass at the prediction horizon; only worth it when
        // the camera is actually moving.
        if velocity.length_squared() > f32::EPSILON {
            let horizon = self.camera.horizon();
            emitted += self.sweep_once(
                shared,
                horizon,
                shared.config.prefetch_radius,
                Priority::Prefetch,
                PREDICTIVE_SWEEP_CAP,
            );
        }

        emitted
    }

    /// One-shot radius sweep (also behind the host-facing prefetch API).
    pub(crate) fn sweep(
        &mut self,
        shared: &EngineShared,
        center: Vec3,
        radius: f32,
        priority: Priority,
        max_assets: usize,
    ) -> usize {
        self.seen.clear();
        self.sweep_once(shared, center, radius, priority, max_assets)
    }

    fn sweep_once(
        &mut self,
        shared: &EngineShared,
        center: Vec3,
        radius: f32,
        priority: Priority,
        max_assets: usize,
    ) -> usize {
        self.scratch.clear();
        shared
            .spatial
            .lock()
            .query_radius(center, radius, &mut self.scratch, max_assets);

        let camera_pos = self.camera.position;
        let mut emitted = 0;
        for i in 0..self.scratch.len() {
            let id = self.scratch[i];
            if !self.seen.insert(id) {
                continue;
            }
            let Some((asset_center, asset_radius)) = shared.spatial.lock().sphere(id) else {
                continue;
            };
            let distance = (asset_center - camera_pos).length();
            let lod = calculate_lod(asset_radius, distance, self.fov);

            if shared.table.lock().is_resident(id, lod) {
                continue;
            }
            if shared.is_inflight(id, lod) {
                continue;
            }
            shared.enqueue(id, priority, lod, None);
            emitted += 1;
        }
        emitted
    }
}

// ============================================================================
// Tests
// ============================================================================
