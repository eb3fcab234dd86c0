//! Shared state between the Tracking, Local Mapping and Loop Closing threads.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::Atlas;
use crate::features::ScalePyramid;

/// Shared state accessible by every thread.
pub struct SharedState {
    /// The Atlas containing the map and the KeyFrame database.
    /// Protected by RwLock: Tracking reads, Local Mapping and Loop Closing write.
    pub atlas: RwLock<Atlas>,

    /// Flow control: when true, Tracking should not create new keyframes.
    /// Set by Local Mapping when the keyframe queue is too long.
    pub stop_keyframe_creation: AtomicBool,

    /// Signal to abort Local BA early when a new keyframe arrives.
    /// Set by Tracking when sending a new keyframe to Local Mapping.
    pub abort_ba: AtomicBool,

    /// Request every background thread to finish and exit.
    pub shutdown_requested: AtomicBool,

    /// Loop Closing asks Local Mapping to stop touching the map.
    pause_requested: AtomicBool,
    /// Local Mapping acknowledges the pause.
    local_mapping_paused: AtomicBool,

    /// KeyFrames sent to Local Mapping and not yet processed.
    keyframes_in_mapping: AtomicUsize,
    /// KeyFrames forwarded to Loop Closing and not yet processed.
    keyframes_in_loop_closing: AtomicUsize,
}

impl SharedState {
    /// Create a new SharedState with an empty Atlas.
    pub fn new(pyramid: ScalePyramid) -> Arc<Self> {
        Arc::new(Self::with_atlas(Atlas::new(pyramid)))
    }

    fn with_atlas(atlas: Atlas) -> Self {
        Self {
            atlas: RwLock::new(atlas),
            stop_keyframe_creation: AtomicBool::new(false),
            abort_ba: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            local_mapping_paused: AtomicBool::new(false),
            keyframes_in_mapping: AtomicUsize::new(0),
            keyframes_in_loop_closing: AtomicUsize::new(0),
        }
    }

    /// Check if keyframe creation should be stopped (flow control).
    pub fn should_stop_keyframe_creation(&self) -> bool {
        self.stop_keyframe_creation.load(Ordering::SeqCst)
    }

    pub fn set_stop_keyframe_creation(&self, value: bool) {
        self.stop_keyframe_creation.store(value, Ordering::SeqCst);
    }

    pub fn should_abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    /// Signal that BA should be aborted (new keyframe arriving).
    pub fn request_abort_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Ask Local Mapping to pause. Also aborts a running local BA.
    pub fn request_pause_local_mapping(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        self.request_abort_ba();
    }

    pub fn release_local_mapping(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn should_pause_local_mapping(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn set_local_mapping_paused(&self, value: bool) {
        self.local_mapping_paused.store(value, Ordering::SeqCst);
    }

    pub fn is_local_mapping_paused(&self) -> bool {
        self.local_mapping_paused.load(Ordering::SeqCst)
    }

    pub fn keyframe_sent_to_mapping(&self) {
        self.keyframes_in_mapping.fetch_add(1, Ordering::SeqCst);
    }

    pub fn keyframe_mapped(&self) {
        let _ = self
            .keyframes_in_mapping
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn keyframes_in_mapping(&self) -> usize {
        self.keyframes_in_mapping.load(Ordering::SeqCst)
    }

    pub fn keyframe_sent_to_loop_closing(&self) {
        self.keyframes_in_loop_closing.fetch_add(1, Ordering::SeqCst);
    }

    pub fn keyframe_loop_checked(&self) {
        let _ = self
            .keyframes_in_loop_closing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// True when no KeyFrame is waiting in or being processed by a background thread.
    pub fn is_mapping_idle(&self) -> bool {
        self.keyframes_in_mapping.load(Ordering::SeqCst) == 0
            && self.keyframes_in_loop_closing.load(Ordering::SeqCst) == 0
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::with_atlas(Atlas::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_request_aborts_ba() {
        let shared = SharedState::default();
        assert!(!shared.should_abort_ba());
        shared.request_pause_local_mapping();
        assert!(shared.should_pause_local_mapping());
        assert!(shared.should_abort_ba());
        shared.release_local_mapping();
        assert!(!shared.should_pause_local_mapping());
    }

    #[test]
    fn test_idle_counters_never_underflow() {
        let shared = SharedState::default();
        assert!(shared.is_mapping_idle());
        shared.keyframe_sent_to_mapping();
        assert!(!shared.is_mapping_idle());
        shared.keyframe_mapped();
        shared.keyframe_mapped();
        assert_eq!(shared.keyframes_in_mapping(), 0);
        shared.keyframe_sent_to_loop_closing();
        assert!(!shared.is_mapping_idle());
        shared.keyframe_loop_checked();
        assert!(shared.is_mapping_idle());
    }
}
