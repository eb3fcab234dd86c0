//! KeyFrame insertion policy.

/// What the tracker knows about the current frame when deciding on a KeyFrame.
#[derive(Debug, Clone, Copy)]
pub struct KeyFrameContext {
    pub frame_id: u64,
    /// Inlier map point matches of the current frame.
    pub tracked: usize,
    /// Map points of the reference KeyFrame seen by enough KeyFrames.
    pub reference_tracked: usize,
    /// Local mapping has no KeyFrame in flight.
    pub mapper_idle: bool,
    /// Local mapping asked to hold KeyFrames (queue too long).
    pub flow_control: bool,
}

/// Criteria for deciding whether to create a new KeyFrame.
///
/// - never more often than every `min_frames` frames
/// - when the frame tracks too few of the reference KeyFrame's points
/// - when `max_frames` have passed and local mapping is idle
#[derive(Debug, Clone)]
pub struct KeyFrameDecision {
    min_frames: u64,
    max_frames: u64,
    min_tracked_ratio: f64,
    /// Fewer tracked points than this and the frame is not worth inserting.
    min_tracked: usize,
    /// Frame id of the last KeyFrame (inserted or from initialization).
    last_kf_frame_id: u64,
    /// Last frame id this decision inserted; guards against double insertion.
    last_inserted_frame_id: Option<u64>,
}

impl KeyFrameDecision {
    pub fn new(min_frames: usize, max_frames: usize, min_tracked_ratio: f64, min_tracked: usize) -> Self {
        Self {
            min_frames: min_frames as u64,
            max_frames: max_frames.max(1) as u64,
            min_tracked_ratio,
            min_tracked,
            last_kf_frame_id: 0,
            last_inserted_frame_id: None,
        }
    }

    pub fn frames_since_keyframe(&self, frame_id: u64) -> u64 {
        frame_id.saturating_sub(self.last_kf_frame_id)
    }

    /// Decide whether the frame described by `ctx` should become a KeyFrame.
    pub fn should_insert(&self, ctx: &KeyFrameContext) -> bool {
        if self.last_inserted_frame_id == Some(ctx.frame_id) {
            return false;
        }
        if ctx.flow_control || ctx.tracked < self.min_tracked {
            return false;
        }
        let since = self.frames_since_keyframe(ctx.frame_id);
        if since < self.min_frames {
            return false;
        }

        let weak_tracking = ctx.reference_tracked > 0
            && (ctx.tracked as f64) < self.min_tracked_ratio * ctx.reference_tracked as f64;
        let stale = ctx.mapper_idle && since >= self.max_frames;
        weak_tracking || stale
    }

    /// Record that `frame_id` was turned into a KeyFrame.
    pub fn record_insertion(&mut self, frame_id: u64) {
        self.last_kf_frame_id = frame_id;
        self.last_inserted_frame_id = Some(frame_id);
    }

    /// Restart counting from `frame_id` (e.g. after initialization or
    /// relocalization) without marking it as inserted.
    pub fn reset(&mut self, frame_id: u64) {
        self.last_kf_frame_id = frame_id;
    }
}

impl Default for KeyFrameDecision {
    fn default() -> Self {
        Self::new(0, 30, 0.9, 15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(frame_id: u64, tracked: usize, reference_tracked: usize, mapper_idle: bool) -> KeyFrameContext {
        KeyFrameContext {
            frame_id,
            tracked,
            reference_tracked,
            mapper_idle,
            flow_control: false,
        }
    }

    #[test]
    fn test_inserts_when_tracking_weakens() {
        let d = KeyFrameDecision::new(0, 30, 0.9, 15);
        assert!(!d.should_insert(&ctx(5, 95, 100, false)));
        assert!(d.should_insert(&ctx(5, 80, 100, false)));
    }

    #[test]
    fn test_inserts_when_stale_and_mapper_idle() {
        let mut d = KeyFrameDecision::new(0, 10, 0.9, 15);
        d.reset(100);
        assert!(!d.should_insert(&ctx(105, 100, 100, true)));
        assert!(!d.should_insert(&ctx(110, 100, 100, false)));
        assert!(d.should_insert(&ctx(110, 100, 100, true)));
    }

    #[test]
    fn test_refusals() {
        let mut d = KeyFrameDecision::new(3, 10, 0.9, 15);
        // Too soon after the last KeyFrame.
        d.reset(10);
        assert!(!d.should_insert(&ctx(12, 20, 100, true)));
        // Too few tracked points.
        assert!(!d.should_insert(&ctx(14, 10, 100, true)));
        // Flow control.
        let mut c = ctx(14, 40, 100, true);
        c.flow_control = true;
        assert!(!d.should_insert(&c));
        c.flow_control = false;
        assert!(d.should_insert(&c));
    }

    #[test]
    fn test_never_inserts_same_frame_twice() {
        let mut d = KeyFrameDecision::new(0, 10, 0.9, 15);
        let c = ctx(20, 50, 100, true);
        assert!(d.should_insert(&c));
        d.record_insertion(20);
        assert!(!d.should_insert(&c));
        assert_eq!(d.frames_since_keyframe(25), 5);
    }
}
