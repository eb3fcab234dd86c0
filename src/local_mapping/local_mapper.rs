//! Local Mapper - the Local Mapping thread.
//!
//! Processes keyframes received from Tracking:
//! 1. Completes the keyframe: BoW, tracked map point associations,
//!    covisibility and spanning tree, keyframe database registration
//! 2. Culls recently created map points that do not hold up
//! 3. Triangulates new map points against covisible keyframes
//! 4. When no other keyframe is waiting: fuses duplicates with the
//!    neighbours and runs local BA
//! 5. Culls redundant keyframes
//! 6. Forwards the keyframe to Loop Closing

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::atlas::Atlas;
use crate::config::LocalMappingSettings;
use crate::geometry::CameraModel;
use crate::optimizer::{apply_ba_results, collect_local_ba_data, cull_ba_outliers, solve_ba, LocalBAConfig, OptimizationError};
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::vocabulary::OrbVocabulary;

use super::search_in_neighbors::{search_in_neighbors, SearchInNeighborsConfig};
use super::triangulation::{triangulate_from_neighbors, TriangulationConfig};

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Observers a recent map point needs once two keyframes have passed.
const RECENT_MIN_OBSERVATIONS: usize = 2;

/// Other observers that make a map point observation redundant.
const REDUNDANT_OBSERVERS: usize = 3;

/// Local Mapping thread state.
pub struct LocalMapper {
    camera: CameraModel,
    settings: LocalMappingSettings,
    vocabulary: Arc<OrbVocabulary>,

    /// Channel sender to Loop Closing thread.
    lc_sender: Option<Sender<KeyFrameId>>,

    /// Map points created by this thread that still have to prove themselves.
    recent_map_points: Vec<MapPointId>,
}

impl LocalMapper {
    pub fn new(
        camera: CameraModel,
        settings: LocalMappingSettings,
        vocabulary: Arc<OrbVocabulary>,
        lc_sender: Option<Sender<KeyFrameId>>,
    ) -> Self {
        Self {
            camera,
            settings,
            vocabulary,
            lc_sender,
            recent_map_points: Vec::new(),
        }
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// This runs until shutdown is requested or the channel is closed.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>, shared: Arc<SharedState>) {
        info!("[LocalMapping] started");
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            // Loop Closing owns the map while it corrects it.
            if shared.should_pause_local_mapping() {
                shared.set_local_mapping_paused(true);
                while shared.should_pause_local_mapping() && !shared.is_shutdown_requested() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                shared.set_local_mapping_paused(false);
                continue;
            }

            shared.set_stop_keyframe_creation(kf_receiver.len() > self.settings.queue_flow_control);

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    let queue_empty = kf_receiver.is_empty();
                    self.process_keyframe(msg, &shared, queue_empty);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Keyframes still queued are dropped; release the tracker's counter.
        while kf_receiver.try_recv().is_ok() {
            shared.keyframe_mapped();
        }
        info!("[LocalMapping] stopped");
    }

    /// Process a single keyframe message.
    pub(crate) fn process_keyframe(&mut self, msg: NewKeyFrameMsg, shared: &SharedState, queue_empty: bool) {
        shared.clear_abort_ba();
        let kf_id = msg.keyframe_id;

        if self.insert_keyframe(&msg, shared) {
            {
                let mut atlas = shared.atlas.write();
                let culled = cull_recent_map_points(
                    &mut atlas.map,
                    &mut self.recent_map_points,
                    kf_id,
                    self.settings.map_point_min_found_ratio,
                );
                if culled > 0 {
                    debug!("[MapCulling] kf={}: removed {} recent map points", kf_id, culled);
                }
            }

            self.create_new_map_points(kf_id, shared);

            if queue_empty && !shared.is_shutdown_requested() {
                self.search_in_neighbors(kf_id, shared);
            }

            if queue_empty && !shared.should_abort_ba() && !shared.is_shutdown_requested() {
                self.local_bundle_adjustment(kf_id, shared);

                let mut atlas = shared.atlas.write();
                let culled = cull_redundant_keyframes(&mut atlas, kf_id, self.settings.kf_redundancy);
                if !culled.is_empty() {
                    info!(
                        "[KFCulling] removed {} redundant keyframes (remaining: {})",
                        culled.len(),
                        atlas.map.num_keyframes()
                    );
                }
            }

            self.forward_to_loop_closing(kf_id, shared);
        }

        shared.keyframe_mapped();
    }

    /// Complete a keyframe created by the tracker. Returns false when the
    /// keyframe is no longer in the map.
    fn insert_keyframe(&mut self, msg: &NewKeyFrameMsg, shared: &SharedState) -> bool {
        let kf_id = msg.keyframe_id;

        let descriptors = {
            let atlas = shared.atlas.read();
            match atlas.map.get_keyframe(kf_id) {
                Some(kf) if kf.is_bad => return false,
                Some(kf) if kf.bow_vector().is_some() => None,
                Some(kf) => Some(kf.descriptors.clone()),
                None => return false,
            }
        };
        // BoW is computed outside the lock.
        let bow = descriptors.map(|d| self.vocabulary.transform(&d, self.vocabulary.default_levels_up()));

        let mut atlas = shared.atlas.write();
        if let (Some((bow, fv)), Some(kf)) = (bow, atlas.map.get_keyframe_mut(kf_id)) {
            kf.set_bow(bow, fv);
        }

        let mut associated = 0;
        for (feature_idx, mp_id) in msg.matched_map_points.iter().enumerate() {
            let Some(mp_id) = (*mp_id).and_then(|id| atlas.map.resolve_map_point(id)) else {
                continue;
            };
            if atlas.map.associate(kf_id, feature_idx, mp_id) {
                associated += 1;
            } else if atlas
                .map
                .get_map_point(mp_id)
                .map_or(false, |mp| mp.observations.get(&kf_id) == Some(&feature_idx))
            {
                // Already attached by the tracker; treat it as a fresh point.
                self.recent_map_points.push(mp_id);
            }
        }
        for mp_id in atlas.map.get_keyframe(kf_id).map(|kf| kf.map_point_ids.clone()).unwrap_or_default().into_iter().flatten() {
            atlas.map.compute_distinctive_descriptor(mp_id);
            atlas.map.update_map_point_normal_and_depth(mp_id);
        }

        atlas.map.update_connections(kf_id);
        atlas.register_keyframe(kf_id);

        debug!(
            "[LocalMapping] kf={}: associated {} tracked points, {} keyframes in map",
            kf_id,
            associated,
            atlas.map.num_keyframes()
        );
        true
    }

    fn create_new_map_points(&mut self, kf_id: KeyFrameId, shared: &SharedState) {
        let config = TriangulationConfig {
            num_neighbors: self.settings.n_neighbors,
            ..Default::default()
        };

        let mut atlas = shared.atlas.write();
        let result = triangulate_from_neighbors(&mut atlas.map, kf_id, &self.camera, &config);
        debug!(
            "[LocalMapping] kf={}: {} pairs, {} matches, {} new points",
            kf_id,
            result.num_pairs_checked,
            result.num_matches_found,
            result.new_points.len()
        );
        self.recent_map_points.extend(result.new_points);
    }

    fn search_in_neighbors(&self, kf_id: KeyFrameId, shared: &SharedState) {
        let config = SearchInNeighborsConfig {
            nn_covisibles: self.settings.n_neighbors,
            ..Default::default()
        };

        let mut atlas = shared.atlas.write();
        let result = search_in_neighbors(&mut atlas.map, kf_id, &self.camera, &config);
        if result.num_fused > 0 || result.num_observations_added > 0 {
            debug!(
                "[SearchInNeighbors] kf={}: fused {} points, added {} observations",
                kf_id, result.num_fused, result.num_observations_added
            );
        }
    }

    /// Local BA in three phases: collect under the read lock, solve with no
    /// lock held, apply under the write lock.
    ///
    /// The solver checks `abort_ba` between iterations and gives up when the
    /// tracker has sent a new keyframe.
    fn local_bundle_adjustment(&self, kf_id: KeyFrameId, shared: &SharedState) {
        let config = LocalBAConfig {
            max_iterations: self.settings.ba_max_iterations,
            max_covisible_keyframes: self.settings.ba_max_covisible,
            ..Default::default()
        };
        let should_stop = || shared.should_abort_ba() || shared.is_shutdown_requested();

        // PHASE 1: COLLECT
        let problem = {
            let atlas = shared.atlas.read();
            match collect_local_ba_data(&atlas.map, kf_id, &config) {
                Some(p) => p,
                None => return,
            }
        };

        // PHASE 2: SOLVE
        let result = match solve_ba(&problem, &self.camera, &config, &should_stop) {
            Ok(r) => r,
            Err(OptimizationError::Aborted) => {
                debug!("[LocalBA] kf={}: aborted", kf_id);
                return;
            }
            Err(e) => {
                warn!("[LocalBA] kf={}: keeping previous estimates: {}", kf_id, e);
                return;
            }
        };

        // PHASE 3: APPLY
        let mut atlas = shared.atlas.write();
        let updated = apply_ba_results(&mut atlas.map, &result);
        let outliers = cull_ba_outliers(&mut atlas.map, &problem, &self.camera, config.chi2_threshold);
        debug!(
            "[LocalBA] kf={} iters={} cost {:.3} -> {:.3} (updated={}, outliers={})",
            kf_id, result.iterations, result.initial_cost, result.final_cost, updated, outliers
        );
    }

    fn forward_to_loop_closing(&self, kf_id: KeyFrameId, shared: &SharedState) {
        let Some(sender) = &self.lc_sender else {
            return;
        };
        shared.keyframe_sent_to_loop_closing();
        if sender.try_send(kf_id).is_err() {
            shared.keyframe_loop_checked();
            debug!("[LocalMapping] loop closing queue full, kf={} not checked", kf_id);
        }
    }
}

/// Drop recent map points that are rarely found when predicted visible, or
/// that gained too few observers two keyframes after their creation. Points
/// older than three keyframes leave the recent list.
pub fn cull_recent_map_points(
    map: &mut Map,
    recent: &mut Vec<MapPointId>,
    current_kf_id: KeyFrameId,
    min_found_ratio: f64,
) -> usize {
    let mut culled = 0;
    let mut to_remove = Vec::new();
    recent.retain(|&mp_id| {
        let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
            return false;
        };
        let age = current_kf_id.0.saturating_sub(mp.first_kf_id.0);
        if mp.found_ratio() < min_found_ratio || (age >= 2 && mp.num_observations() <= RECENT_MIN_OBSERVATIONS) {
            to_remove.push(mp_id);
            false
        } else {
            age < 3
        }
    });
    for mp_id in to_remove {
        map.remove_map_point_full(mp_id);
        culled += 1;
    }
    culled
}

/// Remove covisible keyframes of `current_kf_id` whose map points are
/// mostly seen, at the same or a finer scale, by at least three other
/// keyframes. The first keyframe, the current one and spanning-tree roots
/// are never removed.
pub fn cull_redundant_keyframes(atlas: &mut Atlas, current_kf_id: KeyFrameId, redundancy: f64) -> Vec<KeyFrameId> {
    let initial = atlas.map.initial_keyframe_id();
    let candidates: Vec<KeyFrameId> = match atlas.map.get_keyframe(current_kf_id) {
        Some(kf) => kf.ordered_covisibles().iter().map(|&(id, _)| id).collect(),
        None => return Vec::new(),
    };

    let mut culled = Vec::new();
    for kf_id in candidates {
        if kf_id == current_kf_id || Some(kf_id) == initial {
            continue;
        }
        if is_redundant(&atlas.map, kf_id, redundancy) {
            atlas.remove_keyframe_full(kf_id);
            culled.push(kf_id);
        }
    }
    culled
}

fn is_redundant(map: &Map, kf_id: KeyFrameId, redundancy: f64) -> bool {
    let Some(kf) = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad && !kf.is_root()) else {
        return false;
    };

    let mut total = 0usize;
    let mut redundant = 0usize;
    for (idx, mp_id) in kf.get_map_point_indices() {
        let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        total += 1;
        if mp.num_observations() <= REDUNDANT_OBSERVERS {
            continue;
        }
        let octave = kf.keypoints[idx].octave;
        let observers = mp
            .observations
            .iter()
            .filter(|(&other, _)| other != kf_id)
            .filter(|(&other, &other_idx)| {
                map.get_keyframe(other)
                    .and_then(|o| o.keypoints.get(other_idx))
                    .map_or(false, |kp| kp.octave <= octave + 1)
            })
            .count();
        if observers >= REDUNDANT_OBSERVERS {
            redundant += 1;
        }
    }

    total > 0 && redundant as f64 > redundancy * total as f64
}
