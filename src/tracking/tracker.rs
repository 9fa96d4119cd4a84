// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use lapjv::{lapjv, Matrix};

use super::{
    kalman::ConstantVelocityXY, Track, TrackClass, TrackerError, TrackerSettings, MAX_TRACKS,
};

const INVALID_MATCH: f32 = 1000000.0;
const EPSILON: f32 = 0.00001;

/// Pedestrian speed band in m/s.
const PEDESTRIAN_SPEED: (f32, f32) = (0.5, 2.5);

/// Cluster centroid on the ground plane.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    /// Mean radial velocity of the cluster, positive when approaching.
    pub velocity: f32,
}

impl Detection {
    /// Radial velocity as a ground plane vector.
    fn velocity_vector(&self) -> [f32; 2] {
        let r = (self.x * self.x + self.y * self.y).sqrt();
        if r <= EPSILON {
            return [0.0, 0.0];
        }
        [-self.velocity * self.x / r, -self.velocity * self.y / r]
    }
}

#[derive(Debug, Clone)]
pub struct Tracklet {
    pub id: u32,
    pub filter: ConstantVelocityXY<f32>,
    pub age_count: u16,
    pub prediction_count: u16,
    pub static_count: u16,
}

impl Tracklet {
    fn update(&mut self, detection: &Detection) {
        self.age_count = self.age_count.saturating_add(1);
        self.prediction_count = 0;
        self.filter.update(&[detection.x, detection.y]);
    }

    fn speed(&self) -> f32 {
        let [vx, vy] = self.filter.velocity();
        (vx * vx + vy * vy).sqrt()
    }

    fn quality(&self, s: &TrackerSettings) -> f32 {
        let confirmed = (self.age_count as f32 / s.confirm_age.max(1) as f32).min(1.0);
        let coasting = self.prediction_count as f32 / (s.max_predictions as f32 + 1.0);
        (confirmed * (1.0 - coasting)).clamp(0.0, 1.0)
    }

    fn class(&self, s: &TrackerSettings) -> TrackClass {
        if self.age_count < s.confirm_age || self.static_count >= s.confirm_age {
            return TrackClass::Unclassified;
        }

        let speed = self.speed();
        if speed > PEDESTRIAN_SPEED.1 {
            TrackClass::Vehicle
        } else if speed >= PEDESTRIAN_SPEED.0 {
            TrackClass::Pedestrian
        } else {
            TrackClass::Other
        }
    }

    pub fn to_track(&self, s: &TrackerSettings) -> Track {
        let [position_x, position_y] = self.filter.position();
        let [velocity_x, velocity_y] = self.filter.velocity();
        let speed = self.speed();
        let (direction_x, direction_y) = if speed > EPSILON {
            (velocity_x / speed, velocity_y / speed)
        } else {
            (0.0, 0.0)
        };

        Track {
            object_id: self.id,
            age_count: self.age_count,
            prediction_count: self.prediction_count,
            static_count: self.static_count,
            quality: self.quality(s),
            class: self.class(s),
            position_x,
            position_y,
            velocity_x,
            velocity_y,
            direction_x,
            direction_y,
        }
    }
}

/// Associates detections with tracklets from cycle to cycle.
#[derive(Debug, Clone, Default)]
pub struct TrackManager {
    tracklets: Vec<Tracklet>,
    /// Released ids, reused before new ones are minted.
    id_queue: VecDeque<u32>,
    id_max: u32,
}

impl TrackManager {
    pub fn new() -> TrackManager {
        TrackManager::default()
    }

    pub fn tracklets(&self) -> &[Tracklet] {
        &self.tracklets
    }

    pub fn clear(&mut self) {
        self.tracklets.clear();
        self.id_queue.clear();
        self.id_max = 0;
    }

    fn compute_costs(&self, detections: &[Detection], gate: f32) -> Matrix<f32> {
        // costs matrix must be square
        let dims = detections.len().max(self.tracklets.len());
        Matrix::from_shape_fn((dims, dims), |(x, y)| {
            if x < detections.len() && y < self.tracklets.len() {
                let d = &detections[x];
                let distance = self.tracklets[y].filter.distance(&[d.x, d.y]);
                if distance > gate {
                    INVALID_MATCH
                } else {
                    distance
                }
            } else {
                0.0
            }
        })
    }

    /// Runs one cycle: predict, associate, update, retire and spawn.
    pub fn update(
        &mut self,
        s: &TrackerSettings,
        detections: &[Detection],
        dt: f32,
    ) -> Result<(), TrackerError> {
        for track in &mut self.tracklets {
            track.filter.predict(dt);
        }

        let mut matched = vec![false; detections.len()];
        let mut tracked = vec![false; self.tracklets.len()];

        if !self.tracklets.is_empty() && !detections.is_empty() {
            let costs = self.compute_costs(detections, s.gate_distance);
            // The assignment minimizes total distance, pairs beyond the gate
            // carry INVALID_MATCH and are dropped below.
            let ans = lapjv(&costs).map_err(|e| TrackerError::Processing(format!("{:?}", e)))?;
            for (i, &x) in ans.0.iter().enumerate() {
                if i < detections.len() && x < self.tracklets.len() {
                    if costs[(i, x)] >= INVALID_MATCH {
                        continue;
                    }
                    matched[i] = true;
                    tracked[x] = true;
                    self.tracklets[x].update(&detections[i]);
                }
            }
        }

        for (track, _) in self
            .tracklets
            .iter_mut()
            .zip(tracked.iter())
            .filter(|(_, tracked)| !**tracked)
        {
            track.prediction_count = track.prediction_count.saturating_add(1);
        }

        // must iterate from the back
        for i in (0..self.tracklets.len()).rev() {
            if self.tracklets[i].prediction_count > s.max_predictions {
                let track = self.tracklets.swap_remove(i);
                self.id_queue.push_back(track.id);
            }
        }

        for (i, detection) in detections.iter().enumerate() {
            if matched[i] {
                continue;
            }
            if self.tracklets.len() >= MAX_TRACKS {
                break;
            }
            let id = self.get_new_track_id();
            self.tracklets.push(Tracklet {
                id,
                filter: ConstantVelocityXY::new(
                    &[detection.x, detection.y],
                    &detection.velocity_vector(),
                    s.process_noise,
                    s.measurement_noise,
                ),
                age_count: 1,
                prediction_count: 0,
                static_count: 0,
            });
        }

        for track in &mut self.tracklets {
            if track.speed() < s.static_speed {
                track.static_count = track.static_count.saturating_add(1);
            } else {
                track.static_count = 0;
            }
        }

        Ok(())
    }

    fn get_new_track_id(&mut self) -> u32 {
        match self.id_queue.pop_front() {
            Some(id) => id,
            None => {
                self.id_max += 1;
                self.id_max
            }
        }
    }
}
