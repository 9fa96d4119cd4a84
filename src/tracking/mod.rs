// SPDX-License-Identifier: Apache-2.0

//! Multi-target tracking on top of acquired target lists.
//!
//! [`Tracker`] is the seam the acquisition loop feeds: one call to
//! [`Tracker::execute`] per completed frame, then [`Tracker::track_list`].
//! [`ClusterTracker`] projects targets onto the ground plane, drops those
//! inside ignore zones, groups them with DBSCAN and follows the cluster
//! centroids with constant velocity Kalman filters.

use std::{collections::BTreeMap, fmt};

use dbscan::{Classification, Model};
use tracing::{debug, instrument};

use crate::{acquisition::Cycle, eth::Target};

mod kalman;
mod tracker;
mod zones;

use tracker::{Detection, TrackManager};
pub use zones::{IgnoreZone, MAX_IGNORE_ZONES, MAX_VERTICES};

/// Maximum number of targets processed per cycle.
pub const MAX_TARGETS: usize = 256;

/// Maximum number of concurrently tracked objects.
pub const MAX_TRACKS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerError {
    /// The cycle could not be processed.
    Processing(String),
    /// Working storage for the given number of targets could not be allocated.
    MemoryAllocation(usize),
    /// A parameter is out of range.
    Parameter(String),
    /// A list exceeds its fixed capacity.
    StructSize { expected: usize, actual: usize },
    /// The product code is not supported.
    ProductCode(u32),
}

impl TrackerError {
    /// Numeric result code, 0 being success.
    pub fn code(&self) -> u32 {
        match self {
            TrackerError::Processing(_) => 1,
            TrackerError::MemoryAllocation(_) => 2,
            TrackerError::Parameter(_) => 3,
            TrackerError::StructSize { .. } => 4,
            TrackerError::ProductCode(_) => 5,
        }
    }
}

impl std::error::Error for TrackerError {}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrackerError::Processing(msg) => write!(f, "processing error: {}", msg),
            TrackerError::MemoryAllocation(n) => {
                write!(f, "cannot allocate storage for {} targets", n)
            }
            TrackerError::Parameter(msg) => write!(f, "invalid parameter: {}", msg),
            TrackerError::StructSize { expected, actual } => {
                write!(f, "size {} exceeds capacity {}", actual, expected)
            }
            TrackerError::ProductCode(code) => write!(f, "unsupported product code {}", code),
        }
    }
}

/// Sensor model, selects the tracker defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProductCode {
    ISys5011 = 5011,
    #[default]
    ISys5021 = 5021,
}

impl TryFrom<u32> for ProductCode {
    type Error = TrackerError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            5011 => Ok(ProductCode::ISys5011),
            5021 => Ok(ProductCode::ISys5021),
            _ => Err(TrackerError::ProductCode(value)),
        }
    }
}

impl fmt::Display for ProductCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProductCode::ISys5011 => write!(f, "iSYS-5011"),
            ProductCode::ISys5021 => write!(f, "iSYS-5021"),
        }
    }
}

impl clap::ValueEnum for ProductCode {
    fn value_variants<'a>() -> &'a [Self] {
        &[ProductCode::ISys5011, ProductCode::ISys5021]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::ISys5011 => Some(clap::builder::PossibleValue::new("5011")),
            Self::ISys5021 => Some(clap::builder::PossibleValue::new("5021")),
        }
    }
}

impl ProductCode {
    /// Tuning defaults for the sensor model.
    pub fn settings(&self) -> TrackerSettings {
        match self {
            ProductCode::ISys5011 => TrackerSettings {
                max_range: 50.0,
                cluster_eps: 0.8,
                cluster_min_points: 1,
                gate_distance: 2.0,
                max_predictions: 10,
                confirm_age: 3,
                static_speed: 0.2,
                process_noise: 1.0,
                measurement_noise: 0.04,
            },
            ProductCode::ISys5021 => TrackerSettings {
                max_range: 150.0,
                cluster_eps: 1.5,
                cluster_min_points: 1,
                gate_distance: 4.0,
                max_predictions: 10,
                confirm_age: 3,
                static_speed: 0.3,
                process_noise: 2.0,
                measurement_noise: 0.25,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    /// Targets beyond this slant range in meters are ignored.
    pub max_range: f32,

    /// DBSCAN neighbourhood radius in meters.
    pub cluster_eps: f64,

    /// DBSCAN minimum points per cluster.
    pub cluster_min_points: usize,

    /// Detections further than this from a prediction in meters start a new
    /// track.
    pub gate_distance: f32,

    /// Cycles a track survives without a detection.
    pub max_predictions: u16,

    /// Detections needed before a track is classified.
    pub confirm_age: u16,

    /// Speed in m/s below which a track counts as static.
    pub static_speed: f32,

    pub process_noise: f32,
    pub measurement_noise: f32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        ProductCode::default().settings()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackClass {
    #[default]
    Unclassified = 0,
    Pedestrian = 1,
    Vehicle = 2,
    Other = 3,
}

impl fmt::Display for TrackClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrackClass::Unclassified => write!(f, "unclassified"),
            TrackClass::Pedestrian => write!(f, "pedestrian"),
            TrackClass::Vehicle => write!(f, "vehicle"),
            TrackClass::Other => write!(f, "other"),
        }
    }
}

/// A tracked object in ground plane coordinates, x pointing away from the
/// sensor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Track {
    pub object_id: u32,
    /// Cycles with a matching detection.
    pub age_count: u16,
    /// Consecutive cycles without a matching detection.
    pub prediction_count: u16,
    /// Consecutive cycles below the static speed.
    pub static_count: u16,
    /// Confidence between 0 and 1.
    pub quality: f32,
    pub class: TrackClass,
    pub position_x: f32,
    pub position_y: f32,
    pub velocity_x: f32,
    pub velocity_y: f32,
    pub direction_x: f32,
    pub direction_y: f32,
}

/// A tracking library processing one frame per cycle.
pub trait Tracker {
    /// Processes the targets of one frame.  At most [`MAX_TARGETS`] targets
    /// are accepted.
    fn execute(&mut self, targets: &[Target]) -> Result<(), TrackerError>;

    /// Returns the tracks after the last [`Tracker::execute`].
    fn track_list(&self) -> Result<Vec<Track>, TrackerError>;

    fn reset_tracks(&mut self) -> Result<(), TrackerError>;

    /// Restores the defaults of the sensor model and drops all tracks.
    fn set_default_values(&mut self, product: ProductCode) -> Result<(), TrackerError>;

    /// Mounting height above ground in meters.
    fn set_installation_height(&mut self, height: f32) -> Result<(), TrackerError>;
    fn installation_height(&self) -> f32;

    /// Mounting azimuth offset in degrees.
    fn set_installation_angle(&mut self, angle: f32) -> Result<(), TrackerError>;
    fn installation_angle(&self) -> f32;

    fn set_ignore_zones(&mut self, zones: &[IgnoreZone]) -> Result<(), TrackerError>;
    fn ignore_zones(&self) -> &[IgnoreZone];
}

/// Feeds a completed cycle to the tracker and returns the resulting tracks.
/// Idle and discarded cycles leave the tracker untouched and return `None`.
pub fn execute_cycle<T: Tracker + ?Sized>(
    tracker: &mut T,
    cycle: &Cycle,
) -> Result<Option<Vec<Track>>, TrackerError> {
    let list = match cycle.targets() {
        Some(list) => list,
        None => return Ok(None),
    };

    let targets = list.targets();
    if targets.len() > MAX_TARGETS {
        debug!(
            "frame {} has {} targets, tracking the first {}",
            list.frame_id(),
            targets.len(),
            MAX_TARGETS
        );
    }
    tracker.execute(&targets[..targets.len().min(MAX_TARGETS)])?;
    tracker.track_list().map(Some)
}

/// DBSCAN clustering followed by Kalman tracking of the cluster centroids.
#[derive(Debug, Clone)]
pub struct ClusterTracker {
    cycle_time: f32,
    settings: TrackerSettings,
    installation_height: f32,
    installation_angle: f32,
    zones: Vec<IgnoreZone>,
    tracks: TrackManager,
}

impl ClusterTracker {
    /// Creates a tracker for the given cycle time in seconds with the
    /// iSYS-5021 defaults.
    pub fn new(cycle_time: f32) -> Result<ClusterTracker, TrackerError> {
        if !(cycle_time.is_finite() && cycle_time > 0.0) {
            return Err(TrackerError::Parameter(format!(
                "cycle time {} must be positive",
                cycle_time
            )));
        }

        Ok(ClusterTracker {
            cycle_time,
            settings: TrackerSettings::default(),
            installation_height: 0.0,
            installation_angle: 0.0,
            zones: Vec::new(),
            tracks: TrackManager::new(),
        })
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: TrackerSettings) {
        self.settings = settings;
    }

    /// Ground plane position of a target, `None` when out of range or
    /// ignored.
    fn project(&self, target: &Target) -> Option<[f32; 2]> {
        if !(target.range.is_finite() && target.angle_azimuth.is_finite()) {
            return None;
        }
        if target.range < 0.0 || target.range > self.settings.max_range {
            return None;
        }

        let h = self.installation_height;
        let ground = if target.range <= h {
            0.0
        } else {
            (target.range * target.range - h * h).sqrt()
        };
        let azimuth = (target.angle_azimuth + self.installation_angle).to_radians();
        let (x, y) = (ground * azimuth.cos(), ground * azimuth.sin());

        if self.zones.iter().any(|zone| zone.contains(x, y)) {
            return None;
        }
        Some([x, y])
    }

    fn cluster(&self, points: &[([f32; 2], &Target)]) -> Vec<Detection> {
        if points.is_empty() {
            return Vec::new();
        }

        let dbscantargets: Vec<Vec<f32>> = points.iter().map(|(p, _)| p.to_vec()).collect();
        let dbscan_clusters =
            Model::new(self.settings.cluster_eps, self.settings.cluster_min_points)
                .run(&dbscantargets);

        // BTreeMap keeps detections in cluster order across runs.
        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, cluster) in dbscan_clusters.iter().enumerate() {
            match cluster {
                Classification::Core(id) | Classification::Edge(id) => {
                    clusters.entry(*id).or_default().push(i)
                }
                Classification::Noise => {}
            }
        }

        clusters
            .values()
            .map(|members| {
                let n = members.len() as f32;
                let mut detection = Detection {
                    x: 0.0,
                    y: 0.0,
                    velocity: 0.0,
                };
                for &i in members {
                    let ([x, y], target) = points[i];
                    detection.x += x / n;
                    detection.y += y / n;
                    detection.velocity += target.velocity / n;
                }
                detection
            })
            .collect()
    }
}

impl Tracker for ClusterTracker {
    #[instrument(skip_all, fields(targets = targets.len()), level = "debug")]
    fn execute(&mut self, targets: &[Target]) -> Result<(), TrackerError> {
        if targets.len() > MAX_TARGETS {
            return Err(TrackerError::Parameter(format!(
                "{} targets exceed the limit of {}",
                targets.len(),
                MAX_TARGETS
            )));
        }

        let mut points = Vec::new();
        points
            .try_reserve(targets.len())
            .map_err(|_| TrackerError::MemoryAllocation(targets.len()))?;
        points.extend(
            targets
                .iter()
                .filter_map(|t| self.project(t).map(|p| (p, t))),
        );

        let detections = self.cluster(&points);
        debug!(
            "{} of {} targets in {} clusters",
            points.len(),
            targets.len(),
            detections.len()
        );

        self.tracks
            .update(&self.settings, &detections, self.cycle_time)
    }

    fn track_list(&self) -> Result<Vec<Track>, TrackerError> {
        Ok(self
            .tracks
            .tracklets()
            .iter()
            .map(|t| t.to_track(&self.settings))
            .collect())
    }

    fn reset_tracks(&mut self) -> Result<(), TrackerError> {
        self.tracks.clear();
        Ok(())
    }

    fn set_default_values(&mut self, product: ProductCode) -> Result<(), TrackerError> {
        self.settings = product.settings();
        self.installation_height = 0.0;
        self.installation_angle = 0.0;
        self.tracks.clear();
        Ok(())
    }

    fn set_installation_height(&mut self, height: f32) -> Result<(), TrackerError> {
        if !(height.is_finite() && height >= 0.0) {
            return Err(TrackerError::Parameter(format!(
                "installation height {} must be a non-negative distance",
                height
            )));
        }
        self.installation_height = height;
        Ok(())
    }

    fn installation_height(&self) -> f32 {
        self.installation_height
    }

    fn set_installation_angle(&mut self, angle: f32) -> Result<(), TrackerError> {
        if !(-180.0..=180.0).contains(&angle) {
            return Err(TrackerError::Parameter(format!(
                "installation angle {} outside [-180, 180]",
                angle
            )));
        }
        self.installation_angle = angle;
        Ok(())
    }

    fn installation_angle(&self) -> f32 {
        self.installation_angle
    }

    fn set_ignore_zones(&mut self, zones: &[IgnoreZone]) -> Result<(), TrackerError> {
        if zones.len() > MAX_IGNORE_ZONES {
            return Err(TrackerError::StructSize {
                expected: MAX_IGNORE_ZONES,
                actual: zones.len(),
            });
        }
        self.zones = zones.to_vec();
        Ok(())
    }

    fn ignore_zones(&self) -> &[IgnoreZone] {
        &self.zones
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::TargetList;

    fn target(range: f32, angle_azimuth: f32, velocity: f32) -> Target {
        Target {
            signal_strength: 20.0,
            range,
            velocity,
            angle_azimuth,
            ..Default::default()
        }
    }

    fn frame(targets: Vec<Target>) -> Cycle {
        Cycle::Frame {
            targets: TargetList::truncate(1, targets).target_list().unwrap().clone(),
            full: false,
        }
    }

    /// Records what it was asked to process.
    #[derive(Default)]
    struct Recorder {
        executed: Vec<usize>,
    }

    impl Tracker for Recorder {
        fn execute(&mut self, targets: &[Target]) -> Result<(), TrackerError> {
            self.executed.push(targets.len());
            Ok(())
        }
        fn track_list(&self) -> Result<Vec<Track>, TrackerError> {
            Ok(vec![Track::default(); self.executed.len()])
        }
        fn reset_tracks(&mut self) -> Result<(), TrackerError> {
            Ok(())
        }
        fn set_default_values(&mut self, _: ProductCode) -> Result<(), TrackerError> {
            Ok(())
        }
        fn set_installation_height(&mut self, _: f32) -> Result<(), TrackerError> {
            Ok(())
        }
        fn installation_height(&self) -> f32 {
            0.0
        }
        fn set_installation_angle(&mut self, _: f32) -> Result<(), TrackerError> {
            Ok(())
        }
        fn installation_angle(&self) -> f32 {
            0.0
        }
        fn set_ignore_zones(&mut self, _: &[IgnoreZone]) -> Result<(), TrackerError> {
            Ok(())
        }
        fn ignore_zones(&self) -> &[IgnoreZone] {
            &[]
        }
    }

    #[test]
    fn test_execute_cycle_skips_idle_and_discarded() {
        let mut recorder = Recorder::default();
        assert_eq!(execute_cycle(&mut recorder, &Cycle::Idle), Ok(None));
        assert_eq!(execute_cycle(&mut recorder, &Cycle::Discarded), Ok(None));
        assert!(recorder.executed.is_empty());

        let tracks = execute_cycle(&mut recorder, &frame(vec![Target::default(); 300])).unwrap();
        assert_eq!(tracks.map(|t| t.len()), Some(1));
        assert_eq!(recorder.executed, vec![MAX_TARGETS]);
    }

    #[test]
    fn test_product_code() {
        assert_eq!(ProductCode::try_from(5011), Ok(ProductCode::ISys5011));
        assert_eq!(ProductCode::try_from(5021), Ok(ProductCode::ISys5021));
        let err = ProductCode::try_from(5110).unwrap_err();
        assert_eq!(err, TrackerError::ProductCode(5110));
        assert_eq!(err.code(), 5);
    }

    #[test]
    fn test_parameters() {
        assert!(matches!(
            ClusterTracker::new(0.0),
            Err(TrackerError::Parameter(_))
        ));

        let mut tracker = ClusterTracker::new(0.1).unwrap();
        tracker.set_installation_height(3.0).unwrap();
        tracker.set_installation_angle(-12.5).unwrap();
        assert_eq!(tracker.installation_height(), 3.0);
        assert_eq!(tracker.installation_angle(), -12.5);

        assert_eq!(tracker.set_installation_height(-1.0).unwrap_err().code(), 3);
        assert_eq!(tracker.set_installation_height(f32::NAN).unwrap_err().code(), 3);
        assert_eq!(tracker.set_installation_angle(181.0).unwrap_err().code(), 3);
        assert_eq!(tracker.installation_height(), 3.0);

        let zone = IgnoreZone::new(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]).unwrap();
        let err = tracker
            .set_ignore_zones(&vec![zone; MAX_IGNORE_ZONES + 1])
            .unwrap_err();
        assert_eq!(err.code(), 4);

        let targets = vec![Target::default(); MAX_TARGETS + 1];
        assert_eq!(tracker.execute(&targets).unwrap_err().code(), 3);

        tracker.set_default_values(ProductCode::ISys5011).unwrap();
        assert_eq!(tracker.installation_height(), 0.0);
        assert_eq!(tracker.settings(), &ProductCode::ISys5011.settings());
    }

    #[test]
    fn test_stationary_target() {
        let mut tracker = ClusterTracker::new(0.1).unwrap();
        tracker.set_installation_height(3.0).unwrap();

        // Two reflections of one object, 5 m slant range at 0 degrees.
        for _ in 0..5 {
            tracker
                .execute(&[target(5.0, 0.0, 0.0), target(5.0, 2.0, 0.0)])
                .unwrap();
        }

        let tracks = tracker.track_list().unwrap();
        assert_eq!(tracks.len(), 1);
        let track = tracks[0];
        assert_eq!(track.object_id, 1);
        assert_eq!(track.age_count, 5);
        assert_eq!(track.prediction_count, 0);
        // sqrt(5² - 3²) = 4 m along the ground.
        assert!((track.position_x - 4.0).abs() < 0.05, "{:?}", track);
        assert!(track.position_y.abs() < 0.2, "{:?}", track);
        assert_eq!(track.class, TrackClass::Unclassified);
        assert_eq!(track.static_count, 5);

        tracker.reset_tracks().unwrap();
        assert!(tracker.track_list().unwrap().is_empty());
    }

    #[test]
    fn test_moving_target() {
        let mut tracker = ClusterTracker::new(0.1).unwrap();

        // Walking straight at the sensor with 1.5 m/s.
        for i in 0..30 {
            let range = 20.0 - i as f32 * 0.15;
            tracker.execute(&[target(range, 0.0, 1.5)]).unwrap();
        }

        let tracks = tracker.track_list().unwrap();
        assert_eq!(tracks.len(), 1);
        let track = tracks[0];
        assert!((track.velocity_x + 1.5).abs() < 0.2, "{:?}", track);
        assert!((track.direction_x + 1.0).abs() < 0.05, "{:?}", track);
        assert_eq!(track.class, TrackClass::Pedestrian);
        assert_eq!(track.quality, 1.0);
    }

    #[test]
    fn test_ignore_zone_and_range() {
        let mut tracker = ClusterTracker::new(0.1).unwrap();
        let zone = IgnoreZone::new(&[[8.0, -2.0], [12.0, -2.0], [12.0, 2.0], [8.0, 2.0]]).unwrap();
        tracker.set_ignore_zones(&[zone]).unwrap();
        assert_eq!(tracker.ignore_zones().len(), 1);

        tracker
            .execute(&[
                target(10.0, 0.0, 0.0),
                target(400.0, 0.0, 0.0),
                target(30.0, 0.0, 0.0),
            ])
            .unwrap();

        let tracks = tracker.track_list().unwrap();
        assert_eq!(tracks.len(), 1);
        assert!((tracks[0].position_x - 30.0).abs() < 0.01);
    }
}
