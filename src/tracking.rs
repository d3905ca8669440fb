//! Per-camera track continuity and directional counting.
//!
//! The registry is owned by exactly one camera worker; nothing here is shared
//! across threads.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::Serialize;

use crate::counting::{CountingLine, Direction};

pub const DEFAULT_TRAIL_DURATION_SECS: f64 = 5.0;
pub const DEFAULT_MAX_TRAIL_POINTS: usize = 30;
pub const DEFAULT_MAX_TRACKS: usize = 20;

pub type TrackId = i64;

/// Bounds applied to trails and to the live track set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackingLimits {
    /// Points older than this (relative to the newest observation) are dropped.
    pub trail_duration_secs: f64,
    pub max_trail_points: usize,
    pub max_tracks: usize,
}

impl Default for TrackingLimits {
    fn default() -> Self {
        Self {
            trail_duration_secs: DEFAULT_TRAIL_DURATION_SECS,
            max_trail_points: DEFAULT_MAX_TRAIL_POINTS,
            max_tracks: DEFAULT_MAX_TRACKS,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackPoint {
    pub x: f32,
    pub y: f32,
    /// Arrival time of the source frame, in seconds.
    pub timestamp: f64,
    pub label: String,
}

#[derive(Clone, Debug, Default)]
pub struct Track {
    points: VecDeque<TrackPoint>,
}

impl Track {
    pub fn points(&self) -> impl Iterator<Item = &TrackPoint> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&TrackPoint> {
        self.points.back()
    }

    fn last_timestamp(&self) -> f64 {
        self.points.back().map(|p| p.timestamp).unwrap_or(f64::MIN)
    }
}

/// A counted crossing, reported at most once per track and direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CrossingEvent {
    #[serde(rename = "id")]
    pub track_id: TrackId,
    pub direction: Direction,
}

/// Running per-camera totals. Never decremented.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total_up: u64,
    pub total_down: u64,
    pub by_type_up: BTreeMap<String, u64>,
    pub by_type_down: BTreeMap<String, u64>,
}

impl Counters {
    /// Counters with every known label present at zero.
    pub fn seeded<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut counters = Self::default();
        for label in labels {
            counters.by_type_up.insert(label.to_string(), 0);
            counters.by_type_down.insert(label.to_string(), 0);
        }
        counters
    }

    fn record(&mut self, direction: Direction, label: &str) {
        match direction {
            Direction::Down => {
                self.total_down += 1;
                *self.by_type_down.entry(label.to_string()).or_insert(0) += 1;
            }
            Direction::Up => {
                self.total_up += 1;
                *self.by_type_up.entry(label.to_string()).or_insert(0) += 1;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PositionSample {
    pub x: f32,
    pub y: f32,
    pub time: f64,
}

/// Serializable view of one live track trail.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub positions: Vec<PositionSample>,
    #[serde(rename = "class")]
    pub label: String,
}

pub struct TrackRegistry {
    line: CountingLine,
    limits: TrackingLimits,
    tracks: BTreeMap<TrackId, Track>,
    ledger: HashSet<(TrackId, Direction)>,
    counters: Counters,
    newest_timestamp: Option<f64>,
}

impl TrackRegistry {
    pub fn new<'a>(
        line: CountingLine,
        limits: TrackingLimits,
        labels: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            line,
            limits,
            tracks: BTreeMap::new(),
            ledger: HashSet::new(),
            counters: Counters::seeded(labels),
            newest_timestamp: None,
        }
    }

    pub fn line(&self) -> &CountingLine {
        &self.line
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Whether `(id, direction)` has already been counted.
    pub fn is_counted(&self, id: TrackId, direction: Direction) -> bool {
        self.ledger.contains(&(id, direction))
    }

    /// Append an observation and report a newly counted crossing, if any.
    ///
    /// A late observation is clamped to the track's newest timestamp so trails
    /// stay ordered in time.
    pub fn update(
        &mut self,
        id: TrackId,
        position: (f32, f32),
        timestamp: f64,
        label: &str,
    ) -> Option<CrossingEvent> {
        let track = self.tracks.entry(id).or_default();
        let timestamp = match track.last() {
            Some(prev) if timestamp < prev.timestamp => {
                log::debug!(
                    "track {} observation at {:.3} older than {:.3}, clamping",
                    id,
                    timestamp,
                    prev.timestamp
                );
                prev.timestamp
            }
            _ => timestamp,
        };

        let direction = track
            .last()
            .and_then(|prev| self.line.crossing(prev.y, position.1));

        track.points.push_back(TrackPoint {
            x: position.0,
            y: position.1,
            timestamp,
            label: label.to_string(),
        });
        self.newest_timestamp = Some(match self.newest_timestamp {
            Some(newest) => newest.max(timestamp),
            None => timestamp,
        });

        let direction = direction?;
        if !self.ledger.insert((id, direction)) {
            return None;
        }
        self.counters.record(direction, label);
        Some(CrossingEvent {
            track_id: id,
            direction,
        })
    }

    /// Age out trail points, cap trail length, drop empty tracks and enforce
    /// the live-track cap. Running it again without new points changes nothing.
    pub fn prune(&mut self) {
        let Some(reference) = self.newest_timestamp else {
            return;
        };
        let limits = self.limits;

        for track in self.tracks.values_mut() {
            track
                .points
                .retain(|p| reference - p.timestamp <= limits.trail_duration_secs);
            while track.points.len() > limits.max_trail_points {
                track.points.pop_front();
            }
        }
        self.tracks.retain(|_, track| !track.is_empty());

        if self.tracks.len() > limits.max_tracks {
            let mut ranked: Vec<(TrackId, f64)> = self
                .tracks
                .iter()
                .map(|(id, track)| (*id, track.last_timestamp()))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));
            for (id, _) in ranked.into_iter().skip(limits.max_tracks) {
                self.tracks.remove(&id);
            }
        }
    }

    /// Live trails, ordered by track id.
    pub fn snapshot_tracks(&self) -> Vec<TrackSnapshot> {
        self.tracks
            .iter()
            .filter_map(|(id, track)| {
                let last = track.last()?;
                Some(TrackSnapshot {
                    id: *id,
                    positions: track
                        .points()
                        .map(|p| PositionSample {
                            x: p.x,
                            y: p.y,
                            time: p.timestamp,
                        })
                        .collect(),
                    label: last.label.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TrackRegistry {
        let line = CountingLine {
            y: 50.0,
            x_start: 0.0,
            x_end: 100.0,
        };
        TrackRegistry::new(line, TrackingLimits::default(), ["car", "truck"])
    }

    #[test]
    fn first_point_never_crosses() {
        let mut reg = registry();
        assert_eq!(reg.update(1, (10.0, 80.0), 0.0, "car"), None);
        assert_eq!(reg.counters().total_down + reg.counters().total_up, 0);
    }

    #[test]
    fn down_then_up_counted_once_each() {
        let mut reg = registry();
        let mut events = Vec::new();
        for (i, y) in [40.0, 48.0, 52.0, 60.0].iter().enumerate() {
            events.extend(reg.update(7, (10.0, *y), i as f64 * 0.1, "car"));
        }
        assert_eq!(
            events,
            vec![CrossingEvent {
                track_id: 7,
                direction: Direction::Down
            }]
        );
        assert_eq!(reg.counters().total_down, 1);
        assert_eq!(reg.counters().by_type_down["car"], 1);

        let mut events = Vec::new();
        for (i, y) in [58.0, 52.0, 45.0].iter().enumerate() {
            events.extend(reg.update(7, (10.0, *y), 1.0 + i as f64 * 0.1, "car"));
        }
        assert_eq!(
            events,
            vec![CrossingEvent {
                track_id: 7,
                direction: Direction::Up
            }]
        );
        assert_eq!(reg.counters().total_up, 1);
        assert_eq!(reg.counters().by_type_up["car"], 1);
    }

    #[test]
    fn repeated_crossings_do_not_recount() {
        let mut reg = registry();
        let mut t = 0.0;
        let mut crossings = 0;
        for _ in 0..5 {
            for y in [40.0, 60.0] {
                if reg.update(3, (0.0, y), t, "truck").is_some() {
                    crossings += 1;
                }
                t += 0.1;
            }
        }
        assert_eq!(crossings, 2);
        assert!(reg.is_counted(3, Direction::Down));
        assert!(reg.is_counted(3, Direction::Up));
        assert_eq!(reg.counters().total_down, 1);
        assert_eq!(reg.counters().total_up, 1);
    }

    #[test]
    fn unknown_label_is_added_to_counters() {
        let mut reg = registry();
        reg.update(1, (0.0, 40.0), 0.0, "bus");
        reg.update(1, (0.0, 60.0), 0.1, "bus");
        assert_eq!(reg.counters().by_type_down["bus"], 1);
        assert_eq!(reg.counters().by_type_down["car"], 0);
    }

    #[test]
    fn late_observation_is_clamped() {
        let mut reg = registry();
        reg.update(1, (0.0, 10.0), 5.0, "car");
        reg.update(1, (0.0, 12.0), 4.0, "car");
        let times: Vec<f64> = reg.track(1).unwrap().points().map(|p| p.timestamp).collect();
        assert_eq!(times, vec![5.0, 5.0]);
    }

    #[test]
    fn prune_drops_old_points_and_stale_tracks() {
        let mut reg = registry();
        reg.update(1, (0.0, 10.0), 0.0, "car");
        reg.update(1, (0.0, 11.0), 4.0, "car");
        reg.update(2, (0.0, 20.0), 9.0, "car");
        reg.prune();
        // reference = 9.0: track 1's newest point is 5s old, its first 9s old
        let t1: Vec<f64> = reg.track(1).unwrap().points().map(|p| p.timestamp).collect();
        assert_eq!(t1, vec![4.0]);

        reg.update(2, (0.0, 21.0), 10.0, "car");
        reg.prune();
        assert!(reg.track(1).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn prune_caps_trail_length() {
        let mut reg = registry();
        for i in 0..50 {
            reg.update(1, (0.0, i as f32), i as f64 * 0.01, "car");
        }
        reg.prune();
        let track = reg.track(1).unwrap();
        assert_eq!(track.len(), DEFAULT_MAX_TRAIL_POINTS);
        assert_eq!(track.last().unwrap().y, 49.0);
    }

    #[test]
    fn prune_is_idempotent() {
        let mut reg = registry();
        for id in 0..30 {
            for step in 0..40 {
                reg.update(id, (0.0, step as f32), id as f64 * 0.2 + step as f64 * 0.05, "car");
            }
        }
        reg.prune();
        let once = reg.snapshot_tracks();
        reg.prune();
        assert_eq!(reg.snapshot_tracks(), once);
    }

    #[test]
    fn retention_keeps_most_recent_tracks() {
        let mut reg = registry();
        for id in 0..25 {
            reg.update(id, (0.0, 10.0), 100.0 + id as f64 * 0.01, "car");
        }
        reg.update(0, (0.0, 60.0), 101.0, "car");
        reg.prune();
        assert_eq!(reg.len(), DEFAULT_MAX_TRACKS);
        assert!(reg.track(0).is_some());
        for evicted in 1..6 {
            assert!(reg.track(evicted).is_none(), "track {evicted} should be evicted");
        }
        // counters survive eviction
        assert_eq!(reg.counters().total_down, 1);
    }

    #[test]
    fn snapshot_uses_latest_label() {
        let mut reg = registry();
        reg.update(4, (1.0, 2.0), 0.0, "car");
        reg.update(4, (3.0, 4.0), 0.5, "truck");
        let snap = reg.snapshot_tracks();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].label, "truck");
        assert_eq!(snap[0].positions.len(), 2);
        assert_eq!(snap[0].positions[1].time, 0.5);
    }
}
