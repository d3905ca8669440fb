//! Counting-line geometry.
//!
//! A counting line is a horizontal segment across the frame. A track crosses
//! it when two consecutive observations fall on different sides.

use serde::{Serialize, Serializer};

/// Default relative vertical position of the counting line.
pub const DEFAULT_LINE_POSITION: f32 = 0.5;

/// Direction of a line crossing in image coordinates (y grows downward).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Down,
    Up,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Up => "up",
        }
    }

    /// Signed form used on the wire: `1` for down, `-1` for up.
    pub fn signum(&self) -> i8 {
        match self {
            Self::Down => 1,
            Self::Up => -1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Direction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.signum())
    }
}

/// Crossing direction between two consecutive y positions.
///
/// `Down` when `prev_y <= line_y < curr_y`, `Up` when `prev_y >= line_y > curr_y`.
/// Touching the line without passing it is not a crossing.
pub fn crossing(prev_y: f32, curr_y: f32, line_y: f32) -> Option<Direction> {
    if prev_y <= line_y && curr_y > line_y {
        Some(Direction::Down)
    } else if prev_y >= line_y && curr_y < line_y {
        Some(Direction::Up)
    } else {
        None
    }
}

/// Counting line in pixel coordinates, fixed for a camera once derived.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CountingLine {
    pub y: f32,
    pub x_start: f32,
    pub x_end: f32,
}

impl CountingLine {
    /// Derive the line from the first frame of a camera.
    ///
    /// `position` is relative to the frame height; the pixel row is truncated.
    pub fn from_frame(width: u32, height: u32, position: f32) -> Self {
        Self {
            y: (height as f32 * position).floor(),
            x_start: 0.0,
            x_end: width as f32,
        }
    }

    pub fn crossing(&self, prev_y: f32, curr_y: f32) -> Option<Direction> {
        crossing(prev_y, curr_y, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downward_crossing_includes_start_on_line() {
        assert_eq!(crossing(40.0, 60.0, 50.0), Some(Direction::Down));
        assert_eq!(crossing(50.0, 51.0, 50.0), Some(Direction::Down));
    }

    #[test]
    fn upward_crossing_includes_start_on_line() {
        assert_eq!(crossing(60.0, 40.0, 50.0), Some(Direction::Up));
        assert_eq!(crossing(50.0, 49.0, 50.0), Some(Direction::Up));
    }

    #[test]
    fn landing_on_line_is_not_a_crossing() {
        assert_eq!(crossing(40.0, 50.0, 50.0), None);
        assert_eq!(crossing(60.0, 50.0, 50.0), None);
        assert_eq!(crossing(50.0, 50.0, 50.0), None);
    }

    #[test]
    fn same_side_movement_is_not_a_crossing() {
        assert_eq!(crossing(10.0, 45.0, 50.0), None);
        assert_eq!(crossing(70.0, 55.0, 50.0), None);
    }

    #[test]
    fn crossing_matches_definition_over_grid() {
        let values = [0.0f32, 24.5, 25.0, 25.5, 49.0, 50.0, 51.0, 100.0];
        for &line in &[25.0f32, 50.0] {
            for &prev in &values {
                for &curr in &values {
                    let down = prev <= line && line < curr;
                    let up = prev >= line && line > curr;
                    assert!(!(down && up));
                    let expected = if down {
                        Some(Direction::Down)
                    } else if up {
                        Some(Direction::Up)
                    } else {
                        None
                    };
                    assert_eq!(crossing(prev, curr, line), expected, "{prev} -> {curr} @ {line}");
                }
            }
        }
    }

    #[test]
    fn line_from_frame_truncates() {
        let line = CountingLine::from_frame(640, 481, DEFAULT_LINE_POSITION);
        assert_eq!(line.y, 240.0);
        assert_eq!(line.x_start, 0.0);
        assert_eq!(line.x_end, 640.0);
    }

    #[test]
    fn direction_serializes_signed() {
        assert_eq!(serde_json::to_string(&Direction::Down).unwrap(), "1");
        assert_eq!(serde_json::to_string(&Direction::Up).unwrap(), "-1");
    }
}
