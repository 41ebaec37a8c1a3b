//! Position and display-orientation types. Coordinates are centimeters.

use serde::Serialize;

/// A point in the scene, centimeters on each axis.
///
/// The y axis follows the renderer's convention (positive y is *down*), so
/// "below the anchors" means a larger y value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Position {
    /// East-west, cm.
    pub x: f64,
    /// Vertical, cm (positive is down).
    pub y: f64,
    /// North-south, cm.
    pub z: f64,
}

impl Position {
    /// Construct a position from its components.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Full 3-D distance to another point.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Planar distance in the ground (x, z) plane, ignoring height.
    pub fn planar_distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        (dx * dx + dz * dz).sqrt()
    }

    /// True when every coordinate is a finite number.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Read-only display transform applied to anchor coordinates.
///
/// Lets the operator rotate and shift the solved anchor constellation to
/// match the physical room, and mirror it per axis. Stored tag positions are
/// never rewritten; the transform is applied on every read. Mobile tags are
/// solved against transformed anchor coordinates, so their stored positions
/// already live in the displayed frame and pass through untouched.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Orientation {
    /// Rotation about the vertical axis, radians.
    pub rotation: f64,
    /// Offset added after rotation, cm per axis.
    pub offset: Position,
    /// Mirror factor for x, +1.0 or -1.0.
    pub flip_x: f64,
    /// Mirror factor for z, +1.0 or -1.0.
    pub flip_z: f64,
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            rotation: 0.0,
            offset: Position::default(),
            flip_x: 1.0,
            flip_z: 1.0,
        }
    }
}

impl Orientation {
    /// Apply the transform to a stored anchor position.
    pub fn apply(&self, p: &Position) -> Position {
        let (sin, cos) = self.rotation.sin_cos();
        Position {
            x: self.flip_x * ((p.x * cos - p.z * sin) + self.offset.x),
            y: p.y + self.offset.y,
            z: self.flip_z * ((p.z * cos + p.x * sin) + self.offset.z),
        }
    }
}
