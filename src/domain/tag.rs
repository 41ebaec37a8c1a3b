//! Tag entity: identity, role, lock state, position, and smoothed ranges.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;

use crate::domain::position::{Orientation, Position};
use crate::ingest::{RangeFilter, Rgb};

/// Short protocol address: the last two bytes of the long hardware address,
/// displayed as four lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShortAddr([u8; 2]);

impl ShortAddr {
    /// Wrap the two raw address bytes.
    pub fn new(bytes: [u8; 2]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }
}

impl std::fmt::Display for ShortAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{:02x}", self.0[0], self.0[1])
    }
}

impl Serialize for ShortAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Whether a tag is a stationary reference or a solved tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagRole {
    /// Anchor: position assumed, used as a trilateration reference.
    Fixed,
    /// Tracker: position solved from ranges to anchors.
    Mobile,
}

/// Indicator color palette; the index wraps around it.
pub const COLOR_PALETTE: [Rgb; 7] = [
    Rgb { r: 255, g: 0, b: 0 },
    Rgb { r: 255, g: 150, b: 20 },
    Rgb { r: 245, g: 210, b: 20 },
    Rgb { r: 0, g: 200, b: 50 },
    Rgb { r: 0, g: 200, b: 205 },
    Rgb { r: 0, g: 50, b: 255 },
    Rgb { r: 200, g: 50, b: 200 },
];

/// One ranging tag known to the registry.
#[derive(Debug)]
pub struct Tag {
    /// Radio-level identity the advertisement arrived under.
    pub identity: String,
    /// Single-letter display name assigned at admission.
    pub name: String,
    /// Long hardware address, captured once from the first advertisement.
    pub long_addr: [u8; 8],
    /// Short protocol address, unique within the registry.
    pub short_addr: ShortAddr,
    /// Anchor or tracker.
    pub role: TagRole,
    /// Locked anchors are frozen: the solver never nudges them and the drag
    /// path refuses them.
    pub locked: bool,
    /// Stored position, centimeters. Written only by the solver or an
    /// explicit drag operation, never both within one tick.
    pub position: Position,
    /// Mean absolute residual between measured ranges and the last solved
    /// position; zero until the tag has been multilaterated.
    pub average_range_error: f64,
    /// Index into [`COLOR_PALETTE`].
    pub color_index: usize,
    /// Current indicator color.
    pub color: Rgb,
    filters: HashMap<ShortAddr, RangeFilter>,
    ranges: HashMap<ShortAddr, f64>,
    range_last_seen: HashMap<ShortAddr, Instant>,
    ranges_corrected: HashMap<ShortAddr, f64>,
}

impl Tag {
    /// Create a tag at the given position with a palette color.
    pub fn new(
        identity: impl Into<String>,
        name: impl Into<String>,
        long_addr: [u8; 8],
        short_addr: ShortAddr,
        role: TagRole,
        position: Position,
        color_index: usize,
    ) -> Self {
        let color_index = color_index % COLOR_PALETTE.len();
        Self {
            identity: identity.into(),
            name: name.into(),
            long_addr,
            short_addr,
            role,
            locked: false,
            position,
            average_range_error: 0.0,
            color_index,
            color: COLOR_PALETTE[color_index],
            filters: HashMap::new(),
            ranges: HashMap::new(),
            range_last_seen: HashMap::new(),
            ranges_corrected: HashMap::new(),
        }
    }

    /// Route a raw reading through this tag's per-neighbor filter and store
    /// the smoothed value with its arrival time.
    pub fn add_range(&mut self, neighbor: ShortAddr, raw_cm: f64, window: usize, now: Instant) {
        let filter = self
            .filters
            .entry(neighbor)
            .or_insert_with(|| RangeFilter::new(window).unwrap_or_default());
        let smoothed = filter.next(raw_cm);
        self.ranges.insert(neighbor, smoothed);
        self.range_last_seen.insert(neighbor, now);
    }

    /// Smoothed range to a neighbor, if one has been measured.
    pub fn range_to(&self, neighbor: &ShortAddr) -> Option<f64> {
        self.ranges.get(neighbor).copied()
    }

    /// Height-corrected range to a neighbor, if one could be computed.
    pub fn corrected_range_to(&self, neighbor: &ShortAddr) -> Option<f64> {
        self.ranges_corrected.get(neighbor).copied()
    }

    /// Store or clear the height-corrected range for a neighbor.
    pub fn set_corrected_range(&mut self, neighbor: ShortAddr, corrected: Option<f64>) {
        match corrected {
            Some(v) => self.ranges_corrected.insert(neighbor, v),
            None => self.ranges_corrected.remove(&neighbor),
        };
    }

    /// Age of the most recent reading against a neighbor.
    pub fn range_age(&self, neighbor: &ShortAddr, now: Instant) -> Option<std::time::Duration> {
        self.range_last_seen
            .get(neighbor)
            .map(|seen| now.duration_since(*seen))
    }

    /// All neighbors this tag currently holds smoothed ranges for.
    pub fn neighbors(&self) -> impl Iterator<Item = &ShortAddr> {
        self.ranges.keys()
    }

    /// Smoothed range table, for snapshot output.
    pub fn ranges(&self) -> &HashMap<ShortAddr, f64> {
        &self.ranges
    }

    /// Set the indicator color from a palette index (wraps).
    pub fn set_color_index(&mut self, index: usize) {
        self.color_index = index % COLOR_PALETTE.len();
        self.color = COLOR_PALETTE[self.color_index];
    }

    /// Set the indicator color directly, as decoded from an advertisement.
    pub fn set_color_rgb(&mut self, color: Rgb) {
        self.color = color;
    }

    /// Position with the display orientation applied. Anchors are
    /// transformed; tracker positions already live in the displayed frame.
    pub fn world_position(&self, orientation: &Orientation) -> Position {
        match self.role {
            TagRole::Fixed => orientation.apply(&self.position),
            TagRole::Mobile => self.position,
        }
    }
}

/// Mean of the smoothed readings the pair holds about each other, or `None`
/// when neither direction has measured. With `corrected` the height-corrected
/// table is consulted instead of the raw smoothed one.
pub fn distance_between(a: &Tag, b: &Tag, corrected: bool) -> Option<f64> {
    let pick = |t: &Tag, other: &Tag| -> Option<f64> {
        if corrected {
            t.corrected_range_to(&other.short_addr)
        } else {
            t.range_to(&other.short_addr)
        }
    };
    let readings: Vec<f64> = [pick(a, b), pick(b, a)]
        .into_iter()
        .flatten()
        .filter(|v| v.is_finite())
        .collect();
    if readings.is_empty() {
        return None;
    }
    Some(readings.iter().sum::<f64>() / readings.len() as f64)
}

/// Youngest age of any reading between the pair, in either direction.
pub fn pair_age(a: &Tag, b: &Tag, now: Instant) -> Option<std::time::Duration> {
    [a.range_age(&b.short_addr, now), b.range_age(&a.short_addr, now)]
        .into_iter()
        .flatten()
        .min()
}
