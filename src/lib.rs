//! UWB ranging tag locator engine.
//!
//! Consumes vendor advertisement payloads carrying pairwise ultra-wideband
//! distance measurements and maintains a live scene of tags: stationary
//! anchors whose layout is refined by a fixed-step relaxation, and mobile
//! trackers placed by closed-form multilateration against the anchors.
//!
//! The crate is transport-agnostic: feed raw advertisement bytes into
//! [`TrackingEngine::handle_advertisement`], drive [`TrackingEngine::tick`]
//! (or let [`TrackingEngine::run`] drive it on a timer), and read the result
//! through [`TrackingEngine::snapshot`]. Rendering, scanning, and persistence
//! live outside.
//!
//! Coordinates are centimeters throughout; the y axis points down, matching
//! the renderer this engine was built for.

pub mod domain;
mod engine;
pub mod ingest;
pub mod localization;
pub mod registry;
pub mod units;

pub use domain::{Orientation, Position, ShortAddr, Tag, TagRole};
pub use engine::{SceneSnapshot, TagSnapshot, TrackingEngine};
pub use ingest::{AdvertisementDecoder, RangeFilter};
pub use registry::TagRegistry;

use std::time::Duration;

/// Errors surfaced by the locator. Malformed radio input is never an error;
/// these are contract violations on the caller's side.
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    /// A smoothing filter was requested with an unusable window.
    #[error("filter capacity must be at least 1, got {0}")]
    InvalidFilterCapacity(usize),

    /// An operation referenced a tag the registry does not hold.
    #[error("unknown tag {0}")]
    UnknownTag(ShortAddr),

    /// An operation tried to modify a locked anchor.
    #[error("tag {0} is locked")]
    TagLocked(ShortAddr),
}

/// Tuning for a [`TrackingEngine`].
///
/// Construct via [`EngineConfig::builder`]; every setter clamps its input to
/// a sane range, so a config is always usable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Solver tick period.
    pub tick_interval: Duration,
    /// Samples per range-smoothing window.
    pub filter_window: usize,
    /// Relaxation tolerance, cm.
    pub close_enough_cm: f64,
    /// Ambiguity policy: place trackers below the anchors.
    pub tags_below_anchors: bool,
    /// Pairwise readings older than this are ignored by the relaxation.
    pub stale_pair: Duration,
    /// Tags unseen for longer than this are evicted.
    pub stale_tag: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            filter_window: 10,
            close_enough_cm: 5.0,
            tags_below_anchors: true,
            stale_pair: Duration::from_millis(1000),
            stale_tag: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Start building a config from the defaults.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for [`EngineConfig`] with clamped setters.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Solver tick period, clamped to at least 10 ms.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Smoothing window size, clamped to at least 1.
    pub fn filter_window(mut self, window: usize) -> Self {
        self.config.filter_window = window.max(1);
        self
    }

    /// Relaxation tolerance in cm, clamped to 4..=100.
    pub fn close_enough_cm(mut self, cm: f64) -> Self {
        self.config.close_enough_cm = cm.clamp(4.0, 100.0);
        self
    }

    /// Ambiguity policy for the two-candidate solutions.
    pub fn tags_below_anchors(mut self, below: bool) -> Self {
        self.config.tags_below_anchors = below;
        self
    }

    /// Maximum age of a pairwise reading the relaxation will use.
    pub fn stale_pair(mut self, age: Duration) -> Self {
        self.config.stale_pair = age;
        self
    }

    /// How long a tag may go unseen before eviction.
    pub fn stale_tag(mut self, age: Duration) -> Self {
        self.config.stale_tag = age;
        self
    }

    /// Finish the build.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
