//! The tracking engine: ingestion entry point, periodic solver loop, and
//! renderer-facing snapshot output.
//!
//! All mutable state sits behind one `parking_lot::Mutex`, so an
//! advertisement arriving mid-tick waits for the tick to finish. Ticks are
//! driven either externally through [`TrackingEngine::tick`] or by the
//! timer loop in [`TrackingEngine::run`].

use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::domain::{Orientation, Position, ShortAddr, Tag, TagRole};
use crate::ingest::{AdvertisementDecoder, DecodedAdvertisement, Rgb};
use crate::localization::{DualSolution, PositionSolver, SolverSettings};
use crate::registry::TagRegistry;
use crate::units;
use crate::{EngineConfig, LocatorError};

/// Default palette index for newly admitted tags (green).
const ADMISSION_COLOR_INDEX: usize = 3;

/// Ring radius for initial tag placement, cm.
const PLACEMENT_RADIUS_FT: f64 = 6.0;

struct EngineState {
    registry: TagRegistry,
    solver: PositionSolver,
    settings: SolverSettings,
    orientation: Orientation,
    changed: bool,
}

/// Live scene of ranging tags fed by advertisements and refined per tick.
pub struct TrackingEngine {
    config: EngineConfig,
    decoder: AdvertisementDecoder,
    state: Mutex<EngineState>,
    running: AtomicBool,
}

impl TrackingEngine {
    /// Engine with an empty scene and anchors unlocked.
    pub fn new(config: EngineConfig) -> Self {
        let settings = SolverSettings {
            close_enough_cm: config.close_enough_cm,
            tags_below_anchors: config.tags_below_anchors,
            stale_pair: config.stale_pair,
        };
        Self {
            config,
            decoder: AdvertisementDecoder::default(),
            state: Mutex::new(EngineState {
                registry: TagRegistry::new(),
                solver: PositionSolver::new(),
                settings,
                orientation: Orientation::default(),
                changed: false,
            }),
            running: AtomicBool::new(false),
        }
    }

    /// Feed one raw advertisement.
    ///
    /// Foreign or malformed payloads are dropped silently. While anchors are
    /// unlocked, only anchor-flagged devices may create or refresh tags, so
    /// trackers cannot join before the topology is frozen.
    pub fn handle_advertisement(&self, identity: &str, data: &[u8], now: Instant) {
        let Some(ad) = self.decoder.decode(data) else {
            return;
        };

        let mut state = self.state.lock();
        if !state.registry.admits(ad.is_anchor) {
            return;
        }
        state.registry.record_seen(identity, now);

        if state.registry.lookup_by_short_address(&ad.short_addr).is_none() {
            self.admit(&mut state, identity, &ad);
        }
        self.apply(&mut state, &ad, now);
        state.changed = true;
    }

    /// Create a tag for a newly heard device, placed on the admission ring.
    fn admit(&self, state: &mut EngineState, identity: &str, ad: &DecodedAdvertisement) {
        let n = state.registry.seen_count();
        let role = if ad.is_anchor {
            TagRole::Fixed
        } else {
            TagRole::Mobile
        };
        let tag = Tag::new(
            identity,
            display_name(n),
            ad.long_addr,
            ad.short_addr,
            role,
            ring_position(n),
            ADMISSION_COLOR_INDEX,
        );
        if state.registry.add(tag).is_some() {
            tracing::info!(short_addr = %ad.short_addr, name = %display_name(n), role = ?role, "tag admitted");
        }
    }

    /// Refresh an existing tag from a decoded advertisement.
    fn apply(&self, state: &mut EngineState, ad: &DecodedAdvertisement, now: Instant) {
        let window = self.config.filter_window;
        let Some(tag) = state.registry.lookup_by_short_address_mut(&ad.short_addr) else {
            return;
        };
        // The anchor flag is authoritative for unlocked tags; a locked
        // anchor keeps its role until the operator unlocks.
        if !tag.locked {
            tag.role = if ad.is_anchor {
                TagRole::Fixed
            } else {
                TagRole::Mobile
            };
        }
        for sample in &ad.ranges {
            tag.add_range(sample.neighbor, sample.distance_cm as f64, window, now);
        }
        if let Some(color) = ad.color {
            tag.set_color_rgb(color);
        }
    }

    /// Run one solver pass: evict stale tags, then solve.
    pub fn tick(&self, now: Instant) {
        let mut state = self.state.lock();
        state.registry.evict_stale(self.config.stale_tag, now);
        let EngineState {
            registry,
            solver,
            settings,
            orientation,
            changed,
        } = &mut *state;
        *changed |= solver.run_tick(registry, orientation, settings, now);
    }

    /// Tick on a timer until [`TrackingEngine::stop`] is called.
    ///
    /// A tick always runs to completion; if one overruns the period, the
    /// missed deadlines are skipped rather than bunched up.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(period_ms = self.config.tick_interval.as_millis() as u64, "engine started");
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick(Instant::now());
        }
        tracing::info!("engine stopped");
    }

    /// Ask the timer loop to exit after its current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Freeze the current anchors.
    pub fn lock_anchors(&self) {
        let mut state = self.state.lock();
        state.registry.lock_anchors();
        state.changed = true;
    }

    /// Revert the locked anchors to trackers.
    pub fn unlock_anchors(&self) {
        let mut state = self.state.lock();
        state.registry.unlock_anchors();
        state.changed = true;
    }

    /// Set the relaxation tolerance, clamped to 4..=100 cm.
    pub fn set_close_enough_cm(&self, cm: f64) {
        self.state.lock().settings.close_enough_cm = cm.clamp(4.0, 100.0);
    }

    /// Choose which of the two candidate solutions trackers snap to.
    pub fn set_tags_below_anchors(&self, below: bool) {
        self.state.lock().settings.tags_below_anchors = below;
    }

    /// Mirror the displayed scene on the x axis.
    pub fn toggle_flip_x(&self) {
        let mut state = self.state.lock();
        state.orientation.flip_x = -state.orientation.flip_x;
        state.changed = true;
    }

    /// Mirror the displayed scene on the z axis.
    pub fn toggle_flip_z(&self) {
        let mut state = self.state.lock();
        state.orientation.flip_z = -state.orientation.flip_z;
        state.changed = true;
    }

    /// Rotate the displayed anchor constellation, radians.
    pub fn set_orientation_rotation(&self, radians: f64) {
        let mut state = self.state.lock();
        state.orientation.rotation = radians;
        state.changed = true;
    }

    /// Shift the displayed anchor constellation, cm per axis.
    pub fn set_orientation_offset(&self, offset: Position) {
        let mut state = self.state.lock();
        state.orientation.offset = offset;
        state.changed = true;
    }

    /// Change a tag's role. Locked anchors are refused.
    pub fn set_role(&self, short_addr: &ShortAddr, role: TagRole) -> Result<(), LocatorError> {
        let mut state = self.state.lock();
        let tag = state
            .registry
            .lookup_by_short_address_mut(short_addr)
            .ok_or(LocatorError::UnknownTag(*short_addr))?;
        if tag.locked {
            return Err(LocatorError::TagLocked(*short_addr));
        }
        tag.role = role;
        state.changed = true;
        Ok(())
    }

    /// Drag a tag to a new position. Locked anchors are refused; the solver
    /// cannot race this write because both hold the same lock.
    pub fn move_tag(&self, short_addr: &ShortAddr, position: Position) -> Result<(), LocatorError> {
        let mut state = self.state.lock();
        let tag = state
            .registry
            .lookup_by_short_address_mut(short_addr)
            .ok_or(LocatorError::UnknownTag(*short_addr))?;
        if tag.locked {
            return Err(LocatorError::TagLocked(*short_addr));
        }
        tag.position = position;
        state.changed = true;
        Ok(())
    }

    /// Current scene for a renderer. Reading a snapshot consumes the changed
    /// flag, so a poll loop can redraw only when something moved.
    pub fn snapshot(&self) -> SceneSnapshot {
        let mut state = self.state.lock();
        let orientation = state.orientation;
        let tags = state
            .registry
            .tags()
            .iter()
            .map(|tag| TagSnapshot {
                name: tag.name.clone(),
                short_addr: tag.short_addr,
                role: tag.role,
                locked: tag.locked,
                position: tag.world_position(&orientation),
                color: tag.color,
                ranges: tag.ranges().clone(),
                average_range_error: tag.average_range_error,
            })
            .collect();
        let alert = state.solver.alert().map(str::to_owned);
        let dual_solutions = state.solver.dual_solutions().clone();
        let changed = std::mem::take(&mut state.changed);
        SceneSnapshot {
            tags,
            alert,
            changed,
            dual_solutions,
        }
    }
}

/// One tag as a renderer sees it: world coordinates, display color, and the
/// smoothed range table.
#[derive(Debug, Clone, Serialize)]
pub struct TagSnapshot {
    /// Display name assigned at admission.
    pub name: String,
    /// Short protocol address.
    pub short_addr: ShortAddr,
    /// Anchor or tracker.
    pub role: TagRole,
    /// True while frozen by the anchor lock.
    pub locked: bool,
    /// Position with the display orientation applied, cm.
    pub position: Position,
    /// Indicator color.
    pub color: Rgb,
    /// Smoothed range per neighbor, cm.
    pub ranges: std::collections::HashMap<ShortAddr, f64>,
    /// Mean residual of the last multilateration, cm.
    pub average_range_error: f64,
}

/// The whole scene, serializable for a renderer or debug dump.
#[derive(Debug, Clone, Serialize)]
pub struct SceneSnapshot {
    /// Tags in admission order.
    pub tags: Vec<TagSnapshot>,
    /// Standing positioning alert, if any.
    pub alert: Option<String>,
    /// True when anything moved since the previous snapshot.
    pub changed: bool,
    /// Both multilateration candidates per tracker from the last tick.
    pub dual_solutions: std::collections::HashMap<ShortAddr, DualSolution>,
}

/// Single-letter display name for the n-th admitted tag (1-based).
fn display_name(n: usize) -> String {
    let letter = (b'A' + ((n.saturating_sub(1)) % 26) as u8) as char;
    letter.to_string()
}

/// Initial placement on a ring around the origin so new tags do not pile up
/// at a single point before their first solve.
fn ring_position(n: usize) -> Position {
    let angle = FRAC_PI_2 + 20.0 * PI / (n as f64 + 1.0);
    let radius = units::ft_to_cm(PLACEMENT_RADIUS_FT);
    Position::new(angle.sin() * radius, 5.0, angle.cos() * radius)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::ingest::VENDOR_SIGNATURE;

    /// Build a full advertisement: one manufacturer LTV wrapping a vendor
    /// payload with the given flags, long address, and sub-records.
    fn advertisement(flags: u8, long_addr: [u8; 8], records: &[u8]) -> Vec<u8> {
        let mut payload = VENDOR_SIGNATURE.to_vec();
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.push(flags);
        payload.push(0x00);
        payload.extend_from_slice(&long_addr);
        payload.extend_from_slice(&[0x00; 4]);
        payload.extend_from_slice(records);

        let mut data = vec![payload.len() as u8 + 1, 0xff];
        data.extend_from_slice(&payload);
        data
    }

    fn long_addr(short: [u8; 2]) -> [u8; 8] {
        [0, 0, 0, 0, 0, 0, short[0], short[1]]
    }

    fn ranging_record(neighbor: [u8; 2], cm: u16) -> Vec<u8> {
        let d = cm.to_be_bytes();
        vec![0x00, 0x04, neighbor[0], neighbor[1], d[0], d[1]]
    }

    #[test]
    fn test_admission_requires_anchor_flag_until_locked() {
        let engine = TrackingEngine::new(EngineConfig::default());
        let now = Instant::now();

        // Tracker advertisement before the lock: ignored.
        engine.handle_advertisement("m1", &advertisement(0x00, long_addr([0, 9]), &[]), now);
        assert!(engine.snapshot().tags.is_empty());

        // Anchor advertisement: admitted as fixed.
        engine.handle_advertisement("a1", &advertisement(0x02, long_addr([0, 1]), &[]), now);
        let snap = engine.snapshot();
        assert_eq!(snap.tags.len(), 1);
        assert_eq!(snap.tags[0].role, TagRole::Fixed);
        assert_eq!(snap.tags[0].name, "A");

        // After locking, the tracker is admitted too.
        engine.lock_anchors();
        engine.handle_advertisement("m1", &advertisement(0x00, long_addr([0, 9]), &[]), now);
        let snap = engine.snapshot();
        assert_eq!(snap.tags.len(), 2);
        assert_eq!(snap.tags[1].role, TagRole::Mobile);
        assert_eq!(snap.tags[1].name, "B");
    }

    #[test]
    fn test_foreign_bytes_ignored() {
        let engine = TrackingEngine::new(EngineConfig::default());
        engine.handle_advertisement("x", &[0x03, 0xff, 0x4c, 0x00], Instant::now());
        engine.handle_advertisement("y", b"garbage", Instant::now());
        assert!(engine.snapshot().tags.is_empty());
    }

    #[test]
    fn test_ranges_routed_through_filter() {
        let engine = TrackingEngine::new(EngineConfig::builder().filter_window(2).build());
        let now = Instant::now();
        let records = ranging_record([0, 2], 100);
        engine.handle_advertisement("a1", &advertisement(0x02, long_addr([0, 1]), &records), now);
        let records = ranging_record([0, 2], 200);
        engine.handle_advertisement("a1", &advertisement(0x02, long_addr([0, 1]), &records), now);

        let snap = engine.snapshot();
        let smoothed = snap.tags[0].ranges[&ShortAddr::new([0, 2])];
        assert!((smoothed - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_move_tag_refuses_locked_anchor() {
        let engine = TrackingEngine::new(EngineConfig::default());
        let now = Instant::now();
        engine.handle_advertisement("a1", &advertisement(0x02, long_addr([0, 1]), &[]), now);
        let addr = ShortAddr::new([0, 1]);

        engine.move_tag(&addr, Position::new(1.0, 2.0, 3.0)).unwrap();
        engine.lock_anchors();
        let err = engine.move_tag(&addr, Position::default()).unwrap_err();
        assert!(matches!(err, LocatorError::TagLocked(_)));

        let missing = ShortAddr::new([0xee, 0xee]);
        let err = engine.move_tag(&missing, Position::default()).unwrap_err();
        assert!(matches!(err, LocatorError::UnknownTag(_)));
    }

    #[test]
    fn test_snapshot_consumes_changed_flag() {
        let engine = TrackingEngine::new(EngineConfig::default());
        engine.handle_advertisement(
            "a1",
            &advertisement(0x02, long_addr([0, 1]), &[]),
            Instant::now(),
        );
        assert!(engine.snapshot().changed);
        assert!(!engine.snapshot().changed);

        engine.tick(Instant::now());
        assert!(engine.snapshot().changed);
    }

    #[test]
    fn test_stale_tag_evicted_on_tick() {
        let engine = TrackingEngine::new(EngineConfig::default());
        let t0 = Instant::now();
        engine.handle_advertisement("a1", &advertisement(0x02, long_addr([0, 1]), &[]), t0);
        assert_eq!(engine.snapshot().tags.len(), 1);

        engine.tick(t0 + Duration::from_secs(31));
        assert!(engine.snapshot().tags.is_empty());
    }

    #[test]
    fn test_orientation_controls_affect_snapshot() {
        let engine = TrackingEngine::new(EngineConfig::default());
        let now = Instant::now();
        engine.handle_advertisement("a1", &advertisement(0x02, long_addr([0, 1]), &[]), now);
        let addr = ShortAddr::new([0, 1]);
        engine.move_tag(&addr, Position::new(10.0, 0.0, 20.0)).unwrap();

        engine.toggle_flip_x();
        engine.set_orientation_offset(Position::new(0.0, 0.0, 5.0));
        let snap = engine.snapshot();
        assert!((snap.tags[0].position.x + 10.0).abs() < 1e-9);
        assert!((snap.tags[0].position.z - 25.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_on_request() {
        let engine = Arc::new(TrackingEngine::new(EngineConfig::default()));
        let handle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.stop();
        // The loop observes the flag on its next tick and exits.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.await.unwrap();
    }
}
