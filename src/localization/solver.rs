//! Per-tick position solving.
//!
//! One tick does four things, in order: refresh height-corrected ranges,
//! relax the unlocked anchors toward their measured pairwise distances,
//! multilaterate every tracker against the current anchor topology, and
//! raise or clear the positioning alert. The relaxation step is a fixed-step
//! heuristic, not an optimizer: each offending pair nudges a tag by exactly
//! one centimeter per axis per tick, which converges slowly but never
//! overshoots on noisy input.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::domain::{distance_between, pair_age, Orientation, Position, ShortAddr, TagRole};
use crate::localization::geometry::{circle_circle_intersection, intersect_three_spheres};
use crate::registry::TagRegistry;

/// Alert raised when two anchors cannot place a tracker.
pub const ALERT_2D: &str = "2D Positioning Error";
/// Alert raised when three anchors cannot place a tracker.
pub const ALERT_3D: &str = "3D Positioning Error";

/// Runtime-tunable solver behavior.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Residual below which an anchor pair is considered satisfied, cm.
    pub close_enough_cm: f64,
    /// Disambiguation policy: pick the candidate below the anchors.
    pub tags_below_anchors: bool,
    /// Pairwise readings older than this are ignored by the relaxation.
    pub stale_pair: Duration,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            close_enough_cm: 5.0,
            tags_below_anchors: true,
            stale_pair: Duration::from_millis(1000),
        }
    }
}

/// Both candidate points of the last three-sphere solve for a tracker,
/// kept so a display layer can offer the alternate solution.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DualSolution {
    /// The two candidate positions; the first one is the chosen one.
    pub candidates: [Position; 2],
}

/// Orchestrates one solving pass per timer tick.
#[derive(Debug, Default)]
pub struct PositionSolver {
    /// Standing positioning alert; cleared by the next successful solve.
    alert: Option<&'static str>,
    dual_solutions: HashMap<ShortAddr, DualSolution>,
}

impl PositionSolver {
    /// Solver with no alert and no recorded solutions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current standing alert, if any.
    pub fn alert(&self) -> Option<&'static str> {
        self.alert
    }

    /// Dual-solution records from the most recent tick.
    pub fn dual_solutions(&self) -> &HashMap<ShortAddr, DualSolution> {
        &self.dual_solutions
    }

    /// Run one solving pass. Returns true when the scene should be redrawn.
    pub fn run_tick(
        &mut self,
        registry: &mut TagRegistry,
        orientation: &Orientation,
        settings: &SolverSettings,
        now: Instant,
    ) -> bool {
        self.dual_solutions.clear();
        self.refresh_corrected_ranges(registry, orientation);

        let fixed_count = registry
            .tags()
            .iter()
            .filter(|t| t.role == TagRole::Fixed)
            .count();

        if fixed_count > 0 {
            self.relax_anchors(registry, settings, now);
        }
        match fixed_count {
            2 => self.solve_planar(registry, orientation, settings),
            3 => self.solve_spatial(registry, orientation, settings),
            _ => {}
        }

        true
    }

    /// Project each smoothed range onto the ground plane by removing the
    /// height difference to the neighbor: corrected = sqrt(r² - Δy²).
    /// Readings shorter than the height difference have no planar component
    /// and are cleared instead of stored.
    fn refresh_corrected_ranges(&mut self, registry: &mut TagRegistry, orientation: &Orientation) {
        let mut updates: Vec<(ShortAddr, ShortAddr, Option<f64>)> = Vec::new();
        for tag in registry.tags() {
            let own_y = tag.world_position(orientation).y;
            for neighbor in tag.neighbors() {
                let Some(remote) = registry.lookup_by_short_address(neighbor) else {
                    continue;
                };
                let Some(range) = tag.range_to(neighbor) else {
                    continue;
                };
                let dy = remote.world_position(orientation).y - own_y;
                let corrected = (range * range - dy * dy).sqrt();
                updates.push((
                    tag.short_addr,
                    *neighbor,
                    corrected.is_finite().then_some(corrected),
                ));
            }
        }
        for (owner, neighbor, corrected) in updates {
            if let Some(tag) = registry.lookup_by_short_address_mut(&owner) {
                tag.set_corrected_range(neighbor, corrected);
            }
        }
    }

    /// Fixed-step relaxation among unlocked anchors.
    ///
    /// For every ordered pair with a fresh reading, if the planar distance
    /// between stored positions disagrees with the measured distance by more
    /// than the tolerance, nudge the first tag one centimeter per axis in
    /// the direction that shrinks the disagreement, then recenter the
    /// unlocked anchors around their mean.
    fn relax_anchors(
        &mut self,
        registry: &mut TagRegistry,
        settings: &SolverSettings,
        now: Instant,
    ) {
        let unlocked_fixed: Vec<usize> = registry
            .tags()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.role == TagRole::Fixed && !t.locked)
            .map(|(i, _)| i)
            .collect();

        let tags = registry.tags_mut();
        for &i in &unlocked_fixed {
            for &j in &unlocked_fixed {
                if i == j {
                    continue;
                }
                match pair_age(&tags[i], &tags[j], now) {
                    Some(age) if age <= settings.stale_pair => {}
                    _ => continue,
                }
                let Some(measured) = distance_between(&tags[i], &tags[j], true) else {
                    continue;
                };

                let pi = tags[i].position;
                let pj = tags[j].position;
                let d = pi.planar_distance_to(&pj);
                if (d - measured).abs() < settings.close_enough_cm {
                    continue;
                }

                // Move apart when the measurement says we are too close,
                // together when too far; ties fall to the positive step.
                let (dx, dz) = if measured > d {
                    (
                        if pj.x > pi.x { -1.0 } else { 1.0 },
                        if pj.z > pi.z { -1.0 } else { 1.0 },
                    )
                } else {
                    (
                        if pj.x > pi.x { 1.0 } else { -1.0 },
                        if pj.z > pi.z { 1.0 } else { -1.0 },
                    )
                };
                tags[i].position.x += dx;
                tags[i].position.z += dz;
            }
        }

        if !unlocked_fixed.is_empty() {
            let n = unlocked_fixed.len() as f64;
            let mean_x: f64 = unlocked_fixed.iter().map(|&i| tags[i].position.x).sum::<f64>() / n;
            let mean_z: f64 = unlocked_fixed.iter().map(|&i| tags[i].position.z).sum::<f64>() / n;
            for &i in &unlocked_fixed {
                tags[i].position.x -= mean_x;
                tags[i].position.z -= mean_z;
            }
        }
    }

    /// Two-anchor branch: place each tracker on the circle-circle
    /// intersection in the ground plane, at the first anchor's height.
    fn solve_planar(
        &mut self,
        registry: &mut TagRegistry,
        orientation: &Orientation,
        settings: &SolverSettings,
    ) {
        let anchors: Vec<usize> = registry
            .tags()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.role == TagRole::Fixed)
            .map(|(i, _)| i)
            .collect();
        debug_assert_eq!(anchors.len(), 2);

        let tags = registry.tags();
        let a0 = tags[anchors[0]].world_position(orientation);
        let a1 = tags[anchors[1]].world_position(orientation);

        let mut updates: Vec<(usize, Position)> = Vec::new();
        for (m, tag) in tags.iter().enumerate() {
            if tag.role != TagRole::Mobile {
                continue;
            }
            // A tracker missing a range to either anchor is simply skipped
            // this tick; the next advertisement will fill it in.
            let Some(r0) = distance_between(tag, &tags[anchors[0]], false) else {
                continue;
            };
            let Some(r1) = distance_between(tag, &tags[anchors[1]], false) else {
                continue;
            };

            let solution = circle_circle_intersection(a0.x, a0.z, r0, a1.x, a1.z, r1)
                .filter(|[p, q]| {
                    p.0.is_finite() && p.1.is_finite() && q.0.is_finite() && q.1.is_finite()
                });
            match solution {
                Some([p, q]) => {
                    let pick_first = if settings.tags_below_anchors {
                        p.0 > q.0
                    } else {
                        p.0 < q.0
                    };
                    let (x, z) = if pick_first { p } else { q };
                    updates.push((m, Position::new(x, a0.y, z)));
                    self.alert = None;
                }
                None => {
                    self.alert = Some(ALERT_2D);
                    tracing::debug!(tag = %tag.short_addr, "planar solve failed");
                }
            }
        }

        let tags = registry.tags_mut();
        for (m, position) in updates {
            tags[m].position = position;
        }
    }

    /// Three-anchor branch: place each tracker on the three-sphere
    /// intersection, keeping both candidates for the display layer.
    fn solve_spatial(
        &mut self,
        registry: &mut TagRegistry,
        orientation: &Orientation,
        settings: &SolverSettings,
    ) {
        let anchors: Vec<usize> = registry
            .tags()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.role == TagRole::Fixed)
            .map(|(i, _)| i)
            .collect();
        debug_assert_eq!(anchors.len(), 3);

        let tags = registry.tags();
        let centers = [
            tags[anchors[0]].world_position(orientation),
            tags[anchors[1]].world_position(orientation),
            tags[anchors[2]].world_position(orientation),
        ];

        let mut updates: Vec<(usize, Position, DualSolution, f64)> = Vec::new();
        for (m, tag) in tags.iter().enumerate() {
            if tag.role != TagRole::Mobile {
                continue;
            }
            let radii = [
                distance_between(tag, &tags[anchors[0]], false),
                distance_between(tag, &tags[anchors[1]], false),
                distance_between(tag, &tags[anchors[2]], false),
            ];
            let [Some(r0), Some(r1), Some(r2)] = radii else {
                continue;
            };

            let [a, b] = intersect_three_spheres(centers, [r0, r1, r2]);
            if !a.is_finite() {
                self.alert = Some(ALERT_3D);
                tracing::debug!(tag = %tag.short_addr, "spatial solve failed");
                continue;
            }

            // y grows downward, so "below the anchors" is the larger y.
            let pick_a = if settings.tags_below_anchors {
                a.y > b.y
            } else {
                a.y < b.y
            };
            let chosen = if pick_a { a } else { b };
            let dual = DualSolution {
                candidates: [chosen, if pick_a { b } else { a }],
            };
            let avg_error = centers
                .iter()
                .zip([r0, r1, r2])
                .map(|(c, r)| (chosen.distance_to(c) - r).abs())
                .sum::<f64>()
                / 3.0;
            updates.push((m, chosen, dual, avg_error));
            self.alert = None;
        }

        let tags = registry.tags_mut();
        for (m, position, dual, avg_error) in updates {
            tags[m].position = position;
            tags[m].average_range_error = avg_error;
            self.dual_solutions.insert(tags[m].short_addr, dual);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Position, ShortAddr, Tag};

    fn tag(short: [u8; 2], role: TagRole, position: Position) -> Tag {
        Tag::new(
            format!("id-{:02x}{:02x}", short[0], short[1]),
            "A",
            [0, 0, 0, 0, 0, 0, short[0], short[1]],
            ShortAddr::new(short),
            role,
            position,
            3,
        )
    }

    /// Record a fresh symmetric reading between two tags.
    fn set_range(registry: &mut TagRegistry, a: [u8; 2], b: [u8; 2], cm: f64, now: Instant) {
        let (sa, sb) = (ShortAddr::new(a), ShortAddr::new(b));
        registry
            .lookup_by_short_address_mut(&sa)
            .unwrap()
            .add_range(sb, cm, 1, now);
        registry
            .lookup_by_short_address_mut(&sb)
            .unwrap()
            .add_range(sa, cm, 1, now);
    }

    fn solve_once(registry: &mut TagRegistry, settings: &SolverSettings, now: Instant) -> PositionSolver {
        let mut solver = PositionSolver::new();
        solver.run_tick(registry, &Orientation::default(), settings, now);
        solver
    }

    #[test]
    fn test_relaxation_moves_one_cm_per_axis() {
        let mut registry = TagRegistry::new();
        registry.add(tag([0, 1], TagRole::Fixed, Position::new(-5.0, 0.0, 0.0)));
        registry.add(tag([0, 2], TagRole::Fixed, Position::new(5.0, 0.0, 0.0)));
        let now = Instant::now();
        // Measured 100 cm apart, currently 10: the pair must spread.
        set_range(&mut registry, [0, 1], [0, 2], 100.0, now);

        let mut solver = PositionSolver::new();
        solver.run_tick(
            &mut registry,
            &Orientation::default(),
            &SolverSettings::default(),
            now,
        );

        // Each tag stepped 1 cm away from the other on x (plus the z tie
        // step), and recentering keeps the pair symmetric around zero.
        let x0 = registry.tags()[0].position.x;
        let x1 = registry.tags()[1].position.x;
        assert!((x0 - -6.0).abs() < 1e-9, "x0 = {x0}");
        assert!((x1 - 6.0).abs() < 1e-9, "x1 = {x1}");
        assert!((x0 + x1).abs() < 1e-9);
    }

    #[test]
    fn test_relaxation_converges_within_tolerance() {
        let mut registry = TagRegistry::new();
        registry.add(tag([0, 1], TagRole::Fixed, Position::new(-10.0, 0.0, 0.0)));
        registry.add(tag([0, 2], TagRole::Fixed, Position::new(10.0, 0.0, 0.0)));
        let now = Instant::now();
        set_range(&mut registry, [0, 1], [0, 2], 120.0, now);

        let settings = SolverSettings::default();
        let mut solver = PositionSolver::new();
        // Error starts at 100 cm and shrinks ~2 cm per tick on x; the z tie
        // steps add slack, so allow a proportional bound.
        for _ in 0..200 {
            solver.run_tick(&mut registry, &Orientation::default(), &settings, now);
        }
        let d = registry.tags()[0]
            .position
            .planar_distance_to(&registry.tags()[1].position);
        assert!(
            (d - 120.0).abs() < settings.close_enough_cm + 2.0,
            "pair distance {d} did not converge"
        );
    }

    #[test]
    fn test_relaxation_skips_stale_pairs_and_locked_tags() {
        let mut registry = TagRegistry::new();
        registry.add(tag([0, 1], TagRole::Fixed, Position::new(-5.0, 0.0, 0.0)));
        registry.add(tag([0, 2], TagRole::Fixed, Position::new(5.0, 0.0, 0.0)));
        let now = Instant::now();
        set_range(&mut registry, [0, 1], [0, 2], 100.0, now);

        // Stale reading: two seconds later nothing moves.
        let later = now + Duration::from_secs(2);
        solve_once(&mut registry, &SolverSettings::default(), later);
        assert!((registry.tags()[0].position.x - -5.0).abs() < 1e-9);

        // Locked anchors never move even with fresh readings.
        registry.lock_anchors();
        solve_once(&mut registry, &SolverSettings::default(), now);
        assert!((registry.tags()[0].position.x - -5.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_anchor_branch_places_tracker() {
        let mut registry = TagRegistry::new();
        registry.add(tag([0, 1], TagRole::Fixed, Position::new(0.0, 50.0, 0.0)));
        registry.add(tag([0, 2], TagRole::Fixed, Position::new(100.0, 50.0, 0.0)));
        registry.add(tag([0, 3], TagRole::Mobile, Position::new(0.0, 0.0, 0.0)));
        registry.lock_anchors();

        // True position (50, y, 40): distance to both anchors is
        // sqrt(50² + 40²). The anchors share a height, so y is theirs.
        let r = (50.0_f64 * 50.0 + 40.0 * 40.0).sqrt();
        let now = Instant::now();
        set_range(&mut registry, [0, 3], [0, 1], r, now);
        set_range(&mut registry, [0, 3], [0, 2], r, now);

        let settings = SolverSettings {
            tags_below_anchors: true,
            ..SolverSettings::default()
        };
        let solver = solve_once(&mut registry, &settings, now);
        assert!(solver.alert().is_none());

        let p = registry.tags()[2].position;
        assert!((p.x - 50.0).abs() < 1e-6);
        assert!((p.y - 50.0).abs() < 1e-9);
        // The below-anchors policy compares candidate x values; with the
        // chord vertical at x = 50 both candidates share x, and z = ±40.
        assert!((p.z.abs() - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_two_anchor_branch_alert_on_no_solution() {
        let mut registry = TagRegistry::new();
        registry.add(tag([0, 1], TagRole::Fixed, Position::new(0.0, 0.0, 0.0)));
        registry.add(tag([0, 2], TagRole::Fixed, Position::new(1000.0, 0.0, 0.0)));
        registry.add(tag([0, 3], TagRole::Mobile, Position::new(7.0, 8.0, 9.0)));
        registry.lock_anchors();

        // Ranges far too short to reach both anchors: circles disjoint.
        let now = Instant::now();
        set_range(&mut registry, [0, 3], [0, 1], 10.0, now);
        set_range(&mut registry, [0, 3], [0, 2], 10.0, now);

        let solver = solve_once(&mut registry, &SolverSettings::default(), now);
        assert_eq!(solver.alert(), Some(ALERT_2D));
        // Tracker keeps its last position.
        assert_eq!(registry.tags()[2].position, Position::new(7.0, 8.0, 9.0));
    }

    #[test]
    fn test_missing_range_skips_without_alert() {
        let mut registry = TagRegistry::new();
        registry.add(tag([0, 1], TagRole::Fixed, Position::new(0.0, 0.0, 0.0)));
        registry.add(tag([0, 2], TagRole::Fixed, Position::new(100.0, 0.0, 0.0)));
        registry.add(tag([0, 3], TagRole::Mobile, Position::new(1.0, 2.0, 3.0)));
        registry.lock_anchors();

        // Only one of the two required ranges exists.
        let now = Instant::now();
        set_range(&mut registry, [0, 3], [0, 1], 80.0, now);

        let solver = solve_once(&mut registry, &SolverSettings::default(), now);
        assert!(solver.alert().is_none());
        assert_eq!(registry.tags()[2].position, Position::new(1.0, 2.0, 3.0));
    }

    /// Anchors must not share a height: the sphere derivation solves y from
    /// the linear system, which degenerates when every anchor has the same y.
    const SPATIAL_ANCHORS: [Position; 3] = [
        Position {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        },
        Position {
            x: 400.0,
            y: 0.0,
            z: 0.0,
        },
        Position {
            x: 0.0,
            y: 120.0,
            z: 400.0,
        },
    ];

    fn spatial_registry() -> TagRegistry {
        let mut registry = TagRegistry::new();
        for (i, p) in SPATIAL_ANCHORS.iter().enumerate() {
            registry.add(tag([0, (i + 1) as u8], TagRole::Fixed, *p));
        }
        registry.add(tag([0, 4], TagRole::Mobile, Position::default()));
        registry.lock_anchors();
        registry
    }

    fn feed_truth_ranges(registry: &mut TagRegistry, truth: &Position, now: Instant) {
        for (i, a) in SPATIAL_ANCHORS.iter().enumerate() {
            set_range(registry, [0, 4], [0, (i + 1) as u8], truth.distance_to(a), now);
        }
    }

    #[test]
    fn test_three_anchor_branch_places_tracker() {
        let mut registry = spatial_registry();
        let truth = Position::new(200.0, 150.0, 200.0);
        let now = Instant::now();
        feed_truth_ranges(&mut registry, &truth, now);

        // below-anchors picks the candidate with the larger y; the truth
        // sits below the anchor plane (y grows downward).
        let settings = SolverSettings {
            tags_below_anchors: true,
            ..SolverSettings::default()
        };
        let solver = solve_once(&mut registry, &settings, now);
        assert!(solver.alert().is_none());

        let p = registry.tags()[3].position;
        assert!(p.distance_to(&truth) < 1e-6, "solved {p:?}");

        // Both candidates recorded; the chosen one listed first.
        let dual = solver
            .dual_solutions()
            .get(&ShortAddr::new([0, 4]))
            .unwrap();
        assert!(dual.candidates[0].distance_to(&p) < 1e-9);
        assert!(dual.candidates[1].y < dual.candidates[0].y);

        // Consistent ranges leave a negligible residual.
        assert!(registry.tags()[3].average_range_error < 1e-6);
    }

    #[test]
    fn test_three_anchor_branch_respects_policy_flag() {
        let build = |below: bool| {
            let mut registry = spatial_registry();
            let truth = Position::new(200.0, 150.0, 200.0);
            let now = Instant::now();
            feed_truth_ranges(&mut registry, &truth, now);
            let settings = SolverSettings {
                tags_below_anchors: below,
                ..SolverSettings::default()
            };
            solve_once(&mut registry, &settings, now);
            registry.tags()[3].position
        };

        let below = build(true);
        let above = build(false);
        // The two policies pick opposite candidates; below is the truth.
        assert!((below.y - 150.0).abs() < 1e-6);
        assert!(above.y < below.y);
    }

    #[test]
    fn test_three_anchor_alert_and_recovery() {
        let mut registry = spatial_registry();
        registry.tags_mut()[3].position = Position::new(5.0, 5.0, 5.0);

        // Impossible geometry: tiny ranges cannot meet.
        let now = Instant::now();
        for n in [[0u8, 1], [0, 2], [0, 3]] {
            set_range(&mut registry, [0, 4], n, 1.0, now);
        }
        let mut solver = PositionSolver::new();
        solver.run_tick(&mut registry, &Orientation::default(), &SolverSettings::default(), now);
        assert_eq!(solver.alert(), Some(ALERT_3D));
        assert_eq!(registry.tags()[3].position, Position::new(5.0, 5.0, 5.0));

        // Feed consistent ranges: the alert clears on the next tick.
        let truth = Position::new(200.0, 150.0, 200.0);
        let later = now + Duration::from_millis(50);
        feed_truth_ranges(&mut registry, &truth, later);
        solver.run_tick(&mut registry, &Orientation::default(), &SolverSettings::default(), later);
        assert!(solver.alert().is_none());
    }

    #[test]
    fn test_corrected_range_projection() {
        let mut registry = TagRegistry::new();
        registry.add(tag([0, 1], TagRole::Fixed, Position::new(0.0, 0.0, 0.0)));
        registry.add(tag([0, 2], TagRole::Fixed, Position::new(0.0, 30.0, 0.0)));
        let now = Instant::now();
        set_range(&mut registry, [0, 1], [0, 2], 50.0, now);

        solve_once(&mut registry, &SolverSettings::default(), now);
        let corrected = registry.tags()[0]
            .corrected_range_to(&ShortAddr::new([0, 2]))
            .unwrap();
        // 3-4-5 triangle: 50 cm slant over a 30 cm height difference.
        assert!((corrected - 40.0).abs() < 1e-9);
    }
}
