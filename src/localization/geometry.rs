//! Closed-form intersection solvers used by the position solver.
//!
//! Both solvers are stateless pure functions over centimeter coordinates.
//! The planar solver reports unsolvable configurations as `None`; the
//! spherical solver follows its classical derivation and lets a negative
//! discriminant surface as NaN coordinates, which callers test with
//! `is_finite` — no panic, no error type.

use crate::domain::Position;

/// Intersect two circles in a plane.
///
/// Returns `None` when the circles are too far apart (`d > r0 + r1`) or one
/// contains the other (`d < |r0 - r1|`); otherwise exactly two points, which
/// coincide when the circles are tangent.
pub fn circle_circle_intersection(
    x0: f64,
    y0: f64,
    r0: f64,
    x1: f64,
    y1: f64,
    r1: f64,
) -> Option<[(f64, f64); 2]> {
    let dx = x1 - x0;
    let dy = y1 - y0;
    let d = (dx * dx + dy * dy).sqrt();

    if d > r0 + r1 {
        return None; // circles do not intersect
    }
    if d < (r0 - r1).abs() {
        return None; // one circle contained in the other
    }
    if d == 0.0 {
        // Coincident centers: either no intersection (caught above unless
        // r0 == r1) or infinitely many; neither yields two usable points.
        return None;
    }

    // Distance from center 0 along the center line to the chord, then half
    // the chord length.
    let a = (r0 * r0 - r1 * r1 + d * d) / (2.0 * d);
    let x2 = x0 + dx * a / d;
    let y2 = y0 + dy * a / d;
    let h = (r0 * r0 - a * a).max(0.0).sqrt();

    let rx = -dy * (h / d);
    let ry = dx * (h / d);

    Some([(x2 + rx, y2 + ry), (x2 - rx, y2 - ry)])
}

/// Intersect three spheres, returning both candidate points.
///
/// Subtracting the second sphere's equation from the other two leaves two
/// linear equations describing the line through the intersection points;
/// solving x and y as linear functions of z and substituting back into the
/// first sphere gives a quadratic in z. A negative discriminant produces
/// NaN coordinates, as do centers that all share one y, which leave the
/// linear system singular.
pub fn intersect_three_spheres(
    centers: [Position; 3],
    radii: [f64; 3],
) -> [Position; 2] {
    let [c1, c2, c3] = centers;
    let [r1, r2, r3] = radii;

    // EQ1 - EQ2 -> a1 x + b1 y + c1z z = k1
    let k1 = r1 * r1 - r2 * r2 - c1.x * c1.x + c2.x * c2.x - c1.y * c1.y + c2.y * c2.y
        - c1.z * c1.z
        + c2.z * c2.z;
    let a1 = 2.0 * (c2.x - c1.x);
    let b1 = 2.0 * (c2.y - c1.y);
    let c1z = 2.0 * (c2.z - c1.z);

    // EQ3 - EQ2 -> a3 x + b3 y + c3z z = k3
    let k3 = r3 * r3 - r2 * r2 - c3.x * c3.x + c2.x * c2.x - c3.y * c3.y + c2.y * c2.y
        - c3.z * c3.z
        + c2.z * c2.z;
    let a3 = 2.0 * (c2.x - c3.x);
    let b3 = 2.0 * (c2.y - c3.y);
    let c3z = 2.0 * (c2.z - c3.z);

    // y as a linear function of z: y = e*z + f.
    let (e, f) = if a1 == 0.0 {
        (-c1z / b1, k1 / b1)
    } else if a3 == 0.0 {
        (-c3z / b3, k3 / b3)
    } else {
        let a31 = a3 / a1;
        (
            -((a31 * c1z - c3z) / (a31 * b1 - b3)),
            (a31 * k1 - k3) / (a31 * b1 - b3),
        )
    };

    // x as a linear function of z: x = g*z + h.
    let (g, h) = if b1 == 0.0 {
        (-c1z / a1, k1 / a1)
    } else if b3 == 0.0 {
        (-c3z / a3, k3 / a3)
    } else {
        let b31 = b3 / b1;
        (
            -((b31 * c1z - c3z) / (b31 * a1 - a3)),
            (b31 * k1 - k3) / (b31 * a1 - a3),
        )
    };

    // Substitute into EQ1: quadratic a z^2 + b z + c = 0.
    let qa = g * g + e * e + 1.0;
    let qb = -c1.x * g - c1.y * e - 2.0 * c1.z - c1.x * g - c1.y * e + 2.0 * g * h + 2.0 * e * f;
    let qc = c1.x * c1.x + c1.y * c1.y + c1.z * c1.z - 2.0 * c1.x * h - 2.0 * c1.y * f + h * h
        + f * f
        - r1 * r1;

    // NaN when the discriminant is negative; callers check is_finite.
    let root = (qb * qb - 4.0 * qa * qc).sqrt();
    let z = (-qb + root) / (2.0 * qa);
    let z_alt = (-qb - root) / (2.0 * qa);

    [
        Position::new(g * z + h, e * z + f, z),
        Position::new(g * z_alt + h, e * z_alt + f, z_alt),
    ]
}
