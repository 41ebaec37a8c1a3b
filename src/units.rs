//! Length conversions for display layers.
//!
//! All internal state and solver math is in centimeters; these helpers exist
//! only so a UI can accept and present feet or meters.

/// Display unit selected by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Imperial feet.
    Feet,
    /// Metric meters.
    Meters,
}

/// Centimeters per foot.
pub const CM_PER_FT: f64 = 30.48;

/// Convert feet to centimeters.
pub fn ft_to_cm(ft: f64) -> f64 {
    ft * CM_PER_FT
}

/// Convert centimeters to feet.
pub fn cm_to_ft(cm: f64) -> f64 {
    cm / CM_PER_FT
}

/// Convert a display value in the given unit to centimeters.
pub fn to_cm(value: f64, unit: Unit) -> f64 {
    match unit {
        Unit::Feet => ft_to_cm(value),
        Unit::Meters => value * 100.0,
    }
}

/// Convert centimeters to a display value in the given unit.
pub fn from_cm(cm: f64, unit: Unit) -> f64 {
    match unit {
        Unit::Feet => cm_to_ft(cm),
        Unit::Meters => cm / 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feet_round_trip() {
        let cm = ft_to_cm(6.0);
        assert!((cm - 182.88).abs() < 1e-9);
        assert!((cm_to_ft(cm) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_meters() {
        assert!((to_cm(2.5, Unit::Meters) - 250.0).abs() < 1e-9);
        assert!((from_cm(250.0, Unit::Meters) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_unit_dispatch() {
        assert!((to_cm(1.0, Unit::Feet) - 30.48).abs() < 1e-9);
        assert!((from_cm(30.48, Unit::Feet) - 1.0).abs() < 1e-9);
    }
}
