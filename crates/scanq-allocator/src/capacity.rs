//! Storage sizing from a repository size measurement
//!
//! Three tiers, checked top-down:
//!
//! | size (KB)              | unit | requested          | headroom |
//! |------------------------|------|--------------------|----------|
//! | ≥ 1024×1024            | Gi   | size / (1024×1024) | +1       |
//! | 1024 ..< 1024×1024     | Mi   | size               | +100     |
//! | < 1024                 | Ki   | size               | +1000    |

use std::fmt;

use crate::request::SizeMeasurement;

const KB_PER_GIB: f64 = 1024.0 * 1024.0;
const KB_PER_MIB: f64 = 1024.0;

/// Binary unit suffix of a Kubernetes storage quantity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapacityUnit {
    /// Kibibytes
    Ki,
    /// Mebibytes
    Mi,
    /// Gibibytes
    Gi,
}

impl CapacityUnit {
    /// Quantity suffix as Kubernetes spells it
    pub fn suffix(self) -> &'static str {
        match self {
            CapacityUnit::Ki => "Ki",
            CapacityUnit::Mi => "Mi",
            CapacityUnit::Gi => "Gi",
        }
    }

    fn headroom(self) -> f64 {
        match self {
            CapacityUnit::Ki => 1000.0,
            CapacityUnit::Mi => 100.0,
            CapacityUnit::Gi => 1.0,
        }
    }
}

/// A magnitude in a given unit, possibly fractional
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Capacity {
    /// Amount in `unit`
    pub magnitude: f64,
    /// Unit of `magnitude`
    pub unit: CapacityUnit,
}

impl Capacity {
    /// Quantity string with the magnitude truncated toward zero, e.g. `1500Ki`
    pub fn to_quantity(&self) -> String {
        format!("{}{}", self.magnitude.trunc() as u64, self.unit.suffix())
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_quantity())
    }
}

/// What the scan needs and what the volume gets
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CapacityPlan {
    /// Requested on the claim
    pub requested: Capacity,
    /// Provisioned on the volume: `requested` plus tier headroom, same unit
    pub actual: Capacity,
}

/// Map a size measurement onto a capacity tier. Pure, never fails.
pub fn classify(size: SizeMeasurement) -> CapacityPlan {
    let kb = size.kb();
    let (magnitude, unit) = if kb >= KB_PER_GIB {
        (kb / KB_PER_GIB, CapacityUnit::Gi)
    } else if kb >= KB_PER_MIB {
        (kb, CapacityUnit::Mi)
    } else {
        (kb, CapacityUnit::Ki)
    };

    CapacityPlan {
        requested: Capacity { magnitude, unit },
        actual: Capacity {
            magnitude: magnitude + unit.headroom(),
            unit,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(kb: f64) -> CapacityPlan {
        classify(SizeMeasurement::from_kb(kb))
    }

    #[test]
    fn small_repo_lands_in_ki_tier() {
        let p = plan(500.0);
        assert_eq!(p.requested.unit, CapacityUnit::Ki);
        assert_eq!(p.requested.to_quantity(), "500Ki");
        assert_eq!(p.actual.to_quantity(), "1500Ki");
    }

    #[test]
    fn mi_tier_starts_exactly_at_1024() {
        assert_eq!(plan(1023.0).requested.unit, CapacityUnit::Ki);

        let p = plan(1024.0);
        assert_eq!(p.requested.unit, CapacityUnit::Mi);
        assert_eq!(p.requested.to_quantity(), "1024Mi");
        assert_eq!(p.actual.to_quantity(), "1124Mi");
    }

    #[test]
    fn gi_tier_starts_exactly_at_one_gib() {
        assert_eq!(plan(KB_PER_GIB - 1.0).requested.unit, CapacityUnit::Mi);

        let p = plan(KB_PER_GIB);
        assert_eq!(p.requested.unit, CapacityUnit::Gi);
        assert_eq!(p.requested.magnitude, 1.0);
        assert_eq!(p.actual.to_quantity(), "2Gi");
    }

    #[test]
    fn two_million_kb_is_fractional_gi() {
        let p = plan(2_000_000.0);
        assert_eq!(p.requested.unit, CapacityUnit::Gi);
        assert!((p.requested.magnitude - 1.907).abs() < 0.001);
        assert!((p.actual.magnitude - 2.907).abs() < 0.001);
        // truncation toward zero when rendered
        assert_eq!(p.requested.to_quantity(), "1Gi");
        assert_eq!(p.actual.to_quantity(), "2Gi");
    }

    #[test]
    fn zero_and_negative_degenerate_to_smallest_tier() {
        for kb in [0.0, -10.0] {
            let p = plan(kb);
            assert_eq!(p.requested.unit, CapacityUnit::Ki);
            assert_eq!(p.requested.to_quantity(), "0Ki");
            assert_eq!(p.actual.to_quantity(), "1000Ki");
        }
    }

    #[test]
    fn actual_never_below_requested() {
        let mut kb = 0.0;
        while kb < 8.0 * KB_PER_GIB {
            let p = plan(kb);
            assert_eq!(p.actual.unit, p.requested.unit);
            assert!(p.actual.magnitude >= p.requested.magnitude, "kb={kb}");
            kb = kb * 1.7 + 13.0;
        }
    }

    #[test]
    fn fractional_kb_truncates() {
        assert_eq!(plan(999.9).requested.to_quantity(), "999Ki");
        assert_eq!(plan(999.9).actual.to_quantity(), "1999Ki");
    }
}
