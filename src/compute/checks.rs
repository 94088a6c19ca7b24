//! Diagnostics against the standard's valid-range attributes.
//!
//! These never fail a variable; the coordinator logs them as warnings.
use crate::standard::StandardVariable;
use ndarray::ArrayD;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeCheck {
    ValidMin,
    ValidMax,
    OkMinMeanAbs,
    OkMaxMeanAbs,
}

impl RangeCheck {
    pub fn attribute(self) -> &'static str {
        match self {
            RangeCheck::ValidMin => "valid_min",
            RangeCheck::ValidMax => "valid_max",
            RangeCheck::OkMinMeanAbs => "ok_min_mean_abs",
            RangeCheck::OkMaxMeanAbs => "ok_max_mean_abs",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeViolation {
    pub check: RangeCheck,
    pub limit: f64,
    pub found: f64,
}

impl fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = {} violated by {}", self.check.attribute(), self.limit, self.found)
    }
}

/// Checks one written chunk. NaN values are ignored.
pub fn check_chunk(standard: &StandardVariable, data: &ArrayD<f64>) -> Vec<RangeViolation> {
    let mut out = Vec::new();
    let finite = || data.iter().copied().filter(|v| !v.is_nan());
    let (Some(min), Some(max)) = (finite().reduce(f64::min), finite().reduce(f64::max)) else {
        return out;
    };
    let count = finite().count() as f64;
    let mean_abs = finite().map(f64::abs).sum::<f64>() / count;

    let mut check = |check: RangeCheck, found: f64, bad: fn(f64, f64) -> bool| {
        if let Some(limit) = standard.attribute_f64(check.attribute()) {
            if bad(found, limit) {
                out.push(RangeViolation { check, limit, found });
            }
        }
    };
    check(RangeCheck::ValidMin, min, |v, l| v < l);
    check(RangeCheck::ValidMax, max, |v, l| v > l);
    check(RangeCheck::OkMinMeanAbs, mean_abs, |v, l| v < l);
    check(RangeCheck::OkMaxMeanAbs, mean_abs, |v, l| v > l);
    out
}
