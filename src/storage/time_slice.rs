//! Time slice resolution and interpolation
//!
//! Maps a query time onto a non-decreasing time vector. Queries at or
//! beyond either end resolve to the boundary slice without blending.
//! Integer blends round half away from zero (`f64::round`).

use crate::storage::types::{ArrayData, Complex64, Interpolation};

/// Slice(s) selected for a query time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SliceSelection {
    Single(usize),
    /// `alpha` is in (0, 1): weight of the upper slice
    Bracket { lower: usize, upper: usize, alpha: f64 },
}

impl SliceSelection {
    /// Index used when only one slice is read
    pub fn lower(&self) -> usize {
        match *self {
            SliceSelection::Single(i) => i,
            SliceSelection::Bracket { lower, .. } => lower,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSliceResolver {
    policy: Interpolation,
}

impl TimeSliceResolver {
    pub fn new(policy: Interpolation) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> Interpolation {
        self.policy
    }

    /// Resolve `time` against `times`; `None` for an empty vector
    pub fn resolve(&self, times: &[f64], time: f64) -> Option<SliceSelection> {
        let last = times.len().checked_sub(1)?;
        if time <= times[0] {
            return Some(SliceSelection::Single(0));
        }
        if time >= times[last] {
            return Some(SliceSelection::Single(last));
        }

        // times[i] <= time < times[i + 1]
        let i = (0..last).find(|&i| times[i] <= time && time < times[i + 1])?;
        let (lo, hi) = (times[i], times[i + 1]);
        let selection = match self.policy {
            Interpolation::Previous => SliceSelection::Single(i),
            Interpolation::Closest => {
                if time - lo < hi - time {
                    SliceSelection::Single(i)
                } else {
                    SliceSelection::Single(i + 1)
                }
            }
            Interpolation::Linear => {
                let alpha = (time - lo) / (hi - lo);
                if alpha <= 0.0 {
                    SliceSelection::Single(i)
                } else {
                    SliceSelection::Bracket {
                        lower: i,
                        upper: i + 1,
                        alpha,
                    }
                }
            }
        };
        Some(selection)
    }
}

fn lerp(a: f64, b: f64, alpha: f64) -> f64 {
    a + (b - a) * alpha
}

/// Element-wise blend `lower + (upper - lower) * alpha`
///
/// Returns `None` for strings or when the buffers differ in type or length.
pub fn blend(lower: &ArrayData, upper: &ArrayData, alpha: f64) -> Option<ArrayData> {
    if lower.len() != upper.len() {
        return None;
    }
    match (lower, upper) {
        (ArrayData::Int32(a), ArrayData::Int32(b)) => Some(ArrayData::Int32(
            a.iter()
                .zip(b)
                .map(|(&x, &y)| lerp(x as f64, y as f64, alpha).round() as i32)
                .collect(),
        )),
        (ArrayData::Float64(a), ArrayData::Float64(b)) => Some(ArrayData::Float64(
            a.iter().zip(b).map(|(&x, &y)| lerp(x, y, alpha)).collect(),
        )),
        (ArrayData::Complex128(a), ArrayData::Complex128(b)) => Some(ArrayData::Complex128(
            a.iter()
                .zip(b)
                .map(|(x, y)| Complex64::new(lerp(x.re, y.re, alpha), lerp(x.im, y.im, alpha)))
                .collect(),
        )),
        _ => None,
    }
}
