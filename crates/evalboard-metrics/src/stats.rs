//! Numeric helpers. Inputs are assumed finite; callers filter NaN/inf.

use crate::model::DistributionBin;

/// Linear-interpolated percentile over an ascending slice. `p` is 0..=100.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let weight = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}

/// Label used for a percentile in the serialized map (`p50`, `p2.5`).
pub fn percentile_label(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("p{}", p as u64)
    } else {
        format!("p{}", p)
    }
}

/// Equal-width histogram between min and max of `values`.
pub fn histogram(values: &[f64], bins: usize) -> Vec<DistributionBin> {
    if values.is_empty() || bins == 0 {
        return Vec::new();
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if min == max {
        return vec![DistributionBin {
            start: min,
            end: max,
            count: values.len() as u64,
        }];
    }

    let width = (max - min) / bins as f64;
    let mut out: Vec<DistributionBin> = (0..bins)
        .map(|i| DistributionBin {
            start: min + width * i as f64,
            end: if i + 1 == bins {
                max
            } else {
                min + width * (i + 1) as f64
            },
            count: 0,
        })
        .collect();

    for v in values {
        let idx = (((v - min) / width).floor() as usize).min(bins - 1);
        out[idx].count += 1;
    }
    out
}
