use crate::metrics_cache::RunMetrics;
use evalboard_metrics::{true_percentage, MetricShape};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct RadarAxis {
    pub key: String,
    pub raw: f64,
    /// Explicit axis max. `None` uses the run-wide default.
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadarPoint {
    pub key: String,
    pub raw: f64,
    pub axis_max: f64,
    /// 0..=100
    pub normalized: f64,
}

/// `clamp(raw / axis_max, 0, 1) * 100`. The default axis max is the largest
/// raw value across all axes times `headroom`.
pub fn normalize_axes(axes: &[RadarAxis], headroom: f64) -> Vec<RadarPoint> {
    let run_max = axes
        .iter()
        .map(|a| a.raw)
        .filter(|v| v.is_finite())
        .fold(0.0_f64, f64::max);
    let default_max = run_max * headroom;

    axes.iter()
        .map(|axis| {
            let axis_max = axis.max.filter(|m| *m > 0.0).unwrap_or(default_max);
            let normalized = if axis_max > 0.0 && axis.raw.is_finite() {
                (axis.raw / axis_max).clamp(0.0, 1.0) * 100.0
            } else {
                0.0
            };
            RadarPoint {
                key: axis.key.clone(),
                raw: axis.raw,
                axis_max,
                normalized,
            }
        })
        .collect()
}

/// Numeric metrics contribute their mean; boolean metrics their true share
/// on a fixed 0..1 axis. Categorical metrics have no radar axis.
pub fn axes_from_metrics(metrics: &RunMetrics, overrides: &BTreeMap<String, f64>) -> Vec<RadarAxis> {
    metrics
        .iter()
        .filter(|(_, m)| m.count > 0)
        .filter_map(|(key, m)| {
            let (raw, implicit_max) = match m.shape {
                MetricShape::Numeric => (m.mean()?, None),
                MetricShape::Boolean => (true_percentage(m) / 100.0, Some(1.0)),
                MetricShape::Categorical => return None,
            };
            Some(RadarAxis {
                key: key.clone(),
                raw,
                max: overrides.get(key).copied().or(implicit_max),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(key: &str, raw: f64, max: Option<f64>) -> RadarAxis {
        RadarAxis {
            key: key.into(),
            raw,
            max,
        }
    }

    #[test]
    fn default_max_is_run_max_with_headroom() {
        let points = normalize_axes(&[axis("a", 10.0, None), axis("b", 5.0, None)], 1.2);
        assert!((points[0].axis_max - 12.0).abs() < 1e-9);
        assert!((points[0].normalized - 100.0 / 1.2).abs() < 1e-9);
        assert!((points[1].normalized - 50.0 / 1.2).abs() < 1e-9);
    }

    #[test]
    fn explicit_max_overrides_and_clamps() {
        let points = normalize_axes(&[axis("a", 3.0, Some(2.0)), axis("b", -1.0, Some(2.0))], 1.2);
        assert_eq!(points[0].normalized, 100.0);
        assert_eq!(points[1].normalized, 0.0);
    }

    #[test]
    fn all_zero_axes_normalize_to_zero() {
        let points = normalize_axes(&[axis("a", 0.0, None)], 1.2);
        assert_eq!(points[0].normalized, 0.0);
    }

    #[test]
    fn boolean_metrics_use_unit_axis() {
        let outputs = vec![
            evalboard_metrics::ScenarioOutput::new("s1")
                .with("exact_match.success", serde_json::json!(true))
                .with("duration", serde_json::json!(300.0)),
            evalboard_metrics::ScenarioOutput::new("s2")
                .with("exact_match.success", serde_json::json!(false))
                .with("duration", serde_json::json!(100.0)),
        ];
        let metrics = evalboard_metrics::compute_run_metrics(&outputs, &Default::default());
        let axes = axes_from_metrics(&metrics, &BTreeMap::from([("duration".to_string(), 400.0)]));
        let points = normalize_axes(&axes, 1.2);

        let duration = points.iter().find(|p| p.key == "duration").unwrap();
        assert_eq!(duration.normalized, 50.0);
        let success = points.iter().find(|p| p.key == "exact_match.success").unwrap();
        assert_eq!(success.normalized, 50.0);
    }
}
