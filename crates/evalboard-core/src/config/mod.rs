use crate::errors::{EngineError, EngineResult};
use evalboard_metrics::MetricsOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Step data younger than this is served from cache without a refetch.
    pub stale_after_ms: u64,

    /// Number of distinct colours handed out to compared runs.
    pub palette_size: usize,

    /// Default radar axis max is the run-wide max times this factor.
    pub radar_headroom: f64,

    pub histogram_bins: usize,

    /// Percentiles (0..=100) computed for numeric metrics.
    pub percentiles: Vec<f64>,

    /// Cap on concurrent scenario fetches during a metrics refresh.
    pub max_concurrent_fetches: usize,

    /// Push per-scenario metric entries alongside confirmed steps.
    pub push_metrics: bool,

    /// Invocation step key used when a scenario has none yet.
    pub default_invocation_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let metrics = MetricsOptions::default();
        Self {
            stale_after_ms: 30_000,
            palette_size: 10,
            radar_headroom: 1.2,
            histogram_bins: metrics.histogram_bins,
            percentiles: metrics.percentiles,
            max_concurrent_fetches: 6,
            push_metrics: true,
            default_invocation_key: "default".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> EngineResult<Self> {
        let cfg: Self = serde_yaml::from_str(raw)
            .map_err(|e| EngineError::config(format!("invalid engine config: {}", e)))?;
        cfg.validate().map_err(EngineError::config)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.palette_size == 0 {
            return Err("palette_size must be at least 1".to_string());
        }
        if !self.radar_headroom.is_finite() || self.radar_headroom < 1.0 {
            return Err(format!(
                "radar_headroom must be >= 1.0, got {}",
                self.radar_headroom
            ));
        }
        if self.histogram_bins == 0 {
            return Err("histogram_bins must be at least 1".to_string());
        }
        if let Some(p) = self
            .percentiles
            .iter()
            .find(|p| !(0.0..=100.0).contains(*p))
        {
            return Err(format!("percentile {} is outside 0..=100", p));
        }
        if self.max_concurrent_fetches == 0 {
            return Err("max_concurrent_fetches must be at least 1".to_string());
        }
        if self.default_invocation_key.is_empty() || self.default_invocation_key.contains('.') {
            return Err(
                "default_invocation_key must be non-empty and must not contain '.'".to_string(),
            );
        }
        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn metrics_options(&self) -> MetricsOptions {
        MetricsOptions {
            histogram_bins: self.histogram_bins,
            percentiles: self.percentiles.clone(),
        }
    }
}
