//! Metric aggregation: running and windowed means of per-step metrics.

use crate::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Accumulates per-step scalar metrics into running averages.
///
/// When created with a set of metric names, values under any other name are
/// ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricAggregator {
    names: Option<BTreeSet<String>>,
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
    /// Size of the window for [`MetricAggregator::windowed`]; `None` disables it.
    window_size: Option<usize>,
    #[serde(skip)]
    windows: BTreeMap<String, VecDeque<f64>>,
}

impl MetricAggregator {
    /// Aggregate only the named metrics.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: Some(names.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Aggregate every metric that is reported.
    pub fn unfiltered() -> Self {
        Self::default()
    }

    /// Also keep the last `size` values of each metric.
    pub fn with_window(mut self, size: usize) -> Self {
        self.window_size = (size > 0).then_some(size);
        self
    }

    fn tracks(&self, name: &str) -> bool {
        self.names.as_ref().is_none_or(|names| names.contains(name))
    }

    /// Add one step's metrics.
    pub fn update(&mut self, metrics: &Metrics) {
        for (name, &value) in metrics {
            if !self.tracks(name) {
                continue;
            }
            *self.sums.entry(name.clone()).or_default() += value;
            *self.counts.entry(name.clone()).or_default() += 1;
            if let Some(size) = self.window_size {
                let window = self.windows.entry(name.clone()).or_default();
                window.push_back(value);
                if window.len() > size {
                    window.pop_front();
                }
            }
        }
    }

    /// Running mean (sum / count) of every metric seen so far.
    pub fn snapshot(&self) -> Metrics {
        self.sums
            .iter()
            .filter_map(|(name, sum)| {
                let count = *self.counts.get(name)?;
                (count > 0).then(|| (name.clone(), sum / count as f64))
            })
            .collect()
    }

    /// Mean over the most recent window of values. Empty when no window is configured.
    pub fn windowed(&self) -> Metrics {
        self.windows
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(name, w)| (name.clone(), w.iter().sum::<f64>() / w.len() as f64))
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
        self.counts.clear();
        self.windows.clear();
    }
}

/// Render metrics as `name=value` pairs for progress output.
pub fn format_metrics(metrics: &Metrics) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{name}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_running_mean() {
        let mut agg = MetricAggregator::new(["loss"]);
        for v in [2.0, 4.0, 6.0] {
            agg.update(&step(&[("loss", v)]));
        }
        assert_eq!(agg.snapshot(), step(&[("loss", 4.0)]));
        assert_eq!(agg.count("loss"), 3);
    }

    #[test]
    fn test_unlisted_metrics_ignored() {
        let mut agg = MetricAggregator::new(["loss"]);
        agg.update(&step(&[("loss", 1.0), ("accuracy", 0.5)]));
        assert_eq!(agg.snapshot(), step(&[("loss", 1.0)]));
        assert_eq!(agg.count("accuracy"), 0);
    }

    #[test]
    fn test_counts_are_per_metric() {
        let mut agg = MetricAggregator::unfiltered();
        agg.update(&step(&[("loss", 1.0)]));
        agg.update(&step(&[("loss", 3.0), ("accuracy", 1.0)]));
        let snap = agg.snapshot();
        assert_eq!(snap["loss"], 2.0);
        assert_eq!(snap["accuracy"], 1.0);
    }

    #[test]
    fn test_windowed_mean() {
        let mut agg = MetricAggregator::new(["loss"]).with_window(2);
        for v in [10.0, 2.0, 4.0] {
            agg.update(&step(&[("loss", v)]));
        }
        assert_eq!(agg.windowed()["loss"], 3.0);
        assert_eq!(agg.snapshot()["loss"], 16.0 / 3.0);
    }

    #[test]
    fn test_reset() {
        let mut agg = MetricAggregator::unfiltered();
        agg.update(&step(&[("loss", 1.0)]));
        agg.reset();
        assert!(agg.is_empty());
        assert!(agg.snapshot().is_empty());
    }

    #[test]
    fn test_format_metrics() {
        assert_eq!(
            format_metrics(&step(&[("loss", 0.5), ("accuracy", 1.0)])),
            "accuracy=1.0000 loss=0.5000"
        );
    }
}
