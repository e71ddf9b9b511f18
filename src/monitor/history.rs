//! Bounded in-memory metrics history
//!
//! Keeps a short rolling window of numeric samples per resource and metric,
//! capped both by point count and by age, whichever is tighter. Memory-only;
//! reads return fresh vectors filtered to the requested window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::MetricPoint;

type MetricMap = HashMap<String, HashMap<String, Vec<MetricPoint>>>;

#[derive(Default)]
struct HistoryInner {
    guests: MetricMap,
    nodes: MetricMap,
    storage: MetricMap,
}

/// Rolling metric history for guests, nodes and storage
pub struct MetricsHistory {
    inner: Mutex<HistoryInner>,
    max_points: usize,
    retention: Duration,
}

impl MetricsHistory {
    pub fn new(max_points: usize, retention: Duration) -> Self {
        Self {
            inner: Mutex::new(HistoryInner::default()),
            max_points,
            retention,
        }
    }

    pub fn add_guest_metric(
        &self,
        guest_id: &str,
        metric: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        let series = series_mut(&mut inner.guests, guest_id, metric);
        push_point(series, value, timestamp, self.max_points, self.retention);
    }

    pub fn add_node_metric(
        &self,
        node_id: &str,
        metric: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        let series = series_mut(&mut inner.nodes, node_id, metric);
        push_point(series, value, timestamp, self.max_points, self.retention);
    }

    pub fn add_storage_metric(
        &self,
        storage_id: &str,
        metric: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        let series = series_mut(&mut inner.storage, storage_id, metric);
        push_point(series, value, timestamp, self.max_points, self.retention);
    }

    /// All metric series for a guest, filtered to `window`
    pub fn guest_metrics(&self, guest_id: &str, window: Duration) -> HashMap<String, Vec<MetricPoint>> {
        let inner = self.inner.lock().expect("history lock poisoned");
        collect_all(&inner.guests, guest_id, window)
    }

    /// One metric series for a node, filtered to `window`
    pub fn node_metrics(&self, node_id: &str, metric: &str, window: Duration) -> Vec<MetricPoint> {
        let inner = self.inner.lock().expect("history lock poisoned");
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        inner
            .nodes
            .get(node_id)
            .and_then(|metrics| metrics.get(metric))
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp > cutoff)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All metric series for a storage pool, filtered to `window`
    pub fn storage_metrics(
        &self,
        storage_id: &str,
        window: Duration,
    ) -> HashMap<String, Vec<MetricPoint>> {
        let inner = self.inner.lock().expect("history lock poisoned");
        collect_all(&inner.storage, storage_id, window)
    }
}

fn series_mut<'a>(map: &'a mut MetricMap, id: &str, metric: &str) -> &'a mut Vec<MetricPoint> {
    map.entry(id.to_string())
        .or_default()
        .entry(metric.to_string())
        .or_default()
}

fn push_point(
    series: &mut Vec<MetricPoint>,
    value: f64,
    timestamp: DateTime<Utc>,
    max_points: usize,
    retention: Duration,
) {
    series.push(MetricPoint { timestamp, value });

    let cutoff = timestamp - chrono::Duration::from_std(retention).unwrap_or_default();
    series.retain(|p| p.timestamp > cutoff);

    if series.len() > max_points {
        let excess = series.len() - max_points;
        series.drain(..excess);
    }
}

fn collect_all(map: &MetricMap, id: &str, window: Duration) -> HashMap<String, Vec<MetricPoint>> {
    let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
    map.get(id)
        .map(|metrics| {
            metrics
                .iter()
                .map(|(name, points)| {
                    let filtered = points
                        .iter()
                        .filter(|p| p.timestamp > cutoff)
                        .copied()
                        .collect();
                    (name.clone(), filtered)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_are_capped_by_count() {
        let history = MetricsHistory::new(3, Duration::from_secs(86400));
        let now = Utc::now();
        for i in 0..5 {
            history.add_guest_metric("g1", "cpu", i as f64, now + chrono::Duration::seconds(i));
        }

        let metrics = history.guest_metrics("g1", Duration::from_secs(86400));
        let cpu = &metrics["cpu"];
        assert_eq!(cpu.len(), 3);
        // Oldest points were discarded
        assert_eq!(cpu[0].value, 2.0);
        assert_eq!(cpu[2].value, 4.0);
    }

    #[test]
    fn points_are_capped_by_retention() {
        let history = MetricsHistory::new(1000, Duration::from_secs(60));
        let now = Utc::now();
        history.add_guest_metric("g1", "memory", 1.0, now - chrono::Duration::seconds(120));
        history.add_guest_metric("g1", "memory", 2.0, now);

        let metrics = history.guest_metrics("g1", Duration::from_secs(3600));
        assert_eq!(metrics["memory"].len(), 1);
        assert_eq!(metrics["memory"][0].value, 2.0);
    }

    #[test]
    fn reads_filter_by_window() {
        let history = MetricsHistory::new(1000, Duration::from_secs(86400));
        let now = Utc::now();
        history.add_node_metric("n1", "cpu", 1.0, now - chrono::Duration::seconds(3000));
        history.add_node_metric("n1", "cpu", 2.0, now - chrono::Duration::seconds(10));

        let recent = history.node_metrics("n1", "cpu", Duration::from_secs(60));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].value, 2.0);

        let all = history.node_metrics("n1", "cpu", Duration::from_secs(7200));
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn unknown_resource_returns_empty() {
        let history = MetricsHistory::new(10, Duration::from_secs(60));
        assert!(history.guest_metrics("missing", Duration::from_secs(60)).is_empty());
        assert!(history
            .node_metrics("missing", "cpu", Duration::from_secs(60))
            .is_empty());
    }

    #[test]
    fn storage_series_are_independent_per_metric() {
        let history = MetricsHistory::new(10, Duration::from_secs(3600));
        let now = Utc::now();
        history.add_storage_metric("s1", "usage", 42.0, now);
        history.add_storage_metric("s1", "used", 1024.0, now);

        let metrics = history.storage_metrics("s1", Duration::from_secs(3600));
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["usage"][0].value, 42.0);
        assert_eq!(metrics["used"][0].value, 1024.0);
    }
}
