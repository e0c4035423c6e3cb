use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram; older ones are discarded.
const HISTOGRAM_WINDOW: usize = 4096;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric series, as served by `/metrics`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<HistogramSummary>,
}

/// Percentiles over the retained window. `count` is lifetime.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct Counter(AtomicU64);

/// f64 stored as raw bits.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct Histogram {
    window: Mutex<VecDeque<f64>>,
    seen: AtomicU64,
}

impl Histogram {
    fn observe(&self, value: f64) {
        let mut window = self.window.lock();
        if window.len() == HISTOGRAM_WINDOW {
            let _ = window.pop_front();
        }
        window.push_back(value);
        let _ = self.seen.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.window.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(f64::total_cmp);
        let rank = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)];
        HistogramSummary {
            count: self.seen.load(Ordering::Relaxed),
            sum: sorted.iter().sum(),
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

/// Series identity: metric name plus labels sorted by key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

/// All series of one metric kind. Updates to an existing series only take the
/// read lock.
struct Family<T> {
    series: RwLock<HashMap<SeriesKey, T>>,
}

impl<T: Default> Family<T> {
    fn update(&self, key: SeriesKey, f: impl FnOnce(&T)) {
        if let Some(series) = self.series.read().get(&key) {
            f(series);
            return;
        }
        f(self.series.write().entry(key).or_default());
    }

    fn read<R>(&self, key: &SeriesKey, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.series.read().get(key).map(f)
    }

    fn collect(
        &self,
        kind: MetricType,
        timestamp: &str,
        value: impl Fn(&T) -> (f64, Option<HistogramSummary>),
        out: &mut Vec<MetricsSnapshot>,
    ) {
        for (key, series) in self.series.read().iter() {
            let (value, summary) = value(series);
            out.push(MetricsSnapshot {
                timestamp: timestamp.to_owned(),
                name: key.name.clone(),
                value,
                labels: key.labels.iter().cloned().collect(),
                metric_type: kind.clone(),
                summary,
            });
        }
    }
}

impl<T> Default for Family<T> {
    fn default() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.update(SeriesKey::new(name, labels), |c| {
            let _ = c.0.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .update(SeriesKey::new(name, labels), |g| g.set(value));
    }

    /// Add `delta` (may be negative) to a gauge.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.gauges
            .update(SeriesKey::new(name, labels), |g| g.add(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .update(SeriesKey::new(name, labels), |h| h.observe(value));
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read(&SeriesKey::new(name, labels), Histogram::summary)
            .unwrap_or_default()
    }

    /// Current counter value; 0 for a series never touched.
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read(&SeriesKey::new(name, labels), |c| c.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read(&SeriesKey::new(name, labels), Gauge::get)
            .unwrap_or(0.0)
    }

    /// Every series, sorted by name then labels. Histograms report p50 as
    /// their value.
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let now = Utc::now().to_rfc3339();
        let mut out = Vec::new();
        self.counters.collect(
            MetricType::Counter,
            &now,
            |c| (c.0.load(Ordering::Relaxed) as f64, None),
            &mut out,
        );
        self.gauges
            .collect(MetricType::Gauge, &now, |g| (g.get(), None), &mut out);
        self.histograms.collect(
            MetricType::Histogram,
            &now,
            |h| {
                let summary = h.summary();
                (summary.p50, Some(summary))
            },
            &mut out,
        );
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}
