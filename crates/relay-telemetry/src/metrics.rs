use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

/// Metric names used across the relay.
pub mod names {
    /// Admitted websocket connections (counter).
    pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
    /// Currently admitted websocket connections (gauge).
    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
    /// Connections closed for presenting a bad token (counter).
    pub const WS_AUTH_DENIED_TOTAL: &str = "ws_auth_denied_total";
    /// Successfully parsed inbound messages (counter).
    pub const MESSAGES_RECEIVED_TOTAL: &str = "messages_received_total";
    /// Inbound frames discarded as unparseable (counter).
    pub const MESSAGES_MALFORMED_TOTAL: &str = "messages_malformed_total";
    /// Inserts/rebinds rejected because the key was taken (counter).
    pub const REGISTRY_KEY_CONFLICTS_TOTAL: &str = "registry_key_conflicts_total";
    /// Forwards handed to a detached task (counter).
    pub const FORWARD_DISPATCHED_TOTAL: &str = "forward_dispatched_total";
    /// Forwards answered with a 2xx (counter).
    pub const FORWARD_DELIVERED_TOTAL: &str = "forward_delivered_total";
    /// Forwards that failed (counter, labels: kind).
    pub const FORWARD_FAILED_TOTAL: &str = "forward_failed_total";
    /// Messages not forwarded because the bot was not yet identified (counter).
    pub const FORWARD_SKIPPED_UNRESOLVED_TOTAL: &str = "forward_skipped_unresolved_total";
    /// Outbound webhook requests in progress (gauge).
    pub const FORWARD_IN_FLIGHT: &str = "forward_in_flight";
    /// Outbound webhook request duration (histogram).
    pub const FORWARD_DURATION_SECONDS: &str = "forward_duration_seconds";
    /// Every reported relay error (counter, labels: kind).
    pub const RELAY_ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Observations kept per histogram; older ones are discarded first.
const MAX_OBSERVATIONS: usize = 4096;

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Can go up or down.
struct Gauge {
    // f64 bits, so the value can be updated with a CAS loop
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0f64.to_bits() as i64),
        }
    }
    fn increment(&self, delta: f64) {
        loop {
            let current = self.value.load(Ordering::Relaxed);
            let next = f64::from_bits(current as u64) + delta;
            if self
                .value
                .compare_exchange_weak(
                    current,
                    next.to_bits() as i64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// In-memory histogram over the most recent observations.
struct Histogram {
    observations: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::new()),
        }
    }
    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == MAX_OBSERVATIONS {
            obs.pop_front();
        }
        obs.push_back(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let p50 = sorted[count / 2];
        let p95 = sorted[((count as f64 * 0.95) as usize).min(count - 1)];
        let p99 = sorted[((count as f64 * 0.99) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum,
            p50,
            p95,
            p99,
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.labels.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, (k, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}=\"{v}\"")?;
        }
        f.write_str("}")
    }
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        {
            let counters = self.counters.read();
            if let Some(c) = counters.get(&key) {
                c.increment(n);
                return;
            }
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = MetricKey::new(name, labels);
        {
            let gauges = self.gauges.read();
            if let Some(g) = gauges.get(&key) {
                g.increment(delta);
                return;
            }
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(Gauge::new)
            .increment(delta);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        {
            let histograms = self.histograms.read();
            if let Some(h) = histograms.get(&key) {
                h.observe(value);
                return;
            }
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    /// Every counter, keyed `name` or `name{label="value",...}`.
    pub fn counters_snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(key, counter)| (key.to_string(), counter.get()))
            .collect()
    }

    /// Every gauge, keyed like [`Self::counters_snapshot`].
    pub fn gauges_snapshot(&self) -> BTreeMap<String, f64> {
        self.gauges
            .read()
            .iter()
            .map(|(key, gauge)| (key.to_string(), gauge.get()))
            .collect()
    }
}
