//! Metric emission surface.
//!
//! The core calls a generic sink passed in by the embedder; no
//! singletons. The tracing-backed sink emits structured events under
//! `target: "metrics"`; the noop sink is for embedders that do their own
//! counting; the test sink captures emissions for assertions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A named monotonic counter handle.
#[derive(Clone)]
pub struct Counter {
    name: &'static str,
    sink: Arc<dyn MetricSink>,
}

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, delta: u64) {
        self.sink.record_counter(self.name, delta);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A named duration-observation handle.
#[derive(Clone)]
pub struct Timer {
    name: &'static str,
    sink: Arc<dyn MetricSink>,
}

impl Timer {
    pub fn observe(&self, duration: Duration) {
        self.sink.record_duration(self.name, duration);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The sink contract: hand out counter/timer handles bound to a name.
pub trait MetricSink: Send + Sync {
    fn record_counter(&self, name: &'static str, delta: u64);
    fn record_duration(&self, name: &'static str, duration: Duration);
}

/// Handle constructors shared by every sink.
pub trait MetricSinkExt {
    fn counter(&self, name: &'static str) -> Counter;
    fn timer(&self, name: &'static str) -> Timer;
}

impl MetricSinkExt for Arc<dyn MetricSink> {
    fn counter(&self, name: &'static str) -> Counter {
        Counter {
            name,
            sink: Arc::clone(self),
        }
    }

    fn timer(&self, name: &'static str) -> Timer {
        Timer {
            name,
            sink: Arc::clone(self),
        }
    }
}

/// Emits metrics as structured tracing events.
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record_counter(&self, name: &'static str, delta: u64) {
        tracing::info!(target: "metrics", metric = name, delta, "counter");
    }

    fn record_duration(&self, name: &'static str, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(target: "metrics", metric = name, ms, "duration");
    }
}

/// Discards everything.
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn record_counter(&self, _name: &'static str, _delta: u64) {}

    fn record_duration(&self, _name: &'static str, _duration: Duration) {}
}

/// Captures counter totals and duration observation counts.
#[derive(Default)]
pub struct TestSink {
    counters: Mutex<BTreeMap<&'static str, u64>>,
    durations: Mutex<BTreeMap<&'static str, u64>>,
    total_emissions: AtomicU64,
}

impl TestSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        *self
            .counters
            .lock()
            .expect("test sink lock poisoned")
            .get(name)
            .unwrap_or(&0)
    }

    pub fn duration_count(&self, name: &str) -> u64 {
        *self
            .durations
            .lock()
            .expect("test sink lock poisoned")
            .get(name)
            .unwrap_or(&0)
    }

    pub fn total_emissions(&self) -> u64 {
        self.total_emissions.load(Ordering::Relaxed)
    }
}

impl MetricSink for TestSink {
    fn record_counter(&self, name: &'static str, delta: u64) {
        *self
            .counters
            .lock()
            .expect("test sink lock poisoned")
            .entry(name)
            .or_insert(0) += delta;
        self.total_emissions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, name: &'static str, _duration: Duration) {
        *self
            .durations
            .lock()
            .expect("test sink lock poisoned")
            .entry(name)
            .or_insert(0) += 1;
        self.total_emissions.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn noop() -> Arc<dyn MetricSink> {
    Arc::new(NoopSink)
}

pub fn tracing_sink() -> Arc<dyn MetricSink> {
    Arc::new(TracingSink)
}
