//! Process self-monitoring: atomic counters and min/avg/max aggregators,
//! rotated every minute and re-ingested through the daemon's own write
//! path as `carbon.carbon-daemons.{host}.carbon-storage-go.*` metrics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::mq::MetricReading;

const LOG: &str = "carbond::audit";

const ROTATION_PERIOD: Duration = Duration::from_secs(60);
/// Grace period before a rotated snapshot is emitted, letting in-flight
/// increments land on the new instance first.
const SETTLE_DELAY: Duration = Duration::from_secs(10);

static METRIC_PREFIX: Lazy<String> = Lazy::new(|| {
    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string());
    format!("carbon.carbon-daemons.{}.carbon-storage-go.", hostname.replace('.', "_"))
});

/// Running min/avg/max over u32 samples. Approximate under concurrency by
/// design; the atomics only keep the fields from tearing.
#[derive(Debug)]
pub struct MinAvgMax {
    min: AtomicU32,
    max: AtomicU32,
    total: AtomicU64,
    n: AtomicU32,
}

impl Default for MinAvgMax {
    fn default() -> Self {
        Self {
            min: AtomicU32::new(u32::MAX),
            max: AtomicU32::new(0),
            total: AtomicU64::new(0),
            n: AtomicU32::new(0),
        }
    }
}

impl MinAvgMax {
    pub fn record(&self, val: u32) {
        self.n.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(val as u64, Ordering::Relaxed);
        self.min.fetch_min(val, Ordering::Relaxed);
        self.max.fetch_max(val, Ordering::Relaxed);
    }

    pub fn samples(&self) -> u32 {
        self.n.load(Ordering::Relaxed)
    }

    fn write_instance(&self, sink: &Sender<MetricReading>, prefix: &str, ts: u64) {
        let n = self.n.load(Ordering::Relaxed);
        if n != 0 {
            emit(sink, &format!("{}min", prefix), self.min.load(Ordering::Relaxed) as f64, ts);
            emit(sink, &format!("{}max", prefix), self.max.load(Ordering::Relaxed) as f64, ts);
        }
        emit(sink, &format!("{}total", prefix), n as f64, ts);
        let avg = if n != 0 {
            self.total.load(Ordering::Relaxed) as f64 / n as f64
        } else {
            0.0
        };
        emit(sink, &format!("{}avg", prefix), avg, ts);
    }
}

#[derive(Debug, Default)]
pub struct WriterStats {
    pub write_microseconds: MinAvgMax,
    pub create_microseconds: MinAvgMax,
    pub datapoints_per_write: MinAvgMax,

    pub cache_full_events: AtomicU32,
    pub create_ratelimit_exceeded: AtomicU32,
    pub datapoints_written: AtomicU32,
    pub metric_create_errors: AtomicU32,
    pub metrics_created: AtomicU32,
    pub write_errors: AtomicU32,
    pub write_operations: AtomicU32,
    pub write_ratelimit_exceeded: AtomicU32,
}

impl WriterStats {
    fn write_instance(&self, sink: &Sender<MetricReading>, prefix: &str, ts: u64) {
        self.write_microseconds.write_instance(sink, &format!("{}write_microseconds.", prefix), ts);
        self.create_microseconds.write_instance(sink, &format!("{}create_microseconds.", prefix), ts);
        self.datapoints_per_write.write_instance(sink, &format!("{}datapoints_per_write.", prefix), ts);

        emit32(sink, prefix, "cache_full_events", &self.cache_full_events, ts);
        emit32(sink, prefix, "create_ratelimit_exceeded", &self.create_ratelimit_exceeded, ts);
        emit32(sink, prefix, "datapoints_written", &self.datapoints_written, ts);
        emit32(sink, prefix, "metric_create_errors", &self.metric_create_errors, ts);
        emit32(sink, prefix, "metrics_created", &self.metrics_created, ts);
        emit32(sink, prefix, "write_errors", &self.write_errors, ts);
        emit32(sink, prefix, "write_operations", &self.write_operations, ts);
        emit32(sink, prefix, "write_ratelimit_exceeded", &self.write_ratelimit_exceeded, ts);
    }
}

#[derive(Debug, Default)]
pub struct CarbonStats {
    pub writer: WriterStats,
    pub metrics_received: AtomicU32,
    pub garbled_reception: AtomicU32,
}

impl CarbonStats {
    /// Emit this (rotated-out) instance as readings on the audit stream.
    fn write_instance(&self, sink: &Sender<MetricReading>, ts: u64, queue_depth: usize) {
        let prefix = METRIC_PREFIX.as_str();
        debug!(target: LOG,
            "snapshot ts={} received={} garbled={} written={}",
            ts,
            self.metrics_received.load(Ordering::Relaxed),
            self.garbled_reception.load(Ordering::Relaxed),
            self.writer.datapoints_written.load(Ordering::Relaxed),
        );
        emit32(sink, prefix, "metrics_received", &self.metrics_received, ts);
        emit32(sink, prefix, "garbled_reception", &self.garbled_reception, ts);
        self.writer.write_instance(sink, &format!("{}writer.", prefix), ts);
        emit(sink, &format!("{}writer.cached_datapoints", prefix), queue_depth as f64, ts);
    }
}

/// Callback reporting the combined depth of the storage pipeline queues.
pub type QueueDepths = Arc<dyn Fn() -> usize + Send + Sync>;

/// Handle to the live stats instance. Increments always land on the current
/// instance; the rotation swaps in a fresh zeroed one.
#[derive(Clone)]
pub struct Audit {
    current: Arc<RwLock<Arc<CarbonStats>>>,
}

impl Default for Audit {
    fn default() -> Self {
        Self::new()
    }
}

impl Audit {
    pub fn new() -> Self {
        Self { current: Arc::new(RwLock::new(Arc::new(CarbonStats::default()))) }
    }

    pub fn current(&self) -> Arc<CarbonStats> {
        self.current.read().clone()
    }

    /// Start the once-a-minute rotation. The rotated snapshot is emitted on
    /// the audit stream after a settling delay.
    pub fn start(&self, sink: Sender<MetricReading>, depths: QueueDepths) {
        let audit = self.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(ROTATION_PERIOD);
            audit.rotate(&sink, &depths);
        });
    }

    fn rotate(&self, sink: &Sender<MetricReading>, depths: &QueueDepths) {
        let snapshot = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, Arc::new(CarbonStats::default()))
        };
        let ts = unix_now();
        let sink = sink.clone();
        let depths = Arc::clone(depths);
        std::thread::spawn(move || {
            std::thread::sleep(SETTLE_DELAY);
            snapshot.write_instance(&sink, ts, depths());
        });
    }
}

fn emit32(sink: &Sender<MetricReading>, prefix: &str, name: &str, val: &AtomicU32, ts: u64) {
    emit(sink, &format!("{}{}", prefix, name), val.load(Ordering::Relaxed) as f64, ts);
}

/// Self-metrics block on a full audit stream rather than drop.
fn emit(sink: &Sender<MetricReading>, metric: &str, value: f64, time: u64) {
    let _ = sink.send(MetricReading { metric: metric.to_string(), value, time });
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::collections::HashMap;

    #[test]
    fn min_avg_max_tracks_samples() {
        let agg = MinAvgMax::default();
        for v in [5u32, 1, 9, 3] {
            agg.record(v);
        }
        assert_eq!(agg.samples(), 4);
        assert_eq!(agg.min.load(Ordering::Relaxed), 1);
        assert_eq!(agg.max.load(Ordering::Relaxed), 9);
        assert_eq!(agg.total.load(Ordering::Relaxed), 18);
    }

    #[test]
    fn rotation_swaps_in_fresh_instance() {
        let audit = Audit::new();
        audit.current().metrics_received.fetch_add(7, Ordering::Relaxed);
        let (tx, _rx) = unbounded();
        let depths: QueueDepths = Arc::new(|| 0);
        audit.rotate(&tx, &depths);
        assert_eq!(audit.current().metrics_received.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn snapshot_emission_shape() {
        let stats = CarbonStats::default();
        stats.metrics_received.fetch_add(3, Ordering::Relaxed);
        stats.writer.datapoints_written.fetch_add(2, Ordering::Relaxed);
        stats.writer.write_microseconds.record(10);
        stats.writer.write_microseconds.record(30);

        let (tx, rx) = unbounded();
        stats.write_instance(&tx, 1234, 5);
        drop(tx);

        let mut seen: HashMap<String, f64> = HashMap::new();
        while let Ok(reading) = rx.recv() {
            assert_eq!(reading.time, 1234);
            assert!(reading.metric.starts_with(METRIC_PREFIX.as_str()), "bad name {}", reading.metric);
            let suffix = reading.metric[METRIC_PREFIX.len()..].to_string();
            seen.insert(suffix, reading.value);
        }

        assert_eq!(seen["metrics_received"], 3.0);
        assert_eq!(seen["garbled_reception"], 0.0);
        assert_eq!(seen["writer.datapoints_written"], 2.0);
        assert_eq!(seen["writer.write_microseconds.min"], 10.0);
        assert_eq!(seen["writer.write_microseconds.max"], 30.0);
        assert_eq!(seen["writer.write_microseconds.total"], 2.0);
        assert_eq!(seen["writer.write_microseconds.avg"], 20.0);
        // empty aggregators skip min/max and emit zero total/avg
        assert!(!seen.contains_key("writer.create_microseconds.min"));
        assert_eq!(seen["writer.create_microseconds.total"], 0.0);
        assert_eq!(seen["writer.create_microseconds.avg"], 0.0);
        assert_eq!(seen["writer.cached_datapoints"], 5.0);
    }

    #[test]
    fn prefix_replaces_dots_in_hostname() {
        assert!(METRIC_PREFIX.starts_with("carbon.carbon-daemons."));
        assert!(METRIC_PREFIX.ends_with(".carbon-storage-go."));
        let host_part = &METRIC_PREFIX["carbon.carbon-daemons.".len()..METRIC_PREFIX.len() - ".carbon-storage-go.".len()];
        assert!(!host_part.contains('.'));
    }
}
