//! The reading type that flows through the daemon, and the bundle of queues
//! connecting the listener to the storage dispatchers.

use crossbeam_channel::{bounded, Receiver, Sender};

pub const AUDIT_STREAM_DEPTH: usize = 10_000;
pub const CREATE_OFFLOAD_DEPTH: usize = 1_000_000;

/// A single `(metric, value, timestamp)` tuple as received off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReading {
    pub metric: String,
    pub value: f64,
    /// Unix seconds.
    pub time: u64,
}

/// The three queues of the write path.
///
/// `main` carries readings from listener sessions, `audit_stream` carries
/// the daemon's own periodic self-metrics, and `create_offload` defers
/// expensive metric creation off the hot write path. All three are MPMC;
/// both ends are kept so consumers can be attached after construction and
/// queue depths can be observed for self-monitoring.
#[derive(Clone)]
pub struct StoragePipeline {
    pub main_tx: Sender<MetricReading>,
    pub main_rx: Receiver<MetricReading>,
    pub audit_tx: Sender<MetricReading>,
    pub audit_rx: Receiver<MetricReading>,
    pub offload_tx: Sender<MetricReading>,
    pub offload_rx: Receiver<MetricReading>,
}

impl StoragePipeline {
    pub fn new(backlog: usize) -> Self {
        let (main_tx, main_rx) = bounded(backlog);
        let (audit_tx, audit_rx) = bounded(AUDIT_STREAM_DEPTH);
        let (offload_tx, offload_rx) = bounded(CREATE_OFFLOAD_DEPTH);
        Self { main_tx, main_rx, audit_tx, audit_rx, offload_tx, offload_rx }
    }

    /// Summed depth of all three queues, reported as `cached_datapoints`.
    pub fn cached_datapoints(&self) -> usize {
        self.main_rx.len() + self.audit_rx.len() + self.offload_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_counts_all_queues() {
        let p = StoragePipeline::new(4);
        let r = MetricReading { metric: "a.b".into(), value: 1.0, time: 60 };
        p.main_tx.send(r.clone()).unwrap();
        p.main_tx.send(r.clone()).unwrap();
        p.audit_tx.send(r.clone()).unwrap();
        p.offload_tx.send(r).unwrap();
        assert_eq!(p.cached_datapoints(), 4);
        p.main_rx.recv().unwrap();
        assert_eq!(p.cached_datapoints(), 3);
    }

    #[test]
    fn main_queue_is_bounded() {
        let p = StoragePipeline::new(1);
        let r = MetricReading { metric: "a".into(), value: 0.0, time: 0 };
        assert!(p.main_tx.try_send(r.clone()).is_ok());
        assert!(p.main_tx.try_send(r).is_err());
    }
}
