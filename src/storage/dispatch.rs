//! Dispatcher workers: consume readings off the ingestion queues, enforce
//! per-minute rate budgets, split create from write work, and forward to
//! the configured storage adapter.
//!
//! Ratelimit violations are deliberately not logged: the checks exist to
//! blunt load spikes, and furiously logging them would defeat the point.
//! Outcomes are recorded on the audit counters instead.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};

use crate::audit::Audit;
use crate::config::require_u64;
use crate::mq::MetricReading;

use super::{get_adapter, MetricRef, StorageAdapter};

/// Dispatcher factory bound to one initialized adapter. Cheap to clone;
/// every worker thread owns a clone.
#[derive(Clone)]
pub struct StorageCore {
    adapter: Arc<dyn StorageAdapter>,
    audit: Audit,
    max_write_rpm: u32,
    max_create_rpm: u32,
}

impl StorageCore {
    /// Resolve and initialize the configured engine. Does not start any
    /// dispatchers yet.
    pub fn build(
        storage_config: &HashMap<String, String>,
        engine_config: &HashMap<String, String>,
        audit: Audit,
    ) -> Result<Self> {
        let max_write_rpm = require_u64(storage_config, "max_write_rpm")? as u32;
        let max_create_rpm = require_u64(storage_config, "max_create_rpm")? as u32;

        let engine = storage_config.get("engine").map(String::as_str).unwrap_or_default();
        let adapter =
            get_adapter(engine).with_context(|| format!("unknown storage engine '{}'", engine))?;
        adapter.init(engine_config)?;

        Ok(Self { adapter, audit, max_write_rpm, max_create_rpm })
    }

    /// Start `concurrency` workers off a queue. Returns immediately; the
    /// workers run until the queue disconnects.
    pub fn dispatch_loop(
        &self,
        queue: Receiver<MetricReading>,
        offload: Option<Sender<MetricReading>>,
        enforce_limits: bool,
        concurrency: usize,
    ) {
        for _ in 0..concurrency {
            let core = self.clone();
            let queue = queue.clone();
            let offload = offload.clone();
            std::thread::spawn(move || {
                while let Ok(reading) = queue.recv() {
                    core.checked_write(reading, enforce_limits, offload.as_ref());
                }
            });
        }
    }

    /// The write operation for a single datapoint.
    fn checked_write(
        &self,
        reading: MetricReading,
        enforce_limits: bool,
        offload: Option<&Sender<MetricReading>>,
    ) {
        let stats = self.audit.current();

        if enforce_limits
            && stats.writer.write_operations.load(Ordering::Relaxed) > self.max_write_rpm
        {
            stats.writer.write_ratelimit_exceeded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.adapter.get_metric(&reading.metric) {
            Some(key) => self.write_postlookup(&reading, &key),
            None => match offload {
                // creation is expensive, so defer it given the chance; the
                // offload buffer is large, anything past it is shed load
                Some(tx) => {
                    let _ = tx.try_send(reading);
                }
                None => self.create_and_write(reading, enforce_limits),
            },
        }
    }

    /// Synchronous create-then-write, used where no offload queue exists
    /// (the offload consumer itself, and the audit stream).
    fn create_and_write(&self, reading: MetricReading, enforce_limits: bool) {
        let stats = self.audit.current();

        // the offload queue may hand us metrics that have since been created
        let key = match self.adapter.get_metric(&reading.metric) {
            Some(key) => key,
            None => {
                if enforce_limits
                    && stats.writer.metrics_created.load(Ordering::Relaxed) > self.max_create_rpm
                {
                    stats.writer.create_ratelimit_exceeded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let start = Instant::now();
                match self.adapter.create_metric(&reading.metric) {
                    Some(key) => {
                        stats.writer.create_microseconds.record(start.elapsed().as_micros() as u32);
                        stats.writer.metrics_created.fetch_add(1, Ordering::Relaxed);
                        key
                    }
                    None => {
                        stats.writer.metric_create_errors.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        };

        self.write_postlookup(&reading, &key);
    }

    fn write_postlookup(&self, reading: &MetricReading, key: &MetricRef) {
        let stats = self.audit.current();
        let start = Instant::now();
        if self.adapter.unchecked_write(key, reading) {
            stats.writer.write_microseconds.record(start.elapsed().as_micros() as u32);
            stats.writer.datapoints_written.fetch_add(1, Ordering::Relaxed);
            stats.writer.write_operations.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.writer.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn release(&self) {
        self.adapter.release();
    }
}
