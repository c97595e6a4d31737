//! Unified view across the per-day data shards.
//!
//! The partitioning technique is never revealed to callers: writes are
//! routed by timestamp to the UTC-day shard, scans fan out over every
//! candidate day and concatenate the partial results in chronological
//! order. The federator also houses the metric index needed by both paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::optional_u64;
use crate::error::{StorageError, StorageResult};
use crate::mq::MetricReading;

use super::index::{DirectoryIndex, MetricIndex};
use super::shard::{Datapoint, Shard, ShardConfig};

const LOG: &str = "carbond::federator";

/// Exceeding this resident count evicts the whole working set.
pub const MAX_OPEN_SHARDS: usize = 23;

#[derive(Debug, Clone)]
pub struct LevelTsdConfig {
    pub base_dir: PathBuf,
    pub shard: ShardConfig,
}

/// Translate the `[storage-engine]` section into engine configuration,
/// falling back to shard defaults for absent keys.
pub fn parse_engine_config(config: &HashMap<String, String>) -> Result<LevelTsdConfig> {
    let base_dir = PathBuf::from(config.get("root").map(String::as_str).unwrap_or_default());
    let mut shard = ShardConfig::default();
    if let Some(v) = optional_u64(config, "write-batch-count")? {
        shard.write_batch_size = v as usize;
    }
    if let Some(v) = optional_u64(config, "write-batch-interval-seconds")? {
        shard.write_batch_fill_timeout = Duration::from_secs(v);
    }
    if let Some(v) = optional_u64(config, "write-concurrency")? {
        shard.write_concurrency = v as usize;
    }
    if let Some(v) = optional_u64(config, "memory-cache")? {
        shard.data_cache_bytes = v << 20;
    }
    Ok(LevelTsdConfig { base_dir, shard })
}

pub struct LevelFederator {
    idx: DirectoryIndex,
    config: LevelTsdConfig,
    shards: RwLock<HashMap<String, Arc<Shard>>>,
    released: AtomicBool,
    query_id: AtomicU32,
}

impl LevelFederator {
    pub fn open(config: LevelTsdConfig) -> Result<Self> {
        let root = &config.base_dir;
        let stat = std::fs::metadata(root)
            .with_context(|| format!("storage root {} is not accessible", root.display()))?;
        anyhow::ensure!(stat.is_dir(), "storage root {} is not a directory", root.display());

        let idx = DirectoryIndex::open(root)?;
        Ok(Self {
            idx,
            config,
            shards: RwLock::new(HashMap::new()),
            released: AtomicBool::new(false),
            query_id: AtomicU32::new(0),
        })
    }

    pub fn index(&self) -> &DirectoryIndex {
        &self.idx
    }

    pub fn get_metric(&self, metric: &str) -> Option<Arc<MetricIndex>> {
        self.idx.get_metric(metric, false)
    }

    pub fn create_metric(&self, metric: &str) -> Option<Arc<MetricIndex>> {
        self.idx.get_metric(metric, true)
    }

    pub fn unchecked_write(&self, key: &Arc<MetricIndex>, reading: &MetricReading) -> bool {
        match self.shard_for(reading.time, true) {
            Some(shard) => shard.insert(key, reading.time, reading.value),
            None => false,
        }
    }

    /// Handle to the open shard that holds data for the given instant.
    pub fn shard_for(&self, ts: u64, create_if_absent: bool) -> Option<Arc<Shard>> {
        let day = match shard_id_for_ts(ts) {
            Ok(day) => day,
            Err(e) => {
                warn!(target: LOG, "no shard can hold ts {}: {}", ts, e);
                return None;
            }
        };
        self.shard_from_date(&day, create_if_absent)
    }

    fn shard_from_date(&self, day: &str, create_if_absent: bool) -> Option<Arc<Shard>> {
        if let Some(shard) = self.shards.read().get(day) {
            return Some(Arc::clone(shard));
        }
        self.make_shard_from_date(day, create_if_absent)
    }

    fn make_shard_from_date(&self, day: &str, create_if_absent: bool) -> Option<Arc<Shard>> {
        let mut shards = self.shards.write();
        if let Some(shard) = shards.get(day) {
            return Some(Arc::clone(shard));
        }

        let path = shard_path(&self.config.base_dir, day);
        match Shard::open(&path, create_if_absent, self.config.shard.clone()) {
            Ok(shard) => {
                // past the residency limit the whole working set goes
                // TODO: selective LRU eviction instead of a bulk reset
                if shards.len() > MAX_OPEN_SHARDS {
                    for (_, old) in shards.drain() {
                        old.release();
                    }
                }
                shards.insert(day.to_string(), Arc::clone(&shard));
                Some(shard)
            }
            Err(StorageError::ShardAbsent { .. }) => None,
            Err(e) => {
                warn!(target: LOG, "shard open for {} failed: {}", path.display(), e);
                None
            }
        }
    }

    /// Dispatch and federate a range query across all candidate shards.
    pub fn data_scan(&self, key: &MetricIndex, start: u64, end: u64) -> StorageResult<Vec<Datapoint>> {
        let qid = self.query_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let days = range_shards(start, end)?;
        debug!(target: LOG, "query({:010}) shards to scan: {}", qid, days.len());

        let mut out = Vec::with_capacity(1440);
        for day in &days {
            if let Some(shard) = self.shard_from_date(day, false) {
                let partial = shard.data_scan(key, start, end);
                debug!(target: LOG, "query({:010}) partial datapoints found {}", qid, partial.len());
                out.extend(partial);
            }
        }
        debug!(target: LOG, "query({:010}) total datapoints found {}", qid, out.len());
        Ok(out)
    }

    /// Release the index and every open shard. Safe to call more than once.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut shards = self.shards.write();
        for (_, shard) in shards.drain() {
            shard.release();
        }
        self.idx.release();
    }

    #[cfg(test)]
    fn open_shard_count(&self) -> usize {
        self.shards.read().len()
    }
}

/// Shard ids (`YYYYMMDD`, UTC) for every calendar day touched by the range.
pub fn range_shards(start: u64, end: u64) -> StorageResult<Vec<String>> {
    if start > end {
        return Err(StorageError::InvertedRange { start, end });
    }
    let first = epoch_day(start)?;
    let last = epoch_day(end)?;
    let mut out = Vec::with_capacity(last.signed_duration_since(first).num_days() as usize + 1);
    let mut day = first;
    while day <= last {
        out.push(day.format("%Y%m%d").to_string());
        day = day.succ_opt().ok_or(StorageError::TimeOutOfRange(end))?;
    }
    Ok(out)
}

fn epoch_day(ts: u64) -> StorageResult<NaiveDate> {
    let dt = chrono::DateTime::from_timestamp(ts as i64, 0).ok_or(StorageError::TimeOutOfRange(ts))?;
    Ok(dt.date_naive())
}

fn shard_id_for_ts(ts: u64) -> StorageResult<String> {
    Ok(epoch_day(ts)?.format("%Y%m%d").to_string())
}

/// Filesystem name for a given shard.
fn shard_path(base_dir: &Path, shard_id: &str) -> PathBuf {
    base_dir.join(format!("tsd-data-{}.db", shard_id))
}
