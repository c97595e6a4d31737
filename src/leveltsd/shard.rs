//! A single shard of time-series data.
//!
//! The shard does not carry any information about the subset of data it
//! holds; all such partitioning knowledge lives at the federator level,
//! which keeps shard migration flexible. Writes go through a pool of
//! background batch writers draining a shared rendezvous channel; reads are
//! bounded range scans over the ordered store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};

use super::codec;
use super::index::MetricIndex;

const LOG: &str = "carbond::shard";

pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_DATA_CACHE_BYTES: u64 = 16 << 20;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub data_cache_bytes: u64,
    pub write_batch_size: usize,
    pub write_batch_fill_timeout: Duration,
    pub write_concurrency: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            data_cache_bytes: DEFAULT_DATA_CACHE_BYTES,
            write_batch_size: DEFAULT_BATCH_SIZE,
            write_batch_fill_timeout: DEFAULT_BATCH_INTERVAL,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Datapoint {
    #[serde(rename = "Timestamp")]
    pub timestamp: u64,
    #[serde(rename = "Value")]
    pub value: f64,
}

struct Triplet {
    key: Arc<MetricIndex>,
    val: Datapoint,
}

#[derive(Debug)]
pub struct Shard {
    db: sled::Db,
    /// Taken on release; a taken sender is how `insert` learns the shard is
    /// closed.
    ingress: RwLock<Option<Sender<Triplet>>>,
    /// Per-writer stop sender and join handle; dropping the sender
    /// disconnects the writer's stop channel, which is its termination
    /// signal.
    writers: Mutex<Vec<(Sender<()>, std::thread::JoinHandle<()>)>>,
    config: ShardConfig,
    path: PathBuf,
}

impl Shard {
    /// Open an existing shard, or create it if `create_if_absent`.
    ///
    /// A pre-existing shard must carry the expected serialization marker; a
    /// shard lacking the marker entirely (including a freshly created one)
    /// has it written.
    pub fn open(fs_path: &Path, create_if_absent: bool, config: ShardConfig) -> StorageResult<Arc<Self>> {
        debug!(target: LOG, "shard open request {} create={}", fs_path.display(), create_if_absent);

        let exists = fs_path.exists();
        if !create_if_absent && !exists {
            return Err(StorageError::ShardAbsent { path: fs_path.to_path_buf() });
        }

        let db = sled::Config::new()
            .path(fs_path)
            .cache_capacity(config.data_cache_bytes)
            .open()?;

        match db.get(codec::SCHEME_MAGIC_ID)? {
            Some(magic) if magic.as_ref() != codec::SERIALIZATION_TECHNIQUE.as_bytes() => {
                let err = StorageError::MagicMismatch {
                    path: fs_path.to_path_buf(),
                    found: magic.to_vec(),
                };
                warn!(target: LOG, "{}", err);
                return Err(err);
            }
            Some(_) => {}
            None => {
                db.insert(codec::SCHEME_MAGIC_ID, codec::SERIALIZATION_TECHNIQUE)?;
            }
        }

        let (ingress_tx, ingress_rx) = bounded::<Triplet>(0);
        let shard = Arc::new(Self {
            db,
            ingress: RwLock::new(Some(ingress_tx)),
            writers: Mutex::new(Vec::new()),
            config: config.clone(),
            path: fs_path.to_path_buf(),
        });

        for id in 0..config.write_concurrency {
            shard.spawn_writer(ingress_rx.clone(), id);
        }

        Ok(shard)
    }

    fn spawn_writer(self: &Arc<Self>, ingress: Receiver<Triplet>, id: usize) {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let shard = Arc::clone(self);
        let handle = std::thread::spawn(move || shard.write_loop(ingress, stop_rx, id));
        self.writers.lock().push((stop_tx, handle));
    }

    /// The background writer: multiplexes new tuples, the periodic flush
    /// tick, and termination. Termination returns immediately without
    /// flushing pending data.
    fn write_loop(&self, ingress: Receiver<Triplet>, stop: Receiver<()>, id: usize) {
        let mut batch: Vec<([u8; codec::KEY_LEN], [u8; 8])> =
            Vec::with_capacity(self.config.write_batch_size);
        let ticker = tick(self.config.write_batch_fill_timeout);

        loop {
            select! {
                recv(ingress) -> msg => {
                    let triplet = match msg {
                        Ok(triplet) => triplet,
                        Err(_) => return,
                    };
                    let rounded = codec::round(triplet.val.timestamp, triplet.key.step_seconds);
                    match codec::encode_key(&triplet.key.short_code, rounded) {
                        Ok(key) => {
                            if batch.len() == self.config.write_batch_size {
                                self.flush(&mut batch, id);
                            }
                            batch.push((key, codec::encode_value(triplet.val.value)));
                        }
                        Err(e) => {
                            warn!(target: LOG, "({:02}) dropping unencodable datapoint: {}", id, e);
                        }
                    }
                }
                recv(ticker) -> _ => self.flush(&mut batch, id),
                recv(stop) -> _ => return,
            }
        }
    }

    /// Drain accumulated write commands as one atomic batch. Errors are
    /// logged and the batch is discarded; ingestion is loss-tolerant.
    fn flush(&self, batch: &mut Vec<([u8; codec::KEY_LEN], [u8; 8])>, id: usize) {
        let n = batch.len();
        debug!(target: LOG, "({:02}) flushing {} datapoint(s) in {}", id, n, self.path.display());
        if n == 0 {
            return;
        }
        let mut write = sled::Batch::default();
        for (key, val) in batch.iter() {
            write.insert(&key[..], &val[..]);
        }
        if let Err(e) = self.db.apply_batch(write) {
            warn!(target: LOG, "({:02}) batch write of {} datapoint(s) failed in {}: {}",
                id, n, self.path.display(), e);
        }
        batch.clear();
    }

    /// Schedule a value for writing. Fails only if the writer pipelines have
    /// been closed; there is no synchronous confirmation of durability.
    pub fn insert(&self, key: &Arc<MetricIndex>, ts: u64, value: f64) -> bool {
        match self.ingress.read().as_ref() {
            Some(tx) => tx
                .send(Triplet { key: Arc::clone(key), val: Datapoint { timestamp: ts, value } })
                .is_ok(),
            None => false,
        }
    }

    /// All values recorded for a metric inside `[start, end]`, in ascending
    /// timestamp order.
    pub fn data_scan(&self, key: &MetricIndex, start: u64, end: u64) -> Vec<Datapoint> {
        let start_key = match codec::encode_key(&key.short_code, start) {
            Ok(key) => key,
            Err(_) => return Vec::new(),
        };
        let end_key = match codec::encode_key(&key.short_code, end) {
            Ok(key) => key,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::with_capacity(100);
        for item in self.db.range(start_key..=end_key) {
            let (k, v) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    warn!(target: LOG, "range scan failed in {}: {}", self.path.display(), e);
                    break;
                }
            };
            // the reserved magic entry can fall inside a scanned range
            let ts = match codec::extract_ts(&k) {
                Ok(ts) => ts,
                Err(_) => continue,
            };
            let value = match codec::decode_value(&v) {
                Ok(value) => value,
                Err(_) => continue,
            };
            out.push(Datapoint { timestamp: ts, value });
        }
        out
    }

    /// Close the ingress pipeline, stop every writer and flush the store.
    /// Pending batches in the writers are dropped, not flushed.
    pub fn release(&self) {
        let sender = self.ingress.write().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        info!(target: LOG, "closed receive pipeline for {}", self.path.display());

        let writers = std::mem::take(&mut *self.writers.lock());
        for (stop, handle) in writers {
            drop(stop);
            let _ = handle.join();
        }

        if let Err(e) = self.db.flush() {
            warn!(target: LOG, "flush on release failed in {}: {}", self.path.display(), e);
        }
        info!(target: LOG, "closed {}", self.path.display());
    }
}
