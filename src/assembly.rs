//! Wires the daemon together: adapter registry, storage queues, dispatcher
//! pipelines, audit rotation, and finally the plaintext listener, which
//! runs the calling task forever.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::audit::{Audit, QueueDepths};
use crate::config::{require_u64, IniConfig};
use crate::leveltsd::LevelTsdAdapter;
use crate::listener::{PlaintextConfig, PlaintextReceiver};
use crate::mq::StoragePipeline;
use crate::storage::{register_adapter, DevNullStorage, StorageCore};

const LOG: &str = "carbond::assembly";

/// Number of dispatcher workers on the main ingestion queue.
const MAIN_QUEUE_WORKERS: usize = 4;

pub fn register_builtin_adapters() {
    register_adapter("null", Arc::new(DevNullStorage));
    register_adapter("leveltsd", Arc::new(LevelTsdAdapter::new()));
}

pub async fn build_all_and_run(config: IniConfig) -> Result<()> {
    register_builtin_adapters();

    let storage_config = config.section("storage");
    let backlog = require_u64(&storage_config, "backlog")? as usize;
    let pipeline = StoragePipeline::new(backlog);
    info!(target: LOG, "storage queues up, main backlog {}", backlog);

    let audit = Audit::new();
    let core = StorageCore::build(&storage_config, &config.section("storage-engine"), audit.clone())?;

    // audit stream is never throttled and creates its metrics inline
    core.dispatch_loop(pipeline.audit_rx.clone(), None, false, 1);
    core.dispatch_loop(
        pipeline.main_rx.clone(),
        Some(pipeline.offload_tx.clone()),
        true,
        MAIN_QUEUE_WORKERS,
    );
    core.dispatch_loop(pipeline.offload_rx.clone(), None, true, 1);

    let depths: QueueDepths = {
        let pipeline = pipeline.clone();
        Arc::new(move || pipeline.cached_datapoints())
    };
    audit.start(pipeline.audit_tx.clone(), depths);

    let listener_config = config.section("listener");
    let port = require_u64(&listener_config, "port")? as u16;
    let receiver =
        PlaintextReceiver::new(PlaintextConfig { port }, pipeline.main_tx.clone(), audit);
    receiver.listen().await
}
