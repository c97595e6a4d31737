//! Storage gateway: the capability interface every engine implements, the
//! opaque per-metric handle, and the process-wide adapter registry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::info;

use crate::leveltsd::MetricIndex;
use crate::mq::MetricReading;

pub mod devnull;
pub mod dispatch;

pub use devnull::DevNullStorage;
pub use dispatch::StorageCore;

const LOG: &str = "carbond::storage";

/// Opaque metric handle handed out by an adapter and passed back on writes.
/// A sum type over the known engines, so a handle can never be replayed
/// against the wrong backend.
#[derive(Clone)]
pub enum MetricRef {
    Null,
    Level(Arc<MetricIndex>),
}

/// Capability interface of a storage engine.
pub trait StorageAdapter: Send + Sync {
    fn init(&self, config: &HashMap<String, String>) -> Result<()>;
    fn get_metric(&self, metric: &str) -> Option<MetricRef>;
    fn create_metric(&self, metric: &str) -> Option<MetricRef>;
    fn unchecked_write(&self, key: &MetricRef, reading: &MetricReading) -> bool;
    fn release(&self);
}

static ADAPTERS: Lazy<RwLock<HashMap<String, Arc<dyn StorageAdapter>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a storage engine under a unique name. Duplicate registration is
/// a wiring bug and aborts startup.
pub fn register_adapter(name: &str, adapter: Arc<dyn StorageAdapter>) {
    let mut adapters = ADAPTERS.write();
    if adapters.contains_key(name) {
        panic!("storage adapter already registered under the name {}", name);
    }
    info!(target: LOG, "registering storage engine named {}", name);
    adapters.insert(name.to_string(), adapter);
}

pub fn get_adapter(name: &str) -> Option<Arc<dyn StorageAdapter>> {
    ADAPTERS.read().get(name).cloned()
}
