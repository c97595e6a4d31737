//! `StorageAdapter` implementation backed by the shard federator.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::config::optional_u64;
use crate::mq::MetricReading;
use crate::storage::{MetricRef, StorageAdapter};

use super::federator::{parse_engine_config, LevelFederator};
use super::reader;

/// The `leveltsd` storage engine. Constructed empty and registered at
/// startup; `init` builds the federator and, when a reader port is
/// configured, spawns the JSON-RPC read endpoint.
#[derive(Default)]
pub struct LevelTsdAdapter {
    federator: RwLock<Option<Arc<LevelFederator>>>,
}

impl LevelTsdAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn federator(&self) -> Option<Arc<LevelFederator>> {
        self.federator.read().clone()
    }
}

impl StorageAdapter for LevelTsdAdapter {
    fn init(&self, config: &HashMap<String, String>) -> Result<()> {
        let engine_config = parse_engine_config(config)?;
        let reader_port = optional_u64(config, "reader-port")?;
        let federator = Arc::new(LevelFederator::open(engine_config)?);

        if let Some(port) = reader_port {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let federator = Arc::clone(&federator);
                    handle.spawn(async move {
                        if let Err(e) = reader::serve(federator, port as u16).await {
                            error!(target: "carbond::reader", "reader rpc server exited: {:#}", e);
                        }
                    });
                }
                Err(_) => {
                    warn!(target: "carbond::reader",
                        "no async runtime available, reader rpc endpoint disabled");
                }
            }
        }

        *self.federator.write() = Some(federator);
        Ok(())
    }

    fn get_metric(&self, metric: &str) -> Option<MetricRef> {
        self.federator()?.get_metric(metric).map(MetricRef::Level)
    }

    fn create_metric(&self, metric: &str) -> Option<MetricRef> {
        self.federator()?.create_metric(metric).map(MetricRef::Level)
    }

    fn unchecked_write(&self, key: &MetricRef, reading: &MetricReading) -> bool {
        let Some(federator) = self.federator() else {
            return false;
        };
        match key {
            MetricRef::Level(idx) => federator.unchecked_write(idx, reading),
            MetricRef::Null => false,
        }
    }

    fn release(&self) {
        if let Some(federator) = self.federator.write().take() {
            federator.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_write() {
        let tmp = tempfile::tempdir().unwrap();
        let plugin = LevelTsdAdapter::new();

        let mut config = HashMap::new();
        config.insert("root".to_string(), tmp.path().to_string_lossy().to_string());
        config.insert("write-batch-interval-seconds".to_string(), "1".to_string());
        plugin.init(&config).unwrap();

        let key = plugin.create_metric("foo.baz").unwrap();
        let reading = MetricReading { metric: "foo.baz".into(), value: 1324.12, time: 324323 };
        assert!(plugin.unchecked_write(&key, &reading));

        assert!(plugin.get_metric("foo.baz").is_some());
        assert!(plugin.get_metric("foo.nope").is_none());
        plugin.release();

        // post-release everything degrades to "not found" / failed writes
        assert!(plugin.get_metric("foo.baz").is_none());
        assert!(!plugin.unchecked_write(&key, &reading));
    }

    #[test]
    fn init_requires_root() {
        let plugin = LevelTsdAdapter::new();
        assert!(plugin.init(&HashMap::new()).is_err());
    }
}
