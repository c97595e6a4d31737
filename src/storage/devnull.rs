//! The `null` storage engine: accepts everything, stores nothing. Useful
//! for load testing the ingestion path without touching disk.

use std::collections::HashMap;

use anyhow::Result;

use crate::mq::MetricReading;

use super::{MetricRef, StorageAdapter};

pub struct DevNullStorage;

impl StorageAdapter for DevNullStorage {
    fn init(&self, _config: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn get_metric(&self, _metric: &str) -> Option<MetricRef> {
        Some(MetricRef::Null)
    }

    fn create_metric(&self, _metric: &str) -> Option<MetricRef> {
        Some(MetricRef::Null)
    }

    fn unchecked_write(&self, _key: &MetricRef, _reading: &MetricReading) -> bool {
        true
    }

    fn release(&self) {}
}
