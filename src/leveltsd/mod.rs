//! The `leveltsd` storage engine: a date-sharded time-series store over an
//! ordered KV database.
//!
//! Layout under the configured root:
//! - `tsd-dir.db/`: hierarchical metric directory,
//! - `tsd-map.db/`: metric name to short-code map,
//! - `tsd-data-YYYYMMDD.db/`: one data shard per UTC day.
//!
//! Writes flow through per-shard batch writer pools; reads fan out across
//! the candidate shards of the queried range. The engine also serves a
//! JSON-RPC browse/read endpoint for graphite-web style consumers.

pub mod adapter;
pub mod codec;
pub mod federator;
pub mod index;
pub mod reader;
pub mod shard;

pub use adapter::LevelTsdAdapter;
pub use federator::{parse_engine_config, LevelFederator, LevelTsdConfig};
pub use index::{scrub, DirectoryIndex, MetricIndex};
pub use shard::{Datapoint, Shard, ShardConfig};
