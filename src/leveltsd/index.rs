//! Metric name directory and short-code index.
//!
//! Two ordered KV databases: `tsd-dir.db` maps a dotted path to the JSON
//! array of its immediate children (the empty key is the root), and
//! `tsd-map.db` maps a scrubbed metric name to its 16-byte short code. Both
//! grow monotonically; the core never removes entries.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::codec;

const LOG: &str = "carbond::index";

/// Total cache across the two index databases.
pub const INDEX_CACHE_BYTES: u64 = 128 << 20;
pub const DEFAULT_METRIC_INTERVAL: u32 = 60;

/// Resolved handle for a metric: created once per distinct scrubbed name and
/// shared between the dispatcher and the shard writers.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricIndex {
    pub name: String,
    pub short_code: [u8; codec::SHORT_CODE_LEN],
    pub step_seconds: u32,
}

pub struct DirectoryIndex {
    write_lock: Mutex<()>,
    dir: sled::Db,
    pkey: sled::Db,
}

/// Canonicalize a metric name.
///
/// Strips the characters graphite has never accepted in metric names and
/// collapses runs of dots into a single dot (the browse UI cannot deal with
/// empty path segments). Non-ASCII input passes through untouched.
pub fn scrub(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '?' | '*' | '[' | ']' | '/' => continue,
            '.' if out.ends_with('.') => continue,
            _ => out.push(c),
        }
    }
    out
}

impl DirectoryIndex {
    /// The "mkfs" for the index pair under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let dir = sled::Config::new()
            .path(root.join("tsd-dir.db"))
            .cache_capacity(INDEX_CACHE_BYTES / 2)
            .open()
            .with_context(|| format!("error opening directory map under {}", root.display()))?;
        let pkey = sled::Config::new()
            .path(root.join("tsd-map.db"))
            .cache_capacity(INDEX_CACHE_BYTES / 2)
            .open()
            .with_context(|| format!("error opening index map under {}", root.display()))?;
        let index = Self { write_lock: Mutex::new(()), dir, pkey };
        index.mk_root().context("cannot initialize dir db")?;
        Ok(index)
    }

    /// Seed the directory entry for the root path on first open.
    fn mk_root(&self) -> Result<()> {
        if self.dir.get(b"")?.is_none() {
            self.dir.insert(b"", Vec::<u8>::new())?;
        }
        Ok(())
    }

    /// Immediate descendants of a metric path. Absent paths, unreadable
    /// entries and undecodable child lists all read as empty.
    pub fn list_children(&self, path: &str) -> Vec<String> {
        let spath = scrub(path);
        let raw = match self.ls_path(spath.as_bytes()) {
            Some(raw) => raw,
            None => return Vec::new(),
        };
        serde_json::from_slice(&raw).unwrap_or_default()
    }

    /// Fetch the internal representation of a metric, optionally creating it.
    ///
    /// Reads are lock-free against the store's snapshot semantics; only the
    /// create path takes the index write lock, and it re-checks existence
    /// under the lock before registering anything.
    pub fn get_metric(&self, metric: &str, create_if_absent: bool) -> Option<Arc<MetricIndex>> {
        let spath = scrub(metric);
        if spath.is_empty() {
            return None;
        }

        let _guard = if create_if_absent { Some(self.write_lock.lock()) } else { None };

        match self.pkey.get(spath.as_bytes()) {
            Ok(Some(code)) => {
                let short_code: [u8; codec::SHORT_CODE_LEN] = match code.as_ref().try_into() {
                    Ok(code) => code,
                    Err(_) => {
                        warn!(target: LOG, "short code for '{}' has length {}", spath, code.len());
                        return None;
                    }
                };
                return Some(Arc::new(MetricIndex {
                    name: metric.to_string(),
                    short_code,
                    step_seconds: DEFAULT_METRIC_INTERVAL,
                }));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: LOG, "primary key lookup for '{}' failed: {}", spath, e);
                return None;
            }
        }

        if create_if_absent {
            self.create_locked(&spath)
        } else {
            None
        }
    }

    /// Register a new metric. Caller must hold the write lock and must have
    /// verified the metric is absent.
    fn create_locked(&self, smetric: &str) -> Option<Arc<MetricIndex>> {
        let parts: Vec<&str> = smetric.split('.').collect();
        if !self.register_path(&parts) {
            return None;
        }
        self.record_id(smetric)
    }

    /// Record the metric's short code in the primary key map.
    fn record_id(&self, smetric: &str) -> Option<Arc<MetricIndex>> {
        let code = codec::short_code(smetric.as_bytes());
        if let Err(e) = self.pkey.insert(smetric.as_bytes(), &code[..]) {
            warn!(target: LOG, "recording short code for '{}' failed: {}", smetric, e);
            return None;
        }
        Some(Arc::new(MetricIndex {
            name: smetric.to_string(),
            short_code: code,
            step_seconds: DEFAULT_METRIC_INTERVAL,
        }))
    }

    /// Ensure directory entries exist for every proper prefix of `parts`,
    /// linking each segment into its parent's child list.
    fn register_path(&self, parts: &[&str]) -> bool {
        let n = parts.len();
        if n == 0 {
            return true;
        }
        let parent_chunk = &parts[..n - 1];
        let parent = parent_chunk.join(".");
        match self.ls_path(parent.as_bytes()) {
            None => self.register_path(parent_chunk) && self.add_child(&parent, parts[n - 1], None),
            Some(siblings) => self.add_child(&parent, parts[n - 1], Some(siblings)),
        }
    }

    /// Uninterpreted bytes stored with a directory node, if any.
    fn ls_path(&self, spath: &[u8]) -> Option<sled::IVec> {
        match self.dir.get(spath) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(target: LOG, "directory lookup failed: {}", e);
                None
            }
        }
    }

    /// Attach a child to a directory path, deduplicating.
    fn add_child(&self, parent: &str, child: &str, siblings_raw: Option<sled::IVec>) -> bool {
        let mut siblings: Vec<String> = match &siblings_raw {
            Some(raw) if !raw.is_empty() => match serde_json::from_slice(raw) {
                Ok(list) => list,
                Err(e) => {
                    warn!(target: LOG, "undecodable child list under '{}': {}", parent, e);
                    return false;
                }
            },
            _ => Vec::new(),
        };
        if siblings.iter().any(|c| c == child) {
            return true;
        }
        siblings.push(child.to_string());
        self.replace_children(parent, &siblings)
    }

    /// In-place update of the child list of a directory node.
    fn replace_children(&self, parent: &str, children: &[String]) -> bool {
        let val = if children.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(children).unwrap_or_default()
        };
        debug!(target: LOG, "set children of '{}' to {:?}", parent, children);
        match self.dir.insert(parent.as_bytes(), val) {
            Ok(_) => true,
            Err(e) => {
                warn!(target: LOG, "directory write under '{}' failed: {}", parent, e);
                false
            }
        }
    }

    pub fn release(&self) {
        if let Err(e) = self.dir.flush() {
            warn!(target: LOG, "directory map flush failed: {}", e);
        }
        if let Err(e) = self.pkey.flush() {
            warn!(target: LOG, "index map flush failed: {}", e);
        }
    }
}
