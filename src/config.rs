//! INI configuration loader.
//!
//! The daemon is configured with a flat INI file: a top-level section for
//! process-wide keys (e.g. `parallelism`), plus `[listener]`, `[storage]`
//! and `[storage-engine]` sections. Sections are exposed as plain
//! `key -> value` maps because the storage adapters accept their engine
//! configuration in exactly that shape.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Parsed INI file. The unnamed top-level section is stored under `""`.
#[derive(Debug, Clone, Default)]
pub struct IniConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("cannot parse config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                match name.strip_suffix(']') {
                    Some(name) => current = name.trim().to_string(),
                    None => bail!("line {}: unterminated section header", lineno + 1),
                }
                sections.entry(current.clone()).or_default();
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    sections
                        .entry(current.clone())
                        .or_default()
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
                None => bail!("line {}: expected 'key = value', got {:?}", lineno + 1, raw),
            }
        }
        Ok(Self { sections })
    }

    /// Returns a copy of the named section; missing sections read as empty.
    pub fn section(&self, name: &str) -> HashMap<String, String> {
        self.sections.get(name).cloned().unwrap_or_default()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }
}

/// Parse a mandatory unsigned integer out of a section map.
pub fn require_u64(map: &HashMap<String, String>, key: &str) -> Result<u64> {
    match map.get(key) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("bad value for '{}': {:?}", key, raw)),
        None => bail!("missing config key '{}'", key),
    }
}

/// Parse an optional unsigned integer out of a section map.
pub fn optional_u64(map: &HashMap<String, String>, key: &str) -> Result<Option<u64>> {
    match map.get(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("bad value for '{}': {:?}", key, raw)),
        None => Ok(None),
    }
}
