// src/state/snapshot.rs
//! Full-state snapshots for sources without a usable "created after" filter.
//!
//! A snapshot is a map from item key (e.g. referendum index) to whatever the
//! source returned for it. Only keys that appear between two snapshots are
//! reported; field changes and removals are counted for logging only.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use super::write_atomic;

/// Sorted by key, so the persisted JSON is stable between runs.
pub type Snapshot = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// Keys present in the new state but not in the baseline.
    pub added: BTreeSet<String>,
    pub changed: usize,
    pub removed: usize,
    /// True when there was no baseline and this call established it.
    pub first_run: bool,
}

/// Compare two states. Arrays are compared as multisets.
pub fn diff_states(old: &Snapshot, new: &Snapshot) -> SnapshotDiff {
    let mut out = SnapshotDiff::default();
    for (k, v) in new {
        match old.get(k) {
            None => {
                out.added.insert(k.clone());
            }
            Some(prev) if !same_ignoring_order(prev, v) => out.changed += 1,
            Some(_) => {}
        }
    }
    out.removed = old.keys().filter(|k| !new.contains_key(*k)).count();
    out
}

fn same_ignoring_order(a: &Value, b: &Value) -> bool {
    canonical(a) == canonical(b)
}

fn canonical(v: &Value) -> Value {
    match v {
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(canonical).collect();
            items.sort_by_cached_key(|x| x.to_string());
            Value::Array(items)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Baselines keyed by checker instance, one JSON file per key under `dir`.
#[derive(Debug)]
pub struct SnapshotCache {
    dir: Option<PathBuf>,
    loaded: HashMap<String, Snapshot>,
}

impl SnapshotCache {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            loaded: HashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            dir: None,
            loaded: HashMap::new(),
        }
    }

    /// Diff `new_state` against the stored baseline for `key`, then make
    /// `new_state` the baseline regardless of the outcome.
    pub async fn diff(&mut self, key: &str, new_state: Snapshot) -> Result<SnapshotDiff> {
        let diff = match self.baseline(key).await? {
            Some(old) => diff_states(&old, &new_state),
            None => {
                tracing::info!(
                    snapshot_key = key,
                    items = new_state.len(),
                    "establishing snapshot baseline"
                );
                SnapshotDiff {
                    first_run: true,
                    ..SnapshotDiff::default()
                }
            }
        };
        self.store(key, new_state).await?;
        Ok(diff)
    }

    async fn baseline(&mut self, key: &str) -> Result<Option<Snapshot>> {
        if let Some(s) = self.loaded.get(key) {
            return Ok(Some(s.clone()));
        }
        let Some(path) = self.path_for(key) else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => match serde_json::from_str::<Snapshot>(&s) {
                Ok(snap) => Ok(Some(snap)),
                Err(e) => {
                    // Re-baselining reports nothing, so a lost baseline never floods.
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "unreadable snapshot, starting fresh"
                    );
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading snapshot {}", path.display())),
        }
    }

    async fn store(&mut self, key: &str, state: Snapshot) -> Result<()> {
        if let Some(path) = self.path_for(key) {
            let bytes = serde_json::to_vec_pretty(&state).context("encoding snapshot")?;
            write_atomic(&path, &bytes).await?;
        }
        self.loaded.insert(key.to_string(), state);
        Ok(())
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Some(dir.join(format!("{name}.json")))
    }
}
