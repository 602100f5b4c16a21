// src/state/cursor.rs
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::write_atomic;

/// Identifies one cursor: `<user>_<checker>` or `<user>_<checker>_<sub>` on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorKey {
    pub user: String,
    pub checker: String,
    /// Sub-source id, e.g. one forum out of a multi-forum checker.
    pub sub: Option<String>,
}

impl CursorKey {
    pub fn new(user: impl Into<String>, checker: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            checker: checker.into(),
            sub: None,
        }
    }

    pub fn with_sub(mut self, sub: impl Into<String>) -> Self {
        self.sub = Some(sub.into());
        self
    }
}

impl fmt::Display for CursorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub {
            Some(sub) => write!(f, "{}_{}_{}", self.user, self.checker, sub),
            None => write!(f, "{}_{}", self.user, self.checker),
        }
    }
}

/// Last-successful-check timestamps, persisted as a flat JSON object of
/// `"<key>": "<ISO-8601>"`.
///
/// - `get` on a missing key stores and returns `now`, so a new checker never
///   reports anything older than its first run.
/// - `set` never moves a cursor backwards.
/// - Every change is written through before the call returns.
#[derive(Debug)]
pub struct CursorStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

impl CursorStore {
    /// Opens (or lazily creates) the cursor file at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(s) => match serde_json::from_str::<BTreeMap<String, String>>(&s) {
                Ok(map) => map,
                Err(e) => {
                    // Losing cursors only re-initialises them to "now"; never floods.
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "unreadable cursor file, starting fresh"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading cursors from {}", path.display()))
            }
        };
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    /// Store without a backing file (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: BTreeMap::new(),
        }
    }

    /// Current cursor for `key` without initialising it.
    pub fn peek(&self, key: &CursorKey) -> Option<DateTime<Utc>> {
        self.entries
            .get(&key.to_string())
            .and_then(|raw| parse_timestamp(raw))
    }

    /// Read-or-initialise: a missing (or unreadable) cursor becomes `now`.
    pub async fn get(&mut self, key: &CursorKey, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if let Some(ts) = self.peek(key) {
            return Ok(ts);
        }
        tracing::info!(cursor_key = %key, %now, "initialising cursor");
        self.entries.insert(key.to_string(), format_timestamp(now));
        self.persist().await?;
        Ok(now)
    }

    /// Advance the cursor to `ts`. An older `ts` leaves the stored value in
    /// place; the value actually stored is returned.
    pub async fn set(&mut self, key: &CursorKey, ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let stored = match self.peek(key) {
            Some(prev) if prev > ts => prev,
            _ => ts,
        };
        self.entries.insert(key.to_string(), format_timestamp(stored));
        self.persist().await?;
        tracing::debug!(cursor_key = %key, cursor = %stored, "cursor advanced");
        Ok(stored)
    }

    /// All cursors as stored, keyed by their on-disk name.
    pub fn entries(&self) -> impl Iterator<Item = (&str, Option<DateTime<Utc>>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), parse_timestamp(v)))
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.entries).context("encoding cursors")?;
        write_atomic(path, &bytes).await
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 and the naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` form older
/// deployments wrote; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
