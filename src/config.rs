// src/config.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::checkers::CheckerConfig;
use crate::keywords::clean_keywords;

pub const ENV_CONFIG_PATH: &str = "RELAY_CONFIG_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/config.toml";
pub const DEFAULT_JSON_PATH: &str = "config/config.json";

fn default_interval() -> u64 {
    300
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn default_request_timeout() -> u64 {
    30
}
fn default_sync_timeout() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatrixConfig {
    pub homeserver: String,
    pub user_id: String,
    /// `"ENV"` reads `MATRIX_ACCESS_TOKEN`.
    pub access_token: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Long-poll timeout passed to `/sync`.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,
}

/// What to do with a cursor when the checker run hit a source error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPolicy {
    /// Advance anyway: a failed fetch loses its window instead of piling up.
    #[default]
    AlwaysAdvance,
    /// Keep the old cursor so the next tick re-scans the window.
    HoldOnFailure,
}

/// A configured checker entry. Entries that failed to parse stay in the list
/// so every tick can report and skip them.
#[derive(Debug, Clone)]
pub enum CheckerSlot {
    Ready(CheckerConfig),
    Invalid { checker_type: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct UserConfig {
    pub name: String,
    pub matrix_user_id: String,
    pub matrix_room_id: String,
    pub checkers: Vec<CheckerSlot>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub matrix: MatrixConfig,
    pub check_interval_secs: u64,
    pub state_dir: PathBuf,
    pub cursor_policy: CursorPolicy,
    pub admin_addr: Option<String>,
    pub users: Vec<UserConfig>,
}

#[derive(Deserialize)]
struct RawConfig {
    matrix: MatrixConfig,
    #[serde(default = "default_interval")]
    check_interval_secs: u64,
    #[serde(default = "default_state_dir")]
    state_dir: PathBuf,
    #[serde(default)]
    cursor_policy: CursorPolicy,
    #[serde(default)]
    admin_addr: Option<String>,
    #[serde(default)]
    users: Vec<RawUser>,
}

#[derive(Deserialize)]
struct RawUser {
    name: String,
    matrix_user_id: String,
    matrix_room_id: String,
    #[serde(default)]
    checkers: Vec<serde_json::Value>,
}

impl AppConfig {
    /// Load from an explicit path. TOML or JSON, by extension.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let raw: RawConfig = match ext.as_str() {
            "json" => serde_json::from_str(&content).context("parsing JSON config")?,
            _ => toml::from_str(&content).context("parsing TOML config")?,
        };
        Self::from_raw(raw)
    }

    /// Load using env var + fallbacks:
    /// 1) $RELAY_CONFIG_PATH
    /// 2) config/config.toml
    /// 3) config/config.json
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
            }
            return Self::load_from(&pb);
        }
        for candidate in [DEFAULT_TOML_PATH, DEFAULT_JSON_PATH] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        Err(anyhow!(
            "no config found (set {ENV_CONFIG_PATH} or create {DEFAULT_TOML_PATH})"
        ))
    }

    /// Parse a TOML document (handy for tests and embedded configs).
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(s).context("parsing TOML config")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        if raw.check_interval_secs == 0 {
            bail!("check_interval_secs must be greater than zero");
        }
        let mut matrix = raw.matrix;
        matrix.access_token = resolve_secret(&matrix.access_token, "MATRIX_ACCESS_TOKEN")?;

        let users = raw
            .users
            .into_iter()
            .map(|u| UserConfig {
                checkers: u
                    .checkers
                    .into_iter()
                    .map(|v| parse_checker(&u.name, v))
                    .collect(),
                name: u.name,
                matrix_user_id: u.matrix_user_id,
                matrix_room_id: u.matrix_room_id,
            })
            .collect::<Vec<_>>();

        for (i, u) in users.iter().enumerate() {
            if users[..i].iter().any(|p| p.name == u.name) {
                tracing::warn!(user = %u.name, "duplicate user name; cursors will be shared");
            }
        }

        Ok(Self {
            matrix,
            check_interval_secs: raw.check_interval_secs,
            state_dir: raw.state_dir,
            cursor_policy: raw.cursor_policy,
            admin_addr: raw.admin_addr.filter(|a| !a.trim().is_empty()),
            users,
        })
    }
}

fn parse_checker(user: &str, value: serde_json::Value) -> CheckerSlot {
    let checker_type = value
        .get("checker_type")
        .and_then(|v| v.as_str())
        .unwrap_or("<missing>")
        .to_string();
    let parsed = serde_json::from_value::<CheckerConfig>(value)
        .map_err(anyhow::Error::from)
        .and_then(|mut c| {
            c.resolve_secrets()?;
            let keywords = clean_keywords(c.keywords());
            c.set_keywords(keywords);
            Ok(c)
        });
    match parsed {
        Ok(c) => CheckerSlot::Ready(c),
        Err(e) => {
            tracing::warn!(
                user,
                checker_type = %checker_type,
                error = %e,
                "invalid checker entry, it will be skipped"
            );
            CheckerSlot::Invalid {
                checker_type,
                reason: e.to_string(),
            }
        }
    }
}

/// `"ENV"` (any case) means "read `env_name`".
pub fn resolve_secret(value: &str, env_name: &str) -> Result<String> {
    if value.trim().eq_ignore_ascii_case("env") {
        std::env::var(env_name).map_err(|_| anyhow!("Missing {env_name} env var"))
    } else {
        Ok(value.to_string())
    }
}

/// Shared view of the user list. The scheduler clones what it needs at the
/// start of each tick; the command listener is the only writer.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Vec<UserConfig>>>,
}

impl ConfigHandle {
    pub fn new(users: Vec<UserConfig>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(users)),
        }
    }

    /// Owned copy of the current users.
    pub fn users(&self) -> Vec<UserConfig> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run `f` with write access. Never hold this across an `.await`.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<UserConfig>) -> R) -> R {
        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
