// src/checkers/mod.rs
//! Source checkers: each kind knows how to query its source, apply the
//! cursor/snapshot boundary and normalise hits into [`Candidate`]s.

pub mod discourse;
pub mod governance;
pub mod stackexchange;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::state::{CursorKey, SnapshotCache};

pub use discourse::{DiscourseApi, DiscourseConfig, ForumConfig, HttpDiscourse};
pub use governance::{FreshnessStrategy, GovernanceApi, GovernanceConfig, HttpGovernance};
pub use stackexchange::{HttpStackExchange, StackExchangeApi, StackExchangeConfig};

/// Abstracts longer than this many characters are cut and get an ellipsis.
pub const ABSTRACT_MAX_CHARS: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckerKind {
    Discourse,
    StackExchange,
    Governance,
}

impl CheckerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckerKind::Discourse => "discourse",
            CheckerKind::StackExchange => "stackexchange",
            CheckerKind::Governance => "governance",
        }
    }
}

impl fmt::Display for CheckerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discourse" | "forum" => Ok(CheckerKind::Discourse),
            "stackexchange" | "stack_exchange" | "qa" => Ok(CheckerKind::StackExchange),
            "governance" => Ok(CheckerKind::Governance),
            other => Err(anyhow!("unknown checker type: {other}")),
        }
    }
}

/// One configured checker, tagged by `checker_type` in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "checker_type")]
pub enum CheckerConfig {
    #[serde(rename = "discourse")]
    Discourse(DiscourseConfig),
    #[serde(rename = "stackexchange")]
    StackExchange(StackExchangeConfig),
    #[serde(rename = "governance")]
    Governance(GovernanceConfig),
}

impl CheckerConfig {
    pub fn kind(&self) -> CheckerKind {
        match self {
            CheckerConfig::Discourse(_) => CheckerKind::Discourse,
            CheckerConfig::StackExchange(_) => CheckerKind::StackExchange,
            CheckerConfig::Governance(_) => CheckerKind::Governance,
        }
    }

    pub fn keywords(&self) -> &[String] {
        match self {
            CheckerConfig::Discourse(c) => &c.keywords,
            CheckerConfig::StackExchange(c) => &c.keywords,
            CheckerConfig::Governance(c) => &c.keywords,
        }
    }

    pub fn set_keywords(&mut self, keywords: Vec<String>) {
        match self {
            CheckerConfig::Discourse(c) => c.keywords = keywords,
            CheckerConfig::StackExchange(c) => c.keywords = keywords,
            CheckerConfig::Governance(c) => c.keywords = keywords,
        }
    }

    /// Replace `"ENV"` placeholders with values from the environment.
    pub fn resolve_secrets(&mut self) -> Result<()> {
        match self {
            CheckerConfig::Discourse(c) => {
                for forum in &mut c.forums {
                    forum.api_key =
                        crate::config::resolve_secret(&forum.api_key, "DISCOURSE_API_KEY")?;
                }
            }
            CheckerConfig::StackExchange(c) => {
                if let Some(key) = &c.api_key {
                    c.api_key = Some(crate::config::resolve_secret(key, "STACKEXCHANGE_API_KEY")?);
                }
            }
            CheckerConfig::Governance(_) => {}
        }
        Ok(())
    }
}

/// Source-agnostic unit handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    /// e.g. `Discourse (https://forum.example.org)`.
    pub source_label: String,
    pub author: String,
    pub title: Option<String>,
    /// Abstract, already cut to [`ABSTRACT_MAX_CHARS`].
    pub summary: String,
    /// Render `summary` as markdown in the rich body.
    pub summary_is_markdown: bool,
    pub permalink: String,
    pub matched_keyword: String,
    /// Source-side id (referendum index) when there is one.
    pub reference: Option<String>,
}

/// Output of one checker run.
#[derive(Debug, Default, Clone)]
pub struct CheckerRun {
    pub candidates: Vec<Candidate>,
    /// Source fetches that failed during the run.
    pub fetch_errors: usize,
    /// Items the source returned that were not newer than the cursor.
    pub stale: usize,
}

impl CheckerRun {
    pub fn failed() -> Self {
        Self {
            fetch_errors: 1,
            ..Self::default()
        }
    }
}

/// Cut to [`ABSTRACT_MAX_CHARS`] characters and mark the cut with `...`.
pub fn truncate_abstract(s: &str) -> String {
    if s.chars().count() > ABSTRACT_MAX_CHARS {
        let mut out: String = s.chars().take(ABSTRACT_MAX_CHARS).collect();
        out.push_str("...");
        out
    } else {
        s.to_string()
    }
}

/// Decode HTML entities, strip tags and collapse whitespace.
pub fn clean_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    let stripped = re_tags.replace_all(&decoded, "");

    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    re_ws.replace_all(&stripped, " ").trim().to_string()
}

/// HTTP (or fake) clients for every source kind.
#[derive(Clone)]
pub struct SourceClients {
    pub discourse: Arc<dyn DiscourseApi>,
    pub stackexchange: Arc<dyn StackExchangeApi>,
    pub governance: Arc<dyn GovernanceApi>,
}

impl SourceClients {
    pub fn http(client: reqwest::Client) -> Self {
        Self {
            discourse: Arc::new(HttpDiscourse::new(client.clone())),
            stackexchange: Arc::new(HttpStackExchange::new(client.clone())),
            governance: Arc::new(HttpGovernance::new(client)),
        }
    }
}

/// A unit of work with its own cursor. Keywords are captured by value, so
/// edits made while a tick runs apply from the next tick on.
#[derive(Debug, Clone)]
pub enum CheckerTask {
    Forum {
        forum: ForumConfig,
        keywords: Vec<String>,
    },
    QaSite(StackExchangeConfig),
    Governance {
        config: GovernanceConfig,
        snapshot_key: String,
    },
}

#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub cursor_key: CursorKey,
    pub task: CheckerTask,
}

/// Expand one checker config into its cursor-bearing tasks. A multi-forum
/// config yields one task per forum, each with its own cursor. The first
/// forum keeps the plain `<user>_discourse` key, so adding a second forum
/// does not reset the first one's cursor.
pub fn plan(user: &str, config: &CheckerConfig) -> Vec<PlannedTask> {
    let kind = config.kind().as_str();
    match config {
        CheckerConfig::Discourse(c) => c
            .forums
            .iter()
            .enumerate()
            .map(|(i, forum)| {
                let mut key = CursorKey::new(user, kind);
                if i > 0 {
                    key = key.with_sub(forum.label());
                }
                PlannedTask {
                    cursor_key: key,
                    task: CheckerTask::Forum {
                        forum: forum.clone(),
                        keywords: c.keywords.clone(),
                    },
                }
            })
            .collect(),
        CheckerConfig::StackExchange(c) => vec![PlannedTask {
            cursor_key: CursorKey::new(user, kind),
            task: CheckerTask::QaSite(c.clone()),
        }],
        CheckerConfig::Governance(c) => vec![PlannedTask {
            cursor_key: CursorKey::new(user, kind),
            task: CheckerTask::Governance {
                config: c.clone(),
                snapshot_key: format!("{user}_{kind}_{}", c.network),
            },
        }],
    }
}

/// Dispatch table: run the checker variant behind `task`.
pub async fn run_task(
    task: &CheckerTask,
    since: DateTime<Utc>,
    sources: &SourceClients,
    snapshots: &mut SnapshotCache,
) -> CheckerRun {
    match task {
        CheckerTask::Forum { forum, keywords } => {
            discourse::check(sources.discourse.as_ref(), forum, keywords, since).await
        }
        CheckerTask::QaSite(config) => {
            stackexchange::check(sources.stackexchange.as_ref(), config, since).await
        }
        CheckerTask::Governance {
            config,
            snapshot_key,
        } => match config.strategy {
            FreshnessStrategy::Cursor => {
                governance::check_since(sources.governance.as_ref(), config, since).await
            }
            FreshnessStrategy::Snapshot => {
                governance::check_snapshot(
                    sources.governance.as_ref(),
                    config,
                    snapshot_key,
                    snapshots,
                )
                .await
            }
        },
    }
}
