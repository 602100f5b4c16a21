// src/checkers/governance.rs
//! Governance referenda.
//!
//! Two freshness strategies, picked per checker:
//! - `cursor` (default): walk the reverse-chronological listing and stop at
//!   the first referendum created before the cursor.
//! - `snapshot`: fetch every ongoing referendum and diff against the last
//!   stored set; only newly appeared indices count.
//!
//! New referenda are enriched with their off-chain title/content and then
//! filtered through the keyword matcher.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{truncate_abstract, Candidate, CheckerRun};
use crate::keywords::match_item;
use crate::state::{Snapshot, SnapshotCache};

/// Upper bound on listing pages walked in one run.
const MAX_PAGES: u32 = 50;

/// Listing states that count as "ongoing" for the snapshot strategy.
const ONGOING_STATES: &[&str] = &["Submitted", "Preparing", "Queueing", "Deciding", "Confirming"];

const NO_DETAILS: &str = "Unable to retrieve details from both sources";

fn default_detail_base() -> String {
    "https://api.polkassembly.io".to_string()
}

fn default_page_size() -> u32 {
    100
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessStrategy {
    #[default]
    Cursor,
    Snapshot,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GovernanceConfig {
    /// Network name, e.g. `kusama` or `polkadot`.
    pub network: String,
    #[serde(default)]
    pub strategy: FreshnessStrategy,
    /// Listing host; defaults to `https://{network}.subsquare.io`.
    #[serde(default)]
    pub listing_base: Option<String>,
    #[serde(default = "default_detail_base")]
    pub detail_base: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl GovernanceConfig {
    pub fn listing_base(&self) -> String {
        match &self.listing_base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}.subsquare.io", self.network),
        }
    }

    pub fn permalink(&self, index: u64) -> String {
        format!("{}/referenda/referendum/{index}", self.listing_base())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReferendumState {
    #[serde(default)]
    pub name: String,
}

/// A row of the referenda listing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferendumSummary {
    pub referendum_index: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub proposer: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub state: Option<ReferendumState>,
}

impl ReferendumSummary {
    fn is_ongoing(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| ONGOING_STATES.iter().any(|o| o.eq_ignore_ascii_case(&s.name)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferendaPage {
    #[serde(default)]
    pub items: Vec<ReferendumSummary>,
    #[serde(default)]
    pub total: u64,
}

/// Off-chain discussion attached to a referendum.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferendumDetail {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[async_trait]
pub trait GovernanceApi: Send + Sync {
    /// One page of the listing, newest first. Pages start at 1.
    async fn referenda_page(&self, config: &GovernanceConfig, page: u32) -> Result<ReferendaPage>;

    async fn referendum_detail(
        &self,
        config: &GovernanceConfig,
        index: u64,
    ) -> Result<ReferendumDetail>;
}

pub struct HttpGovernance {
    client: reqwest::Client,
}

impl HttpGovernance {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GovernanceApi for HttpGovernance {
    async fn referenda_page(&self, config: &GovernanceConfig, page: u32) -> Result<ReferendaPage> {
        let url = format!("{}/api/gov2/referendums", config.listing_base());
        self.client
            .get(&url)
            .header("x-network", &config.network)
            .query(&[("page", page), ("pageSize", config.page_size)])
            .send()
            .await
            .with_context(|| format!("referenda listing {url} page {page}"))?
            .error_for_status()
            .context("referenda listing non-2xx")?
            .json()
            .await
            .context("decoding referenda listing")
    }

    async fn referendum_detail(
        &self,
        config: &GovernanceConfig,
        index: u64,
    ) -> Result<ReferendumDetail> {
        let url = format!(
            "{}/api/v1/posts/on-chain-post",
            config.detail_base.trim_end_matches('/')
        );
        let post_id = index.to_string();
        self.client
            .get(&url)
            .header("x-network", &config.network)
            .query(&[("postId", post_id.as_str()), ("proposalType", "referendums_v2")])
            .send()
            .await
            .with_context(|| format!("referendum detail {index}"))?
            .error_for_status()
            .context("referendum detail non-2xx")?
            .json()
            .await
            .context("decoding referendum detail")
    }
}

/// Cursor strategy. Relies on the listing being newest-first: pagination
/// stops at the first item created before `since`.
pub async fn check_since(
    api: &dyn GovernanceApi,
    config: &GovernanceConfig,
    since: DateTime<Utc>,
) -> CheckerRun {
    let fresh = match fetch_newer_than(api, config, since).await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(network = %config.network, error = ?e, "referenda listing failed");
            return CheckerRun::failed();
        }
    };
    tracing::debug!(network = %config.network, new = fresh.len(), "referenda newer than cursor");
    let mut run = CheckerRun::default();
    for item in &fresh {
        if let Some(c) = enrich_and_match(api, config, item).await {
            run.candidates.push(c);
        }
    }
    run
}

async fn fetch_newer_than(
    api: &dyn GovernanceApi,
    config: &GovernanceConfig,
    since: DateTime<Utc>,
) -> Result<Vec<ReferendumSummary>> {
    let mut fresh = Vec::new();
    let mut seen: u64 = 0;
    for page in 1..=MAX_PAGES {
        let batch = api.referenda_page(config, page).await?;
        if batch.items.is_empty() {
            break;
        }
        seen += batch.items.len() as u64;
        for item in batch.items {
            match item.created_at {
                Some(t) if t < since => return Ok(fresh),
                Some(t) if t > since => fresh.push(item),
                Some(_) => {}
                None => {
                    tracing::debug!(
                        index = item.referendum_index,
                        "referendum without createdAt, skipped"
                    );
                }
            }
        }
        if seen >= batch.total {
            break;
        }
    }
    Ok(fresh)
}

/// Snapshot strategy: diff the ongoing set against the stored baseline.
pub async fn check_snapshot(
    api: &dyn GovernanceApi,
    config: &GovernanceConfig,
    snapshot_key: &str,
    snapshots: &mut SnapshotCache,
) -> CheckerRun {
    let ongoing = match fetch_ongoing(api, config).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(network = %config.network, error = ?e, "ongoing referenda fetch failed");
            return CheckerRun::failed();
        }
    };
    let items: Vec<ReferendumSummary> = ongoing
        .values()
        .filter_map(|v| serde_json::from_value(v.clone()).ok())
        .collect();

    let diff = match snapshots.diff(snapshot_key, ongoing).await {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(snapshot_key, error = ?e, "snapshot diff failed");
            return CheckerRun::failed();
        }
    };
    tracing::debug!(
        snapshot_key,
        added = diff.added.len(),
        changed = diff.changed,
        removed = diff.removed,
        "referenda snapshot diff"
    );

    let mut run = CheckerRun::default();
    for item in items
        .iter()
        .filter(|i| diff.added.contains(&i.referendum_index.to_string()))
    {
        if let Some(c) = enrich_and_match(api, config, item).await {
            run.candidates.push(c);
        }
    }
    run
}

async fn fetch_ongoing(api: &dyn GovernanceApi, config: &GovernanceConfig) -> Result<Snapshot> {
    let mut out = Snapshot::new();
    let mut seen: u64 = 0;
    for page in 1..=MAX_PAGES {
        let batch = api.referenda_page(config, page).await?;
        if batch.items.is_empty() {
            break;
        }
        seen += batch.items.len() as u64;
        for item in batch.items.into_iter().filter(ReferendumSummary::is_ongoing) {
            let value = serde_json::to_value(&item).context("encoding referendum")?;
            out.insert(item.referendum_index.to_string(), value);
        }
        if seen >= batch.total {
            break;
        }
    }
    Ok(out)
}

/// Fetch off-chain details, then keep the referendum only if a keyword hits
/// its title or content.
async fn enrich_and_match(
    api: &dyn GovernanceApi,
    config: &GovernanceConfig,
    item: &ReferendumSummary,
) -> Option<Candidate> {
    let index = item.referendum_index;
    let (title, content) = match api.referendum_detail(config, index).await {
        Ok(detail) => match detail.title {
            Some(title) => (title, detail.content.unwrap_or_default()),
            None => ("None".to_string(), NO_DETAILS.to_string()),
        },
        Err(e) => {
            tracing::warn!(index, error = ?e, "referendum detail fetch failed, using listing data");
            (
                item.title.clone().unwrap_or_else(|| "None".to_string()),
                item.content.clone().unwrap_or_default(),
            )
        }
    };

    let keyword = match_item(&title, &content, &config.keywords)?;
    Some(Candidate {
        source_label: format!("Governance ({})", config.network),
        author: item
            .proposer
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        title: Some(title),
        summary: truncate_abstract(&content),
        summary_is_markdown: true,
        permalink: config.permalink(index),
        matched_keyword: keyword.to_string(),
        reference: Some(index.to_string()),
    })
}
