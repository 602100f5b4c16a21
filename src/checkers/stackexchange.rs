// src/checkers/stackexchange.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{clean_text, truncate_abstract, Candidate, CheckerRun};

fn default_api_base() -> String {
    "https://api.stackexchange.com".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StackExchangeConfig {
    /// API site parameter, e.g. `substrate` or `stackoverflow`.
    pub site: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<Question>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Owner {
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Question {
    pub title: String,
    pub link: String,
    /// Unix seconds.
    #[serde(default)]
    pub creation_date: Option<i64>,
    #[serde(default)]
    pub owner: Owner,
}

#[async_trait]
pub trait StackExchangeApi: Send + Sync {
    async fn search(
        &self,
        config: &StackExchangeConfig,
        keyword: &str,
        from_date: i64,
    ) -> Result<Vec<Question>>;
}

pub struct HttpStackExchange {
    client: reqwest::Client,
}

impl HttpStackExchange {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StackExchangeApi for HttpStackExchange {
    async fn search(
        &self,
        config: &StackExchangeConfig,
        keyword: &str,
        from_date: i64,
    ) -> Result<Vec<Question>> {
        let url = format!("{}/2.3/search/advanced", config.api_base.trim_end_matches('/'));
        let from = from_date.to_string();
        let mut params = vec![
            ("site", config.site.as_str()),
            ("sort", "creation"),
            ("q", keyword),
            ("fromdate", from.as_str()),
            ("filter", "withbody"),
        ];
        if let Some(key) = config.api_key.as_deref() {
            params.push(("key", key));
        }
        let resp: SearchResponse = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .with_context(|| format!("stackexchange search {url}"))?
            .error_for_status()
            .context("stackexchange search non-2xx")?
            .json()
            .await
            .context("decoding stackexchange search response")?;
        Ok(resp.items)
    }
}

/// One search per keyword, from the cursor's epoch second. Creation dates
/// only have second resolution while the cursor keeps sub-second precision,
/// so questions in the cursor's own second are kept: one that landed just
/// after the tick started may be sent twice, but none is lost.
pub async fn check(
    api: &dyn StackExchangeApi,
    config: &StackExchangeConfig,
    since: DateTime<Utc>,
) -> CheckerRun {
    let mut run = CheckerRun::default();
    let from_date = since.timestamp();
    for keyword in &config.keywords {
        let questions = match api.search(config, keyword, from_date).await {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(
                    site = %config.site,
                    keyword = %keyword,
                    error = ?e,
                    "stackexchange search failed"
                );
                run.fetch_errors += 1;
                continue;
            }
        };
        for q in questions {
            if q.creation_date.is_some_and(|t| t < from_date) {
                run.stale += 1;
                continue;
            }
            run.candidates.push(candidate(keyword, &q));
        }
    }
    run
}

fn candidate(keyword: &str, q: &Question) -> Candidate {
    let author = q
        .owner
        .display_name
        .as_deref()
        .map(clean_text)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    Candidate {
        source_label: "Stack Exchange".to_string(),
        author,
        title: None,
        summary: truncate_abstract(&clean_text(&q.title)),
        summary_is_markdown: false,
        permalink: q.link.clone(),
        matched_keyword: keyword.to_string(),
        reference: None,
    }
}
