// src/checkers/discourse.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{clean_text, truncate_abstract, Candidate, CheckerRun};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForumConfig {
    /// Short id used in cursor keys; defaults to the forum host.
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    pub api_key: String,
    pub api_user: String,
}

impl ForumConfig {
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn label(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.base_url().to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscourseConfig {
    pub forums: Vec<ForumConfig>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    posts: Vec<DiscoursePost>,
}

/// One hit from `/search.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoursePost {
    #[serde(default)]
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub blurb: String,
    pub topic_id: u64,
    pub post_number: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DiscourseApi: Send + Sync {
    /// Run a raw Discourse search query against `forum`.
    async fn search(&self, forum: &ForumConfig, query: &str) -> Result<Vec<DiscoursePost>>;
}

pub struct HttpDiscourse {
    client: reqwest::Client,
}

impl HttpDiscourse {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscourseApi for HttpDiscourse {
    async fn search(&self, forum: &ForumConfig, query: &str) -> Result<Vec<DiscoursePost>> {
        let url = format!("{}/search.json", forum.base_url());
        let resp: SearchResponse = self
            .client
            .get(&url)
            .header("Api-Key", &forum.api_key)
            .header("Api-Username", &forum.api_user)
            .query(&[("q", query)])
            .send()
            .await
            .with_context(|| format!("discourse search {url}"))?
            .error_for_status()
            .context("discourse search non-2xx")?
            .json()
            .await
            .context("decoding discourse search response")?;
        Ok(resp.posts)
    }
}

/// Search query restricted to open topics after the cursor's calendar day.
pub fn search_query(keyword: &str, since: DateTime<Utc>) -> String {
    format!("{keyword} after:{} in:open", since.format("%Y-%m-%d"))
}

/// One search per keyword. `after:` only has day resolution, so posts not
/// strictly newer than `since` are dropped here as well.
pub async fn check(
    api: &dyn DiscourseApi,
    forum: &ForumConfig,
    keywords: &[String],
    since: DateTime<Utc>,
) -> CheckerRun {
    let mut run = CheckerRun::default();
    for keyword in keywords {
        let query = search_query(keyword, since);
        tracing::debug!(forum = forum.base_url(), %query, "searching forum");
        let posts = match api.search(forum, &query).await {
            Ok(posts) => posts,
            Err(e) => {
                tracing::warn!(
                    forum = forum.base_url(),
                    keyword = %keyword,
                    error = ?e,
                    "forum search failed"
                );
                run.fetch_errors += 1;
                continue;
            }
        };
        for post in posts {
            if post.created_at.is_some_and(|t| t <= since) {
                run.stale += 1;
                continue;
            }
            run.candidates.push(candidate(forum, keyword, &post));
        }
    }
    run
}

fn candidate(forum: &ForumConfig, keyword: &str, post: &DiscoursePost) -> Candidate {
    Candidate {
        source_label: format!("Discourse ({})", forum.base_url()),
        author: post.username.clone(),
        title: None,
        summary: truncate_abstract(&clean_text(&post.blurb)),
        summary_is_markdown: false,
        permalink: format!("{}/t/{}/{}", forum.base_url(), post.topic_id, post.post_number),
        matched_keyword: keyword.to_string(),
        reference: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn query_uses_cursor_day() {
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap();
        assert_eq!(search_query("security", since), "security after:2024-01-01 in:open");
    }

    #[test]
    fn forum_label_prefers_name_then_host() {
        let mut f = ForumConfig {
            name: None,
            url: "https://forum.polkadot.network/".into(),
            api_key: String::new(),
            api_user: String::new(),
        };
        assert_eq!(f.label(), "forum.polkadot.network");
        f.name = Some("polkadot".into());
        assert_eq!(f.label(), "polkadot");
    }

    #[test]
    fn candidate_links_to_post() {
        let forum = ForumConfig {
            name: None,
            url: "https://forum.example.org/".into(),
            api_key: String::new(),
            api_user: String::new(),
        };
        let post = DiscoursePost {
            id: 1,
            username: "carol".into(),
            blurb: "A <b>security</b> patch".into(),
            topic_id: 42,
            post_number: 3,
            created_at: None,
        };
        let c = candidate(&forum, "security", &post);
        assert_eq!(c.permalink, "https://forum.example.org/t/42/3");
        assert_eq!(c.summary, "A security patch");
        assert_eq!(c.source_label, "Discourse (https://forum.example.org)");
    }
}
