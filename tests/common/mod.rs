// tests/common/mod.rs
// In-process fakes for the source APIs, shared by the integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use keyword_relay::checkers::discourse::DiscoursePost;
use keyword_relay::checkers::governance::{
    ReferendaPage, ReferendumDetail, ReferendumState, ReferendumSummary,
};
use keyword_relay::checkers::stackexchange::{Owner, Question};
use keyword_relay::checkers::{
    DiscourseApi, DiscourseConfig, ForumConfig, GovernanceApi, GovernanceConfig, StackExchangeApi,
    StackExchangeConfig,
};
use keyword_relay::config::{CheckerSlot, UserConfig};
use keyword_relay::{CheckerConfig, SourceClients};

pub fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn user(name: &str, checkers: Vec<CheckerSlot>) -> UserConfig {
    UserConfig {
        name: name.to_string(),
        matrix_user_id: format!("@{name}:example.org"),
        matrix_room_id: format!("!{name}-room:example.org"),
        checkers,
    }
}

pub fn forum(url: &str) -> ForumConfig {
    ForumConfig {
        name: None,
        url: url.to_string(),
        api_key: "key".into(),
        api_user: "relay".into(),
    }
}

pub fn discourse_slot(keywords: &[&str]) -> CheckerSlot {
    CheckerSlot::Ready(CheckerConfig::Discourse(DiscourseConfig {
        forums: vec![forum("https://forum.example.org")],
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
    }))
}

pub fn stackexchange_slot(keywords: &[&str]) -> CheckerSlot {
    CheckerSlot::Ready(CheckerConfig::StackExchange(StackExchangeConfig {
        site: "substrate".into(),
        api_key: None,
        api_base: "https://api.stackexchange.com".into(),
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
    }))
}

pub fn governance_config(keywords: &[&str]) -> GovernanceConfig {
    serde_json::from_value(serde_json::json!({
        "network": "kusama",
        "page_size": 2,
        "keywords": keywords,
    }))
    .unwrap()
}

pub fn post(
    topic_id: u64,
    username: &str,
    blurb: &str,
    created_at: DateTime<Utc>,
) -> DiscoursePost {
    DiscoursePost {
        id: topic_id * 10,
        username: username.to_string(),
        blurb: blurb.to_string(),
        topic_id,
        post_number: 1,
        created_at: Some(created_at),
    }
}

pub fn referendum(
    index: u64,
    created_at: DateTime<Utc>,
    title: &str,
    state: &str,
) -> ReferendumSummary {
    ReferendumSummary {
        referendum_index: index,
        created_at: Some(created_at),
        proposer: Some("F3op".into()),
        title: Some(title.to_string()),
        content: None,
        state: Some(ReferendumState {
            name: state.to_string(),
        }),
    }
}

/// Forum fake: answers by the keyword at the front of the query.
#[derive(Default)]
pub struct FakeDiscourse {
    pub posts: Mutex<HashMap<String, Vec<DiscoursePost>>>,
    pub failing: Mutex<HashSet<String>>,
    pub queries: Mutex<Vec<String>>,
}

impl FakeDiscourse {
    pub fn with_posts(keyword: &str, posts: Vec<DiscoursePost>) -> Self {
        let fake = Self::default();
        fake.posts.lock().unwrap().insert(keyword.to_string(), posts);
        fake
    }

    pub fn fail_keyword(&self, keyword: &str) {
        self.failing.lock().unwrap().insert(keyword.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiscourseApi for FakeDiscourse {
    async fn search(&self, _forum: &ForumConfig, query: &str) -> Result<Vec<DiscoursePost>> {
        self.queries.lock().unwrap().push(query.to_string());
        let keyword = query.split(" after:").next().unwrap_or_default();
        if self.failing.lock().unwrap().contains(keyword) {
            return Err(anyhow!("forum unavailable"));
        }
        Ok(self
            .posts
            .lock()
            .unwrap()
            .get(keyword)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeStackExchange {
    pub questions: Mutex<HashMap<String, Vec<Question>>>,
}

impl FakeStackExchange {
    pub fn with_question(keyword: &str, title: &str, link: &str, created: DateTime<Utc>) -> Self {
        let fake = Self::default();
        fake.questions.lock().unwrap().insert(
            keyword.to_string(),
            vec![Question {
                title: title.to_string(),
                link: link.to_string(),
                creation_date: Some(created.timestamp()),
                owner: Owner {
                    display_name: Some("dave".into()),
                },
            }],
        );
        fake
    }
}

#[async_trait]
impl StackExchangeApi for FakeStackExchange {
    async fn search(
        &self,
        _config: &StackExchangeConfig,
        keyword: &str,
        _from_date: i64,
    ) -> Result<Vec<Question>> {
        Ok(self
            .questions
            .lock()
            .unwrap()
            .get(keyword)
            .cloned()
            .unwrap_or_default())
    }
}

/// Listing fake paginated by `page_size`, newest first as stored.
#[derive(Default)]
pub struct FakeGovernance {
    pub referenda: Mutex<Vec<ReferendumSummary>>,
    pub details: Mutex<HashMap<u64, ReferendumDetail>>,
    pub pages_requested: Mutex<Vec<u32>>,
    pub listing_down: Mutex<bool>,
}

impl FakeGovernance {
    pub fn with_referenda(items: Vec<ReferendumSummary>) -> Self {
        let fake = Self::default();
        *fake.referenda.lock().unwrap() = items;
        fake
    }

    pub fn set_detail(&self, index: u64, title: &str, content: &str) {
        self.details.lock().unwrap().insert(
            index,
            ReferendumDetail {
                title: Some(title.to_string()),
                content: Some(content.to_string()),
            },
        );
    }

    pub fn pages_requested(&self) -> Vec<u32> {
        self.pages_requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl GovernanceApi for FakeGovernance {
    async fn referenda_page(&self, config: &GovernanceConfig, page: u32) -> Result<ReferendaPage> {
        self.pages_requested.lock().unwrap().push(page);
        if *self.listing_down.lock().unwrap() {
            return Err(anyhow!("listing unavailable"));
        }
        let all = self.referenda.lock().unwrap().clone();
        let size = config.page_size as usize;
        let start = (page as usize - 1) * size;
        Ok(ReferendaPage {
            items: all.iter().skip(start).take(size).cloned().collect(),
            total: all.len() as u64,
        })
    }

    async fn referendum_detail(
        &self,
        _config: &GovernanceConfig,
        index: u64,
    ) -> Result<ReferendumDetail> {
        self.details
            .lock()
            .unwrap()
            .get(&index)
            .cloned()
            .ok_or_else(|| anyhow!("no detail for {index}"))
    }
}

pub fn sources(
    discourse: Arc<FakeDiscourse>,
    stackexchange: Arc<FakeStackExchange>,
    governance: Arc<FakeGovernance>,
) -> SourceClients {
    SourceClients {
        discourse,
        stackexchange,
        governance,
    }
}
