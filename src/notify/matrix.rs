// src/notify/matrix.rs
//! Minimal Matrix client-server API client: send room messages and long-poll
//! `/sync` for inbound commands.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{ChatTransport, OutboundMessage};
use crate::config::{ConfigHandle, MatrixConfig};
use crate::reconfig::{self, InboundMessage};

/// Pause after a failed `/sync` before trying again.
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct MatrixClient {
    homeserver: Url,
    user_id: String,
    access_token: String,
    client: Client,
    request_timeout: Duration,
    sync_timeout_ms: u64,
    txn_prefix: String,
    txn_counter: AtomicU64,
}

impl MatrixClient {
    pub fn new(cfg: &MatrixConfig, client: Client) -> Result<Self> {
        let homeserver = Url::parse(&cfg.homeserver)
            .with_context(|| format!("invalid homeserver url {}", cfg.homeserver))?;
        if homeserver.cannot_be_a_base() {
            return Err(anyhow!("homeserver url cannot be a base: {}", cfg.homeserver));
        }
        Ok(Self {
            homeserver,
            user_id: cfg.user_id.clone(),
            access_token: cfg.access_token.clone(),
            client,
            request_timeout: Duration::from_secs(cfg.request_timeout_secs.max(1)),
            sync_timeout_ms: cfg.sync_timeout_ms,
            txn_prefix: format!("relay{}", chrono::Utc::now().timestamp_millis()),
            txn_counter: AtomicU64::new(0),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("homeserver url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}.{n}", self.txn_prefix)
    }

    /// One `/sync` round. Without `since` the call returns immediately and
    /// only yields the token to continue from.
    pub async fn sync(&self, since: Option<&str>) -> Result<SyncBatch> {
        let url = self.endpoint(&["_matrix", "client", "v3", "sync"])?;
        let timeout_ms = if since.is_some() { self.sync_timeout_ms } else { 0 };
        let mut req = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .timeout(self.request_timeout + Duration::from_millis(timeout_ms))
            .query(&[("timeout", timeout_ms.to_string())]);
        if let Some(since) = since {
            req = req.query(&[("since", since)]);
        }
        let resp: SyncResponse = req
            .send()
            .await
            .context("matrix sync")?
            .error_for_status()
            .context("matrix sync non-2xx")?
            .json()
            .await
            .context("decoding matrix sync response")?;
        Ok(resp.into_batch(&self.user_id))
    }

    /// Background task that routes `!` commands from joined rooms to the
    /// reconfiguration handler and posts the replies.
    pub fn spawn_command_listener(self: Arc<Self>, handle: ConfigHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut since: Option<String> = None;
            loop {
                match self.sync(since.as_deref()).await {
                    Ok(batch) => {
                        // The first batch is history; only take its token.
                        if since.is_some() {
                            for msg in &batch.messages {
                                if let Err(e) =
                                    reconfig::respond(&handle, self.as_ref(), msg).await
                                {
                                    tracing::warn!(
                                        room_id = %msg.room_id,
                                        error = ?e,
                                        "command reply failed"
                                    );
                                }
                            }
                        }
                        since = Some(batch.next_batch);
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "matrix sync failed");
                        tokio::time::sleep(SYNC_RETRY_DELAY).await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ChatTransport for MatrixClient {
    async fn send(&self, room_id: &str, message: &OutboundMessage) -> Result<()> {
        let txn = self.next_txn_id();
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room_id,
            "send",
            "m.room.message",
            txn.as_str(),
        ])?;
        self.client
            .put(url)
            .bearer_auth(&self.access_token)
            .timeout(self.request_timeout)
            .json(message)
            .send()
            .await
            .with_context(|| format!("matrix send to {room_id}"))?
            .error_for_status()
            .context("matrix send non-2xx")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "matrix"
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncBatch {
    pub next_batch: String,
    pub messages: Vec<InboundMessage>,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: Rooms,
}

#[derive(Debug, Default, Deserialize)]
struct Rooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<RoomEvent>,
}

#[derive(Debug, Deserialize)]
struct RoomEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    content: serde_json::Value,
}

impl SyncResponse {
    /// Text messages from other users, across all joined rooms.
    fn into_batch(self, own_user_id: &str) -> SyncBatch {
        let mut messages = Vec::new();
        for (room_id, room) in self.rooms.join {
            for ev in room.timeline.events {
                if ev.kind != "m.room.message" || ev.sender == own_user_id {
                    continue;
                }
                if ev.content.get("msgtype").and_then(|v| v.as_str()) != Some("m.text") {
                    continue;
                }
                if let Some(body) = ev.content.get("body").and_then(|v| v.as_str()) {
                    messages.push(InboundMessage {
                        room_id: room_id.clone(),
                        sender: ev.sender,
                        body: body.to_string(),
                    });
                }
            }
        }
        SyncBatch {
            next_batch: self.next_batch,
            messages,
        }
    }
}
