// src/notify/mod.rs
//! Rendering and delivery of notifications.
//!
//! Every candidate becomes one message carrying both a plain-text body and
//! an HTML body; the chat client picks which one to show. Delivery is best
//! effort: a failed send is logged and the next candidate still goes out.

pub mod matrix;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use metrics::counter;
use pulldown_cmark::{html, Event, Parser};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::checkers::Candidate;

pub const MSGTYPE_TEXT: &str = "m.text";
pub const HTML_FORMAT: &str = "org.matrix.custom.html";

/// Message content as sent to the chat server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub msgtype: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
}

impl OutboundMessage {
    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            msgtype: MSGTYPE_TEXT.to_string(),
            body: body.into(),
            format: None,
            formatted_body: None,
        }
    }

    pub fn rich(body: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            msgtype: MSGTYPE_TEXT.to_string(),
            body: body.into(),
            format: Some(HTML_FORMAT.to_string()),
            formatted_body: Some(html.into()),
        }
    }
}

/// Plain: `author - abstract\npermalink` (titled candidates get the title on
/// the first line). Rich: bold source/keyword/author and a link.
pub fn render(c: &Candidate) -> OutboundMessage {
    let plain = match &c.title {
        Some(title) => format!("{} - {}\n{}\n{}", c.author, title, c.summary, c.permalink),
        None => format!("{} - {}\n{}", c.author, c.summary, c.permalink),
    };

    let summary_html = if c.summary_is_markdown {
        markdown_to_html(&c.summary)
    } else {
        html_escape::encode_text(&c.summary).to_string()
    };
    let mut rich = format!(
        "🔍 <strong>{} ({})</strong><br><strong>{}</strong> - ",
        html_escape::encode_text(&c.source_label),
        html_escape::encode_text(&c.matched_keyword),
        html_escape::encode_text(&c.author),
    );
    if let Some(title) = &c.title {
        rich.push_str(&html_escape::encode_text(title));
        rich.push_str("<br>");
    }
    rich.push_str(&summary_html);
    rich.push_str(&format!(
        "<br><a href='{}'>Read more</a>",
        html_escape::encode_single_quoted_attribute(&c.permalink)
    ));

    OutboundMessage::rich(plain, rich)
}

/// Markdown to HTML; raw HTML blocks in the source are shown as text.
pub fn markdown_to_html(md: &str) -> String {
    let parser = Parser::new(md).map(|ev| match ev {
        Event::Html(raw) => Event::Text(raw),
        other => other,
    });
    let mut out = String::with_capacity(md.len() + md.len() / 2);
    html::push_html(&mut out, parser);
    out.trim_end().to_string()
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, room_id: &str, message: &OutboundMessage) -> Result<()>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &dyn ChatTransport {
        self.transport.as_ref()
    }

    pub async fn dispatch(&self, room_id: &str, candidate: &Candidate) -> Result<()> {
        self.transport.send(room_id, &render(candidate)).await
    }

    /// Deliver every candidate in order. Failures are logged and counted,
    /// never retried, and never stop the remaining sends.
    pub async fn dispatch_all(&self, room_id: &str, candidates: &[Candidate]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for c in candidates {
            match self.dispatch(room_id, c).await {
                Ok(()) => {
                    report.delivered += 1;
                    counter!("relay_deliveries_total").increment(1);
                    tracing::debug!(room_id, permalink = %c.permalink, "notification sent");
                }
                Err(e) => {
                    report.failed += 1;
                    counter!("relay_delivery_failures_total").increment(1);
                    tracing::error!(
                        room_id,
                        transport = self.transport.name(),
                        permalink = %c.permalink,
                        error = ?e,
                        "notification delivery failed"
                    );
                }
            }
        }
        report
    }
}

// --- Test helper ---
/// Transport that records messages instead of sending them. Sends whose
/// 0-based attempt number is in `fail_on` return an error.
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, OutboundMessage)>>,
    fail_on: Vec<usize>,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::failing_on(Vec::new())
    }

    pub fn failing_on(fail_on: Vec<usize>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_on,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        match self.sent.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, room_id: &str, message: &OutboundMessage) -> Result<()> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&n) {
            return Err(anyhow!("simulated delivery failure #{n}"));
        }
        let mut sent = self.sent.lock().map_err(|_| anyhow!("recording mutex poisoned"))?;
        sent.push((room_id.to_string(), message.clone()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
