// src/reconfig.rs
//! Chat commands that change a running checker's keywords.
//!
//! `!set_keywords <checker_type> <kw1,kw2,...>` replaces the keyword list of
//! the sender's checkers of that type. Changes live in memory only and apply
//! from the next tick.

use anyhow::Result;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::checkers::CheckerKind;
use crate::config::{CheckerSlot, ConfigHandle};
use crate::keywords::parse_keyword_list;
use crate::notify::{ChatTransport, OutboundMessage};

/// A text message received from the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub room_id: String,
    pub sender: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetKeywords { checker: String, keywords: Vec<String> },
}

/// Rejections, worded as the reply the sender gets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconfigError {
    #[error("You are not a registered user.")]
    UnknownSender,
    #[error("No checker of type '{0}' found.")]
    UnknownChecker(String),
    #[error("Usage: !set_keywords <checker_type> <keyword1,keyword2,...>")]
    Malformed,
    #[error("Unknown command '!{0}'.")]
    UnknownCommand(String),
}

static RE_SET_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+(.+)$").expect("set_keywords regex"));

/// `None` for ordinary chat, otherwise the parsed command or why it is wrong.
pub fn parse_command(body: &str) -> Option<Result<Command, ReconfigError>> {
    let rest = body.trim().strip_prefix('!')?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (rest, ""),
    };
    if name != "set_keywords" {
        return Some(Err(ReconfigError::UnknownCommand(name.to_string())));
    }
    let Some(caps) = RE_SET_KEYWORDS.captures(args) else {
        return Some(Err(ReconfigError::Malformed));
    };
    let keywords = parse_keyword_list(&caps[2]);
    if keywords.is_empty() {
        return Some(Err(ReconfigError::Malformed));
    }
    Some(Ok(Command::SetKeywords {
        checker: caps[1].to_string(),
        keywords,
    }))
}

/// Apply `cmd` on behalf of `sender` and return the acknowledgement text.
pub fn apply(
    handle: &ConfigHandle,
    sender: &str,
    cmd: Command,
) -> Result<String, ReconfigError> {
    let Command::SetKeywords { checker, keywords } = cmd;
    handle.update(|users| {
        let user = users
            .iter_mut()
            .find(|u| u.matrix_user_id == sender)
            .ok_or(ReconfigError::UnknownSender)?;
        let kind: CheckerKind = checker
            .parse()
            .map_err(|_| ReconfigError::UnknownChecker(checker.clone()))?;

        let mut updated = 0usize;
        for slot in &mut user.checkers {
            if let CheckerSlot::Ready(c) = slot {
                if c.kind() == kind {
                    c.set_keywords(keywords.clone());
                    updated += 1;
                }
            }
        }
        if updated == 0 {
            return Err(ReconfigError::UnknownChecker(checker.clone()));
        }
        tracing::info!(user = %user.name, checker = %kind, ?keywords, "keywords updated");
        Ok(format!(
            "Keywords updated for {kind} checker: {}",
            keywords.join(", ")
        ))
    })
}

/// Reply text for an inbound message. Ordinary chat and commands other than
/// `!set_keywords` get no reply, whoever sent them.
pub fn handle_message(handle: &ConfigHandle, msg: &InboundMessage) -> Option<String> {
    let outcome = match parse_command(&msg.body)? {
        Err(ReconfigError::UnknownCommand(name)) => {
            counter!("relay_commands_total", "outcome" => "ignored").increment(1);
            tracing::debug!(sender = %msg.sender, command = %name, "ignoring unknown command");
            return None;
        }
        parsed => parsed.and_then(|cmd| apply(handle, &msg.sender, cmd)),
    };
    let reply = match outcome {
        Ok(ack) => {
            counter!("relay_commands_total", "outcome" => "applied").increment(1);
            ack
        }
        Err(e) => {
            counter!("relay_commands_total", "outcome" => "rejected").increment(1);
            tracing::info!(sender = %msg.sender, reason = %e, "command rejected");
            e.to_string()
        }
    };
    Some(reply)
}

/// Handle `msg` and post any reply to the room it came from. Returns whether
/// a reply was sent.
pub async fn respond(
    handle: &ConfigHandle,
    transport: &dyn ChatTransport,
    msg: &InboundMessage,
) -> Result<bool> {
    let Some(reply) = handle_message(handle, msg) else {
        return Ok(false);
    };
    transport
        .send(&msg.room_id, &OutboundMessage::plain(reply))
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_keywords() {
        let cmd = parse_command("!set_keywords governance treasury, runtime ,fees")
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            Command::SetKeywords {
                checker: "governance".into(),
                keywords: vec!["treasury".into(), "runtime".into(), "fees".into()],
            }
        );
    }

    #[test]
    fn ordinary_chat_is_ignored() {
        assert!(parse_command("hello there").is_none());
        assert!(parse_command("").is_none());
    }

    #[test]
    fn malformed_and_unknown_commands() {
        assert_eq!(
            parse_command("!set_keywords governance"),
            Some(Err(ReconfigError::Malformed))
        );
        assert_eq!(
            parse_command("!set_keywords governance , ,"),
            Some(Err(ReconfigError::Malformed))
        );
        assert_eq!(
            parse_command("!mute 5m"),
            Some(Err(ReconfigError::UnknownCommand("mute".into())))
        );
    }
}
