//! Command language parsed out of inbound chat text.
//!
//! Grammar: `<keyword> <JSON array>` where the array holds
//! `{"url": "...", "filename": "..."}` objects. Torrent items may use
//! `magnet` instead of `url` and may pick a file with `index`.

use std::path::{Component, Path};

use serde::Serialize;

use crate::config::{AllowList, Keywords};

/// Which fetcher a command is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    Http,
    Torrent,
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Torrent => write!(f, "torrent"),
        }
    }
}

/// One file to acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchItem {
    /// URL or magnet reference.
    pub source_ref: String,
    /// Relative destination name inside the download directory.
    pub filename: String,
    /// Designated file inside a torrent.
    pub file_index: Option<usize>,
}

/// A validated fetch command. `items` is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub sender: String,
    /// Conversation replies go to.
    pub conversation: String,
    pub keyword: String,
    pub items: Vec<FetchItem>,
}

/// Why a keyword-bearing message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Unauthorized,
    MalformedPayload,
    MissingField,
    UnsafeFilename,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unauthorized => "unauthorized",
            Self::MalformedPayload => "malformed_payload",
            Self::MissingField => "missing_field",
            Self::UnsafeFilename => "unsafe_filename",
        };
        write!(f, "{s}")
    }
}

/// Parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FetchHttp(FetchRequest),
    FetchTorrent(FetchRequest),
    /// Ordinary chatter that carries no command.
    Echo { sender: String, text: String },
    Invalid {
        sender: String,
        conversation: String,
        keyword: String,
        reason: InvalidReason,
        detail: String,
    },
}

/// Render the literal usage example for a keyword.
pub fn usage(keyword: &str) -> String {
    format!(r#"{keyword} [ {{ "url": "...", "filename": "..." }} ]"#)
}

/// Converts raw text into a [`Command`]. Pure; holds only configuration.
#[derive(Debug, Clone)]
pub struct CommandParser {
    allow_list: AllowList,
    keywords: Keywords,
}

impl CommandParser {
    pub fn new(allow_list: AllowList, keywords: Keywords) -> Self {
        Self {
            allow_list,
            keywords,
        }
    }

    /// Parse `text` sent by `sender` in `conversation`.
    pub fn parse(&self, sender: &str, conversation: &str, text: &str) -> Command {
        let trimmed = text.trim();
        let (head, rest) = split_keyword(trimmed);
        let lower = head.to_lowercase();

        let kind = if self.keywords.torrent.iter().any(|k| *k == lower) {
            FetchKind::Torrent
        } else if self.keywords.http.iter().any(|k| *k == lower) {
            FetchKind::Http
        } else {
            return Command::Echo {
                sender: sender.to_string(),
                text: text.to_string(),
            };
        };

        let invalid = |reason: InvalidReason, detail: String| Command::Invalid {
            sender: sender.to_string(),
            conversation: conversation.to_string(),
            keyword: lower.clone(),
            reason,
            detail,
        };

        if !self.allow_list.is_allowed(sender) {
            return invalid(
                InvalidReason::Unauthorized,
                format!("sender {sender} is not allow-listed"),
            );
        }

        let items = match parse_items(rest) {
            Ok(items) => items,
            Err((reason, detail)) => return invalid(reason, detail),
        };

        let request = FetchRequest {
            sender: sender.to_string(),
            conversation: conversation.to_string(),
            keyword: lower.clone(),
            items,
        };
        match kind {
            FetchKind::Http => Command::FetchHttp(request),
            FetchKind::Torrent => Command::FetchTorrent(request),
        }
    }
}

/// Split off the leading keyword token. The token ends at whitespace or `[`.
fn split_keyword(text: &str) -> (&str, &str) {
    let end = text
        .find(|c: char| c.is_whitespace() || c == '[')
        .unwrap_or(text.len());
    (&text[..end], text[end..].trim())
}

fn parse_items(payload: &str) -> Result<Vec<FetchItem>, (InvalidReason, String)> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| (InvalidReason::MalformedPayload, format!("invalid JSON: {e}")))?;

    let serde_json::Value::Array(entries) = value else {
        return Err((
            InvalidReason::MalformedPayload,
            "expected a JSON array".to_string(),
        ));
    };

    if entries.is_empty() {
        return Err((InvalidReason::MissingField, "the list is empty".to_string()));
    }

    entries.iter().map(parse_item).collect()
}

fn parse_item(entry: &serde_json::Value) -> Result<FetchItem, (InvalidReason, String)> {
    let missing = || {
        (
            InvalidReason::MissingField,
            format!("missing url or filename for {entry}"),
        )
    };

    let object = entry.as_object().ok_or_else(missing)?;
    let non_empty = |key: &str| {
        object
            .get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let source_ref = non_empty("url").or_else(|| non_empty("magnet")).ok_or_else(missing)?;
    let filename = non_empty("filename").ok_or_else(missing)?;

    if !is_safe_filename(filename) {
        return Err((
            InvalidReason::UnsafeFilename,
            format!("filename '{filename}' must be a plain relative path"),
        ));
    }

    let file_index = match object.get("index") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(v.as_u64().ok_or_else(|| {
            (
                InvalidReason::MalformedPayload,
                format!("index must be a non-negative integer, got {v}"),
            )
        })? as usize),
    };

    Ok(FetchItem {
        source_ref: source_ref.to_string(),
        filename: filename.to_string(),
        file_index,
    })
}

/// Relative, no traversal, no root or drive prefix.
pub fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() || name.contains('\0') || name.contains('\\') {
        return false;
    }
    let path = Path::new(name);
    path.components().count() > 0
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.file_name().is_some()
}
