//! Chat export loaders.

use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::conversation::{ChatKind, Conversation};
use crate::error::{ChatlabelError, Result};

static WHATSAPP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d{2}/\d{2}/\d{4}), (\d{2}:\d{2}:\d{2})\] ([^:]+): (.+)$")
        .expect("whatsapp line pattern")
});

const WHATSAPP_TIMESTAMP: &str = "%d/%m/%Y %H:%M:%S";

/// Parses a WhatsApp "export chat" text file.
///
/// Lines that do not start a new message are continuation lines of the
/// previous one. Lines before the first message are skipped.
pub fn parse_whatsapp(name: &str, raw: &str) -> Result<Conversation> {
    let mut chat = Conversation::new(name, ChatKind::WhatsApp);
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.replace(['\u{200e}', '\u{200f}'], "");
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = WHATSAPP_LINE.captures(line) {
            let stamp = format!("{} {}", &caps[1], &caps[2]);
            let timestamp = NaiveDateTime::parse_from_str(&stamp, WHATSAPP_TIMESTAMP)
                .map_err(|e| {
                    ChatlabelError::Transcript(format!(
                        "line {}: bad timestamp {stamp:?}: {e}",
                        line_no + 1
                    ))
                })?;
            chat.push(caps[3].trim(), timestamp, &caps[4]);
        } else if !chat.extend_last(line) {
            tracing::warn!(line = line_no + 1, "line outside message context skipped");
        }
    }
    if chat.is_empty() {
        return Err(ChatlabelError::Transcript(format!(
            "no messages found in {name}"
        )));
    }
    Ok(chat)
}

pub fn load_whatsapp(path: &Path) -> Result<Conversation> {
    let raw = fs::read_to_string(path)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "chat".to_string());
    parse_whatsapp(&name, &raw)
}

pub fn load_json(path: &Path) -> Result<Conversation> {
    let raw = fs::read_to_string(path)?;
    Conversation::from_json(&raw)
}

pub fn save_json(conversation: &Conversation, path: &Path) -> Result<()> {
    fs::write(path, conversation.to_json()?)?;
    Ok(())
}
