use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ChatlabelError, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static ATTACHMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<attached: (.+?)>$").expect("attachment pattern"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    #[default]
    WhatsApp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub index: u64,
    pub author: String,
    pub timestamp: NaiveDateTime,
    pub content: String,
    #[serde(default)]
    pub hidden: bool,
}

impl Message {
    /// One prompt line, newline included. The index is the one the model is
    /// asked to quote back, so it is rendered verbatim.
    pub fn render(&self) -> String {
        format!(
            "{} [{}] {}: {}\n",
            self.index,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.author,
            self.content
        )
    }

    pub fn attachment(&self) -> Option<&str> {
        ATTACHMENT
            .captures(self.content.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub name: String,
    #[serde(default)]
    pub kind: ChatKind,
    #[serde(default)]
    pub owner: Option<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationStats {
    pub messages: usize,
    pub hidden: usize,
    pub authors: usize,
    pub first: Option<NaiveDateTime>,
    pub last: Option<NaiveDateTime>,
}

impl Conversation {
    pub fn new(name: impl Into<String>, kind: ChatKind) -> Self {
        Self {
            name: name.into(),
            kind,
            owner: None,
            messages: Vec::new(),
        }
    }

    /// Builds a conversation from messages that already carry indices,
    /// rejecting duplicates or out-of-order indices instead of renumbering.
    pub fn from_messages(
        name: impl Into<String>,
        kind: ChatKind,
        messages: Vec<Message>,
    ) -> Result<Self> {
        let conversation = Self {
            name: name.into(),
            kind,
            owner: None,
            messages,
        };
        conversation.validate()?;
        Ok(conversation)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let conversation: Conversation = serde_json::from_str(raw)?;
        conversation.validate()?;
        Ok(conversation)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        for pair in self.messages.windows(2) {
            if pair[1].index <= pair[0].index {
                return Err(ChatlabelError::Transcript(format!(
                    "message index {} follows {}; indices must be unique and increasing",
                    pair[1].index, pair[0].index
                )));
            }
        }
        Ok(())
    }

    /// Appends a message at the next position and returns its index.
    pub fn push(
        &mut self,
        author: impl Into<String>,
        timestamp: NaiveDateTime,
        content: impl Into<String>,
    ) -> u64 {
        let index = self.messages.last().map(|m| m.index + 1).unwrap_or(0);
        self.messages.push(Message {
            index,
            author: author.into(),
            timestamp,
            content: content.into(),
            hidden: false,
        });
        index
    }

    /// Appends continuation text to the most recent message.
    pub fn extend_last(&mut self, text: &str) -> bool {
        match self.messages.last_mut() {
            Some(last) => {
                last.content.push('\n');
                last.content.push_str(text);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, position: usize) -> Option<&Message> {
        self.messages.get(position)
    }

    pub fn position_of(&self, index: u64) -> Option<usize> {
        self.messages.binary_search_by_key(&index, |m| m.index).ok()
    }

    pub fn contains_index(&self, index: u64) -> bool {
        self.position_of(index).is_some()
    }

    pub fn authors(&self) -> BTreeSet<&str> {
        self.messages.iter().map(|m| m.author.as_str()).collect()
    }

    /// Sets the `hidden` flag on every message whose index is listed and
    /// returns how many messages changed.
    pub fn set_hidden(&mut self, indices: &[u64], hidden: bool) -> usize {
        let mut changed = 0;
        for index in indices {
            if let Some(position) = self.position_of(*index) {
                let message = &mut self.messages[position];
                if message.hidden != hidden {
                    message.hidden = hidden;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Renders the non-hidden messages of `[start, end]` (positions, inclusive).
    pub fn render_range(&self, start: usize, end: usize) -> String {
        let end = end.min(self.messages.len().saturating_sub(1));
        if self.messages.is_empty() || start > end {
            return String::new();
        }
        self.messages[start..=end]
            .iter()
            .filter(|m| !m.hidden)
            .map(Message::render)
            .collect()
    }

    pub fn stats(&self) -> ConversationStats {
        ConversationStats {
            messages: self.messages.len(),
            hidden: self.messages.iter().filter(|m| m.hidden).count(),
            authors: self.authors().len(),
            first: self.messages.first().map(|m| m.timestamp),
            last: self.messages.last().map(|m| m.timestamp),
        }
    }
}
