//! Token-budgeted windows over a conversation.
//!
//! A window is an inclusive range of message positions whose rendered text
//! fits the token budget. Consecutive windows share `overlap` trailing
//! messages so the model keeps some context across the boundary.
//!
//! # Algorithm
//!
//! 1. Starting at `start`, extend the window one message at a time while the
//!    summed per-line token cost of the visible messages stays within budget.
//!    Hidden messages belong to the range but cost nothing.
//! 2. If the very first visible message already exceeds the budget, the
//!    window holds it alone and is flagged `oversized`.
//! 3. Re-count the joined text once and trim from the end if tokenizer
//!    merges pushed it over budget.
//! 4. The next window starts at `end + 1 - overlap`. A window that would not
//!    reach past the previous one is re-planned without overlap, and an
//!    oversized window never carries overlap, so planning always terminates
//!    and never leaves gaps.

use crate::conversation::Conversation;
use crate::error::{ChatlabelError, Result};
use crate::tokens::TokenEstimator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Tokens available for the conversation text, instruction already
    /// subtracted.
    pub token_budget: usize,
    /// Messages repeated at the start of the next window.
    pub overlap: usize,
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.token_budget == 0 {
            return Err(ChatlabelError::Configuration(
                "token budget is empty once the instruction is accounted for".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWindow {
    pub start: usize,
    pub end: usize,
    pub rendered_text: String,
    pub rendered_token_count: usize,
    /// A single message larger than the budget, sent on its own.
    pub oversized: bool,
}

impl ChunkWindow {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

pub struct ChunkPlanner<'a> {
    estimator: &'a dyn TokenEstimator,
}

impl<'a> ChunkPlanner<'a> {
    pub fn new(estimator: &'a dyn TokenEstimator) -> Self {
        Self { estimator }
    }

    /// Plans the window starting at position `start`.
    pub fn plan(
        &self,
        conversation: &Conversation,
        start: usize,
        config: &ChunkConfig,
    ) -> Result<ChunkWindow> {
        config.validate()?;
        if start >= conversation.len() {
            return Err(ChatlabelError::Configuration(format!(
                "window start {start} is outside a conversation of {} messages",
                conversation.len()
            )));
        }
        let budget = config.token_budget;
        let mut end = start;
        let mut used = 0usize;
        let mut visible = 0usize;
        let mut oversized = false;
        for (position, message) in conversation.messages().iter().enumerate().skip(start) {
            let cost = if message.hidden {
                0
            } else {
                self.estimator.count(&message.render())
            };
            if used + cost > budget {
                if visible == 0 {
                    end = position;
                    oversized = true;
                }
                break;
            }
            used += cost;
            end = position;
            if !message.hidden {
                visible += 1;
            }
        }

        let mut rendered_text = conversation.render_range(start, end);
        let mut rendered_token_count = self.estimator.count(&rendered_text);
        while !oversized && rendered_token_count > budget && end > start {
            end -= 1;
            rendered_text = conversation.render_range(start, end);
            rendered_token_count = self.estimator.count(&rendered_text);
        }
        if rendered_token_count > budget {
            oversized = true;
        }
        if oversized {
            tracing::warn!(
                start,
                end,
                tokens = rendered_token_count,
                budget,
                "message exceeds the token budget on its own; sending it alone"
            );
        }
        Ok(ChunkWindow {
            start,
            end,
            rendered_text,
            rendered_token_count,
            oversized,
        })
    }

    /// Plans every window needed to cover the conversation.
    pub fn plan_all(
        &self,
        conversation: &Conversation,
        config: &ChunkConfig,
    ) -> Result<Vec<ChunkWindow>> {
        config.validate()?;
        if conversation.is_empty() {
            return Ok(Vec::new());
        }
        let last = conversation.len() - 1;
        let mut windows: Vec<ChunkWindow> = Vec::new();
        let mut start = 0usize;
        loop {
            let mut window = self.plan(conversation, start, config)?;
            if let Some(previous) = windows.last() {
                if window.end <= previous.end {
                    tracing::debug!(
                        start,
                        previous_end = previous.end,
                        "window made no progress; dropping overlap"
                    );
                    window = self.plan(conversation, previous.end + 1, config)?;
                }
            } else if window.end < last && !window.oversized && config.overlap >= window.len() {
                return Err(ChatlabelError::Configuration(format!(
                    "overlap of {} messages does not fit a window of {} messages",
                    config.overlap,
                    window.len()
                )));
            }
            let end = window.end;
            let overlap = if window.oversized { 0 } else { config.overlap };
            let next = (end + 1).saturating_sub(overlap).max(window.start + 1);
            windows.push(window);
            if end >= last {
                break;
            }
            start = next;
        }
        Ok(windows)
    }
}
