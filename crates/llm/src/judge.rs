//! The two [`Judge`] implementations: schema-constrained and free text.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chatlabel_core::{ChatModel, Judge, JudgmentPrompt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::{LlmClient, LlmRequest};

const AFFIRMATIVE: &[&str] = &["true", "yes"];
const NEGATIVE: &[&str] = &["false", "no"];

/// `{ "result": boolean }`, no other keys.
pub fn judgment_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "result": { "type": "boolean" } },
        "required": ["result"],
        "additionalProperties": false,
    })
}

#[derive(Deserialize)]
struct Judgment {
    result: bool,
}

/// Parses a structured answer; anything but `{"result": bool}` is an error.
pub fn parse_structured(content: &str) -> Result<bool> {
    let judgment: Judgment = serde_json::from_str(content.trim())
        .with_context(|| format!("malformed structured judgment: {content:?}"))?;
    Ok(judgment.result)
}

/// Reads a yes/no out of free text. True only when an affirmative word
/// appears and no negative one does; ambiguous text is false.
pub fn parse_affirmative(content: &str) -> bool {
    let lower = content.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |set: &[&str]| words.iter().any(|w| set.contains(w));
    has(AFFIRMATIVE) && !has(NEGATIVE)
}

/// Asks the provider for a schema-constrained boolean.
pub struct StructuredJudge {
    client: LlmClient,
}

impl StructuredJudge {
    pub fn new(client: LlmClient) -> Result<Self> {
        if !client.supports_structured_output() {
            return Err(anyhow!(
                "{} does not support structured output",
                client.provider().as_str()
            ));
        }
        Ok(Self { client })
    }
}

#[async_trait]
impl Judge for StructuredJudge {
    fn supports_structured_output(&self) -> bool {
        true
    }

    async fn decide(&self, prompt: &JudgmentPrompt) -> Result<bool> {
        let request = LlmRequest {
            system: Some(prompt.preamble.clone()),
            user: prompt.user_content(),
            response_schema: Some(judgment_schema()),
        };
        let response = self.client.chat(&request).await?;
        parse_structured(&response.content)
    }
}

/// Asks any chat model in free text and parses the answer.
pub struct TextJudge<M> {
    model: M,
}

impl<M: ChatModel> TextJudge<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M: ChatModel> Judge for TextJudge<M> {
    fn supports_structured_output(&self) -> bool {
        false
    }

    async fn decide(&self, prompt: &JudgmentPrompt) -> Result<bool> {
        let answer = self
            .model
            .complete(&prompt.preamble, &prompt.user_content())
            .await?;
        let decision = parse_affirmative(&answer);
        tracing::trace!(decision, answer = %answer, "free-text judgment");
        Ok(decision)
    }
}

/// Picks the judge for the client's provider once, at construction.
pub fn build_judge(client: LlmClient) -> Result<Box<dyn Judge>> {
    if client.supports_structured_output() {
        Ok(Box::new(StructuredJudge::new(client)?))
    } else {
        Ok(Box::new(TextJudge::new(client)))
    }
}
