use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chatlabel_core::{
    topic_instruction, FieldConfig, TokenEstimator, TokenizerKind, DEFAULT_JUDGE_PREAMBLE,
};
use chatlabel_index::ElasticConfig;
use chatlabel_llm::LlmProvider;
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "chatlabel.toml";

const DEFAULT_CHUNK_PROMPT: &str = "You will receive a WhatsApp conversation (it can be in any \
language, or combine several languages). Do the following task based on the conversation \
content: {task}";

const DEFAULT_RECONCILIATION_PROMPT: &str = "Your job is to combine the following LLM-generated \
answers. The original prompt was too big for the context length and was divided into chunks. \
Combine the answers given for each chunk into a single one, keeping it coherent and avoiding \
duplicated content. Don't mention the chunk partitions in your answer.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatlabelConfig {
    pub llm: LlmSection,
    pub elasticsearch: ElasticConfig,
    pub fields: FieldConfig,
    pub prompts: PromptConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: Option<String>,
    /// Whole input budget of the model, instruction included.
    pub context_tokens: usize,
    pub tokenizer: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            context_tokens: 3000,
            tokenizer: None,
        }
    }
}

/// Instruction templates. `{task}` and `{topic}` are substituted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub chunk: String,
    pub reconciliation: String,
    pub topic: Option<String>,
    pub judge: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            chunk: DEFAULT_CHUNK_PROMPT.to_string(),
            reconciliation: DEFAULT_RECONCILIATION_PROMPT.to_string(),
            topic: None,
            judge: DEFAULT_JUDGE_PREAMBLE.to_string(),
        }
    }
}

impl PromptConfig {
    pub fn chunk_for(&self, task: &str) -> String {
        self.chunk.replace("{task}", task)
    }

    pub fn topic_for(&self, topic: &str) -> String {
        match &self.topic {
            Some(template) => template.replace("{topic}", topic),
            None => topic_instruction(topic),
        }
    }
}

impl ChatlabelConfig {
    /// Reads `path`, or `chatlabel.toml` when present, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(provider) = lookup("CHATLABEL_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Some(model) = lookup("CHATLABEL_MODEL") {
            self.llm.model = Some(model);
        }
        if let Some(tokens) = lookup("CHATLABEL_CONTEXT_TOKENS") {
            self.llm.context_tokens = tokens
                .trim()
                .parse()
                .with_context(|| format!("CHATLABEL_CONTEXT_TOKENS is not a number: {tokens}"))?;
        }
        if let Some(url) = lookup("CHATLABEL_ES_URL") {
            self.elasticsearch.url = url;
        }
        if let Some(index) = lookup("CHATLABEL_ES_INDEX") {
            self.elasticsearch.index = index;
        }
        Ok(())
    }

    pub fn provider(&self) -> Result<LlmProvider> {
        self.llm.provider.parse()
    }

    pub fn model(&self) -> Result<String> {
        let provider = self.provider()?;
        Ok(self
            .llm
            .model
            .clone()
            .unwrap_or_else(|| default_model(provider).to_string()))
    }

    pub fn estimator(&self) -> Result<Box<dyn TokenEstimator>> {
        let kind = match &self.llm.tokenizer {
            Some(name) => name.parse::<TokenizerKind>()?,
            None => TokenizerKind::for_model(&self.model()?),
        };
        kind.build().context("failed to load tokenizer")
    }
}

fn default_model(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "gpt-4o-mini",
        LlmProvider::Anthropic => "claude-3-5-sonnet-latest",
        LlmProvider::Ollama => "llama3.1",
        LlmProvider::Local => "local",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn file_sections_and_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chatlabel.toml");
        fs::write(
            &path,
            r#"
[llm]
provider = "ollama"
context_tokens = 8000

[elasticsearch]
index = "mail"
page_size = 50

[fields]
labels = "TAGS"
"#,
        )
        .unwrap();
        let config = ChatlabelConfig::from_file(&path).unwrap();
        assert_eq!(config.provider().unwrap(), LlmProvider::Ollama);
        assert_eq!(config.model().unwrap(), "llama3.1");
        assert_eq!(config.llm.context_tokens, 8000);
        assert_eq!(config.elasticsearch.index, "mail");
        assert_eq!(config.elasticsearch.scroll, "1m");
        assert_eq!(config.elasticsearch.page_size, 50);
        assert_eq!(config.fields.labels, "TAGS");
        assert_eq!(config.fields.relevance, "DOCUMENT_RELEVANCE");
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("CHATLABEL_PROVIDER", "local"),
            ("CHATLABEL_CONTEXT_TOKENS", "1200"),
            ("CHATLABEL_ES_INDEX", "archive"),
        ]
        .into_iter()
        .collect();
        let mut config = ChatlabelConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.provider().unwrap(), LlmProvider::Local);
        assert_eq!(config.llm.context_tokens, 1200);
        assert_eq!(config.elasticsearch.index, "archive");
    }

    #[test]
    fn bad_token_count_is_reported() {
        let mut config = ChatlabelConfig::default();
        let err = config
            .apply_env(|key| (key == "CHATLABEL_CONTEXT_TOKENS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CHATLABEL_CONTEXT_TOKENS"));
    }

    #[test]
    fn templates_substitute_placeholders() {
        let prompts = PromptConfig::default();
        assert!(prompts.chunk_for("list the dates").ends_with("list the dates"));
        assert!(prompts.topic_for("rent").contains("\"rent\""));
        let custom = PromptConfig {
            topic: Some("Find {topic}".into()),
            ..PromptConfig::default()
        };
        assert_eq!(custom.topic_for("rent"), "Find rent");
    }
}
