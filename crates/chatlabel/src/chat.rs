use std::path::Path;

use anyhow::{Context, Result};
use chatlabel_core::{
    find_topic, hide_topic as hide_matches, load_json, load_whatsapp, save_json,
    ChunkedPromptRunner, Conversation, PromptJob,
};
use chatlabel_llm::LlmClient;
use serde_json::json;

use crate::config::ChatlabelConfig;
use crate::output::{print_record, progress_sink};
use crate::runtime;

pub fn import(input: &Path, out: &Path, name: Option<String>) -> Result<()> {
    let mut conversation = load_whatsapp(input)
        .with_context(|| format!("failed to import {}", input.display()))?;
    if let Some(name) = name {
        conversation.name = name;
    }
    save_json(&conversation, out)?;
    let stats = conversation.stats();
    tracing::info!(
        chat = %conversation.name,
        messages = stats.messages,
        authors = stats.authors,
        first = ?stats.first,
        last = ?stats.last,
        out = %out.display(),
        "conversation imported"
    );
    print_record(&json!({
        "chat_name": conversation.name,
        "messages": stats.messages,
        "authors": stats.authors,
    }))
}

fn open_chat(path: &Path) -> Result<Conversation> {
    load_json(path).with_context(|| format!("failed to load conversation {}", path.display()))
}

fn client(config: &ChatlabelConfig) -> Result<LlmClient> {
    LlmClient::new(config.provider()?, config.model()?)
}

pub fn ask(config: &ChatlabelConfig, chat: &Path, task: &str, overlap: usize) -> Result<()> {
    let conversation = open_chat(chat)?;
    let client = client(config)?;
    let estimator = config.estimator()?;
    let runner = ChunkedPromptRunner::new(
        &client,
        estimator.as_ref(),
        config.llm.context_tokens,
        overlap,
    );
    let job = PromptJob::new(config.prompts.chunk_for(task))
        .reconciled_with(config.prompts.reconciliation.clone());

    let (runtime, cancel) = runtime::start()?;
    let sink = progress_sink();
    let outcome = runtime.block_on(runner.run(&conversation, &job, &sink, &cancel))?;
    let cancelled = outcome.is_cancelled();
    print_record(&json!({
        "chat_name": conversation.name,
        "answer": outcome.into_text(),
        "cancelled": cancelled,
    }))
}

pub fn find(config: &ChatlabelConfig, chat: &Path, topic: &str, overlap: usize) -> Result<()> {
    let conversation = open_chat(chat)?;
    let client = client(config)?;
    let estimator = config.estimator()?;
    let runner = ChunkedPromptRunner::new(
        &client,
        estimator.as_ref(),
        config.llm.context_tokens,
        overlap,
    );
    let instruction = config.prompts.topic_for(topic);

    let (runtime, cancel) = runtime::start()?;
    let sink = progress_sink();
    let matches =
        runtime.block_on(find_topic(&runner, &conversation, &instruction, &sink, &cancel))?;
    print_record(&json!({
        "chat_name": conversation.name,
        "topic": topic,
        "message_ids": matches.indices,
        "cancelled": matches.cancelled,
    }))
}

/// Hides the matching messages and rewrites the conversation in place.
/// Nothing is written when the search was interrupted.
pub fn hide(config: &ChatlabelConfig, chat: &Path, topic: &str, overlap: usize) -> Result<()> {
    let mut conversation = open_chat(chat)?;
    let client = client(config)?;
    let estimator = config.estimator()?;
    let runner = ChunkedPromptRunner::new(
        &client,
        estimator.as_ref(),
        config.llm.context_tokens,
        overlap,
    );
    let instruction = config.prompts.topic_for(topic);

    let (runtime, cancel) = runtime::start()?;
    let sink = progress_sink();
    let matches = runtime.block_on(hide_matches(
        &runner,
        &mut conversation,
        &instruction,
        &sink,
        &cancel,
    ))?;
    let hidden = if matches.cancelled {
        Vec::new()
    } else {
        matches.indices
    };
    if matches.cancelled {
        tracing::warn!(chat = %chat.display(), "search interrupted; conversation left unchanged");
    } else {
        save_json(&conversation, chat)?;
    }
    print_record(&json!({
        "chat_name": conversation.name,
        "topic": topic,
        "hidden_ids": hidden,
        "cancelled": matches.cancelled,
    }))
}
