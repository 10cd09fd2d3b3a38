//! Runs one instruction over a long conversation, window by window.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::chunk::{ChunkConfig, ChunkPlanner, ChunkWindow};
use crate::conversation::Conversation;
use crate::error::{CallSite, ChatlabelError, Result};
use crate::progress::{ProgressEvent, ProgressReport, ProgressSink};
use crate::tokens::TokenEstimator;

/// A language model call: one instruction (system role) plus user content.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, instruction: &str, content: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct PromptJob {
    pub chunk_instruction: String,
    pub reconciliation_instruction: Option<String>,
}

impl PromptJob {
    pub fn new(chunk_instruction: impl Into<String>) -> Self {
        Self {
            chunk_instruction: chunk_instruction.into(),
            reconciliation_instruction: None,
        }
    }

    pub fn reconciled_with(mut self, instruction: impl Into<String>) -> Self {
        self.reconciliation_instruction = Some(instruction.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The whole conversation fit one window; the raw answer.
    Single(String),
    /// Partial answers merged by a reconciliation call.
    Reconciled(String),
    /// Partial answers in window order, no reconciliation requested.
    Partials(Vec<String>),
    /// Cancelled at a window boundary; the answers collected so far.
    Cancelled(Vec<String>),
}

impl PromptOutcome {
    pub fn answers(&self) -> Vec<&str> {
        match self {
            PromptOutcome::Single(answer) | PromptOutcome::Reconciled(answer) => {
                vec![answer.as_str()]
            }
            PromptOutcome::Partials(answers) | PromptOutcome::Cancelled(answers) => {
                answers.iter().map(String::as_str).collect()
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PromptOutcome::Cancelled(_))
    }

    pub fn into_text(self) -> String {
        match self {
            PromptOutcome::Single(answer) | PromptOutcome::Reconciled(answer) => answer,
            PromptOutcome::Partials(answers) | PromptOutcome::Cancelled(answers) => {
                answers.join("\n")
            }
        }
    }
}

pub struct ChunkedPromptRunner<'a> {
    model: &'a dyn ChatModel,
    estimator: &'a dyn TokenEstimator,
    context_tokens: usize,
    overlap: usize,
}

impl<'a> ChunkedPromptRunner<'a> {
    /// `context_tokens` is the model's whole input budget; the chunk
    /// instruction's own cost is subtracted per run.
    pub fn new(
        model: &'a dyn ChatModel,
        estimator: &'a dyn TokenEstimator,
        context_tokens: usize,
        overlap: usize,
    ) -> Self {
        Self {
            model,
            estimator,
            context_tokens,
            overlap,
        }
    }

    pub async fn run(
        &self,
        conversation: &Conversation,
        job: &PromptJob,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PromptOutcome> {
        let total = conversation.len() as u64;
        let windows = match self.plan(conversation, job) {
            Ok(windows) => windows,
            Err(err) => {
                finish(sink, 0, total);
                return Err(err);
            }
        };
        tracing::info!(
            chat = %conversation.name,
            messages = total,
            windows = windows.len(),
            "starting chunked prompt"
        );

        let multi = windows.len() > 1;
        let mut answers = Vec::with_capacity(windows.len());
        let mut covered = 0u64;
        for (i, window) in windows.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(chunk = i, "chunked prompt cancelled");
                finish(sink, covered, total);
                return Ok(PromptOutcome::Cancelled(answers));
            }
            tracing::debug!(
                chunk = i,
                start = window.start,
                end = window.end,
                tokens = window.rendered_token_count,
                "sending chunk"
            );
            let answer = match self
                .model
                .complete(&job.chunk_instruction, &window.rendered_text)
                .await
            {
                Ok(answer) => answer,
                Err(err) => {
                    finish(sink, covered, total);
                    return Err(ChatlabelError::model_call(CallSite::Chunk(i), err));
                }
            };
            answers.push(answer);
            covered = window.end as u64 + 1;
            if multi && i + 1 < windows.len() {
                sink.emit(ProgressEvent::Prompt(ProgressReport {
                    processed: covered,
                    total,
                    ..ProgressReport::default()
                }));
            }
        }

        let outcome = if !multi {
            PromptOutcome::Single(answers.pop().unwrap_or_default())
        } else if let Some(instruction) = &job.reconciliation_instruction {
            if cancel.is_cancelled() {
                finish(sink, covered, total);
                return Ok(PromptOutcome::Cancelled(answers));
            }
            match self
                .model
                .complete(instruction, &reconciliation_input(&answers))
                .await
            {
                Ok(answer) => PromptOutcome::Reconciled(answer),
                Err(err) => {
                    finish(sink, covered, total);
                    return Err(ChatlabelError::model_call(CallSite::Reconciliation, err));
                }
            }
        } else {
            PromptOutcome::Partials(answers)
        };
        finish(sink, total, total);
        Ok(outcome)
    }

    fn plan(&self, conversation: &Conversation, job: &PromptJob) -> Result<Vec<ChunkWindow>> {
        if conversation.is_empty() {
            return Err(ChatlabelError::Configuration(
                "conversation has no messages".to_string(),
            ));
        }
        let instruction_tokens = self.estimator.count(&job.chunk_instruction);
        let config = ChunkConfig {
            token_budget: self.context_tokens.saturating_sub(instruction_tokens),
            overlap: self.overlap,
        };
        ChunkPlanner::new(self.estimator).plan_all(conversation, &config)
    }
}

fn finish(sink: &dyn ProgressSink, processed: u64, total: u64) {
    sink.emit(ProgressEvent::Prompt(ProgressReport {
        processed,
        total,
        finished: true,
        ..ProgressReport::default()
    }));
}

fn reconciliation_input(answers: &[String]) -> String {
    answers
        .iter()
        .enumerate()
        .map(|(i, answer)| format!("Chunk {i}:\n{answer}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconciliation_input_labels_chunks() {
        let text = reconciliation_input(&["a".to_string(), "b".to_string()]);
        assert_eq!(text, "Chunk 0:\na\nChunk 1:\nb\n");
    }

    #[test]
    fn outcome_answers_cover_all_variants() {
        assert_eq!(PromptOutcome::Single("x".into()).answers(), vec!["x"]);
        let partials = PromptOutcome::Partials(vec!["1".into(), "2".into()]);
        assert_eq!(partials.answers(), vec!["1", "2"]);
        assert_eq!(partials.into_text(), "1\n2");
        assert!(PromptOutcome::Cancelled(Vec::new()).is_cancelled());
    }
}
