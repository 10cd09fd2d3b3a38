//! Topic search and curation over a conversation.

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversation;
use crate::error::Result;
use crate::progress::ProgressSink;
use crate::runner::{ChunkedPromptRunner, PromptJob, PromptOutcome};

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("number pattern"));

/// Instruction asking for the indices of messages about `topic`.
pub fn topic_instruction(topic: &str) -> String {
    format!(
        "You will receive a WhatsApp conversation (it can be in any language, or combine \
several languages). Your job is to identify the messages talking about \"{topic}\".\n\
Return ONLY a list of integers containing the message indexes (the number preceding each \
message is its index, so use those numbers in your answer)."
    )
}

/// Pulls every integer out of the answers, keeping the first occurrence of
/// each and dropping indices the conversation does not contain.
pub fn extract_message_indices<'s>(
    answers: impl IntoIterator<Item = &'s str>,
    conversation: &Conversation,
) -> Vec<u64> {
    answers
        .into_iter()
        .flat_map(|answer| NUMBER.find_iter(answer))
        .filter_map(|m| m.as_str().parse::<u64>().ok())
        .filter(|index| conversation.contains_index(*index))
        .unique()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatches {
    pub indices: Vec<u64>,
    pub cancelled: bool,
}

/// Runs a topic instruction (see [`topic_instruction`]) over every window
/// and collects the indices. Partial answers are never reconciled: the
/// index lists are merged locally.
pub async fn find_topic(
    runner: &ChunkedPromptRunner<'_>,
    conversation: &Conversation,
    instruction: &str,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<TopicMatches> {
    let job = PromptJob::new(instruction);
    let outcome = runner.run(conversation, &job, sink, cancel).await?;
    let indices = extract_message_indices(outcome.answers(), conversation);
    tracing::info!(matches = indices.len(), "topic search finished");
    Ok(TopicMatches {
        indices,
        cancelled: matches!(outcome, PromptOutcome::Cancelled(_)),
    })
}

/// Hides the messages a topic search finds. A cancelled search hides
/// nothing.
pub async fn hide_topic(
    runner: &ChunkedPromptRunner<'_>,
    conversation: &mut Conversation,
    instruction: &str,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<TopicMatches> {
    let matches = find_topic(runner, conversation, instruction, sink, cancel).await?;
    if !matches.cancelled {
        let changed = conversation.set_hidden(&matches.indices, true);
        tracing::info!(hidden = changed, "messages hidden");
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChatKind;
    use crate::progress::NullSink;
    use crate::runner::ChatModel;
    use crate::tokens::HeuristicEstimator;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    struct Canned(&'static str);

    #[async_trait]
    impl ChatModel for Canned {
        async fn complete(&self, _instruction: &str, _content: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn chat(n: usize) -> Conversation {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let mut chat = Conversation::new("t", ChatKind::WhatsApp);
        for i in 0..n {
            chat.push("a", ts, format!("m{i}"));
        }
        chat
    }

    #[test]
    fn indices_are_deduplicated_across_answers() {
        let conversation = chat(20);
        let indices =
            extract_message_indices(["[3, 5, 7]", "Messages 7 and 12, also 3", "99"], &conversation);
        assert_eq!(indices, vec![3, 5, 7, 12]);
    }

    #[test]
    fn answers_without_numbers_yield_nothing() {
        assert!(extract_message_indices(["none of them"], &chat(3)).is_empty());
    }

    #[tokio::test]
    async fn hide_topic_hides_found_messages() {
        let model = Canned("Messages 1 and 2 (also 77)");
        let estimator = HeuristicEstimator::default();
        let runner = ChunkedPromptRunner::new(&model, &estimator, 3000, 0);
        let mut conversation = chat(4);
        let matches = hide_topic(
            &runner,
            &mut conversation,
            &topic_instruction("holidays"),
            &NullSink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(matches.indices, vec![1, 2]);
        assert!(!matches.cancelled);
        assert_eq!(conversation.stats().hidden, 2);
        assert!(conversation.get(1).unwrap().hidden);
    }
}
