mod annotate;
mod chunk;
mod conversation;
mod error;
mod judge;
mod progress;
mod request;
mod runner;
mod source;
mod tokens;
mod topics;
mod transcript;

pub use annotate::{count_matching, BulkAnnotator};
pub use chunk::{ChunkConfig, ChunkPlanner, ChunkWindow};
pub use conversation::{ChatKind, Conversation, ConversationStats, Message, TIMESTAMP_FORMAT};
pub use error::{CallSite, ChatlabelError, Result};
pub use judge::{project, projection_fields, Judge, JudgmentPrompt, DEFAULT_JUDGE_PREAMBLE};
pub use progress::{
    ChannelSink, JsonlSink, JsonlWriter, MemorySink, NullSink, ProgressEvent, ProgressReport,
    ProgressSink,
};
pub use request::{
    Action, AnnotationRequest, FieldConfig, Filter, FilterOperator, FilterQuery, Predicate,
    TargetValue,
};
pub use runner::{ChatModel, ChunkedPromptRunner, PromptJob, PromptOutcome};
pub use source::memory::MemoryStore;
pub use source::{CursorHandle, Document, DocumentSource, Mutation, Page};
pub use tokens::{BpeEstimator, HeuristicEstimator, TokenEstimator, TokenizerKind};
pub use topics::{extract_message_indices, find_topic, hide_topic, topic_instruction, TopicMatches};
pub use transcript::{load_json, load_whatsapp, parse_whatsapp, save_json};

pub use tokio_util::sync::CancellationToken;
