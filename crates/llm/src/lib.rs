mod client;
mod judge;

pub use client::{LlmClient, LlmProvider, LlmRequest, LlmResponse};
pub use judge::{
    build_judge, judgment_schema, parse_affirmative, parse_structured, StructuredJudge, TextJudge,
};
