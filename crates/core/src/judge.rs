use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::request::Predicate;
use crate::source::Document;

pub const DEFAULT_JUDGE_PREAMBLE: &str = "Your task is to filter documents from a search index \
based on some natural language conditions. You will receive a list of filters, which may relate \
to a specific document field, and a document. Answer with a JSON object {\"result\": true} if the \
document satisfies all the filters, and {\"result\": false} otherwise.";

/// A yes/no decision from a language model.
///
/// Implementations either ask the model for a structured `{result: bool}`
/// answer or parse free text; which one is fixed when the judge is built.
#[async_trait]
pub trait Judge: Send + Sync {
    fn supports_structured_output(&self) -> bool;

    async fn decide(&self, prompt: &JudgmentPrompt) -> anyhow::Result<bool>;
}

/// Everything a judge sees for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgmentPrompt {
    pub preamble: String,
    pub predicates: Vec<Predicate>,
    pub projection: Value,
}

impl JudgmentPrompt {
    pub fn new(
        preamble: impl Into<String>,
        predicates: &[Predicate],
        document: &Document,
        default_fields: &[String],
    ) -> Self {
        let fields = projection_fields(predicates, default_fields);
        Self {
            preamble: preamble.into(),
            predicates: predicates.to_vec(),
            projection: project(&document.source, &fields),
        }
    }

    /// The user-role content: numbered filters, then the projected document.
    pub fn user_content(&self) -> String {
        let mut text = String::from("Filters:\n");
        for (i, predicate) in self.predicates.iter().enumerate() {
            text.push_str(&format!("{}: {}", i + 1, predicate.text));
            if let Some(field) = &predicate.field {
                text.push_str(&format!("(\"{field}\" field)"));
            }
            text.push('\n');
        }
        text.push_str("Document:\n");
        text.push_str(&self.projection.to_string());
        text
    }
}

/// Fields named by predicates in first-mention order, or `defaults` when
/// no predicate names one.
pub fn projection_fields(predicates: &[Predicate], defaults: &[String]) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for field in predicates.iter().filter_map(|p| p.field.as_ref()) {
        if !fields.contains(field) {
            fields.push(field.clone());
        }
    }
    if fields.is_empty() {
        defaults.to_vec()
    } else {
        fields
    }
}

pub fn project(source: &Value, fields: &[String]) -> Value {
    let mut out = Map::new();
    for field in fields {
        out.insert(
            field.clone(),
            source.get(field).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(out)
}
