//! Cursor-based document store abstraction.
//!
//! The [`DocumentSource`] trait is the narrow contract the bulk annotator
//! needs from a paginated store: open a cursor over a [`FilterQuery`], pull
//! pages until `has_more` is false, close the cursor, and write one
//! [`Mutation`] per document. Stores translate the query into their native
//! form; the in-memory [`memory::MemoryStore`] evaluates it locally.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::request::{Action, AnnotationRequest, FieldConfig, FilterQuery};

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub source: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.source.get(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub documents: Vec<Document>,
    pub has_more: bool,
}

/// An open server-side cursor.
///
/// `total_estimate` is fixed at open time. Stores whose open call already
/// returns the first page keep it in `prefetched` until the first
/// `next_page`.
#[derive(Debug, Clone)]
pub struct CursorHandle {
    pub id: String,
    pub total_estimate: u64,
    prefetched: Option<Page>,
}

impl CursorHandle {
    pub fn new(id: impl Into<String>, total_estimate: u64) -> Self {
        Self {
            id: id.into(),
            total_estimate,
            prefetched: None,
        }
    }

    pub fn with_first_page(mut self, page: Page) -> Self {
        self.prefetched = Some(page);
        self
    }

    pub fn take_prefetched(&mut self) -> Option<Page> {
        self.prefetched.take()
    }
}

/// A single-document write.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Overwrite a scalar field.
    Set { field: String, value: Value },
    /// Add to a set-valued field unless already present.
    AddToSet { field: String, value: Value },
}

impl Mutation {
    pub fn for_request(request: &AnnotationRequest, fields: &FieldConfig) -> Self {
        let value = request.target_value.to_json();
        match request.action {
            Action::SetRelevance => Mutation::Set {
                field: fields.relevance.clone(),
                value,
            },
            Action::AppendLabel => Mutation::AddToSet {
                field: fields.labels.clone(),
                value,
            },
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Mutation::Set { field, .. } | Mutation::AddToSet { field, .. } => field,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Mutation::Set { value, .. } | Mutation::AddToSet { value, .. } => value,
        }
    }

    /// True when applying the mutation would not change `source`.
    pub fn is_satisfied_by(&self, source: &Value) -> bool {
        match (self, source.get(self.field())) {
            (_, None) | (_, Some(Value::Null)) => false,
            (Mutation::Set { value, .. }, Some(current)) => same_value(current, value),
            (Mutation::AddToSet { value, .. }, Some(Value::Array(items))) => {
                items.iter().any(|item| same_value(item, value))
            }
            (Mutation::AddToSet { value, .. }, Some(current)) => same_value(current, value),
        }
    }

    /// Applies the mutation to a document body in place.
    pub fn apply_to(&self, source: &mut Value) {
        if !source.is_object() {
            *source = Value::Object(Map::new());
        }
        let Some(object) = source.as_object_mut() else {
            return;
        };
        match self {
            Mutation::Set { field, value } => {
                object.insert(field.clone(), value.clone());
            }
            Mutation::AddToSet { field, value } => {
                let slot = object.entry(field.clone()).or_insert(Value::Null);
                if let Value::Array(items) = &mut *slot {
                    if !items.iter().any(|item| same_value(item, value)) {
                        items.push(value.clone());
                    }
                } else if slot.is_null() {
                    *slot = Value::Array(vec![value.clone()]);
                } else if !same_value(slot, value) {
                    let current = slot.take();
                    *slot = Value::Array(vec![current, value.clone()]);
                }
            }
        }
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// A paginated, cursor-based document store.
///
/// Implementations must be `Send + Sync`; a run drives one cursor at a time
/// and always calls [`close`](DocumentSource::close), including after a
/// failed `next_page`.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn open(&self, query: &FilterQuery) -> Result<CursorHandle>;

    async fn next_page(&self, cursor: &mut CursorHandle) -> Result<Page>;

    async fn close(&self, cursor: CursorHandle) -> Result<()>;

    async fn apply(&self, doc_id: &str, mutation: &Mutation) -> Result<()>;

    /// Number of documents matching `query`, without opening a cursor.
    async fn count(&self, query: &FilterQuery) -> Result<u64>;
}
