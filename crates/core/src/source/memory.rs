//! In-memory [`DocumentSource`] for tests and offline runs.
//!
//! Documents live in insertion order behind a `RwLock`. A cursor snapshots
//! the ids matching its query at open time and re-reads each document when
//! its page is served, so mutations applied mid-run are visible the way a
//! scroll over a live index would show them. Filters are evaluated locally
//! with approximations of the search-engine operators: phrase matching on
//! lower-cased word tokens, substring for `contains`, token prefix, anchored
//! regex and AUTO-fuzziness Levenshtein distance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;

use super::{CursorHandle, Document, DocumentSource, Mutation, Page};
use crate::request::{Filter, FilterOperator, FilterQuery};

struct OpenCursor {
    ids: Vec<String>,
    position: usize,
}

pub struct MemoryStore {
    docs: RwLock<Vec<Document>>,
    cursors: Mutex<HashMap<String, OpenCursor>>,
    next_cursor: AtomicU64,
    page_size: usize,
}

impl MemoryStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(0),
            page_size: page_size.max(1),
        }
    }

    pub fn with_documents(page_size: usize, documents: Vec<Document>) -> Self {
        let store = Self::new(page_size);
        if let Ok(mut docs) = store.docs.write() {
            *docs = documents;
        }
        store
    }

    /// Inserts or replaces a document.
    pub fn insert(&self, document: Document) {
        if let Ok(mut docs) = self.docs.write() {
            match docs.iter_mut().find(|d| d.id == document.id) {
                Some(existing) => *existing = document,
                None => docs.push(document),
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.docs
            .read()
            .ok()
            .and_then(|docs| docs.iter().find(|d| d.id == id).cloned())
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursors opened and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn matching_ids(&self, query: &FilterQuery) -> Result<Vec<String>> {
        let compiled = CompiledQuery::new(query)?;
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow!("document store lock poisoned"))?;
        Ok(docs
            .iter()
            .filter(|doc| compiled.matches(&doc.source))
            .map(|doc| doc.id.clone())
            .collect())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl DocumentSource for MemoryStore {
    async fn open(&self, query: &FilterQuery) -> Result<CursorHandle> {
        let ids = self.matching_ids(query)?;
        let total = ids.len() as u64;
        let id = format!("mem-{}", self.next_cursor.fetch_add(1, Ordering::Relaxed));
        self.cursors
            .lock()
            .map_err(|_| anyhow!("cursor table lock poisoned"))?
            .insert(id.clone(), OpenCursor { ids, position: 0 });
        Ok(CursorHandle::new(id, total))
    }

    async fn next_page(&self, cursor: &mut CursorHandle) -> Result<Page> {
        let (ids, has_more) = {
            let mut cursors = self
                .cursors
                .lock()
                .map_err(|_| anyhow!("cursor table lock poisoned"))?;
            let open = cursors
                .get_mut(&cursor.id)
                .with_context(|| format!("unknown cursor {}", cursor.id))?;
            let end = (open.position + self.page_size).min(open.ids.len());
            let ids = open.ids[open.position..end].to_vec();
            open.position = end;
            (ids, end < open.ids.len())
        };
        let documents = ids.iter().filter_map(|id| self.get(id)).collect();
        Ok(Page {
            documents,
            has_more,
        })
    }

    async fn close(&self, cursor: CursorHandle) -> Result<()> {
        self.cursors
            .lock()
            .map_err(|_| anyhow!("cursor table lock poisoned"))?
            .remove(&cursor.id);
        Ok(())
    }

    async fn apply(&self, doc_id: &str, mutation: &Mutation) -> Result<()> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| anyhow!("document store lock poisoned"))?;
        let doc = docs
            .iter_mut()
            .find(|d| d.id == doc_id)
            .with_context(|| format!("document {doc_id} not found"))?;
        mutation.apply_to(&mut doc.source);
        Ok(())
    }

    async fn count(&self, query: &FilterQuery) -> Result<u64> {
        Ok(self.matching_ids(query)?.len() as u64)
    }
}

struct CompiledQuery<'q> {
    query: &'q FilterQuery,
    regexes: Vec<Option<Regex>>,
}

impl<'q> CompiledQuery<'q> {
    fn new(query: &'q FilterQuery) -> Result<Self> {
        let regexes = query
            .filters
            .iter()
            .map(|filter| match filter.operator {
                FilterOperator::Regexp => Regex::new(&format!("^(?:{})$", filter.value))
                    .map(Some)
                    .with_context(|| format!("invalid regexp {:?}", filter.value)),
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { query, regexes })
    }

    fn matches(&self, source: &Value) -> bool {
        if (self.query.date_from.is_some() || self.query.date_to.is_some())
            && !self.date_in_range(source)
        {
            return false;
        }
        self.query
            .filters
            .iter()
            .zip(&self.regexes)
            .all(|(filter, regex)| filter_matches(filter, regex.as_ref(), source))
    }

    fn date_in_range(&self, source: &Value) -> bool {
        let Some(date) = source
            .get(&self.query.date_field)
            .and_then(Value::as_str)
            .and_then(parse_date)
        else {
            return false;
        };
        self.query.date_from.map_or(true, |from| date >= from)
            && self.query.date_to.map_or(true, |to| date <= to)
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    raw.get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
}

fn filter_matches(filter: &Filter, regex: Option<&Regex>, source: &Value) -> bool {
    let text = source.get(&filter.field).and_then(field_text);
    if filter.operator == FilterOperator::Different {
        return !text.is_some_and(|t| phrase_matches(&t, &filter.value));
    }
    let Some(text) = text else {
        return false;
    };
    match filter.operator {
        FilterOperator::Equals | FilterOperator::Different => phrase_matches(&text, &filter.value),
        FilterOperator::Contains => text.to_lowercase().contains(&filter.value.to_lowercase()),
        FilterOperator::StartsWith => {
            let prefix = filter.value.to_lowercase();
            text.to_lowercase().starts_with(&prefix)
                || words(&text).iter().any(|w| w.starts_with(&prefix))
        }
        FilterOperator::Regexp => regex.is_some_and(|re| {
            re.is_match(&text) || words(&text).iter().any(|w| re.is_match(w))
        }),
        FilterOperator::Fuzzy => {
            let target = filter.value.to_lowercase();
            let allowed = auto_fuzziness(target.chars().count());
            words(&text)
                .iter()
                .any(|w| strsim::levenshtein(w, &target) <= allowed)
        }
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(field_text).collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        }
        other => Some(other.to_string()),
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// The phrase's words appear consecutively in the field's words.
fn phrase_matches(text: &str, phrase: &str) -> bool {
    let needle = words(phrase);
    if needle.is_empty() {
        return false;
    }
    words(text)
        .windows(needle.len())
        .any(|window| window == needle.as_slice())
}

fn auto_fuzziness(len: usize) -> usize {
    match len {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FieldConfig;
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::with_documents(
            2,
            vec![
                Document::new(
                    "1",
                    json!({"SUBJECT": "Quarterly report", "FROM": "ana@corp.com", "DATE_CREATED": "2024-01-10T09:00:00"}),
                ),
                Document::new(
                    "2",
                    json!({"SUBJECT": "Re: wire transfer", "FROM": "luis@corp.com", "DATE_CREATED": "2024-02-01"}),
                ),
                Document::new(
                    "3",
                    json!({"SUBJECT": "Lunch", "FROM": "ana@home.net", "DATE_CREATED": "2024-03-05"}),
                ),
            ],
        )
    }

    fn query(filters: Vec<Filter>) -> FilterQuery {
        FilterQuery {
            filters,
            ..FilterQuery::match_all(&FieldConfig::default())
        }
    }

    fn filter(field: &str, operator: FilterOperator, value: &str) -> Filter {
        Filter {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn operators_select_expected_documents() {
        let store = store();
        let cases = [
            (filter("SUBJECT", FilterOperator::Equals, "wire transfer"), 1),
            (filter("SUBJECT", FilterOperator::Different, "lunch"), 2),
            (filter("FROM", FilterOperator::Contains, "corp"), 2),
            (filter("SUBJECT", FilterOperator::StartsWith, "re"), 2),
            (filter("FROM", FilterOperator::Regexp, "ana@.*"), 2),
            (filter("SUBJECT", FilterOperator::Fuzzy, "reprot"), 1),
        ];
        for (f, expected) in cases {
            let count = store.count(&query(vec![f.clone()])).await.unwrap();
            assert_eq!(count, expected, "{f:?}");
        }
    }

    #[tokio::test]
    async fn date_range_is_inclusive() {
        let store = store();
        let mut q = query(Vec::new());
        q.date_from = NaiveDate::from_ymd_opt(2024, 1, 10);
        q.date_to = NaiveDate::from_ymd_opt(2024, 2, 1);
        assert_eq!(store.count(&q).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cursor_pages_through_snapshot() {
        let store = store();
        let mut cursor = store.open(&query(Vec::new())).await.unwrap();
        assert_eq!(cursor.total_estimate, 3);
        let first = store.next_page(&mut cursor).await.unwrap();
        assert_eq!(first.documents.len(), 2);
        assert!(first.has_more);
        let second = store.next_page(&mut cursor).await.unwrap();
        assert_eq!(second.documents.len(), 1);
        assert!(!second.has_more);
        assert_eq!(store.open_cursors(), 1);
        store.close(cursor).await.unwrap();
        assert_eq!(store.open_cursors(), 0);
    }

    #[tokio::test]
    async fn invalid_regexp_fails_open() {
        let store = store();
        let q = query(vec![filter("SUBJECT", FilterOperator::Regexp, "(")]);
        assert!(store.open(&q).await.is_err());
        assert_eq!(store.open_cursors(), 0);
    }

    #[tokio::test]
    async fn apply_mutates_stored_document() {
        let store = store();
        let mutation = Mutation::Set {
            field: "DOCUMENT_RELEVANCE".into(),
            value: json!(1),
        };
        store.apply("2", &mutation).await.unwrap();
        assert!(mutation.is_satisfied_by(&store.get("2").unwrap().source));
        assert!(store.apply("missing", &mutation).await.is_err());
    }
}
