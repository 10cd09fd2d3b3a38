use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chatlabel_core::{
    Action, AnnotationRequest, BulkAnnotator, CancellationToken, ChatlabelError, CursorHandle,
    Document, DocumentSource, FieldConfig, Filter, FilterOperator, FilterQuery, Judge,
    JudgmentPrompt, MemorySink, MemoryStore, Mutation, Page, Predicate, ProgressEvent,
    ProgressReport, ProgressSink, TargetValue,
};
use serde_json::json;

/// Returns scripted decisions in order; `Err` entries simulate model failures.
struct ScriptedJudge {
    answers: Mutex<VecDeque<anyhow::Result<bool>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedJudge {
    fn new(answers: Vec<anyhow::Result<bool>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    fn supports_structured_output(&self) -> bool {
        true
    }

    async fn decide(&self, prompt: &JudgmentPrompt) -> anyhow::Result<bool> {
        self.prompts.lock().unwrap().push(prompt.user_content());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted answer left")))
    }
}

/// Wraps a [`MemoryStore`], failing page fetches after `pages_ok` pages and
/// writes to the listed documents.
struct FlakySource {
    inner: MemoryStore,
    pages_ok: usize,
    pages_served: AtomicUsize,
    broken_docs: Vec<String>,
}

impl FlakySource {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            pages_ok: usize::MAX,
            pages_served: AtomicUsize::new(0),
            broken_docs: Vec::new(),
        }
    }
}

#[async_trait]
impl DocumentSource for FlakySource {
    async fn open(&self, query: &FilterQuery) -> anyhow::Result<CursorHandle> {
        self.inner.open(query).await
    }

    async fn next_page(&self, cursor: &mut CursorHandle) -> anyhow::Result<Page> {
        if self.pages_served.fetch_add(1, Ordering::SeqCst) >= self.pages_ok {
            bail!("scroll context expired");
        }
        self.inner.next_page(cursor).await
    }

    async fn close(&self, cursor: CursorHandle) -> anyhow::Result<()> {
        self.inner.close(cursor).await
    }

    async fn apply(&self, doc_id: &str, mutation: &Mutation) -> anyhow::Result<()> {
        if self.broken_docs.iter().any(|id| id == doc_id) {
            bail!("version conflict");
        }
        self.inner.apply(doc_id, mutation).await
    }

    async fn count(&self, query: &FilterQuery) -> anyhow::Result<u64> {
        self.inner.count(query).await
    }
}

/// Cancels the run once `after` events have been seen.
struct CancellingSink {
    inner: MemorySink,
    token: CancellationToken,
    after: usize,
}

impl ProgressSink for CancellingSink {
    fn emit(&self, event: ProgressEvent) {
        self.inner.emit(event);
        if self.inner.events().len() >= self.after {
            self.token.cancel();
        }
    }
}

fn emails(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| {
            Document::new(
                format!("doc-{i}"),
                json!({
                    "SUBJECT": format!("subject {i}"),
                    "CONTENT": format!("body {i}"),
                    "FROM": "ana@corp.com",
                    "TO": "luis@corp.com",
                    "DATE_CREATED": "2024-04-02T10:00:00",
                }),
            )
        })
        .collect()
}

fn relevance_request() -> AnnotationRequest {
    AnnotationRequest {
        id: Some(11),
        action: Action::SetRelevance,
        target_value: TargetValue::Integer(1),
        date_from: None,
        date_to: None,
        structured_filters: Vec::new(),
        free_text_predicates: Vec::new(),
    }
}

fn label_request(predicate: &str) -> AnnotationRequest {
    AnnotationRequest {
        action: Action::AppendLabel,
        target_value: TargetValue::Text("fraud".into()),
        free_text_predicates: vec![Predicate {
            field: None,
            text: predicate.into(),
        }],
        ..relevance_request()
    }
}

fn last(sink: &MemorySink) -> ProgressReport {
    *sink.events().last().unwrap().report()
}

#[tokio::test]
async fn pure_mutation_updates_every_document() {
    let store = MemoryStore::with_documents(2, emails(3));
    let annotator = BulkAnnotator::new(&store, FieldConfig::default());
    let sink = MemorySink::new();

    let report = annotator
        .run(&relevance_request(), &sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!((report.updated, report.ignored, report.finished), (3, 0, true));
    assert_eq!(sink.events().len(), 4);
    assert_eq!(last(&sink), report);
    for i in 0..3 {
        let doc = store.get(&format!("doc-{i}")).unwrap();
        assert_eq!(doc.source["DOCUMENT_RELEVANCE"], json!(1));
    }
    assert_eq!(store.open_cursors(), 0);
}

#[tokio::test]
async fn progress_events_carry_request_id_and_running_counts() {
    let store = MemoryStore::with_documents(10, emails(2));
    let annotator = BulkAnnotator::new(&store, FieldConfig::default());
    let sink = MemorySink::new();
    annotator
        .run(&relevance_request(), &sink, &CancellationToken::new())
        .await
        .unwrap();

    let wire: Vec<serde_json::Value> = sink
        .events()
        .iter()
        .map(|e| serde_json::to_value(e).unwrap())
        .collect();
    assert_eq!(
        wire[0],
        json!({"id": 11, "total_docs": 2, "updated_docs": 1, "ignored_docs": 0, "finished": false})
    );
    assert_eq!(wire[2]["finished"], json!(true));
}

#[tokio::test]
async fn judged_mutation_follows_the_judge() {
    let store = MemoryStore::with_documents(10, emails(2));
    let judge = ScriptedJudge::new(vec![Ok(true), Ok(false)]);
    let annotator = BulkAnnotator::new(&store, FieldConfig::default()).with_judge(&judge);
    let sink = MemorySink::new();

    let report = annotator
        .run(&label_request("asks for a payment"), &sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!((report.updated, report.ignored), (1, 1));
    assert_eq!(store.get("doc-0").unwrap().source["DOCUMENT_LABELS"], json!(["fraud"]));
    assert!(store.get("doc-1").unwrap().source.get("DOCUMENT_LABELS").is_none());
    let prompts = judge.prompts.lock().unwrap().clone();
    assert!(prompts[0].starts_with("Filters:\n1: asks for a payment\nDocument:\n"));
    assert!(prompts[0].contains("\"SUBJECT\":\"subject 0\""));
}

#[tokio::test]
async fn rerun_counts_annotated_documents_without_asking_again() {
    let store = MemoryStore::with_documents(10, emails(2));
    let request = label_request("asks for a payment");

    let first = ScriptedJudge::new(vec![Ok(true), Ok(false)]);
    BulkAnnotator::new(&store, FieldConfig::default())
        .with_judge(&first)
        .run(&request, &MemorySink::new(), &CancellationToken::new())
        .await
        .unwrap();

    let second = ScriptedJudge::new(vec![Ok(false)]);
    let report = BulkAnnotator::new(&store, FieldConfig::default())
        .with_judge(&second)
        .run(&request, &MemorySink::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!((report.updated, report.ignored), (1, 1));
    assert_eq!(second.calls(), 1);
    assert_eq!(store.get("doc-0").unwrap().source["DOCUMENT_LABELS"], json!(["fraud"]));
}

#[tokio::test]
async fn failures_count_as_ignored_and_totals_add_up() {
    let mut source = FlakySource::new(MemoryStore::with_documents(2, emails(5)));
    source.broken_docs = vec!["doc-3".into()];
    let judge = ScriptedJudge::new(vec![
        Ok(true),
        Err(anyhow!("model timed out")),
        Ok(false),
        Ok(true),
        Ok(true),
    ]);
    let annotator = BulkAnnotator::new(&source, FieldConfig::default()).with_judge(&judge);

    let report = annotator
        .run(&label_request("x"), &MemorySink::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.processed, 5);
    assert_eq!((report.updated, report.ignored), (2, 3));
    assert_eq!(report.updated + report.ignored, report.processed);
}

#[tokio::test]
async fn pure_mode_write_failure_is_ignored() {
    let mut source = FlakySource::new(MemoryStore::with_documents(10, emails(3)));
    source.broken_docs = vec!["doc-1".into()];
    let report = BulkAnnotator::new(&source, FieldConfig::default())
        .run(&relevance_request(), &MemorySink::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((report.updated, report.ignored), (2, 1));
}

#[tokio::test]
async fn cursor_failure_aborts_with_partial_progress() {
    let mut source = FlakySource::new(MemoryStore::with_documents(2, emails(5)));
    source.pages_ok = 1;
    let annotator = BulkAnnotator::new(&source, FieldConfig::default());
    let sink = MemorySink::new();

    let err = annotator
        .run(&relevance_request(), &sink, &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        ChatlabelError::SourceUnavailable { message, progress } => {
            assert!(message.contains("scroll context expired"));
            assert_eq!(progress.processed, 2);
            assert_eq!(progress.updated, 2);
            assert!(progress.finished);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(last(&sink).finished);
    assert_eq!(source.inner.open_cursors(), 0);
}

#[tokio::test]
async fn cancellation_stops_at_document_boundary() {
    let store = MemoryStore::with_documents(10, emails(5));
    let token = CancellationToken::new();
    let sink = CancellingSink {
        inner: MemorySink::new(),
        token: token.clone(),
        after: 2,
    };

    let report = BulkAnnotator::new(&store, FieldConfig::default())
        .run(&relevance_request(), &sink, &token)
        .await
        .unwrap();

    assert_eq!(report.processed, 2);
    assert!(report.finished);
    assert_eq!(sink.inner.events().len(), 3);
    assert!(store.get("doc-2").unwrap().source.get("DOCUMENT_RELEVANCE").is_none());
    assert_eq!(store.open_cursors(), 0);
}

#[tokio::test]
async fn judged_request_without_judge_is_rejected_before_io() {
    let store = MemoryStore::with_documents(10, emails(2));
    let sink = MemorySink::new();
    let err = BulkAnnotator::new(&store, FieldConfig::default())
        .run(&label_request("x"), &sink, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatlabelError::Configuration(_)));
    assert_eq!(sink.reports(), vec![ProgressReport::default().finish()]);
    assert!(store.get("doc-0").unwrap().source.get("DOCUMENT_LABELS").is_none());
}

#[tokio::test]
async fn structured_filters_are_pushed_into_the_cursor() {
    let mut docs = emails(3);
    docs[1].source["SUBJECT"] = json!("Re: wire transfer");
    let store = MemoryStore::with_documents(10, docs);
    let request = AnnotationRequest {
        structured_filters: vec![Filter {
            field: "SUBJECT".into(),
            operator: FilterOperator::Contains,
            value: "wire".into(),
        }],
        ..relevance_request()
    };

    let report = BulkAnnotator::new(&store, FieldConfig::default())
        .run(&request, &MemorySink::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!((report.total, report.updated), (1, 1));
    assert_eq!(store.get("doc-1").unwrap().source["DOCUMENT_RELEVANCE"], json!(1));
    assert!(store.get("doc-0").unwrap().source.get("DOCUMENT_RELEVANCE").is_none());
}
