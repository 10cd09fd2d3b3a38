//! Bulk annotation over a cursor.
//!
//! One run opens one cursor over the structured part of an
//! [`AnnotationRequest`] and walks it strictly in order. Without free-text
//! predicates every returned document is mutated; with them each document is
//! first checked for the target state (already annotated counts as updated),
//! then put to the [`Judge`]. Single-document judge or write failures are
//! counted as ignored; only cursor failures end the run early.

use tokio_util::sync::CancellationToken;

use crate::error::{CallSite, ChatlabelError, Result};
use crate::judge::{Judge, JudgmentPrompt, DEFAULT_JUDGE_PREAMBLE};
use crate::progress::{ProgressEvent, ProgressReport, ProgressSink};
use crate::request::{AnnotationRequest, FieldConfig, FilterQuery};
use crate::source::{CursorHandle, Document, DocumentSource, Mutation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Updated,
    Ignored,
}

pub struct BulkAnnotator<'a> {
    source: &'a dyn DocumentSource,
    judge: Option<&'a dyn Judge>,
    fields: FieldConfig,
    preamble: String,
}

impl<'a> BulkAnnotator<'a> {
    pub fn new(source: &'a dyn DocumentSource, fields: FieldConfig) -> Self {
        Self {
            source,
            judge: None,
            fields,
            preamble: DEFAULT_JUDGE_PREAMBLE.to_string(),
        }
    }

    pub fn with_judge(mut self, judge: &'a dyn Judge) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    /// Runs the request to completion, cancellation or cursor failure and
    /// returns the final report. Exactly one finished report is emitted on
    /// every path.
    pub async fn run(
        &self,
        request: &AnnotationRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ProgressReport> {
        let judge = match self.check(request) {
            Ok(judge) => judge,
            Err(err) => {
                emit(sink, request, ProgressReport::default().finish());
                return Err(err);
            }
        };
        let query = FilterQuery::from_request(request, &self.fields);
        let mutation = Mutation::for_request(request, &self.fields);

        let mut cursor = match self.source.open(&query).await {
            Ok(cursor) => cursor,
            Err(err) => {
                let report = ProgressReport::default().finish();
                emit(sink, request, report);
                return Err(ChatlabelError::source(report, err.context("opening cursor")));
            }
        };
        tracing::info!(
            request_id = ?request.id,
            action = ?request.action,
            target = %request.target_value,
            judged = judge.is_some(),
            total = cursor.total_estimate,
            "starting bulk annotation"
        );

        let mut report = ProgressReport::new(cursor.total_estimate);
        let walked = self
            .walk(&mut cursor, request, judge, &mutation, &mut report, sink, cancel)
            .await;
        if let Err(err) = self.source.close(cursor).await {
            tracing::warn!("failed to close cursor: {err:#}");
        }

        report.finished = true;
        emit(sink, request, report);
        tracing::info!(
            processed = report.processed,
            updated = report.updated,
            ignored = report.ignored,
            "bulk annotation finished"
        );
        match walked {
            Ok(()) => Ok(report),
            Err(err) => Err(ChatlabelError::source(report, err)),
        }
    }

    fn check(&self, request: &AnnotationRequest) -> Result<Option<&'a dyn Judge>> {
        request.validate()?;
        if !request.is_judged() {
            return Ok(None);
        }
        match self.judge {
            Some(judge) => Ok(Some(judge)),
            None => Err(ChatlabelError::Configuration(
                "request has free-text predicates but no judge is configured".to_string(),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn walk(
        &self,
        cursor: &mut CursorHandle,
        request: &AnnotationRequest,
        judge: Option<&dyn Judge>,
        mutation: &Mutation,
        report: &mut ProgressReport,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            if cancel.is_cancelled() {
                tracing::info!(processed = report.processed, "bulk annotation cancelled");
                return Ok(());
            }
            let page = self.source.next_page(cursor).await?;
            if page.documents.is_empty() {
                return Ok(());
            }
            for document in &page.documents {
                if cancel.is_cancelled() {
                    tracing::info!(processed = report.processed, "bulk annotation cancelled");
                    return Ok(());
                }
                let verdict = match judge {
                    Some(judge) => self.judged(judge, request, document, mutation).await,
                    None => self.mutate(document, mutation).await,
                };
                report.processed += 1;
                match verdict {
                    Verdict::Updated => report.updated += 1,
                    Verdict::Ignored => report.ignored += 1,
                }
                report.total = report.total.max(report.processed);
                emit(sink, request, *report);
            }
            if !page.has_more {
                return Ok(());
            }
        }
    }

    async fn judged(
        &self,
        judge: &dyn Judge,
        request: &AnnotationRequest,
        document: &Document,
        mutation: &Mutation,
    ) -> Verdict {
        if mutation.is_satisfied_by(&document.source) {
            tracing::debug!(doc_id = %document.id, "already annotated");
            return Verdict::Updated;
        }
        let prompt = JudgmentPrompt::new(
            self.preamble.as_str(),
            &request.free_text_predicates,
            document,
            &self.fields.default_projection,
        );
        match judge.decide(&prompt).await {
            Ok(true) => self.mutate(document, mutation).await,
            Ok(false) => {
                tracing::debug!(doc_id = %document.id, "judge rejected document");
                Verdict::Ignored
            }
            Err(err) => {
                let err = ChatlabelError::model_call(CallSite::Judgment(document.id.clone()), err);
                tracing::warn!(doc_id = %document.id, "{err}");
                Verdict::Ignored
            }
        }
    }

    async fn mutate(&self, document: &Document, mutation: &Mutation) -> Verdict {
        match self.source.apply(&document.id, mutation).await {
            Ok(()) => {
                tracing::debug!(doc_id = %document.id, field = mutation.field(), "document updated");
                Verdict::Updated
            }
            Err(err) => {
                let err = ChatlabelError::MutationFailed {
                    doc_id: document.id.clone(),
                    message: format!("{err:#}"),
                };
                tracing::warn!(doc_id = %document.id, "{err}");
                Verdict::Ignored
            }
        }
    }
}

fn emit(sink: &dyn ProgressSink, request: &AnnotationRequest, report: ProgressReport) {
    sink.emit(ProgressEvent::Annotation {
        request_id: request.id,
        report,
    });
}

/// Counts the documents a request's structured filters select.
pub async fn count_matching(
    source: &dyn DocumentSource,
    request: &AnnotationRequest,
    fields: &FieldConfig,
) -> Result<u64> {
    request.validate()?;
    let query = FilterQuery::from_request(request, fields);
    source
        .count(&query)
        .await
        .map_err(|err| ChatlabelError::source(ProgressReport::default().finish(), err))
}
