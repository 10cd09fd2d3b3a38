use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chatlabel_core::{count_matching, AnnotationRequest, BulkAnnotator, Judge};
use chatlabel_index::ElasticSource;
use chatlabel_llm::{build_judge, LlmClient};
use serde_json::json;

use crate::config::ChatlabelConfig;
use crate::output::{print_record, progress_sink};
use crate::runtime;

fn load_request(path: &Path) -> Result<AnnotationRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read request {}", path.display()))?;
    let request = AnnotationRequest::from_json(&raw)
        .with_context(|| format!("invalid request {}", path.display()))?;
    Ok(request)
}

pub fn count(config: &ChatlabelConfig, request: &Path) -> Result<()> {
    let request = load_request(request)?;
    let source = ElasticSource::new(config.elasticsearch.clone())?;
    let (runtime, _cancel) = runtime::start()?;
    let total = runtime.block_on(count_matching(&source, &request, &config.fields))?;
    print_record(&json!({ "id": request.id, "total_docs": total }))
}

pub fn annotate(config: &ChatlabelConfig, request: &Path) -> Result<()> {
    let request = load_request(request)?;
    let source = ElasticSource::new(config.elasticsearch.clone())?;
    let judge: Option<Box<dyn Judge>> = if request.is_judged() {
        let client = LlmClient::new(config.provider()?, config.model()?)?;
        Some(build_judge(client)?)
    } else {
        None
    };

    let mut annotator = BulkAnnotator::new(&source, config.fields.clone())
        .with_preamble(config.prompts.judge.clone());
    if let Some(judge) = judge.as_deref() {
        annotator = annotator.with_judge(judge);
    }

    let (runtime, cancel) = runtime::start()?;
    let sink = progress_sink();
    let report = runtime.block_on(annotator.run(&request, &sink, &cancel))?;
    tracing::info!(
        request = ?request.id,
        processed = report.processed,
        updated = report.updated,
        ignored = report.ignored,
        cancelled = cancel.is_cancelled(),
        "annotation finished"
    );
    Ok(())
}
