//! [`DocumentSource`] over the Elasticsearch REST API.
//!
//! Cursors are scroll contexts: `open` runs the initial search and keeps its
//! first page in the handle, `next_page` continues the scroll and tracks the
//! scroll id the server hands back, `close` clears the context.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chatlabel_core::{CursorHandle, Document, DocumentSource, FilterQuery, Mutation, Page};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::query::build_query;

const ADD_TO_SET_SCRIPT: &str = "\
if (ctx._source[params.field] == null) { ctx._source[params.field] = [params.value]; } \
else if (!(ctx._source[params.field] instanceof List)) { \
if (ctx._source[params.field] != params.value) { ctx._source[params.field] = [ctx._source[params.field], params.value]; } } \
else if (!ctx._source[params.field].contains(params.value)) { ctx._source[params.field].add(params.value); }";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ElasticConfig {
    pub url: String,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Scroll keep-alive, in Elasticsearch time units.
    pub scroll: String,
    pub page_size: usize,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: String::new(),
            username: None,
            password: None,
            scroll: "1m".to_string(),
            page_size: 100,
        }
    }
}

pub struct ElasticSource {
    http: Client,
    config: ElasticConfig,
}

impl ElasticSource {
    pub fn new(config: ElasticConfig) -> Result<Self> {
        if config.index.trim().is_empty() {
            return Err(anyhow!("elasticsearch index name is not set"));
        }
        if config.page_size == 0 {
            return Err(anyhow!("elasticsearch page size must be positive"));
        }
        Ok(Self {
            http: Client::new(),
            config,
        })
    }

    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    /// Base url plus `segments`, each percent-encoded as a single path
    /// segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.url)
            .with_context(|| format!("invalid elasticsearch url {}", self.config.url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("elasticsearch url {} cannot carry a path", self.config.url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let builder = self.http.request(method, self.endpoint(segments)?);
        Ok(match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_ref()),
            None => builder,
        })
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Value> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("elasticsearch {what} request failed"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!(
                "elasticsearch {what} returned error (status {status}): {body}"
            ));
        }
        serde_json::from_str(&body)
            .with_context(|| format!("failed to decode elasticsearch {what} response"))
    }

    fn page(&self, response: &SearchResponse) -> Page {
        let documents: Vec<Document> = response
            .hits
            .hits
            .iter()
            .map(|hit| Document::new(hit.id.clone(), hit.source.clone()))
            .collect();
        let has_more = documents.len() >= self.config.page_size;
        Page {
            documents,
            has_more,
        }
    }
}

#[async_trait]
impl DocumentSource for ElasticSource {
    async fn open(&self, query: &FilterQuery) -> Result<CursorHandle> {
        let body = json!({
            "query": build_query(query),
            "size": self.config.page_size,
            "track_total_hits": true,
        });
        let request = self
            .request(Method::POST, &[self.config.index.as_str(), "_search"])?
            .query(&[("scroll", self.config.scroll.as_str())])
            .json(&body);
        let value = self.send(request, "search").await?;
        let response: SearchResponse =
            serde_json::from_value(value).context("unexpected search response shape")?;
        let scroll_id = response
            .scroll_id
            .clone()
            .ok_or_else(|| anyhow!("search response carries no scroll id"))?;
        let total = response.hits.total.as_ref().map_or(0, TotalHits::value);
        tracing::debug!(index = %self.config.index, total, "scroll opened");
        let first = self.page(&response);
        Ok(CursorHandle::new(scroll_id, total).with_first_page(first))
    }

    async fn next_page(&self, cursor: &mut CursorHandle) -> Result<Page> {
        if let Some(page) = cursor.take_prefetched() {
            return Ok(page);
        }
        let body = json!({ "scroll": self.config.scroll, "scroll_id": cursor.id });
        let request = self
            .request(Method::POST, &["_search", "scroll"])?
            .json(&body);
        let value = self.send(request, "scroll").await?;
        let response: SearchResponse =
            serde_json::from_value(value).context("unexpected scroll response shape")?;
        if let Some(id) = &response.scroll_id {
            cursor.id = id.clone();
        }
        Ok(self.page(&response))
    }

    async fn close(&self, cursor: CursorHandle) -> Result<()> {
        let body = json!({ "scroll_id": [cursor.id] });
        let response = self
            .request(Method::DELETE, &["_search", "scroll"])?
            .json(&body)
            .send()
            .await
            .context("elasticsearch clear scroll request failed")?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(anyhow!("elasticsearch clear scroll returned status {status}"))
        }
    }

    async fn apply(&self, doc_id: &str, mutation: &Mutation) -> Result<()> {
        let request = self
            .request(Method::POST, &[self.config.index.as_str(), "_update", doc_id])?
            .query(&[("retry_on_conflict", "3")])
            .json(&update_body(mutation));
        self.send(request, "update")
            .await
            .with_context(|| format!("updating document {doc_id}"))?;
        Ok(())
    }

    async fn count(&self, query: &FilterQuery) -> Result<u64> {
        let body = json!({ "query": build_query(query) });
        let request = self
            .request(Method::POST, &[self.config.index.as_str(), "_count"])?
            .json(&body);
        let value = self.send(request, "count").await?;
        value
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("count response carries no count"))
    }
}

/// Partial-document update for `Set`, painless script for `AddToSet`.
pub fn update_body(mutation: &Mutation) -> Value {
    match mutation {
        Mutation::Set { field, value } => json!({ "doc": { field.as_str(): value } }),
        Mutation::AddToSet { field, value } => json!({
            "script": {
                "source": ADD_TO_SET_SCRIPT,
                "lang": "painless",
                "params": { "field": field, "value": value },
            }
        }),
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<Hit>,
}

/// `hits.total` is an object since 7.0 and a bare number before.
#[derive(Deserialize)]
#[serde(untagged)]
enum TotalHits {
    Object { value: u64 },
    Number(u64),
}

impl TotalHits {
    fn value(&self) -> u64 {
        match self {
            TotalHits::Object { value } | TotalHits::Number(value) => *value,
        }
    }
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
}
