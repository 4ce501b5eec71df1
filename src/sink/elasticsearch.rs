use super::{BulkAction, BulkReceipt, BulkSink};
use crate::config::SinkConfig;
use crate::error::{ExcavatorError, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    took: Option<u64>,
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

impl BulkResponse {
    fn first_error(&self) -> Option<String> {
        self.items.iter().find_map(|item| {
            let error = item.as_object()?.values().next()?.get("error")?;
            Some(
                error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            )
        })
    }
}

/// Sink posting newline-delimited bulk requests to an Elasticsearch-compatible `_bulk` endpoint.
pub struct ElasticsearchSink {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<(String, String)>,
}

impl ElasticsearchSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let credentials = match (&config.user, &config.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        Ok(Self {
            client,
            endpoint: format!("{}/_bulk", config.base_url()),
            credentials,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Action line followed by document line for every action.
    pub fn render_body(actions: &[BulkAction]) -> Result<String> {
        let mut body = String::new();
        for action in actions {
            let header = json!({ "index": { "_index": action.index } });
            body.push_str(&serde_json::to_string(&header)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(&action.source())?);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl BulkSink for ElasticsearchSink {
    async fn bulk(&self, actions: &[BulkAction]) -> Result<BulkReceipt> {
        if actions.is_empty() {
            return Ok(BulkReceipt::default());
        }
        let body = Self::render_body(actions)?;
        debug!("Posting {} documents ({} bytes) to {}", actions.len(), body.len(), self.endpoint);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExcavatorError::SinkUnavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(ExcavatorError::SinkUnavailable(format!(
                "bulk request returned {}: {}",
                status.as_u16(),
                snippet
            )));
        }

        let summary: BulkResponse = response
            .json()
            .await
            .map_err(|e| ExcavatorError::SinkUnavailable(format!("unreadable bulk response: {e}")))?;
        if summary.errors {
            return Err(ExcavatorError::SinkUnavailable(format!(
                "bulk request rejected documents: {}",
                summary.first_error().unwrap_or_else(|| "unknown reason".to_string())
            )));
        }

        Ok(BulkReceipt {
            items: actions.len(),
            took_ms: summary.took,
        })
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}
