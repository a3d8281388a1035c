//! # Solr Client
//!
//! JSON-over-HTTP access to the Solr update endpoint. Adds are buffered
//! and flushed as one POST when either the document count or the byte
//! budget is reached; deletes flush the buffer first so ordering is
//! preserved. Non-2xx responses are hard failures carrying the body.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{HttpSettings, SolrSettings};
use crate::error::RecordError;
use crate::harvest::BackoffPolicy;
use crate::Cancellation;

pub struct SolrClient {
    client: reqwest::Client,
    settings: SolrSettings,
    http: HttpSettings,
    cancellation: Cancellation,
    buffer: Vec<Value>,
    buffered_bytes: usize,
}

impl SolrClient {
    pub fn new(
        client: reqwest::Client,
        settings: SolrSettings,
        http: HttpSettings,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            client,
            settings,
            http,
            cancellation,
            buffer: Vec::new(),
            buffered_bytes: 0,
        }
    }

    /// Queue one document for addition, flushing when a batch limit is
    /// hit.
    pub async fn add(&mut self, doc: Value) -> Result<(), RecordError> {
        self.buffered_bytes += doc.to_string().len();
        self.buffer.push(doc);
        if self.buffer.len() >= self.settings.max_update_records
            || self.buffered_bytes >= self.settings.max_update_size
        {
            self.flush().await?;
        }
        Ok(())
    }

    /// POST all buffered adds as one `[ {...}, {...} ]` body.
    pub async fn flush(&mut self) -> Result<(), RecordError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        self.buffered_bytes = 0;
        let body = serde_json::to_string(&Value::Array(batch))?;
        debug!(bytes = body.len(), "posting add batch");
        self.post(body).await
    }

    pub async fn delete_id(&mut self, id: &str) -> Result<(), RecordError> {
        self.flush().await?;
        let body = serde_json::json!({ "delete": { "id": id } }).to_string();
        self.post(body).await
    }

    pub async fn delete_query(&mut self, query: &str) -> Result<(), RecordError> {
        self.flush().await?;
        let body = serde_json::json!({ "delete": { "query": query } }).to_string();
        self.post(body).await
    }

    pub async fn commit(&mut self) -> Result<(), RecordError> {
        self.flush().await?;
        info!("committing Solr index");
        self.post(serde_json::json!({ "commit": {} }).to_string())
            .await
    }

    pub async fn optimize(&mut self) -> Result<(), RecordError> {
        self.flush().await?;
        info!("optimizing Solr index");
        self.post(serde_json::json!({ "optimize": {} }).to_string())
            .await
    }

    /// Fetch the currently indexed document, for compare mode.
    pub async fn get_document(&self, id: &str) -> Result<Option<Value>, RecordError> {
        let select_url = self.settings.update_url.replace("/update", "/select");
        let url = reqwest::Url::parse_with_params(
            &select_url,
            [("q", format!("id:\"{id}\"")), ("wt", "json".to_string())],
        )
        .map_err(|err| RecordError::Config(format!("bad Solr url: {err}")))?;

        let mut request = self.client.get(url);
        if let Some(username) = &self.settings.username {
            request = request.basic_auth(username, self.settings.password.as_deref());
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RecordError::Solr {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: Value = serde_json::from_str(&body)?;
        Ok(parsed
            .pointer("/response/docs/0")
            .cloned())
    }

    /// POST one update body with the transient-failure retry budget.
    async fn post(&self, body: String) -> Result<(), RecordError> {
        let policy = BackoffPolicy::from_settings(&self.http);
        let mut last_error = None;

        for attempt in 0..self.http.max_tries {
            if self.cancellation.is_cancelled() {
                return Err(RecordError::Cancelled);
            }
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for(attempt - 1)).await;
            }

            let mut request = self
                .client
                .post(&self.settings.update_url)
                .header("Content-Type", "application/json")
                .timeout(Duration::from_secs(self.settings.timeout_secs))
                .body(body.clone());
            if let Some(username) = &self.settings.username {
                request = request.basic_auth(username, self.settings.password.as_deref());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    let body = response.text().await.unwrap_or_default();
                    let error = RecordError::Solr {
                        status: status.as_u16(),
                        body,
                    };
                    // Client errors are not transient; bail out at once.
                    if status.is_client_error() {
                        return Err(error);
                    }
                    debug!(attempt, error = %error, "retrying Solr POST");
                    last_error = Some(error);
                }
                Err(err) => {
                    debug!(attempt, error = %err, "retrying Solr POST");
                    last_error = Some(err.into());
                }
            }
        }

        Err(last_error.unwrap_or(RecordError::TransientNetwork {
            attempts: self.http.max_tries,
            message: "Solr POST failed".to_string(),
        }))
    }

    /// Number of documents waiting in the add buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_bodies() {
        assert_eq!(
            serde_json::json!({ "delete": { "id": "s1.1" } }).to_string(),
            r#"{"delete":{"id":"s1.1"}}"#
        );
        assert_eq!(
            serde_json::json!({ "delete": { "query": "id:s1.*" } }).to_string(),
            r#"{"delete":{"query":"id:s1.*"}}"#
        );
        assert_eq!(serde_json::json!({ "commit": {} }).to_string(), r#"{"commit":{}}"#);
        assert_eq!(
            serde_json::json!({ "optimize": {} }).to_string(),
            r#"{"optimize":{}}"#
        );
    }

    #[tokio::test]
    async fn test_add_buffers_until_flush() {
        let settings = SolrSettings {
            max_update_records: 100,
            max_update_size: usize::MAX,
            ..SolrSettings::default()
        };
        let mut client = SolrClient::new(
            reqwest::Client::new(),
            settings,
            HttpSettings::default(),
            Cancellation::new(),
        );
        client.add(serde_json::json!({"id": "a"})).await.unwrap();
        client.add(serde_json::json!({"id": "b"})).await.unwrap();
        assert_eq!(client.pending(), 2);
    }
}
