//! HTTP adapter for the external import service.
//!
//! All metadata-source work happens on the other side of this endpoint; the
//! adapter only ships the task parameters over and maps the response.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use showsync_config::ImportConfig;
use showsync_scheduler::{ImportError, ImportSummary, MetadataImporter};
use showsync_types::{MediaItem, ScheduledTask};

pub struct HttpImporter {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpImporter {
    pub fn new(config: &ImportConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            auth_token: config.auth_token.clone(),
        }
    }
}

#[async_trait]
impl MetadataImporter for HttpImporter {
    async fn perform_import(
        &self,
        task: &ScheduledTask,
        item: &MediaItem,
        cancel: CancellationToken,
    ) -> Result<ImportSummary, ImportError> {
        let body = json!({
            "task_id": task.id,
            "item_id": item.id,
            "title": item.title,
            "action": task.action,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ImportError::Cancelled),
            result = request.send() => {
                result.map_err(|e| ImportError::Request(e.to_string()))?
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ImportError::Request(format!("{status}: {detail}")));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ImportError::Request(e.to_string()))?;

        Ok(ImportSummary {
            episodes_updated: payload
                .get("episodes_updated")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            detail: payload
                .get("detail")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }
}
