use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{ApiError, TransportError};
use crate::models::{
    Article, ArticleContent, BackendConfig, CacheFile, DraftHandle, GenerateRequest, HistoryRecord, HistoryStatus,
    ModelList, PublishReceipt, SavedDraft, ScheduleRequest,
};
use crate::transport::{Method, Transport};

pub const CONFIG: &str = "config";
pub const GENERATE_ARTICLE: &str = "generate-article";
pub const SAVE_DRAFT: &str = "save-draft";
pub const PUBLISH_DRAFT: &str = "publish-draft";
pub const MASS_SEND: &str = "mass-send";
pub const SCHEDULE_PUBLISH: &str = "schedule-publish";
pub const GENERATION_HISTORY: &str = "generation-history";
pub const PUBLISH_HISTORY: &str = "publish-history";
pub const ARTICLE_CONTENT: &str = "article-content";
pub const LATEST_CACHE_FILE: &str = "get-latest-cache-file";

/// Text-generation providers the backend can list models for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Provider {
    Gemini,
    Deepseek,
    Dashscope,
}

impl Provider {
    fn slug(self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::Deepseek => "deepseek",
            Provider::Dashscope => "dashscope",
        }
    }
}

/// External services whose credentials the backend can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Service {
    Wechat,
    Gemini,
    Deepseek,
    Dashscope,
}

impl Service {
    fn slug(self) -> &'static str {
        match self {
            Service::Wechat => "wechat",
            Service::Gemini => "gemini",
            Service::Deepseek => "deepseek",
            Service::Dashscope => "dashscope",
        }
    }
}

/// Typed view over the backend routes.
#[derive(Clone)]
pub struct BackendClient {
    transport: Arc<dyn Transport>,
}

impl BackendClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        let data = self.transport.call(endpoint, Method::Get, None).await?;
        decode(endpoint, data)
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> Result<T, ApiError> {
        let data = self.transport.call(endpoint, Method::Post, Some(body)).await?;
        decode(endpoint, data)
    }

    async fn post_unit(&self, endpoint: &str, body: Value) -> Result<(), ApiError> {
        self.transport.call(endpoint, Method::Post, Some(body)).await?;
        Ok(())
    }

    pub async fn config(&self) -> Result<BackendConfig, ApiError> {
        self.get(CONFIG).await
    }

    pub async fn generate_article(&self, request: &GenerateRequest) -> Result<Article, ApiError> {
        let body = serde_json::to_value(request).map_err(|e| malformed(GENERATE_ARTICLE, e))?;
        self.post(GENERATE_ARTICLE, body).await
    }

    pub async fn save_draft(&self, article: &Article) -> Result<DraftHandle, ApiError> {
        let saved: SavedDraft = self.post(SAVE_DRAFT, json!({ "article": article })).await?;
        if saved.media_id.is_empty() {
            return Err(TransportError::Malformed {
                endpoint: SAVE_DRAFT.to_string(),
                message: "empty media_id".to_string(),
            }
            .into());
        }
        Ok(DraftHandle::new(saved.media_id))
    }

    pub async fn publish_draft(&self, handle: &DraftHandle) -> Result<PublishReceipt, ApiError> {
        let data = self
            .transport
            .call(PUBLISH_DRAFT, Method::Post, Some(json!({ "media_id": handle.media_id() })))
            .await?;
        if data.is_null() {
            return Ok(PublishReceipt::default());
        }
        decode(PUBLISH_DRAFT, data)
    }

    pub async fn mass_send(&self, publish_id: &str) -> Result<(), ApiError> {
        self.post_unit(MASS_SEND, json!({ "publish_id": publish_id })).await
    }

    pub async fn schedule_publish(&self, request: &ScheduleRequest) -> Result<(), ApiError> {
        let body = serde_json::to_value(request).map_err(|e| malformed(SCHEDULE_PUBLISH, e))?;
        self.post_unit(SCHEDULE_PUBLISH, body).await
    }

    pub async fn generation_history(&self) -> Result<Vec<HistoryRecord>, ApiError> {
        self.get(GENERATION_HISTORY).await
    }

    /// Publish-history entries carry no status of their own; they are published by definition.
    pub async fn publish_history(&self) -> Result<Vec<HistoryRecord>, ApiError> {
        let mut records: Vec<HistoryRecord> = self.get(PUBLISH_HISTORY).await?;
        for record in &mut records {
            record.status = HistoryStatus::Published;
        }
        Ok(records)
    }

    pub async fn article_content(&self, cache_files: &[String]) -> Result<String, ApiError> {
        let content: ArticleContent = self
            .post(ARTICLE_CONTENT, json!({ "cache_files": cache_files }))
            .await?;
        Ok(content.content)
    }

    pub async fn latest_cache_file(&self) -> Result<CacheFile, ApiError> {
        self.get(LATEST_CACHE_FILE).await
    }

    pub async fn models(&self, provider: Provider) -> Result<ModelList, ApiError> {
        self.get(&format!("{}-models", provider.slug())).await
    }

    pub async fn test_connection(&self, service: Service) -> Result<(), ApiError> {
        self.post_unit(&format!("test-{}", service.slug()), json!({})).await
    }
}

fn decode<T: DeserializeOwned>(endpoint: &str, data: Value) -> Result<T, ApiError> {
    serde_json::from_value(data).map_err(|e| malformed(endpoint, e))
}

fn malformed(endpoint: &str, e: serde_json::Error) -> ApiError {
    TransportError::Malformed {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    }
    .into()
}
