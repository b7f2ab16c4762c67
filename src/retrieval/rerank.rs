//! Rerank 提供方：Cohere 兼容 /rerank 端点
//!
//! 请求 {model, query, documents, top_n}，响应 {results: [{index, relevance_score}]}。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// 精排提供方；返回 (文档下标, 相关性分数)，按分数降序
#[async_trait]
pub trait RerankProvider: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<(usize, f32)>, String>;
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankEntry>,
}

#[derive(Debug, Deserialize)]
struct RerankEntry {
    index: usize,
    relevance_score: f32,
}

/// HTTP 精排客户端
pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpReranker {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key
                .map(String::from)
                .or_else(|| std::env::var("RERANK_API_KEY").ok()),
        }
    }
}

#[async_trait]
impl RerankProvider for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<(usize, f32)>, String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "missing RERANK_API_KEY".to_string())?;

        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": top_n,
        });

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("rerank http {}", response.status()));
        }

        let parsed: RerankResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(parsed
            .results
            .into_iter()
            .map(|r| (r.index, r.relevance_score))
            .collect())
    }
}
