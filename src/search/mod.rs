//! Web search tool boundary

pub mod tavily;

pub use tavily::TavilySearch;

use crate::llm::ToolSpec;
use crate::metrics::METRICS;
use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Name the research agent uses to call search
pub const WEB_SEARCH_TOOL: &str = "web_search";

/// One page returned by a search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

/// Search errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("Search not configured: {0}")]
    NotConfigured(String),

    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// External search capability
#[async_trait]
pub trait SearchTool: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError>;

    /// Capability description offered to the model
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: WEB_SEARCH_TOOL.to_string(),
            description: "Search the web for up-to-date information. Returns pages with title, url, content and related image urls.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"]
            }),
        }
    }
}

/// Memoizes results of another search tool per normalized query
pub struct CachedSearch {
    inner: Arc<dyn SearchTool>,
    cache: Cache<String, Arc<Vec<SearchResult>>>,
}

impl CachedSearch {
    pub fn new(inner: Arc<dyn SearchTool>, capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner, cache }
    }
}

#[async_trait]
impl SearchTool for CachedSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let key = normalize_query(query);

        if let Some(hit) = self.cache.get(&key).await {
            METRICS.search_cache_hits.inc();
            debug!("Search cache hit: {}", key);
            return Ok(hit.as_ref().clone());
        }
        METRICS.search_cache_misses.inc();

        let results = self.inner.search(query).await?;
        self.cache.insert(key, Arc::new(results.clone())).await;
        Ok(results)
    }

    fn spec(&self) -> ToolSpec {
        self.inner.spec()
    }
}

/// Lowercase and collapse whitespace
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
