//! Tavily search client with result post-processing

use super::{SearchError, SearchResult, SearchTool};
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::SearchConfig;
use crate::metrics::METRICS;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

const SEARCH_OPERATION: &str = "search";

/// Tavily `/search` client
pub struct TavilySearch {
    http: Client,
    endpoint: String,
    api_key: Secret<String>,
    max_results: usize,
    search_depth: String,
    include_images: bool,
    min_score_threshold: Option<f64>,
    max_content_length: usize,
    breaker: CircuitBreaker,
}

impl TavilySearch {
    pub fn new(config: &SearchConfig) -> Result<Self, SearchError> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            SearchError::NotConfigured(format!(
                "no search.api_key and ${} is not set",
                config.api_key_env
            ))
        })?;

        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/search", config.base_url.trim_end_matches('/')),
            api_key,
            max_results: config.max_results,
            search_depth: config.search_depth.clone(),
            include_images: config.include_images,
            min_score_threshold: config.min_score_threshold,
            max_content_length: config.max_content_length_per_page,
            breaker: CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(30),
            }),
        })
    }

    async fn call_search_api(&self, query: &str) -> Result<TavilyResponse, SearchError> {
        let request_body = serde_json::json!({
            "api_key": self.api_key.expose_secret(),
            "query": query,
            "max_results": self.max_results,
            "search_depth": self.search_depth,
            "include_answer": false,
            "include_raw_content": false,
            "include_images": self.include_images,
            "include_image_descriptions": self.include_images,
        });

        debug!("Calling Tavily search: {}", query);

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout(e.to_string())
                } else {
                    SearchError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SearchError::Upstream(format!(
                "Status {}: {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SearchError::InvalidResponse(e.to_string()))
    }

    /// Score filter, content truncation, and image attachment
    fn process(&self, response: TavilyResponse) -> Vec<SearchResult> {
        let mut results: Vec<SearchResult> = response
            .results
            .into_iter()
            .filter(|page| match (self.min_score_threshold, page.score) {
                (Some(threshold), Some(score)) => score >= threshold,
                _ => true,
            })
            .map(|page| SearchResult {
                title: page.title,
                url: page.url,
                content: truncate_chars(&page.content, self.max_content_length),
                images: Vec::new(),
            })
            .collect();

        if let Some(first) = results.first_mut() {
            first.images = response
                .images
                .into_iter()
                .map(TavilyImage::into_url)
                .collect();
        }

        results
    }
}

#[async_trait]
impl SearchTool for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        if self.breaker.is_open(SEARCH_OPERATION) {
            error!("Circuit breaker is open for search");
            return Err(SearchError::CircuitOpen(SEARCH_OPERATION.to_string()));
        }

        match self.call_search_api(query).await {
            Ok(response) => {
                self.breaker.mark_success(SEARCH_OPERATION);
                METRICS.record_search(true);
                let results = self.process(response);
                debug!("Search returned {} pages for {:?}", results.len(), query);
                Ok(results)
            }
            Err(e) => {
                self.breaker.mark_failure(SEARCH_OPERATION);
                METRICS.record_search(false);
                Err(e)
            }
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyPage>,
    #[serde(default)]
    images: Vec<TavilyImage>,
}

#[derive(Debug, Deserialize)]
struct TavilyPage {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f64>,
}

/// Plain URL, or `{url, description}` when descriptions are requested
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TavilyImage {
    Url(String),
    Described {
        url: String,
        #[allow(dead_code)]
        #[serde(default)]
        description: Option<String>,
    },
}

impl TavilyImage {
    fn into_url(self) -> String {
        match self {
            TavilyImage::Url(url) | TavilyImage::Described { url, .. } => url,
        }
    }
}
