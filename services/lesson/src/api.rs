//! HTTP client for the REST backend: progress, profile and lesson metadata.

use crate::models::{User, UserStats};
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use signstream_core::lesson::{Lesson, LessonsResponse};
use signstream_core::progress::{ProgressReport, ProgressSaver};
use tracing::{debug, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// Non-success status. `detail` is the server's own message when it sent one.
    #[error("{detail}")]
    Status {
        path: String,
        status: u16,
        detail: String,
    },
    #[error("Could not decode response from {path}: {message}")]
    Decode { path: String, message: String },
}

/// Pulls the `detail` string out of an error body, falling back to `fallback`.
fn error_detail(body: &str, fallback: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("detail")?.as_str().map(str::to_string))
        .filter(|detail| !detail.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        path: &str,
        request: reqwest::RequestBuilder,
        fallback: &str,
    ) -> Result<String, ApiError> {
        let response = request.send().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })?;
        if !status.is_success() {
            warn!(path, status = status.as_u16(), "Backend request failed");
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                detail: error_detail(&body, fallback),
            });
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, fallback: &str) -> Result<T, ApiError> {
        let body = self.send(path, self.http.get(self.url(path)), fallback).await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.get_json("/api/users/me", "Failed to fetch user").await
    }

    pub async fn user_stats(&self) -> Result<UserStats, ApiError> {
        self.get_json("/api/user/stats", "Failed to fetch user stats").await
    }

    pub async fn lesson(&self, lesson_id: &str) -> Result<Lesson, ApiError> {
        self.get_json(&format!("/api/lessons/{lesson_id}"), "Failed to fetch lesson")
            .await
    }

    pub async fn all_lessons(&self) -> Result<Vec<Lesson>, ApiError> {
        let response: LessonsResponse = self
            .get_json("/api/lessons/all", "Failed to fetch lessons")
            .await?;
        Ok(response.lessons)
    }

    #[instrument(skip(self, report), fields(lesson_id = %report.lesson_id))]
    pub async fn post_progress(&self, report: &ProgressReport) -> Result<(), ApiError> {
        let path = "/api/progress";
        let request = self.http.post(self.url(path)).json(report);
        self.send(path, request, "Failed to save progress").await?;
        debug!("Progress stored");
        Ok(())
    }
}

#[async_trait]
impl ProgressSaver for ApiClient {
    async fn save_progress(&self, report: ProgressReport) -> Result<()> {
        Ok(self.post_progress(&report).await?)
    }
}
