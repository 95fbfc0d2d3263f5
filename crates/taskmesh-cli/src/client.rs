//! HTTP client for the control plane's REST endpoints.

use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use taskmesh_core::api::{ErrorResponse, RejectionResponse};

/// Errors that can occur when talking to the control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport or decoding failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Admission turned the submission away.
    #[error("rejected ({}): {}", .0.code, .0.message)]
    Rejected(RejectionResponse),

    /// Any other non-success status.
    #[error("HTTP {status}: {message}")]
    Status { status: StatusCode, message: String },
}

pub struct HttpClient {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        self.send(Method::POST, path, body).await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.inner.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        if let Ok(rejection) = serde_json::from_str::<RejectionResponse>(&text) {
            return Err(ClientError::Rejected(rejection));
        }
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.error)
            .unwrap_or(text);
        Err(ClientError::Status { status, message })
    }
}
