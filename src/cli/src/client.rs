//! HTTP client for communicating with the reindex API server.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// API response wrapper matching the server's ApiResponse format.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[allow(dead_code)]
    pub error_code: Option<String>,
}

/// Error envelope the server returns for failed requests.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

/// A non-success response from the server.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{code} ({status}): {message}")]
    Rejected {
        status: StatusCode,
        code: String,
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("API error ({status}): {body}")]
    Unexpected { status: StatusCode, body: String },
}

impl ApiError {
    /// Stable error code, when the server sent one.
    #[allow(dead_code)]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => Some(code),
            Self::Unexpected { .. } => None,
        }
    }

    async fn from_response(resp: Response) -> Self {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => Self::Rejected {
                status,
                code: envelope.error.code,
                message: envelope.error.message,
                retry_after_secs: envelope
                    .error
                    .details
                    .as_ref()
                    .and_then(|d| d.get("retry_after_secs"))
                    .and_then(|v| v.as_u64()),
            },
            Err(_) => Self::Unexpected { status, body },
        }
    }
}

/// HTTP client for the reindex API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, label: &str) -> Result<Response> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("{} failed", label))?;

        if !resp.status().is_success() {
            return Err(ApiError::from_response(resp).await.into());
        }
        Ok(resp)
    }

    async fn unwrap_data<T: DeserializeOwned>(resp: Response, label: &str) -> Result<T> {
        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", label))?;

        if api_resp.success {
            api_resp
                .data
                .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
        } else {
            Err(anyhow::anyhow!(
                "API error: {}",
                api_resp.error.unwrap_or_else(|| "Unknown error".into())
            ))
        }
    }

    /// Perform a GET request and deserialize the response data.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let label = format!("GET {}", url);
        let resp = self.send(self.client.get(&url), &label).await?;
        Self::unwrap_data(resp, &label).await
    }

    /// Perform a GET request with query parameters.
    pub async fn get_with_query<Q: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T> {
        let url = self.url(path);
        let label = format!("GET {}", url);
        let resp = self.send(self.client.get(&url).query(query), &label).await?;
        Self::unwrap_data(resp, &label).await
    }

    /// Perform a POST request with a JSON body and deserialize the response.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        let label = format!("POST {}", url);
        let resp = self.send(self.client.post(&url).json(body), &label).await?;
        Self::unwrap_data(resp, &label).await
    }

    /// Perform a DELETE request that answers `204 No Content`.
    pub async fn delete<Q: Serialize>(&self, path: &str, query: &Q) -> Result<()> {
        let url = self.url(path);
        let label = format!("DELETE {}", url);
        self.send(self.client.delete(&url).query(query), &label).await?;
        Ok(())
    }

    /// Perform a GET request and return the body as text.
    /// GET a plain-text body together with one response header, if present.
    pub async fn get_text(&self, path: &str, header: &str) -> Result<(String, Option<String>)> {
        let url = self.url(path);
        let label = format!("GET {}", url);
        let resp = self.send(self.client.get(&url), &label).await?;
        let value = resp
            .headers()
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", url))?;
        Ok((body, value))
    }

    /// Perform a raw GET request and return the full JSON value (for health endpoint).
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let label = format!("GET {}", url);
        let resp = self.send(self.client.get(&url), &label).await?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}
