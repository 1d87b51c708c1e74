//! Remote retrieval of script dependencies.
//!
//! Dependencies are plain GETs. A failure carries the URL and, when the server
//! answered, the HTTP status so it can be shown as `HTTP404 <url>`.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::FetchConfig;

/// Failure to retrieve one dependency
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}", self.describe())]
pub struct FetchError {
    pub url: String,
    pub status: Option<u16>,
    pub message: String,
}

impl FetchError {
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status: Some(status),
            message: String::new(),
        }
    }

    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: None,
            message: message.into(),
        }
    }

    fn describe(&self) -> String {
        match self.status {
            Some(status) => format!("HTTP{} {}", status, self.url),
            None if self.message.is_empty() => self.url.clone(),
            None => format!("{} {}", self.message, self.url),
        }
    }
}

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
    pub timeout_ms: Option<u64>,
}

impl FetchOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A successful (2xx) or not-modified (304) response
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl FetchResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn not_modified(&self) -> bool {
        self.status == 304
    }
}

/// Content check applied before a fetched blob is stored
pub type Validator = fn(url: &str, body: &[u8], content_type: Option<&str>) -> Result<(), FetchError>;

/// Retrieves dependency blobs from remote hosts
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Fetch `url`. Non-success statuses other than 304 are errors.
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError>;
}

/// `RemoteFetcher` over a shared reqwest client
pub struct HttpFetcher {
    client: reqwest::Client,
    default_timeout: Duration,
    max_blob_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            default_timeout: Duration::from_millis(config.timeout_ms),
            max_blob_bytes: config.max_blob_bytes,
        })
    }
}

fn header(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Declared lengths that do not fit in `usize` count as too large
fn exceeds(len: u64, max: usize) -> bool {
    usize::try_from(len).map_or(true, |l| l > max)
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        debug!("Fetching dependency {}", url);
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::network(url, e.to_string()))?;

        let status = response.status().as_u16();
        if status == 304 {
            return Ok(FetchResponse {
                status,
                ..Default::default()
            });
        }
        if !response.status().is_success() {
            return Err(FetchError::status(url, status));
        }
        if response
            .content_length()
            .is_some_and(|len| exceeds(len, self.max_blob_bytes))
        {
            return Err(FetchError::network(url, "response too large"));
        }

        let content_type = header(&response, reqwest::header::CONTENT_TYPE);
        let etag = header(&response, reqwest::header::ETAG);
        let last_modified = header(&response, reqwest::header::LAST_MODIFIED);
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::network(url, e.to_string()))?;
        if body.len() > self.max_blob_bytes {
            return Err(FetchError::network(url, "response too large"));
        }

        Ok(FetchResponse {
            status,
            body: body.to_vec(),
            content_type,
            etag,
            last_modified,
        })
    }
}

const IMAGE_SIGNATURES: &[&[u8]] = &[
    b"\x89PNG\r\n\x1a\n",
    b"\xff\xd8\xff",
    b"GIF87a",
    b"GIF89a",
    b"\x00\x00\x01\x00",
    b"BM",
];

/// Accept only bodies that look like an image
pub fn validate_image(url: &str, body: &[u8], content_type: Option<&str>) -> Result<(), FetchError> {
    if content_type.is_some_and(|t| t.starts_with("image/")) {
        return Ok(());
    }
    let is_webp = body.len() >= 12 && &body[..4] == b"RIFF" && &body[8..12] == b"WEBP";
    let head = String::from_utf8_lossy(&body[..body.len().min(256)]);
    let is_svg = head.contains("<svg");
    if is_webp || is_svg || IMAGE_SIGNATURES.iter().any(|sig| body.starts_with(sig)) {
        Ok(())
    } else {
        Err(FetchError::network(url, "IMAGE_ERROR:"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        assert_eq!(
            FetchError::status("https://a.test/x.js", 404).to_string(),
            "HTTP404 https://a.test/x.js"
        );
        assert_eq!(
            FetchError::network("https://a.test/x.js", "connection refused").to_string(),
            "connection refused https://a.test/x.js"
        );
    }

    #[test]
    fn test_declared_length_limit() {
        assert!(!exceeds(10, 10));
        assert!(exceeds(11, 10));
        assert!(exceeds(u64::MAX, usize::MAX - 1));
        assert!(!exceeds(0, 0));
    }

    #[test]
    fn test_validate_image() {
        assert!(validate_image("u", b"anything", Some("image/png")).is_ok());
        assert!(validate_image("u", b"\x89PNG\r\n\x1a\nrest", None).is_ok());
        assert!(validate_image("u", b"<svg xmlns='x'></svg>", Some("text/xml")).is_ok());
        let err = validate_image("https://a.test/i", b"<html>", Some("text/html")).unwrap_err();
        assert_eq!(err.to_string(), "IMAGE_ERROR: https://a.test/i");
    }
}
