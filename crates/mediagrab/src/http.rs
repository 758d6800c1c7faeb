//! HTTP seam used by every network-facing component.
//!
//! Engine code never talks to `reqwest` directly; it goes through [`HttpClient`]
//! so tests can substitute an in-memory server.

use std::fmt;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderValue, RANGE};
use reqwest::{Method, Proxy, StatusCode};
use tracing::debug;

use crate::config::DownloadConfig;
use crate::error::DownloadError;

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::HEAD, url)
    }

    /// Request the inclusive byte range `start..=end`.
    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        if let Ok(value) = HeaderValue::from_str(&format!("bytes={start}-{end}")) {
            self.headers.insert(RANGE, value);
        }
        self
    }

    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Apply the headers, cookies and timeout of `config`.
    pub fn configured(self, config: &DownloadConfig) -> Self {
        let headers = config.request_headers();
        self.with_headers(&headers).with_timeout(config.timeout)
    }

    /// The `(start, end)` pair of a `Range` header set by [`HttpRequest::with_range`].
    pub fn range(&self) -> Option<(u64, u64)> {
        let value = self.headers.get(RANGE)?.to_str().ok()?;
        let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            headers,
            body: Box::pin(futures::stream::once(async move { Ok(body) })),
        }
    }

    /// Collect the whole body.
    pub async fn bytes(self) -> Result<Bytes, DownloadError> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Collect the body, failing with `SizeExceeded` once more than `limit` bytes arrive.
    pub async fn bytes_limited(self, limit: u64) -> Result<Bytes, DownloadError> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let size = (buf.len() + chunk.len()) as u64;
            if size > limit {
                return Err(DownloadError::SizeExceeded { size, limit });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Total resource size from a `Content-Range: bytes a-b/total` header.
    pub fn content_range_total(&self) -> Option<u64> {
        let value = self.headers.get(CONTENT_RANGE)?.to_str().ok()?;
        parse_content_range_total(value)
    }
}

pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, DownloadError>;
}

/// Execute `request` and map any non-2xx status to [`DownloadError::HttpStatus`].
pub async fn send_checked(
    client: &dyn HttpClient,
    request: HttpRequest,
    operation: &'static str,
) -> Result<HttpResponse, DownloadError> {
    let url = request.url.clone();
    let response = client.execute(request).await?;
    if !response.status.is_success() {
        return Err(DownloadError::http_status(response.status, url, operation));
    }
    Ok(response)
}

/// Production [`HttpClient`] backed by a caller-owned `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, DownloadError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(DownloadError::from);

        Ok(HttpResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Proxy configuration types
#[derive(Debug, Clone, PartialEq, Eq, Copy, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g. "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub fn build_proxy(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let proxy_url = &config.url;
    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(proxy_url),
        ProxyType::Https => Proxy::https(proxy_url),
        ProxyType::Socks5 => {
            if proxy_url.starts_with("socks5://") || proxy_url.starts_with("socks5h://") {
                Proxy::all(proxy_url)
            } else {
                Proxy::all(format!("socks5://{proxy_url}"))
            }
        }
    }
    .map_err(|e| DownloadError::Configuration {
        reason: format!("invalid proxy URL `{proxy_url}`: {e}"),
    })?;

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        proxy = proxy.basic_auth(username, password);
    }
    Ok(proxy)
}

/// Build the default `reqwest::Client` used by the CLI.
///
/// `proxy = None` keeps reqwest's system/env proxy detection.
pub fn build_client(
    proxy: Option<&ProxyConfig>,
    connect_timeout: Duration,
) -> Result<reqwest::Client, DownloadError> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(10)
        .default_headers(DownloadConfig::default_headers());

    if let Some(config) = proxy {
        builder = builder.proxy(build_proxy(config)?);
    }

    builder.build().map_err(|e| DownloadError::Configuration {
        reason: format!("failed to build HTTP client: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_round_trips() {
        let request = HttpRequest::get("https://example.com/a.mp4").with_range(10, 19);
        assert_eq!(request.headers[RANGE], "bytes=10-19");
        assert_eq!(request.range(), Some((10, 19)));
    }

    #[test]
    fn content_range_total_parsing() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-99/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[tokio::test]
    async fn send_checked_maps_status() {
        let mut client = MockHttpClient::new();
        client.expect_execute().returning(|_| {
            Ok(HttpResponse::from_bytes(
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::new(),
            ))
        });

        let err = send_checked(&client, HttpRequest::get("https://example.com/x"), "GET")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::HttpStatus { status: StatusCode::NOT_FOUND, .. }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn bytes_limited_rejects_overrun() {
        let response = HttpResponse::from_bytes(StatusCode::OK, HeaderMap::new(), vec![0u8; 32]);
        let err = response.bytes_limited(16).await.unwrap_err();
        assert!(matches!(err, DownloadError::SizeExceeded { limit: 16, .. }));
    }

    #[test]
    fn socks_scheme_is_added() {
        let config = ProxyConfig {
            url: "127.0.0.1:1080".to_string(),
            proxy_type: ProxyType::Socks5,
            username: None,
            password: None,
        };
        assert!(build_proxy(&config).is_ok());
    }
}
