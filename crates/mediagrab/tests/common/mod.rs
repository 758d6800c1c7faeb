//! In-memory HTTP server and toolkit shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mediagrab_engine::http::{HttpClient, HttpRequest, HttpResponse};
use mediagrab_engine::toolkit::{MediaToolkit, TrackMetadata};
use mediagrab_engine::DownloadError;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

/// One URL served by [`RouteClient`].
#[derive(Debug, Clone)]
pub struct Route {
    pub body: Bytes,
    pub status: StatusCode,
    /// Answer HEAD with a `Content-Length`.
    pub head: bool,
    /// Number of leading requests answered with 503.
    pub transient_failures: usize,
    /// Ranged requests starting here fail with 404.
    pub fail_range_start: Option<u64>,
    /// Delay applied before answering.
    pub delay: Option<Duration>,
    /// Extra delay for ranged requests that are not the failing one.
    pub range_delay: Option<Duration>,
}

impl Route {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            status: StatusCode::OK,
            head: true,
            transient_failures: 0,
            fail_range_start: None,
            delay: None,
            range_delay: None,
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            ..Self::ok(Bytes::new())
        }
    }

    pub fn without_head(mut self) -> Self {
        self.head = false;
        self
    }

    pub fn with_transient_failures(mut self, count: usize) -> Self {
        self.transient_failures = count;
        self
    }

    pub fn failing_range_at(mut self, start: u64) -> Self {
        self.fail_range_start = Some(start);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stall every ranged request except the one at `fail_range_start`.
    pub fn with_range_delay(mut self, delay: Duration) -> Self {
        self.range_delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub range: Option<(u64, u64)>,
}

/// Route table keyed by exact URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct RouteClient {
    routes: Mutex<HashMap<String, Route>>,
    served: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl RouteClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, route: Route) -> Self {
        self.routes.lock().unwrap().insert(url.to_string(), route);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }

    fn respond(&self, request: &HttpRequest) -> HttpResponse {
        let Some(route) = self.routes.lock().unwrap().get(&request.url).cloned() else {
            return HttpResponse::from_bytes(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
        };

        let attempt = {
            let mut served = self.served.lock().unwrap();
            let count = served.entry(request.url.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if attempt <= route.transient_failures {
            return HttpResponse::from_bytes(
                StatusCode::SERVICE_UNAVAILABLE,
                HeaderMap::new(),
                Bytes::new(),
            );
        }
        if !route.status.is_success() {
            return HttpResponse::from_bytes(route.status, HeaderMap::new(), Bytes::new());
        }

        let total = route.body.len() as u64;
        if request.method == Method::HEAD {
            if !route.head {
                return HttpResponse::from_bytes(
                    StatusCode::METHOD_NOT_ALLOWED,
                    HeaderMap::new(),
                    Bytes::new(),
                );
            }
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
            return HttpResponse::from_bytes(StatusCode::OK, headers, Bytes::new());
        }

        if let Some((start, end)) = request.range() {
            if route.fail_range_start == Some(start) || start >= total {
                return HttpResponse::from_bytes(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
            }
            let end = end.min(total - 1);
            let mut headers = HeaderMap::new();
            let range = format!("bytes {start}-{end}/{total}");
            headers.insert(CONTENT_RANGE, HeaderValue::from_str(&range).unwrap());
            let body = route.body.slice(start as usize..=end as usize);
            return HttpResponse::from_bytes(StatusCode::PARTIAL_CONTENT, headers, body);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
        HttpResponse::from_bytes(StatusCode::OK, headers, route.body.clone())
    }
}

#[async_trait]
impl HttpClient for RouteClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, DownloadError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            range: request.range(),
        });
        let route = self.routes.lock().unwrap().get(&request.url).cloned();
        let delay = route.and_then(|r| match request.range() {
            Some((start, _)) if r.fail_range_start != Some(start) => r.range_delay.or(r.delay),
            _ => r.delay,
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.respond(&request))
    }
}

/// Toolkit that joins files byte for byte and records every call.
#[derive(Default)]
pub struct ConcatToolkit {
    pub remuxes: AtomicUsize,
    pub muxes: Mutex<Vec<(PathBuf, PathBuf, PathBuf)>>,
    pub tags: Mutex<Vec<TrackMetadata>>,
    pub fail_concat: bool,
}

impl ConcatToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_concat() -> Self {
        Self {
            fail_concat: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaToolkit for ConcatToolkit {
    async fn remux(&self, _path: &Path, _token: &CancellationToken) -> Result<(), DownloadError> {
        self.remuxes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        _token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if self.fail_concat {
            return Err(DownloadError::toolkit("concat", "forced failure"));
        }
        let mut joined = Vec::new();
        for input in inputs {
            joined.extend(tokio::fs::read(input).await?);
        }
        tokio::fs::write(output, joined).await?;
        Ok(())
    }

    async fn mux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        _token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut joined = tokio::fs::read(video).await?;
        joined.extend(tokio::fs::read(audio).await?);
        tokio::fs::write(output, joined).await?;
        self.muxes.lock().unwrap().push((
            video.to_path_buf(),
            audio.to_path_buf(),
            output.to_path_buf(),
        ));
        Ok(())
    }

    async fn embed_metadata(
        &self,
        _path: &Path,
        metadata: &TrackMetadata,
        _token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        self.tags.lock().unwrap().push(metadata.clone());
        Ok(())
    }
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Names of the entries in `dir`.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
