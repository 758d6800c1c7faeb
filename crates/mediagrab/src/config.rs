use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use media_types::DecryptionKey;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_IN_MEMORY: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Receives the cumulative completed fraction in `0.0..=1.0`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Policy for one acquisition call.
///
/// Zero or empty fields mean "use the default"; call [`DownloadConfig::with_defaults`]
/// (the engine does it on entry) to fill them in. `retry_attempts` is the
/// exception: it starts at [`DEFAULT_RETRY_ATTEMPTS`] and zero means no retries.
#[derive(Clone)]
pub struct DownloadConfig {
    /// Byte size of one ranged request in the chunked path.
    pub chunk_size: u64,
    /// Upper bound on parallel chunk, segment and item tasks.
    pub concurrency: usize,
    /// Timeout for each individual HTTP request.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Cap for the doubling retry delay. Equal to `retry_delay` gives a fixed delay.
    pub retry_max_delay: Duration,
    /// Run a container fix-up pass after a chunked download.
    pub remux: bool,
    /// Resources at or below this size are buffered in memory instead of chunked.
    pub max_in_memory: u64,
    /// Hard cap on the size of any produced file.
    pub max_file_size: u64,
    /// Extra headers, merged over [`DownloadConfig::default_headers`].
    pub headers: HeaderMap,
    /// `(name, value)` cookie pairs sent as one `Cookie` header.
    pub cookies: Vec<(String, String)>,
    /// Overrides the key carried by a format.
    pub decryption_key: Option<DecryptionKey>,
    pub progress: Option<ProgressCallback>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            concurrency: 0,
            timeout: Duration::ZERO,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::ZERO,
            retry_max_delay: Duration::ZERO,
            remux: false,
            max_in_memory: 0,
            max_file_size: 0,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            decryption_key: None,
            progress: None,
        }
    }
}

impl fmt::Debug for DownloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadConfig")
            .field("chunk_size", &self.chunk_size)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("remux", &self.remux)
            .field("max_in_memory", &self.max_in_memory)
            .field("max_file_size", &self.max_file_size)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies.len())
            .field("decryption_key", &self.decryption_key.as_ref().map(|k| k.method))
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl DownloadConfig {
    pub fn builder() -> DownloadConfigBuilder {
        DownloadConfigBuilder::new()
    }

    /// Fill every unset field from the defaults.
    ///
    /// `retry_attempts` is taken as given: zero retries is a valid policy.
    pub fn with_defaults(mut self) -> Self {
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = DEFAULT_RETRY_DELAY;
        }
        if self.retry_max_delay < self.retry_delay {
            self.retry_max_delay = self.retry_delay;
        }
        if self.max_in_memory == 0 {
            self.max_in_memory = DEFAULT_MAX_IN_MEMORY;
        }
        if self.max_file_size == 0 {
            self.max_file_size = DEFAULT_MAX_FILE_SIZE;
        }

        let mut headers = Self::default_headers();
        // Custom headers take precedence over defaults for the same fields
        for (name, value) in self.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        self.headers = headers;
        self
    }

    pub fn default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_USER_AGENT),
        );

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        default_headers
    }

    /// Headers to attach to every request, including the rendered `Cookie`.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.insert(reqwest::header::COOKIE, value);
            }
        }
        headers
    }

    pub(crate) fn report_progress(&self, fraction: f64) {
        if let Some(progress) = &self.progress {
            progress(fraction.clamp(0.0, 1.0));
        }
    }
}

/// Builder for [`DownloadConfig`].
#[derive(Debug, Default)]
pub struct DownloadConfigBuilder {
    config: DownloadConfig,
}

impl DownloadConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.config.chunk_size = bytes;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry_max_delay = delay;
        self
    }

    pub fn remux(mut self, remux: bool) -> Self {
        self.config.remux = remux;
        self
    }

    pub fn max_in_memory(mut self, bytes: u64) -> Self {
        self.config.max_in_memory = bytes;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.max_file_size = bytes;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.insert(name, value);
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.cookies.push((name.into(), value.into()));
        self
    }

    pub fn decryption_key(mut self, key: DecryptionKey) -> Self {
        self.config.decryption_key = Some(key);
        self
    }

    pub fn progress(mut self, callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.config.progress = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> DownloadConfig {
        self.config.with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fields_are_filled_from_defaults() {
        let config = DownloadConfig {
            chunk_size: 0,
            concurrency: 8,
            ..Default::default()
        }
        .with_defaults();

        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.retry_max_delay, config.retry_delay);
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert!(config.headers.contains_key(reqwest::header::USER_AGENT));
    }

    #[test]
    fn default_config_keeps_retries() {
        let config = DownloadConfig::default().with_defaults();
        assert_eq!(config.retry_attempts, DEFAULT_RETRY_ATTEMPTS);

        let literal = DownloadConfig {
            concurrency: 2,
            ..Default::default()
        }
        .with_defaults();
        assert_eq!(literal.retry_attempts, DEFAULT_RETRY_ATTEMPTS);

        let disabled = DownloadConfig::builder().retry_attempts(0).build();
        assert_eq!(disabled.retry_attempts, 0);
    }

    #[test]
    fn custom_headers_override_defaults() {
        let config = DownloadConfig::builder()
            .header(
                reqwest::header::USER_AGENT,
                HeaderValue::from_static("mediagrab-test"),
            )
            .build();
        assert_eq!(config.headers[reqwest::header::USER_AGENT], "mediagrab-test");
        assert_eq!(config.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
    }

    #[test]
    fn cookies_render_as_one_header() {
        let config = DownloadConfig::builder()
            .cookie("sid", "abc")
            .cookie("lang", "en")
            .build();
        let headers = config.request_headers();
        assert_eq!(headers[reqwest::header::COOKIE], "sid=abc; lang=en");
    }

    #[test]
    fn progress_is_clamped() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let config = DownloadConfig::builder()
            .progress(move |p| sink.lock().unwrap().push(p))
            .build();
        config.report_progress(1.5);
        config.report_progress(0.25);
        assert_eq!(*seen.lock().unwrap(), vec![1.0, 0.25]);
    }
}
