use reqwest::StatusCode;

/// Coarse error category preserved through every layer.
///
/// Callers branch on this instead of inspecting error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection failures, 5xx, throttling, timeouts. Retried.
    TransientNetwork,
    /// 4xx, malformed manifests, bad URLs. Never retried.
    PermanentRequest,
    /// Declared or observed size is over the configured cap.
    SizeExceeded,
    /// Bad padding, truncated ciphertext, missing segment files.
    CorruptSegment,
    /// No usable format survived manifest parsing.
    PartialManifest,
    /// Explicit cancellation or deadline expiry.
    Cancelled,
    /// The external media toolkit failed.
    Toolkit,
    /// A post-processing plugin failed.
    Plugin,
    /// Caller supplied invalid arguments.
    InvalidInput,
    /// Local filesystem failure.
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("deadline of {seconds:.1}s exceeded")]
    DeadlineExceeded { seconds: f64 },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network { source: reqwest::Error },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("no usable format in manifest ({failures} failed): {reason}")]
    PartialManifest { failures: usize, reason: String },

    #[error("size {size} bytes exceeds the limit of {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("corrupt segment: {reason}")]
    CorruptSegment { reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("{tool} failed: {reason}")]
    Toolkit { tool: &'static str, reason: String },

    #[error("plugin `{plugin}` failed: {reason}")]
    Plugin { plugin: &'static str, reason: String },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl From<reqwest::Error> for DownloadError {
    fn from(source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                reason: source.to_string(),
            }
        } else {
            Self::Network { source }
        }
    }
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptSegment {
            reason: reason.into(),
        }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn toolkit(tool: &'static str, reason: impl Into<String>) -> Self {
        Self::Toolkit {
            tool,
            reason: reason.into(),
        }
    }

    pub fn plugin(plugin: &'static str, reason: impl ToString) -> Self {
        Self::Plugin {
            plugin,
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled | Self::DeadlineExceeded { .. } => ErrorKind::Cancelled,
            Self::Network { source } => {
                if source.is_builder() || source.is_redirect() {
                    ErrorKind::PermanentRequest
                } else {
                    ErrorKind::TransientNetwork
                }
            }
            Self::Transport { .. } | Self::Timeout { .. } => ErrorKind::TransientNetwork,
            Self::HttpStatus { status, .. } => {
                if status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::PermanentRequest
                }
            }
            Self::InvalidUrl { .. } | Self::Manifest { .. } => ErrorKind::PermanentRequest,
            Self::PartialManifest { .. } => ErrorKind::PartialManifest,
            Self::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            Self::CorruptSegment { .. } | Self::Decryption { .. } => ErrorKind::CorruptSegment,
            Self::Toolkit { .. } => ErrorKind::Toolkit,
            Self::Plugin { .. } => ErrorKind::Plugin,
            Self::InvalidInput { .. } | Self::Configuration { .. } => ErrorKind::InvalidInput,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
