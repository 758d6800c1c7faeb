use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mediagrab_engine::{DownloadConfig, ProxyConfig, ProxyType};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::DownloadArgs;
use crate::error::{AppError, Result};

/// Settings read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub chunk_size: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub remux: bool,
    pub max_in_memory: Option<u64>,
    pub max_file_size: Option<u64>,
    /// Path of the `ffmpeg` binary.
    pub ffmpeg: Option<PathBuf>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub proxy: Option<String>,
    pub proxy_type: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mediagrab").join("config.toml"))
    }

    /// Load `path`, or the default location when `path` is `None`.
    ///
    /// An explicit path must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                return Err(AppError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&contents)
            .map_err(|e| AppError::Config(format!("invalid config {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply command-line overrides on top of the file values.
    pub fn apply_args(&mut self, args: &DownloadArgs) -> Result<()> {
        if let Some(concurrency) = args.concurrency {
            self.concurrency = Some(concurrency);
        }
        if let Some(chunk_size) = args.chunk_size {
            self.chunk_size = Some(chunk_size);
        }
        if let Some(retries) = args.retries {
            self.retry_attempts = Some(retries);
        }
        if let Some(timeout) = args.timeout {
            self.timeout_secs = Some(timeout);
        }
        if args.remux {
            self.remux = true;
        }
        if let Some(dir) = &args.output_dir {
            self.output_dir = Some(dir.clone());
        }
        for header in &args.headers {
            let (name, value) = header.split_once(':').ok_or_else(|| {
                AppError::InvalidInput(format!("invalid header `{header}`, expected `Name: Value`"))
            })?;
            self.headers
                .insert(name.trim().to_string(), value.trim().to_string());
        }
        for cookie in &args.cookies {
            let (name, value) = cookie.split_once('=').ok_or_else(|| {
                AppError::InvalidInput(format!("invalid cookie `{cookie}`, expected `name=value`"))
            })?;
            self.cookies
                .insert(name.trim().to_string(), value.trim().to_string());
        }
        if let Some(proxy) = &args.proxy {
            self.proxy = Some(proxy.clone());
            self.proxy_type = Some(proxy_type_name(args.proxy_type).to_string());
        }
        if args.proxy_username.is_some() {
            self.proxy_username = args.proxy_username.clone();
        }
        if args.proxy_password.is_some() {
            self.proxy_password = args.proxy_password.clone();
        }
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Engine policy; unset values fall back to the engine defaults.
    pub fn download_config(&self) -> Result<DownloadConfig> {
        let mut builder = DownloadConfig::builder().remux(self.remux);
        if let Some(concurrency) = self.concurrency {
            builder = builder.concurrency(concurrency);
        }
        if let Some(chunk_size) = self.chunk_size {
            builder = builder.chunk_size(chunk_size);
        }
        if let Some(attempts) = self.retry_attempts {
            builder = builder.retry_attempts(attempts);
        }
        if let Some(delay) = self.retry_delay_ms {
            builder = builder.retry_delay(Duration::from_millis(delay));
        }
        if let Some(timeout) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        if let Some(limit) = self.max_in_memory {
            builder = builder.max_in_memory(limit);
        }
        if let Some(limit) = self.max_file_size {
            builder = builder.max_file_size(limit);
        }
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AppError::InvalidInput(format!("invalid header name `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AppError::InvalidInput(format!("invalid header value `{value}`: {e}")))?;
            builder = builder.header(name, value);
        }
        for (name, value) in &self.cookies {
            builder = builder.cookie(name, value);
        }
        Ok(builder.build())
    }

    pub fn proxy_config(&self) -> Result<Option<ProxyConfig>> {
        let Some(url) = &self.proxy else {
            return Ok(None);
        };
        let proxy_type = match self.proxy_type.as_deref().unwrap_or("http") {
            "http" => ProxyType::Http,
            "https" => ProxyType::Https,
            "socks5" => ProxyType::Socks5,
            other => {
                return Err(AppError::Config(format!("unknown proxy type `{other}`")));
            }
        };
        Ok(Some(ProxyConfig {
            url: url.clone(),
            proxy_type,
            username: self.proxy_username.clone(),
            password: self.proxy_password.clone(),
        }))
    }
}

fn proxy_type_name(proxy_type: ProxyType) -> &'static str {
    match proxy_type {
        ProxyType::Http => "http",
        ProxyType::Https => "https",
        ProxyType::Socks5 => "socks5",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let config = AppConfig::from_toml(
            r#"
            concurrency = 8
            output_dir = "/srv/media"

            [headers]
            Referer = "https://example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.concurrency, Some(8));
        assert_eq!(config.output_dir(), PathBuf::from("/srv/media"));
        assert_eq!(config.chunk_size, None);
        assert!(!config.remux);
    }

    #[test]
    fn arguments_override_file() {
        let mut config = AppConfig::from_toml("concurrency = 2\nretry_attempts = 5").unwrap();
        let args = DownloadArgs {
            concurrency: Some(6),
            headers: vec!["X-Token: abc".to_string()],
            cookies: vec!["session=42".to_string()],
            ..DownloadArgs::default()
        };
        config.apply_args(&args).unwrap();

        let download = config.download_config().unwrap();
        assert_eq!(download.concurrency, 6);
        assert_eq!(download.retry_attempts, 5);
        assert_eq!(download.headers["x-token"], "abc");
        assert_eq!(download.request_headers()["cookie"], "session=42");
    }

    #[test]
    fn malformed_header_is_rejected() {
        let args = DownloadArgs {
            headers: vec!["no-colon".to_string()],
            ..DownloadArgs::default()
        };
        assert!(AppConfig::default().apply_args(&args).is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).is_err());

        let present = dir.path().join("config.toml");
        std::fs::write(&present, "remux = true").unwrap();
        assert!(AppConfig::load(Some(&present)).unwrap().remux);
    }

    #[test]
    fn proxy_from_file() {
        let config = AppConfig::from_toml("proxy = \"127.0.0.1:1080\"\nproxy_type = \"socks5\"").unwrap();
        let proxy = config.proxy_config().unwrap().unwrap();
        assert_eq!(proxy.proxy_type, ProxyType::Socks5);
    }
}
