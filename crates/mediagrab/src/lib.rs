//! Media acquisition engine.
//!
//! Parses HLS and DASH manifests into [`MediaFormat`]s, picks defaults,
//! downloads single resources in parallel byte ranges or segmented streams
//! with AES-128 decryption, and reassembles them losslessly through an
//! external [`MediaToolkit`].

pub mod acquire;
pub mod config;
pub mod decrypt;
pub mod download;
pub mod error;
pub mod http;
pub mod manifest;
pub mod plugins;
pub mod resolver;
pub mod retry;
pub mod toolkit;

pub use acquire::{AcquireRequest, Acquirer, DownloadedMedia, download_format, output_path};
pub use config::{DownloadConfig, DownloadConfigBuilder, ProgressCallback};
pub use decrypt::SegmentDecryptor;
pub use download::{ChunkedDownloader, SegmentedDownloader};
pub use error::{DownloadError, ErrorKind};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, ProxyConfig, ProxyType, ReqwestClient, build_client,
    install_rustls_provider, send_checked,
};
pub use manifest::{ManifestContext, ManifestKind, fetch_manifest, parse_manifest};
pub use plugins::{MergeAudioPlugin, MetadataPlugin, PluginContext, PostProcessor};
pub use resolver::{default_audio, default_photo, default_video, ranked_formats, resolve_default};
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
pub use toolkit::{FfmpegToolkit, MediaToolkit, TrackMetadata};

pub use media_types::{
    AudioCodec, DecryptionKey, KeyMethod, MediaFormat, MediaItem, MediaType, Resolution,
    VideoCodec,
};
