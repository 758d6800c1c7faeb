//! Downloaders: ranged parallel fetches of single resources and concurrent
//! segment fetches with reassembly.

pub mod chunked;
pub mod ranges;
pub mod segmented;

use std::path::Path;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DownloadError;
use crate::http::HttpResponse;

pub use chunked::ChunkedDownloader;
pub use ranges::{ByteRange, effective_concurrency, plan_chunks};
pub use segmented::SegmentedDownloader;

/// Stream a response body into a fresh file at `path`.
///
/// Fails with `SizeExceeded` as soon as more than `limit` bytes arrive.
pub(crate) async fn stream_to_file(
    response: HttpResponse,
    path: &Path,
    limit: u64,
    token: &CancellationToken,
) -> Result<u64, DownloadError> {
    let file = tokio::fs::File::create(path).await?;
    let mut writer = tokio::io::BufWriter::new(file);
    let mut body = response.body;
    let mut written = 0u64;

    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(DownloadError::SizeExceeded {
                size: written,
                limit,
            });
        }
        writer.write_all(&chunk).await?;
    }

    writer.flush().await?;
    Ok(written)
}

/// Remove a file, ignoring "not found" and logging anything else.
pub(crate) async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
