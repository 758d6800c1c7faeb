//! External media toolkit used for lossless container work.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::download::remove_file_quietly;
use crate::error::DownloadError;

const STDERR_TAIL_LINES: usize = 12;

/// Tags written by [`MediaToolkit::embed_metadata`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    /// Image attached as cover art.
    pub cover: Option<PathBuf>,
}

/// Container operations. Implementations must never re-encode.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Rewrite the container at `path` in place.
    async fn remux(&self, path: &Path, token: &CancellationToken) -> Result<(), DownloadError>;

    /// Join `inputs` in order into `output`.
    async fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError>;

    /// Combine the video stream of `video` with the audio stream of `audio`.
    async fn mux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError>;

    /// Write tags (and cover art) into `path` in place.
    async fn embed_metadata(
        &self,
        path: &Path,
        metadata: &TrackMetadata,
        token: &CancellationToken,
    ) -> Result<(), DownloadError>;
}

/// [`MediaToolkit`] backed by the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    binary: PathBuf,
}

impl Default for FfmpegToolkit {
    fn default() -> Self {
        Self::new()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Sibling path used while rewriting `path` in place: `name.<tag>.ext`.
fn staging_path(path: &Path, tag: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{tag}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{tag}"),
    };
    path.with_file_name(name)
}

fn base_args() -> Vec<String> {
    vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-nostats".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ]
}

fn remux_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_string(), path_arg(input)]);
    args.extend(["-map".to_string(), "0".to_string()]);
    args.extend(["-c".to_string(), "copy".to_string()]);
    args.push(path_arg(output));
    args
}

fn mux_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_string(), path_arg(video)]);
    args.extend(["-i".to_string(), path_arg(audio)]);
    args.extend(["-map".to_string(), "0:v:0".to_string()]);
    args.extend(["-map".to_string(), "1:a:0".to_string()]);
    args.extend(["-c".to_string(), "copy".to_string()]);
    args.push(path_arg(output));
    args
}

fn metadata_args(input: &Path, metadata: &TrackMetadata, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".to_string(), path_arg(input)]);
    if let Some(cover) = &metadata.cover {
        args.extend(["-i".to_string(), path_arg(cover)]);
        args.extend(["-map".to_string(), "0:a".to_string()]);
        args.extend(["-map".to_string(), "1:v".to_string()]);
        args.extend(["-disposition:v:0".to_string(), "attached_pic".to_string()]);
    } else {
        args.extend(["-map".to_string(), "0".to_string()]);
    }
    args.extend(["-c".to_string(), "copy".to_string()]);
    if let Some(title) = &metadata.title {
        args.extend(["-metadata".to_string(), format!("title={title}")]);
    }
    if let Some(artist) = &metadata.artist {
        args.extend(["-metadata".to_string(), format!("artist={artist}")]);
    }
    args.push(path_arg(output));
    args
}

/// Append `inputs` byte for byte into a fresh `output`, in order.
///
/// Segment streams (MPEG-TS, or an fMP4 init segment followed by fragments)
/// are only valid as one continuous byte stream, so they are joined without
/// probing each piece.
pub async fn append_files(
    inputs: &[PathBuf],
    output: &Path,
    token: &CancellationToken,
) -> Result<u64, DownloadError> {
    let file = tokio::fs::File::create(output).await?;
    let mut writer = tokio::io::BufWriter::new(file);
    let mut written = 0u64;
    for input in inputs {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let mut reader = tokio::fs::File::open(input).await?;
        written += tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    Ok(written)
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

impl FfmpegToolkit {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>, token: &CancellationToken) -> Result<(), DownloadError> {
        debug!("FFmpeg args: {:?}", args);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadError::toolkit("ffmpeg", format!("failed to spawn: {e}")))?;

        let stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut output).await;
            }
            output
        });

        let status = tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                return Err(DownloadError::Cancelled);
            }
            status = child.wait() => status?,
        };

        let stderr = stderr_reader.await.unwrap_or_default();
        if !status.success() {
            return Err(DownloadError::toolkit(
                "ffmpeg",
                format!("exited with {status}: {}", stderr_tail(&stderr)),
            ));
        }
        Ok(())
    }

    /// Run `args` writing to `staging`, then move `staging` over `target`.
    async fn rewrite_in_place(
        &self,
        args: Vec<String>,
        staging: &Path,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let result = async {
            self.run(args, token).await?;
            tokio::fs::rename(staging, target).await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            remove_file_quietly(staging).await;
        }
        result
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn remux(&self, path: &Path, token: &CancellationToken) -> Result<(), DownloadError> {
        let staging = staging_path(path, "remux");
        self.rewrite_in_place(remux_args(path, &staging), &staging, path, token)
            .await
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if inputs.is_empty() {
            return Err(DownloadError::invalid_input("nothing to concatenate"));
        }
        match append_files(inputs, output, token).await {
            Ok(written) => {
                debug!(inputs = inputs.len(), bytes = written, output = %output.display(), "Joined segments");
                Ok(())
            }
            Err(err) => {
                remove_file_quietly(output).await;
                Err(err)
            }
        }
    }

    async fn mux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if output == video {
            let staging = staging_path(video, "mux");
            return self
                .rewrite_in_place(mux_args(video, audio, &staging), &staging, video, token)
                .await;
        }
        let result = self.run(mux_args(video, audio, output), token).await;
        if result.is_err() {
            remove_file_quietly(output).await;
        }
        result
    }

    async fn embed_metadata(
        &self,
        path: &Path,
        metadata: &TrackMetadata,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let staging = staging_path(path, "tagged");
        self.rewrite_in_place(metadata_args(path, metadata, &staging), &staging, path, token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_keeps_extension() {
        assert_eq!(
            staging_path(Path::new("/tmp/out/a_v1.mp4"), "remux"),
            Path::new("/tmp/out/a_v1.remux.mp4")
        );
        assert_eq!(
            staging_path(Path::new("plain"), "mux"),
            Path::new("plain.mux")
        );
    }

    #[tokio::test]
    async fn concat_joins_init_and_fragments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let init = dir.path().join("seg_00000");
        let first = dir.path().join("seg_00001");
        let second = dir.path().join("seg_00002");
        std::fs::write(&init, b"ftypmoov").unwrap();
        std::fs::write(&first, b"moof1mdat1").unwrap();
        std::fs::write(&second, b"moof2mdat2").unwrap();
        let output = dir.path().join("joined.mp4");

        // The binary is never spawned for a join.
        let toolkit = FfmpegToolkit::with_binary("/nonexistent/ffmpeg-binary");
        toolkit
            .concat(&[init, first, second], &output, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"ftypmoovmoof1mdat1moof2mdat2");
    }

    #[tokio::test]
    async fn failed_concat_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("seg_00000");
        std::fs::write(&present, b"data").unwrap();
        let output = dir.path().join("joined.ts");

        let err = FfmpegToolkit::new()
            .concat(
                &[present, dir.path().join("seg_00001")],
                &output,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Io);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn cancelled_concat_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("seg_00000");
        std::fs::write(&segment, b"data").unwrap();
        let output = dir.path().join("joined.ts");
        let token = CancellationToken::new();
        token.cancel();

        let err = FfmpegToolkit::new()
            .concat(&[segment], &output, &token)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!output.exists());
    }

    #[test]
    fn arguments_never_reencode() {
        let remux = remux_args(Path::new("in.ts"), Path::new("out.ts"));
        assert!(remux.windows(2).any(|w| w == ["-c", "copy"]));
        assert_eq!(remux.last().map(String::as_str), Some("out.ts"));

        let mux = mux_args(Path::new("v.mp4"), Path::new("a.m4a"), Path::new("o.mp4"));
        assert!(mux.windows(2).any(|w| w == ["-map", "1:a:0"]));

        let tags = metadata_args(
            Path::new("a.m4a"),
            &TrackMetadata {
                title: Some("Song".into()),
                artist: Some("Band".into()),
                cover: Some(PathBuf::from("cover.jpg")),
            },
            Path::new("a.tagged.m4a"),
        );
        assert!(tags.contains(&"title=Song".to_string()));
        assert!(tags.contains(&"attached_pic".to_string()));
        assert!(tags.windows(2).any(|w| w == ["-c", "copy"]));
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(&stderr);
        assert!(tail.starts_with("line 18"));
        assert!(tail.ends_with("line 29"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_toolkit_error() {
        let toolkit = FfmpegToolkit::with_binary("/nonexistent/ffmpeg-binary");
        let err = toolkit
            .remux(Path::new("/tmp/none.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Toolkit);
    }
}
