mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ConcatToolkit, Route, RouteClient, dir_entries, payload};
use mediagrab_engine::{
    AcquireRequest, Acquirer, AudioCodec, DownloadConfig, ErrorKind, MediaFormat, MediaItem,
    MediaType, MergeAudioPlugin, MetadataPlugin, VideoCodec,
};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

fn config() -> DownloadConfig {
    DownloadConfig::builder()
        .concurrency(2)
        .retry_attempts(0)
        .retry_delay(Duration::from_millis(5))
        .build()
}

fn direct_item(id: &str, url: &str) -> MediaItem {
    let mut item = MediaItem::new(id, format!("https://example.com/{id}"));
    item.push_format(
        MediaFormat::new("direct", MediaType::Video)
            .with_codecs(Some(VideoCodec::Avc), Some(AudioCodec::Aac))
            .with_url(url),
    );
    item
}

#[tokio::test]
async fn batch_results_keep_input_order_and_isolate_failures() {
    let client = RouteClient::new()
        .route(
            "https://cdn.example.com/a.mp4",
            Route::ok(payload(300)).with_delay(Duration::from_millis(60)),
        )
        .route("https://cdn.example.com/b.mp4", Route::status(StatusCode::FORBIDDEN))
        .route("https://cdn.example.com/c.mp4", Route::ok(payload(200)));
    let dir = tempfile::tempdir().unwrap();
    let acquirer = Acquirer::new(Arc::new(client), Arc::new(ConcatToolkit::new()), dir.path());

    let requests = ["a", "b", "c"]
        .iter()
        .map(|id| {
            let item = direct_item(id, &format!("https://cdn.example.com/{id}.mp4"));
            AcquireRequest::default_format(item).unwrap()
        })
        .collect();

    let results = acquirer
        .acquire_all(requests, &config(), &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 3);
    let first = results[0].as_ref().unwrap();
    assert_eq!(first.index, 0);
    assert_eq!(first.path, dir.path().join("a_direct.mp4"));
    assert_eq!(std::fs::read(&first.path).unwrap(), payload(300));

    assert_eq!(
        results[1].as_ref().unwrap_err().kind(),
        ErrorKind::PermanentRequest
    );

    let third = results[2].as_ref().unwrap();
    assert_eq!(third.index, 2);
    assert_eq!(
        dir_entries(dir.path()),
        vec!["a_direct.mp4".to_string(), "c_direct.mp4".to_string()]
    );
}

#[tokio::test]
async fn deadline_cancels_and_cleans_up() {
    let client = RouteClient::new().route(
        "https://cdn.example.com/slow.mp4",
        Route::ok(payload(1_000)).with_delay(Duration::from_millis(500)),
    );
    let dir = tempfile::tempdir().unwrap();
    let acquirer = Acquirer::new(Arc::new(client), Arc::new(ConcatToolkit::new()), dir.path());
    let request =
        AcquireRequest::default_format(direct_item("slow", "https://cdn.example.com/slow.mp4"))
            .unwrap();

    let err = acquirer
        .acquire_with_deadline(
            request,
            &config(),
            &CancellationToken::new(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(matches!(
        err,
        mediagrab_engine::DownloadError::DeadlineExceeded { .. }
    ));
    assert!(dir_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn video_only_default_gets_audio_merged() {
    let client = RouteClient::new()
        .route("https://cdn.example.com/v.mp4", Route::ok(payload(400)))
        .route("https://cdn.example.com/a.m4a", Route::ok(vec![7u8; 100]));
    let toolkit = Arc::new(ConcatToolkit::new());
    let dir = tempfile::tempdir().unwrap();
    let acquirer = Acquirer::new(Arc::new(client), toolkit.clone(), dir.path())
        .with_plugin(MergeAudioPlugin)
        .with_plugin(MetadataPlugin);

    let mut item = MediaItem::new("clip", "https://example.com/clip");
    item.push_format(
        MediaFormat::new("v", MediaType::Video)
            .with_codecs(Some(VideoCodec::Avc), None)
            .with_bitrate(2_000_000)
            .with_url("https://cdn.example.com/v.mp4"),
    );
    item.push_format(
        MediaFormat::new("a", MediaType::Audio)
            .with_codecs(None, Some(AudioCodec::Aac))
            .with_bitrate(128_000)
            .with_url("https://cdn.example.com/a.m4a"),
    );
    let request = AcquireRequest::default_format(item).unwrap();
    assert!(request.format.merge_audio);

    let media = acquirer
        .acquire(request, &config(), &CancellationToken::new())
        .await
        .unwrap();

    let mut expected = payload(400);
    expected.extend(vec![7u8; 100]);
    assert_eq!(std::fs::read(&media.path).unwrap(), expected);
    assert_eq!(toolkit.muxes.lock().unwrap().len(), 1);
    assert!(toolkit.tags.lock().unwrap().is_empty());
    assert_eq!(dir_entries(dir.path()), vec!["clip_v.mp4".to_string()]);
}

#[tokio::test]
async fn audio_track_gets_tags_and_cover() {
    let client = RouteClient::new()
        .route("https://cdn.example.com/song.mp3", Route::ok(payload(256)))
        .route("https://img.example.com/missing.jpg", Route::status(StatusCode::NOT_FOUND))
        .route("https://img.example.com/cover.jpg", Route::ok(vec![1u8; 32]));
    let toolkit = Arc::new(ConcatToolkit::new());
    let dir = tempfile::tempdir().unwrap();
    let acquirer = Acquirer::new(Arc::new(client), toolkit.clone(), dir.path())
        .with_plugin(MergeAudioPlugin)
        .with_plugin(MetadataPlugin);

    let mut format = MediaFormat::new("mp3", MediaType::Audio)
        .with_codecs(None, Some(AudioCodec::Mp3))
        .with_url("https://cdn.example.com/song.mp3");
    format.title = Some("Song".into());
    format.artist = Some("Band".into());
    format.thumbnail_urls = vec![
        "https://img.example.com/missing.jpg".into(),
        "https://img.example.com/cover.jpg".into(),
    ];
    let mut item = MediaItem::new("track", "https://example.com/track");
    item.push_format(format.clone());

    let media = acquirer
        .acquire(AcquireRequest::new(item, format), &config(), &CancellationToken::new())
        .await
        .unwrap();

    let thumbnail = media.thumbnail_path.clone().unwrap();
    assert_eq!(std::fs::read(&thumbnail).unwrap(), vec![1u8; 32]);
    let tags = toolkit.tags.lock().unwrap().clone();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].title.as_deref(), Some("Song"));
    assert_eq!(tags[0].cover.as_deref(), Some(thumbnail.as_path()));

    media.remove_files().await;
    assert!(dir_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn plugin_failure_removes_output() {
    let client = RouteClient::new().route("https://cdn.example.com/v.mp4", Route::ok(payload(64)));
    let dir = tempfile::tempdir().unwrap();
    let acquirer = Acquirer::new(Arc::new(client), Arc::new(ConcatToolkit::new()), dir.path())
        .with_plugin(MergeAudioPlugin);

    let mut format = MediaFormat::new("v", MediaType::Video)
        .with_codecs(Some(VideoCodec::Avc), None)
        .with_url("https://cdn.example.com/v.mp4");
    format.merge_audio = true;
    let mut item = MediaItem::new("lonely", "https://example.com/lonely");
    item.push_format(format.clone());

    let err = acquirer
        .acquire(AcquireRequest::new(item, format), &config(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Plugin);
    assert!(dir_entries(dir.path()).is_empty());
}
