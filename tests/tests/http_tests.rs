//! HTTP integration tests.
//!
//! All tests use a local axum fixture server (no external network) and the real
//! `HttpTransport`. They validate:
//! - full downloads with and without server-side range support;
//! - resume after suspend sends `Range: bytes=N-` from the end of the buffer;
//! - a body aborted mid-flight is retried once and the result is byte-exact;
//! - protocol errors are terminal and not retried;
//! - content type resolution from headers and URL extensions.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use rstest::rstest;

use caching_loader::{
    CachingPlayerItem, HttpTransport, LoaderError, LoaderParams, LoaderSettings, LoaderState,
    Transport,
};

mod loader_fixture;

use loader_fixture::{RangeServer, Recorder, payload, wait_for_state};

fn spawn(url: url::Url, settings: LoaderSettings, recorder: &Arc<Recorder>) -> CachingPlayerItem {
    let transport = HttpTransport::new(reqwest::Client::new(), Duration::from_secs(5));
    let params = LoaderParams::new(url, settings).observer(recorder);
    CachingPlayerItem::spawn(params, Arc::new(transport))
}

async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("timed out")
}

#[rstest]
#[case(true)]
#[case(false)]
#[tokio::test]
async fn downloads_whole_resource(#[case] honor_ranges: bool) {
    let data = payload(64 * 1024 + 17);
    let server = RangeServer::new("track.mp3", data.clone())
        .honor_ranges(honor_ranges)
        .with_content_type("audio/mpeg");
    let url = server.start().await;
    let recorder = Arc::new(Recorder::default());
    let item = spawn(url, LoaderSettings::default().prebuffer_bytes(8 * 1024), &recorder);

    assert_eq!(within(item.read(0, None)).await.unwrap(), data);
    wait_for_state(item.watch_state(), LoaderState::Completed).await;

    assert_eq!(recorder.count("ready"), 1);
    assert_eq!(recorder.finished_data(), Some(data.clone()));
    let info = within(item.content_info()).await.unwrap();
    assert_eq!(info.total_length, Some(data.len() as u64));
    assert_eq!(info.content_type.as_deref(), Some("audio/mpeg"));
    assert_eq!(server.requests(), vec![None]);
}

#[rstest]
#[case(true)]
#[case(false)]
#[tokio::test]
async fn resume_after_suspend_continues_from_buffer_end(#[case] honor_ranges: bool) {
    let data = payload(256 * 1024);
    let server = RangeServer::new("track.mp3", data.clone())
        .honor_ranges(honor_ranges)
        .with_chunks(4 * 1024, Duration::from_millis(5));
    let url = server.start().await;
    let recorder = Arc::new(Recorder::default());
    let item = spawn(url, LoaderSettings::default().prebuffer_bytes(16 * 1024), &recorder);

    wait_for_state(item.watch_state(), LoaderState::Streaming).await;
    item.suspend().await.unwrap();
    let suspended_at = within(item.content_info()).await.unwrap().downloaded_length;
    assert!(suspended_at > 0 && suspended_at < data.len() as u64);

    // Reading buffered bytes does not resume.
    assert_eq!(
        within(item.read(0, Some(suspended_at))).await.unwrap(),
        data.slice(..suspended_at as usize)
    );
    assert_eq!(server.requests().len(), 1);

    // Reading missing bytes does.
    let tail = within(item.read(data.len() as u64 - 10, None)).await.unwrap();
    assert_eq!(tail, data.slice(data.len() - 10..));
    wait_for_state(item.watch_state(), LoaderState::Completed).await;

    assert_eq!(recorder.finished_data(), Some(data));
    assert_eq!(
        server.requests(),
        vec![None, Some(format!("bytes={suspended_at}-"))]
    );
}

#[tokio::test]
async fn aborted_body_is_retried_once() {
    let data = payload(128 * 1024);
    let server = RangeServer::new("track.mp3", data.clone()).truncate_first_after(40 * 1024);
    let url = server.start().await;
    let recorder = Arc::new(Recorder::default());
    let item = spawn(
        url,
        LoaderSettings::default().retry_delay(Duration::from_millis(10)),
        &recorder,
    );

    assert_eq!(within(item.read(0, None)).await.unwrap(), data);
    assert_eq!(recorder.count("failed"), 0);

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], None);
}

#[rstest]
#[case(StatusCode::NOT_FOUND)]
#[case(StatusCode::FORBIDDEN)]
#[case(StatusCode::INTERNAL_SERVER_ERROR)]
#[tokio::test]
async fn http_error_status_is_terminal(#[case] status: StatusCode) {
    let server = RangeServer::new("track.mp3", payload(1024)).with_status(status);
    let url = server.start().await;
    let recorder = Arc::new(Recorder::default());
    let item = spawn(url, LoaderSettings::default(), &recorder);

    let err = within(item.read(0, Some(10))).await.unwrap_err();
    assert!(
        matches!(err, LoaderError::Http { status: s, .. } if s == status.as_u16()),
        "unexpected error: {err:?}"
    );
    wait_for_state(item.watch_state(), LoaderState::Failed).await;
    assert_eq!(recorder.log(), vec!["failed"]);
    assert_eq!(server.requests().len(), 1);
}

#[rstest]
#[case("track.mp3", None, Some("audio/mpeg"))]
#[case("track.mp4", None, Some("video/mp4"))]
#[case("track", None, None)]
#[case("track", Some("mp3"), Some("audio/mpeg"))]
#[tokio::test]
async fn content_type_inferred_without_header(
    #[case] name: &'static str,
    #[case] custom_extension: Option<&str>,
    #[case] expected: Option<&str>,
) {
    let server = RangeServer::new(name, payload(1024));
    let url = server.start().await;
    let recorder = Arc::new(Recorder::default());
    let mut settings = LoaderSettings::default();
    if let Some(ext) = custom_extension {
        settings = settings.custom_file_extension(ext);
    }
    let item = spawn(url, settings, &recorder);
    wait_for_state(item.watch_state(), LoaderState::Completed).await;

    let info = within(item.content_info()).await.unwrap();
    assert_eq!(info.content_type.as_deref(), expected);
}

#[tokio::test]
async fn transport_reports_range_layout() {
    let data = payload(10_000);
    let server = RangeServer::new("track.mp3", data.clone()).with_content_type("audio/mpeg");
    let url = server.start().await;
    let transport = HttpTransport::default();

    let full = within(transport.open(&url, 0)).await.unwrap();
    assert_eq!(full.offset, 0);
    assert_eq!(full.total_length, Some(10_000));
    assert_eq!(full.content_type.as_deref(), Some("audio/mpeg"));

    let ranged = within(transport.open(&url, 7_000)).await.unwrap();
    assert_eq!(ranged.offset, 7_000);
    assert_eq!(ranged.total_length, Some(10_000));

    let past_end = within(transport.open(&url, 10_000)).await.unwrap_err();
    assert!(matches!(past_end, LoaderError::RangeNotSatisfiable(_)));
    assert!(!past_end.is_transient());

    assert_eq!(
        server.requests(),
        vec![
            None,
            Some("bytes=7000-".to_string()),
            Some("bytes=10000-".to_string())
        ]
    );
}

#[tokio::test]
async fn connection_refused_is_transient() {
    // Bind and drop to get a port nobody listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let url = url::Url::parse(&format!("http://127.0.0.1:{port}/track.mp3")).unwrap();

    let err = within(HttpTransport::default().open(&url, 0))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err:?}");
}
