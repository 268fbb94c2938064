//! Shared fixtures for loader integration tests.
//!
//! - [`ScriptedTransport`]: in-process transport whose every `open` follows a scripted
//!   [`Attempt`], for deterministic retry/stall/suspend scenarios.
//! - [`Recorder`]: observer that logs every callback in order.
//! - [`RangeServer`]: local axum server honoring (or ignoring) `Range` requests, with request
//!   logging and failure injection, for exercising the real HTTP transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tokio::sync::watch;

use caching_loader::{
    LoaderError, LoaderObserver, LoaderResult, LoaderState, Transport, TransportResponse,
};

/// Deterministic test payload.
pub fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// Wait until the loader reaches `target`, panicking after a few seconds.
pub async fn wait_for_state(mut state: watch::Receiver<LoaderState>, target: LoaderState) {
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("loader did not reach {target:?}"))
        .expect("loader dropped");
}

// ----------------------------
// Scripted transport
// ----------------------------

/// How one `open` call behaves.
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Serve the rest of the resource.
    Full,
    /// Serve `n` bytes, then fail the body with the error.
    FailAfter(u64, LoaderError),
    /// Serve `n` bytes, then go silent.
    StallAfter(u64),
    /// Serve `n` bytes, go silent for a while, then serve the rest.
    PauseAfter(u64, Duration),
    /// Fail before any body.
    Refuse(LoaderError),
}

/// Transport serving `data` according to a script. Once the script runs out every open
/// serves the full remainder.
pub struct ScriptedTransport {
    data: Bytes,
    chunk_size: usize,
    chunk_delay: Duration,
    content_type: Option<String>,
    script: Mutex<VecDeque<Attempt>>,
    opens: Mutex<Vec<u64>>,
}

impl ScriptedTransport {
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size,
            chunk_delay: Duration::ZERO,
            content_type: Some("audio/mpeg".to_string()),
            script: Mutex::new(VecDeque::new()),
            opens: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_delay(mut self, d: Duration) -> Self {
        self.chunk_delay = d;
        self
    }

    pub fn with_content_type(mut self, content_type: Option<&str>) -> Self {
        self.content_type = content_type.map(str::to_string);
        self
    }

    pub fn with_script(self, attempts: impl IntoIterator<Item = Attempt>) -> Self {
        self.script.lock().unwrap().extend(attempts);
        self
    }

    /// Offsets of every `open` call so far.
    pub fn opens(&self) -> Vec<u64> {
        self.opens.lock().unwrap().clone()
    }

    fn chunks(&self, from: u64, limit: Option<u64>) -> Vec<LoaderResult<Bytes>> {
        let start = (from as usize).min(self.data.len());
        let end = limit.map_or(self.data.len(), |n| (start + n as usize).min(self.data.len()));
        let mut out = Vec::new();
        let mut pos = start;
        while pos < end {
            let next = (pos + self.chunk_size).min(end);
            out.push(Ok(self.data.slice(pos..next)));
            pos = next;
        }
        out
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _url: &url::Url, from_offset: u64) -> LoaderResult<TransportResponse> {
        self.opens.lock().unwrap().push(from_offset);
        let attempt = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Full);

        let delay = self.chunk_delay;
        let paced = move |chunks: Vec<LoaderResult<Bytes>>| {
            stream::iter(chunks).then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
        };

        let body = match attempt {
            Attempt::Refuse(e) => return Err(e),
            Attempt::Full => paced(self.chunks(from_offset, None)).boxed(),
            Attempt::FailAfter(n, e) => paced(self.chunks(from_offset, Some(n)))
                .chain(stream::once(async move { Err(e) }))
                .boxed(),
            Attempt::StallAfter(n) => paced(self.chunks(from_offset, Some(n)))
                .chain(stream::pending())
                .boxed(),
            Attempt::PauseAfter(n, pause) => {
                let rest = paced(self.chunks(from_offset + n, None));
                let gap = stream::once(tokio::time::sleep(pause)).filter_map(|()| async { None });
                paced(self.chunks(from_offset, Some(n)))
                    .chain(gap)
                    .chain(rest)
                    .boxed()
            }
        };

        Ok(TransportResponse {
            offset: from_offset.min(self.data.len() as u64),
            total_length: Some(self.data.len() as u64),
            content_type: self.content_type.clone(),
            body,
        })
    }
}

// ----------------------------
// Observer
// ----------------------------

/// Observer logging every callback, in order, as a short string.
#[derive(Default)]
pub struct Recorder {
    log: Mutex<Vec<String>>,
    finished: Mutex<Option<Bytes>>,
}

impl Recorder {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log().iter().position(|e| e.as_str() == entry)
    }

    pub fn progress(&self) -> Vec<u64> {
        self.log()
            .iter()
            .filter_map(|e| e.strip_prefix("progress ")?.parse().ok())
            .collect()
    }

    pub fn finished_data(&self) -> Option<Bytes> {
        self.finished.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl LoaderObserver for Recorder {
    fn on_progress(&self, bytes_downloaded: u64, _bytes_expected: Option<u64>) {
        self.push(format!("progress {bytes_downloaded}"));
    }

    fn on_ready_to_play(&self) {
        self.push("ready".into());
    }

    fn on_playback_stalled(&self) {
        self.push("stalled".into());
    }

    fn on_finished(&self, data: Bytes) {
        self.push("finished".into());
        *self.finished.lock().unwrap() = Some(data);
    }

    fn on_failed(&self, _error: &LoaderError) {
        self.push("failed".into());
    }
}

// ----------------------------
// HTTP fixture server
// ----------------------------

/// Local HTTP server for a single resource at `/{name}`.
///
/// Notes:
/// - `Range: bytes=N-` is answered with `206` and `Content-Range` unless ranges are ignored,
///   in which case the whole resource is sent with `200`.
/// - No `Content-Type` is sent unless configured.
/// - Every request is logged with its `Range` header so tests can assert resume offsets.
#[derive(Clone)]
pub struct RangeServer {
    name: &'static str,
    data: Bytes,
    chunk_size: usize,
    chunk_delay: Duration,
    honor_ranges: bool,
    content_type: Option<&'static str>,
    status_override: Option<StatusCode>,
    truncate_first_after: Option<usize>,
    requests: Arc<Mutex<Vec<Option<String>>>>,
}

impl RangeServer {
    pub fn new(name: &'static str, data: Bytes) -> Self {
        Self {
            name,
            data,
            chunk_size: 4 * 1024,
            chunk_delay: Duration::ZERO,
            honor_ranges: true,
            content_type: None,
            status_override: None,
            truncate_first_after: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn honor_ranges(mut self, honor: bool) -> Self {
        self.honor_ranges = honor;
        self
    }

    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn with_chunks(mut self, size: usize, delay: Duration) -> Self {
        self.chunk_size = size;
        self.chunk_delay = delay;
        self
    }

    /// Answer every request with `status`.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status_override = Some(status);
        self
    }

    /// Abort the first response's body after `n` bytes.
    pub fn truncate_first_after(mut self, n: usize) -> Self {
        self.truncate_first_after = Some(n);
        self
    }

    /// `Range` header of every request served so far (`None` for plain GETs).
    pub fn requests(&self) -> Vec<Option<String>> {
        self.requests.lock().unwrap().clone()
    }

    /// Start the server and return the resource URL.
    ///
    /// - bind a `std::net::TcpListener` on `127.0.0.1:0`,
    /// - mark it non-blocking,
    /// - hand it off to `tokio::net::TcpListener::from_std`,
    /// - spawn `axum::serve` in the background.
    pub async fn start(&self) -> url::Url {
        let app = Router::new()
            .route("/{name}", get(serve_resource))
            .with_state(self.clone());

        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("failed to bind local fixture server");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking on fixture listener");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener)
                .expect("failed to convert fixture listener to tokio listener");
            axum::serve(listener, app).await.unwrap();
        });

        url::Url::parse(&format!("http://{}/{}", addr, self.name)).expect("failed to build url")
    }

    fn range_start(headers: &HeaderMap) -> Option<u64> {
        let value = headers.get(header::RANGE)?.to_str().ok()?;
        let spec = value.strip_prefix("bytes=")?;
        let (start, _) = spec.split_once('-')?;
        start.parse().ok()
    }
}

async fn serve_resource(State(server): State<RangeServer>, headers: HeaderMap) -> Response {
    let request_index = {
        let mut requests = server.requests.lock().unwrap();
        requests.push(
            headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
        requests.len() - 1
    };

    if let Some(status) = server.status_override {
        return (status, Body::empty()).into_response();
    }

    let len = server.data.len();
    let start = if server.honor_ranges {
        RangeServer::range_start(&headers)
    } else {
        None
    };

    let mut response_headers = HeaderMap::new();
    if let Some(ct) = server.content_type {
        response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ct));
    }

    let (status, body_start) = match start {
        Some(start) if start as usize >= len => {
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{len}")).unwrap(),
            );
            return (StatusCode::RANGE_NOT_SATISFIABLE, response_headers).into_response();
        }
        Some(start) => {
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, len - 1, len)).unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, start as usize)
        }
        None => (StatusCode::OK, 0),
    };

    let truncate = match server.truncate_first_after {
        Some(n) if request_index == 0 => Some(body_start + n),
        _ => None,
    };
    let body_end = truncate.unwrap_or(len).min(len);

    let mut frames: Vec<Result<Bytes, std::io::Error>> = Vec::new();
    let mut pos = body_start;
    while pos < body_end {
        let next = (pos + server.chunk_size).min(body_end);
        frames.push(Ok(server.data.slice(pos..next)));
        pos = next;
    }
    if truncate.is_some() {
        frames.push(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "fixture: truncated body",
        )));
    } else {
        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from(len - body_start),
        );
    }

    let delay = server.chunk_delay;
    let body = stream::iter(frames).then(move |frame| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        frame
    });

    (status, response_headers, Body::from_stream(body)).into_response()
}
