use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use tokio::time::timeout;
use tracing::{debug, instrument};
use url::Url;

use super::{Transport, TransportResponse};
use crate::error::{LoaderError, LoaderResult};

/// HTTP transport backed by a shared `reqwest` client.
///
/// `request_timeout` bounds the time until response headers arrive; the idle timeout between
/// body chunks is enforced by the download session.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    request_timeout: Duration,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Client::new(), Duration::from_secs(30))
    }
}

impl HttpTransport {
    /// Creates a transport from an existing client (TLS, proxies, headers are the caller's
    /// business).
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    fn classify(url: &Url, err: reqwest::Error) -> LoaderError {
        if err.is_timeout() {
            LoaderError::Timeout(url.to_string())
        } else if let Some(status) = err.status() {
            LoaderError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else {
            // Connect/request/body failures are all worth one more try.
            LoaderError::Connection(format!("{url}: {err}"))
        }
    }

    /// Parse the `Content-Range` header to extract the total length.
    /// Expected formats:
    /// - "bytes 0-0/12345"
    /// - "bytes */12345"
    fn parse_content_range_total(header_val: &str) -> Option<u64> {
        let idx = header_val.rfind('/')?;
        let total_str = header_val.get(idx + 1..)?.trim();
        if total_str == "*" {
            None
        } else {
            total_str.parse::<u64>().ok()
        }
    }

    /// Parse the first byte position out of `Content-Range: bytes a-b/total`.
    fn parse_content_range_start(header_val: &str) -> Option<u64> {
        let spec = header_val.trim().strip_prefix("bytes")?.trim_start();
        let (start, _) = spec.split_once('-')?;
        start.trim().parse::<u64>().ok()
    }

    fn header_str<'a>(headers: &'a HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Work out where the body starts and how long the whole resource is.
    fn body_layout(status: StatusCode, headers: &HeaderMap) -> (u64, Option<u64>) {
        let content_length =
            Self::header_str(headers, CONTENT_LENGTH).and_then(|s| s.trim().parse::<u64>().ok());

        if status == StatusCode::PARTIAL_CONTENT {
            let range = Self::header_str(headers, CONTENT_RANGE);
            let start = range.and_then(Self::parse_content_range_start).unwrap_or(0);
            let total = range.and_then(Self::parse_content_range_total);
            (start, total)
        } else {
            // Plain 200: the server ignored the range (or none was sent).
            (0, content_length)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, url), fields(url = %url))]
    async fn open(&self, url: &Url, from_offset: u64) -> LoaderResult<TransportResponse> {
        let mut request = self.client.get(url.clone());
        if from_offset > 0 {
            request = request.header(RANGE, format!("bytes={from_offset}-"));
        }

        let response = match timeout(self.request_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(Self::classify(url, e)),
            Err(_) => return Err(LoaderError::Timeout(url.to_string())),
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(LoaderError::RangeNotSatisfiable(url.to_string()));
        }
        if !status.is_success() {
            return Err(LoaderError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let headers = response.headers();
        let (offset, total_length) = Self::body_layout(status, headers);
        let content_type = Self::header_str(headers, CONTENT_TYPE).map(str::to_string);

        debug!(
            status = status.as_u16(),
            from_offset,
            offset,
            ?total_length,
            ?content_type,
            "transport: response opened"
        );

        let body_url = url.clone();
        let body = response
            .bytes_stream()
            .map(move |item| item.map_err(|e| Self::classify(&body_url, e)))
            .boxed();

        Ok(TransportResponse {
            offset,
            total_length,
            content_type,
            body,
        })
    }
}
