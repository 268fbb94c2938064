//! Network collaborator abstraction.
//!
//! A [`Transport`] opens a (possibly ranged) GET for the resource and hands back the response
//! metadata together with a stream of body chunks. The default implementation is
//! [`HttpTransport`]; tests and embedders may supply their own.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use url::Url;

use crate::error::{LoaderError, LoaderResult};

mod http;

pub use http::HttpTransport;

/// A boxed stream of body chunks.
pub type ByteStream = BoxStream<'static, LoaderResult<Bytes>>;

/// Headers and body of an opened response.
pub struct TransportResponse {
    /// Offset of the first body byte within the resource.
    ///
    /// Equal to the requested offset for a honored range request, `0` when the server
    /// ignored the range and sent the whole resource.
    pub offset: u64,
    /// Total length of the resource, if the server declared it.
    pub total_length: Option<u64>,
    /// Content type declared by the server.
    pub content_type: Option<String>,
    /// Body chunks, in order.
    pub body: ByteStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("offset", &self.offset)
            .field("total_length", &self.total_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Streaming fetcher for a single resource.
///
/// Errors must distinguish transient network failures from protocol-level ones
/// (see [`crate::LoaderError::is_transient`]); the coordinator only retries the former.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a GET for `url` starting at `from_offset` (to the end of the resource).
    async fn open(&self, url: &Url, from_offset: u64) -> LoaderResult<TransportResponse>;
}

/// Transport for items seeded with their whole content. Opening always fails.
pub(crate) struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn open(&self, url: &Url, _from_offset: u64) -> LoaderResult<TransportResponse> {
        Err(LoaderError::msg(format!("{url} is served from memory only")))
    }
}
