//! Progressive, range-aware caching loader for remote media resources.
//!
//! A media player asks a [`CachingPlayerItem`] for byte ranges of a remote file while the file
//! is still downloading. The item downloads the resource once, sequentially, into an in-memory
//! buffer; reads of buffered bytes are answered immediately and the rest are kept pending until
//! the download reaches them. Lifecycle notifications (progress, ready to play, stalled,
//! finished, failed) go to an optional [`LoaderObserver`] and to a [`LoaderEvent`] feed.
//!
//! This crate is composed of several modules:
//! - `buffer`: Append-only byte buffer plus resource metadata.
//! - `pending`: Registry of reads waiting for bytes.
//! - `session`: The single network fetch and its epoch bookkeeping.
//! - `transport`: Network abstraction and the `reqwest`-based HTTP implementation.
//! - `coordinator`: The task that owns all of the above and sequences every event.
//! - `item`: The player-facing handle.
//! - `observer`: Observer trait, events and their ordering rules.
//! - `settings`: Configuration and MIME type resolution.
//! - `error`: Unified error types.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types from the internal
//! modules to form the public API of the crate.

mod buffer;
mod coordinator;
mod error;
mod item;
mod observer;
mod pending;
mod session;
mod settings;
mod transport;

pub use crate::buffer::{ByteRangeBuffer, ResourceMetadata};
pub use crate::coordinator::{ContentInfo, LoaderState};
pub use crate::error::{LoaderError, LoaderResult};
pub use crate::item::{CachingPlayerItem, PendingRead, RangeResponse};
pub use crate::observer::{LoaderEvent, LoaderObserver};
pub use crate::pending::{Advance, PendingRequest, PendingRequestRegistry, RequestId};
pub use crate::session::{
    DownloadSession, ResponseMeta, SessionEvent, SessionEventKind, SessionState,
};
pub use crate::settings::{LoaderParams, LoaderSettings};
pub use crate::transport::{ByteStream, HttpTransport, Transport, TransportResponse};
