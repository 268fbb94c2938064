//! Unified configuration for the `caching-loader` crate.
//!
//! Included configuration domains:
//! - Prebuffering and stall detection (when to declare ready / stalled)
//! - HTTP transport behavior (timeouts, automatic retry after transient errors)
//! - Channel capacities between the player, the network and the coordinator
//! - MIME type resolution for resources served without a declared content type

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use url::Url;

use crate::observer::{LoaderEvent, LoaderObserver};

/// Settings for a single caching loader.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    // ----------------------------
    // Readiness / stall detection
    // ----------------------------
    /// Bytes that must be buffered before the item is declared ready to play.
    /// Default: 256 KiB.
    pub prebuffer_bytes: u64,

    /// How long a pending read may go without any new chunk before playback is
    /// declared stalled.
    /// Default: 5 seconds.
    pub stall_timeout: Duration,

    /// How often the coordinator checks for a stall.
    /// Default: 250ms.
    pub stall_check_interval: Duration,

    /// Start downloading as soon as the loader is created, before the player asks
    /// for any bytes.
    /// Default: true.
    pub prefetch_on_start: bool,

    // ----------------------------
    // Transport
    // ----------------------------
    /// Timeout for establishing the response and, afterwards, between two body chunks.
    /// Default: 30 seconds.
    pub request_timeout: Duration,

    /// How many times a download is restarted automatically after consecutive
    /// transient network errors.
    /// Default: 1.
    pub max_transient_retries: u32,

    /// Delay before an automatic restart.
    /// Default: 250ms.
    pub retry_delay: Duration,

    // ----------------------------
    // Channels
    // ----------------------------
    /// Capacity of the player -> coordinator command channel.
    /// Default: 64.
    pub command_capacity: usize,

    /// Capacity of the network -> coordinator channel. Bounds how many chunks may be
    /// in flight before the download is back-pressured.
    /// Default: 32.
    pub session_capacity: usize,

    /// Capacity of the broadcast event feed.
    /// Default: 64.
    pub event_capacity: usize,

    // ----------------------------
    // Content type
    // ----------------------------
    /// Content type reported when the server does not declare one.
    pub content_type: Option<String>,

    /// File extension used to guess a content type when neither the server nor
    /// `content_type` provide one (e.g. `"mp3"`).
    pub custom_file_extension: Option<String>,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            prebuffer_bytes: 256 * 1024,
            stall_timeout: Duration::from_secs(5),
            stall_check_interval: Duration::from_millis(250),
            prefetch_on_start: true,

            request_timeout: Duration::from_secs(30),
            max_transient_retries: 1,
            retry_delay: Duration::from_millis(250),

            command_capacity: 64,
            session_capacity: 32,
            event_capacity: 64,

            content_type: None,
            custom_file_extension: None,
        }
    }
}

impl LoaderSettings {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prebuffer_bytes(mut self, v: u64) -> Self {
        self.prebuffer_bytes = v;
        self
    }

    pub fn stall_timeout(mut self, v: Duration) -> Self {
        self.stall_timeout = v;
        self
    }

    pub fn stall_check_interval(mut self, v: Duration) -> Self {
        self.stall_check_interval = v;
        self
    }

    pub fn prefetch_on_start(mut self, v: bool) -> Self {
        self.prefetch_on_start = v;
        self
    }

    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = v;
        self
    }

    pub fn max_transient_retries(mut self, v: u32) -> Self {
        self.max_transient_retries = v;
        self
    }

    pub fn retry_delay(mut self, v: Duration) -> Self {
        self.retry_delay = v;
        self
    }

    pub fn command_capacity(mut self, v: usize) -> Self {
        self.command_capacity = v;
        self
    }

    pub fn session_capacity(mut self, v: usize) -> Self {
        self.session_capacity = v;
        self
    }

    pub fn event_capacity(mut self, v: usize) -> Self {
        self.event_capacity = v;
        self
    }

    pub fn content_type(mut self, v: impl Into<String>) -> Self {
        self.content_type = Some(v.into());
        self
    }

    pub fn custom_file_extension(mut self, v: impl Into<String>) -> Self {
        let ext = v.into();
        self.custom_file_extension = Some(ext.trim_start_matches('.').to_ascii_lowercase());
        self
    }

    /// Resolve the content type to report for `url`.
    ///
    /// Precedence: the server's header, the configured override, a guess from the custom
    /// file extension, and finally a guess from the URL path.
    pub fn resolve_content_type(&self, url: &Url, server: Option<&str>) -> Option<String> {
        if let Some(ct) = server.map(str::trim).filter(|s| !s.is_empty()) {
            return Some(ct.to_string());
        }
        if let Some(ct) = &self.content_type {
            return Some(ct.clone());
        }
        let ext = self
            .custom_file_extension
            .clone()
            .or_else(|| extension_from_url(url))?;
        mime_guess::from_ext(&ext)
            .first()
            .map(|m| m.essence_str().to_string())
    }
}

/// Lowercase file extension of the URL's last path segment, if any.
pub(crate) fn extension_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Parameters for creating a [`crate::CachingPlayerItem`].
#[derive(Clone)]
pub struct LoaderParams {
    /// The URL of the remote resource.
    pub url: Url,
    /// Loader behavior.
    pub settings: Arc<LoaderSettings>,
    /// Already available bytes and their MIME type; the network is never used.
    pub initial_data: Option<(Bytes, String)>,
    /// Receiver of lifecycle callbacks. Held weakly.
    pub observer: Option<Weak<dyn LoaderObserver>>,
    /// Feed for [`LoaderEvent`]s. Supply one to receive events emitted before the first
    /// [`crate::CachingPlayerItem::subscribe`] call.
    pub event_sender: Option<broadcast::Sender<LoaderEvent>>,
}

impl std::fmt::Debug for LoaderParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderParams")
            .field("url", &self.url.as_str())
            .field("settings", &self.settings)
            .field(
                "initial_data",
                &self.initial_data.as_ref().map(|(d, mime)| (d.len(), mime)),
            )
            .field("observer", &self.observer.is_some())
            .field("event_sender", &self.event_sender.is_some())
            .finish()
    }
}

impl LoaderParams {
    /// Create parameters for `url` with the given settings.
    pub fn new(url: Url, settings: impl Into<Arc<LoaderSettings>>) -> Self {
        Self {
            url,
            settings: settings.into(),
            initial_data: None,
            observer: None,
            event_sender: None,
        }
    }

    /// Seed the loader with the complete resource.
    pub fn initial_data(mut self, data: Bytes, mime_type: impl Into<String>) -> Self {
        self.initial_data = Some((data, mime_type.into()));
        self
    }

    /// Register the lifecycle observer. The loader does not keep it alive.
    pub fn observer<O: LoaderObserver>(mut self, observer: &Arc<O>) -> Self {
        let observer: Arc<dyn LoaderObserver> = observer.clone();
        self.observer = Some(Arc::downgrade(&observer));
        self
    }

    /// Publish lifecycle events on `sender`.
    pub fn event_sender(mut self, sender: broadcast::Sender<LoaderEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }
}
