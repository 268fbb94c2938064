//! Player-facing handle.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::coordinator::{Command, ContentInfo, Coordinator, CoordinatorChannels, LoaderState};
use crate::error::{LoaderError, LoaderResult};
use crate::observer::LoaderEvent;
use crate::pending::RequestId;
use crate::settings::{LoaderParams, LoaderSettings};
use crate::transport::{HttpTransport, OfflineTransport, Transport};

/// Answer to a range read.
#[derive(Debug)]
pub enum RangeResponse {
    /// The bytes were already buffered.
    Ready(Bytes),
    /// The read was registered and completes once the bytes arrive.
    Pending(PendingRead),
}

impl RangeResponse {
    /// Wait for the bytes, whichever way they come.
    pub async fn into_bytes(self) -> LoaderResult<Bytes> {
        match self {
            Self::Ready(bytes) => Ok(bytes),
            Self::Pending(read) => read.wait().await,
        }
    }
}

/// A registered range read.
///
/// Resolves exactly once: with the whole range, with the loader's failure, or with
/// [`LoaderError::Cancelled`] if the read was cancelled or the loader went away.
pub struct PendingRead {
    id: RequestId,
    rx: oneshot::Receiver<LoaderResult<Bytes>>,
}

impl fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRead").field("id", &self.id).finish()
    }
}

impl PendingRead {
    pub(crate) fn new(id: RequestId, rx: oneshot::Receiver<LoaderResult<Bytes>>) -> Self {
        Self { id, rx }
    }

    /// Identifier to pass to [`CachingPlayerItem::cancel`].
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn wait(self) -> LoaderResult<Bytes> {
        self.rx.await.unwrap_or(Err(LoaderError::Cancelled))
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from async code.
    pub fn blocking_wait(self) -> LoaderResult<Bytes> {
        self.rx.blocking_recv().unwrap_or(Err(LoaderError::Cancelled))
    }

    #[cfg(test)]
    pub(crate) fn into_receiver(self) -> oneshot::Receiver<LoaderResult<Bytes>> {
        self.rx
    }
}

/// A media resource that is progressively downloaded and cached while it plays.
///
/// The player asks for byte ranges; ranges already buffered are answered immediately, the
/// rest is answered as the single sequential download reaches them. Creating an item spawns
/// its coordinator task, so it must happen inside a Tokio runtime. Dropping the item cancels
/// the download and resolves every outstanding read as cancelled.
pub struct CachingPlayerItem {
    url: Url,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LoaderState>,
    event_sender: broadcast::Sender<LoaderEvent>,
    cancel_token: CancellationToken,
    coordinator_task: JoinHandle<()>,
}

impl fmt::Debug for CachingPlayerItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingPlayerItem")
            .field("url", &self.url.as_str())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl CachingPlayerItem {
    /// Load `url` over HTTP with default settings.
    pub fn new(url: Url) -> Self {
        Self::new_with(url, LoaderSettings::default())
    }

    /// Load `url` over HTTP.
    pub fn new_with(url: Url, settings: impl Into<Arc<LoaderSettings>>) -> Self {
        let settings = settings.into();
        let transport = HttpTransport::new(reqwest::Client::new(), settings.request_timeout);
        Self::spawn(LoaderParams::new(url, settings), Arc::new(transport))
    }

    /// Serve already available bytes. Nothing is downloaded.
    pub fn from_data(
        url: Url,
        data: Bytes,
        mime_type: impl Into<String>,
        settings: impl Into<Arc<LoaderSettings>>,
    ) -> Self {
        let params = LoaderParams::new(url, settings).initial_data(data, mime_type);
        Self::spawn(params, Arc::new(OfflineTransport))
    }

    /// Spawn the coordinator for `params`, fetching through `transport`.
    pub fn spawn(params: LoaderParams, transport: Arc<dyn Transport>) -> Self {
        let settings = Arc::clone(&params.settings);
        let url = params.url.clone();

        let (commands, command_rx) = mpsc::channel(settings.command_capacity.max(1));
        let (state_tx, state) = watch::channel(LoaderState::Uninitialized);
        let event_sender = params
            .event_sender
            .clone()
            .unwrap_or_else(|| broadcast::channel(settings.event_capacity.max(1)).0);
        let cancel_token = CancellationToken::new();

        let coordinator = Coordinator::new(
            params,
            transport,
            CoordinatorChannels {
                commands: command_rx,
                state: state_tx,
                events: event_sender.clone(),
                cancel: cancel_token.clone(),
            },
        );
        let coordinator_task = tokio::spawn(async move {
            trace!("coordinator task started");
            coordinator.run().await;
            trace!("coordinator task finished");
        });

        Self {
            url,
            commands,
            state,
            event_sender,
            cancel_token,
            coordinator_task,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Current loader state.
    pub fn state(&self) -> LoaderState {
        *self.state.borrow()
    }

    /// Watch loader state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LoaderState> {
        self.state.clone()
    }

    /// Subscribe to lifecycle events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.event_sender.subscribe()
    }

    async fn send(&self, cmd: Command) -> LoaderResult<()> {
        self.commands.send(cmd).await.map_err(|_| LoaderError::Closed)
    }

    /// Ask for `[offset, offset + length)`; `None` reads to the end of the resource.
    ///
    /// Ranges reaching past the end of the resource are clamped to it.
    pub async fn request(&self, offset: u64, length: Option<u64>) -> LoaderResult<RangeResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Request {
            offset,
            length,
            reply,
        })
        .await?;
        rx.await.map_err(|_| LoaderError::Closed)?
    }

    /// Blocking variant of [`request`](Self::request) for players that pull on their own
    /// thread. Must not be called from async code.
    pub fn request_blocking(
        &self,
        offset: u64,
        length: Option<u64>,
    ) -> LoaderResult<RangeResponse> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .blocking_send(Command::Request {
                offset,
                length,
                reply,
            })
            .map_err(|_| LoaderError::Closed)?;
        rx.blocking_recv().map_err(|_| LoaderError::Closed)?
    }

    /// Read a range, waiting for it if necessary.
    pub async fn read(&self, offset: u64, length: Option<u64>) -> LoaderResult<Bytes> {
        self.request(offset, length).await?.into_bytes().await
    }

    /// Cancel a pending read. Returns `false` if it already completed.
    pub async fn cancel(&self, id: RequestId) -> LoaderResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { id, reply }).await?;
        rx.await.map_err(|_| LoaderError::Closed)
    }

    /// Download the whole resource without waiting for the player (resumes after
    /// [`suspend`](Self::suspend)).
    pub async fn download(&self) -> LoaderResult<()> {
        self.send(Command::Download).await
    }

    /// Stop downloading but keep everything buffered. The next read of missing bytes, or
    /// [`download`](Self::download), resumes where the buffer ends.
    pub async fn suspend(&self) -> LoaderResult<()> {
        self.send(Command::Suspend).await
    }

    /// Length, content type and download progress known so far.
    pub async fn content_info(&self) -> LoaderResult<ContentInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ContentInfo { reply }).await?;
        rx.await.map_err(|_| LoaderError::Closed)
    }
}

impl Drop for CachingPlayerItem {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if !self.coordinator_task.is_finished() {
            self.coordinator_task.abort();
        }
    }
}
