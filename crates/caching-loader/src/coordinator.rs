//! Resource-loading coordinator.
//!
//! The coordinator is a single task that owns the buffer, the pending-read registry and the
//! download session. Everything that mutates them arrives as a message on one of two inboxes:
//! - player commands (range reads, cancellations, download/suspend) from [`crate::CachingPlayerItem`];
//! - session events (response opened, chunk, completion, failure) from the fetch task.
//!
//! Handlers are synchronous and run to completion, so a chunk append, the re-evaluation of
//! pending reads and a request registration never interleave. The run loop only awaits the
//! inboxes and the stall timer.
//!
//! State machine:
//!
//! ```text
//! Uninitialized -> Priming -> Streaming <-> Stalled -> Completed
//!        \____________\___________\___________\______> Failed
//! ```
//!
//! Downloads are single-stream and sequential: a read far ahead of the download position stays
//! pending until the stream reaches it; there is no seek-ahead re-fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::buffer::ByteRangeBuffer;
use crate::error::{LoaderError, LoaderResult};
use crate::item::{PendingRead, RangeResponse};
use crate::observer::{LoaderEvent, Notifier};
use crate::pending::{Advance, PendingRequestRegistry, RequestId, resolve_end};
use crate::session::{DownloadSession, ResponseMeta, SessionEvent, SessionEventKind};
use crate::settings::{LoaderParams, LoaderSettings};
use crate::transport::Transport;

/// Lifecycle of a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    /// Nothing requested or downloaded yet.
    Uninitialized,
    /// Downloading, prebuffer threshold not reached.
    Priming,
    /// Ready to play.
    Streaming,
    /// A pending read is starving; the download keeps going.
    Stalled,
    /// The whole resource is buffered.
    Completed,
    /// Downloading failed for good.
    Failed,
}

/// Snapshot of what is known about the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub total_length: Option<u64>,
    pub content_type: Option<String>,
    pub downloaded_length: u64,
}

/// Player-side messages.
pub(crate) enum Command {
    Request {
        offset: u64,
        length: Option<u64>,
        reply: oneshot::Sender<LoaderResult<RangeResponse>>,
    },
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    Download,
    Suspend,
    ContentInfo {
        reply: oneshot::Sender<ContentInfo>,
    },
}

/// Channels shared between the coordinator and its public handle.
pub(crate) struct CoordinatorChannels {
    pub commands: mpsc::Receiver<Command>,
    pub state: watch::Sender<LoaderState>,
    pub events: broadcast::Sender<LoaderEvent>,
    pub cancel: CancellationToken,
}

pub(crate) struct Coordinator {
    url: Url,
    settings: Arc<LoaderSettings>,

    buffer: ByteRangeBuffer,
    pending: PendingRequestRegistry,
    waiters: HashMap<RequestId, oneshot::Sender<LoaderResult<Bytes>>>,
    session: DownloadSession,

    state: LoaderState,
    state_tx: watch::Sender<LoaderState>,
    notifier: Notifier,

    /// First read the player issued; readiness is declared once it is servable.
    first_request: Option<(u64, Option<u64>)>,
    consecutive_failures: u32,
    failure: Option<LoaderError>,

    last_chunk_at: Instant,
    waiting_since: Option<Instant>,

    commands: mpsc::Receiver<Command>,
    session_events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub(crate) fn new(
        params: LoaderParams,
        transport: Arc<dyn Transport>,
        channels: CoordinatorChannels,
    ) -> Self {
        let LoaderParams {
            url,
            settings,
            initial_data,
            observer,
            ..
        } = params;

        let (session_tx, session_rx) = mpsc::channel(settings.session_capacity.max(1));
        let session = DownloadSession::new(
            url.clone(),
            transport,
            session_tx,
            channels.cancel.clone(),
            settings.request_timeout,
        );

        let (buffer, state) = match initial_data {
            Some((data, mime)) => (
                ByteRangeBuffer::seeded(&data, Some(mime)),
                LoaderState::Completed,
            ),
            None => (ByteRangeBuffer::new(), LoaderState::Uninitialized),
        };
        channels.state.send_replace(state);

        Self {
            url,
            settings,
            buffer,
            pending: PendingRequestRegistry::new(),
            waiters: HashMap::new(),
            session,
            state,
            state_tx: channels.state,
            notifier: Notifier::new(observer, channels.events),
            first_request: None,
            consecutive_failures: 0,
            failure: None,
            last_chunk_at: Instant::now(),
            waiting_since: None,
            commands: channels.commands,
            session_events: session_rx,
            cancel: channels.cancel,
        }
    }

    /// Drive the coordinator until it is cancelled or every handle is gone.
    pub(crate) async fn run(mut self) {
        self.start();

        // `interval` rejects a zero period.
        let period = self
            .settings
            .stall_check_interval
            .max(Duration::from_millis(1));
        let mut stall_tick = tokio::time::interval(period);
        stall_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    trace!("coordinator: cancelled");
                    break;
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        trace!("coordinator: all handles dropped");
                        break;
                    }
                },
                // The session keeps a sender alive, so this never yields `None`.
                Some(event) = self.session_events.recv() => self.handle_session_event(event),
                _ = stall_tick.tick() => self.check_stall(),
            }
        }

        self.session.cancel();
        // Dropping the waiters resolves every outstanding read as cancelled.
        self.waiters.clear();
    }

    fn start(&mut self) {
        match self.state {
            LoaderState::Completed => {
                debug!(url = %self.url, len = self.buffer.downloaded_length(), "coordinator: seeded");
                self.notifier.ready_to_play();
            }
            _ if self.settings.prefetch_on_start => self.ensure_download(),
            _ => {}
        }
    }

    fn set_state(&mut self, state: LoaderState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "coordinator: state");
        self.state = state;
        self.state_tx.send_replace(state);
    }

    // ----------------------------
    // Player commands
    // ----------------------------

    pub(crate) fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Request {
                offset,
                length,
                reply,
            } => {
                let response = self.handle_range_request(offset, length);
                let _ = reply.send(response);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel_request(id));
            }
            Command::Download => self.ensure_download(),
            Command::Suspend => self.suspend(),
            Command::ContentInfo { reply } => {
                let _ = reply.send(self.content_info());
            }
        }
    }

    /// Serve `[offset, offset + length)` from the buffer, or register it and make sure the
    /// download is running.
    #[instrument(level = "trace", skip(self))]
    fn handle_range_request(
        &mut self,
        offset: u64,
        length: Option<u64>,
    ) -> LoaderResult<RangeResponse> {
        if self.first_request.is_none() {
            self.first_request = Some((offset, length));
        }

        let total = self.buffer.total_length();
        let downloaded = self.buffer.downloaded_length();
        let past_end = total.is_some_and(|total| offset >= total);
        if let Some(end) = resolve_end(offset, length, total) {
            if end <= downloaded || past_end {
                let bytes = self.read_range(offset, end)?;
                trace!(offset, len = bytes.len(), "coordinator: served from buffer");
                self.check_ready();
                return Ok(RangeResponse::Ready(bytes));
            }
        }

        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        let id = self.pending.register(offset, length);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        self.waiting_since.get_or_insert_with(Instant::now);
        trace!(%id, offset, ?length, downloaded, "coordinator: registered pending read");

        self.ensure_download();
        Ok(RangeResponse::Pending(PendingRead::new(id, rx)))
    }

    fn cancel_request(&mut self, id: RequestId) -> bool {
        let removed = self.pending.cancel(id);
        // Dropping the sender resolves the read as cancelled.
        self.waiters.remove(&id);
        if self.pending.is_empty() {
            self.waiting_since = None;
        }
        trace!(%id, removed, "coordinator: cancel read");
        removed
    }

    fn suspend(&mut self) {
        if self.session.is_active() {
            debug!(
                downloaded = self.buffer.downloaded_length(),
                "coordinator: suspending download"
            );
            self.session.cancel();
        }
    }

    fn content_info(&self) -> ContentInfo {
        ContentInfo {
            total_length: self.buffer.total_length(),
            content_type: self.buffer.content_type().map(str::to_string),
            downloaded_length: self.buffer.downloaded_length(),
        }
    }

    /// Start a session from the end of the buffer unless one is running or nothing is left.
    fn ensure_download(&mut self) {
        if self.failure.is_some()
            || self.state == LoaderState::Completed
            || self.buffer.is_complete()
            || self.session.is_active()
        {
            return;
        }
        let from_offset = self.buffer.downloaded_length();
        match self.session.start(from_offset, Duration::ZERO) {
            Ok(_) => {
                if self.state == LoaderState::Uninitialized {
                    self.set_state(LoaderState::Priming);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    // ----------------------------
    // Session events
    // ----------------------------

    pub(crate) fn handle_session_event(&mut self, event: SessionEvent) {
        let SessionEvent { epoch, kind } = event;
        match kind {
            SessionEventKind::Opened(meta) => {
                if self.session.accepts(epoch) {
                    self.on_opened(meta);
                } else {
                    trace!(epoch, "coordinator: dropping stale response");
                }
            }
            SessionEventKind::Chunk { offset, bytes } => {
                if self.session.accepts(epoch) {
                    self.on_chunk(offset, bytes);
                } else {
                    trace!(epoch, offset, "coordinator: dropping stale chunk");
                }
            }
            SessionEventKind::Complete => {
                if self.session.on_complete(epoch) {
                    self.on_complete();
                }
            }
            SessionEventKind::Failed(error) => {
                if self.session.on_error(epoch, error.clone()) {
                    self.on_error(error);
                }
            }
        }
    }

    fn on_opened(&mut self, meta: ResponseMeta) {
        // The content type is settled by the first response that yields one; resumed
        // responses only have their length checked.
        let content_type = match self.buffer.content_type() {
            Some(_) => None,
            None => self
                .settings
                .resolve_content_type(&self.url, meta.content_type.as_deref()),
        };
        if let Err(e) = self.buffer.set_metadata(meta.total_length, content_type) {
            self.fail(e);
            return;
        }
        // Reads past the end can be answered now that the length is known.
        self.advance_pending();
    }

    #[instrument(level = "trace", skip(self, bytes), fields(len = bytes.len()))]
    fn on_chunk(&mut self, offset: u64, bytes: Bytes) {
        let downloaded = self.buffer.downloaded_length();
        if offset != downloaded {
            warn!(offset, downloaded, "coordinator: dropping misaligned chunk");
            return;
        }

        self.buffer.append(&bytes);
        self.last_chunk_at = Instant::now();
        self.consecutive_failures = 0;
        if self.state == LoaderState::Stalled {
            self.set_state(LoaderState::Streaming);
        }

        self.advance_pending();
        self.notifier
            .progress(self.buffer.downloaded_length(), self.buffer.total_length());
        self.check_ready();
    }

    fn on_complete(&mut self) {
        let downloaded = self.buffer.downloaded_length();
        if let Some(total) = self.buffer.total_length() {
            if downloaded < total {
                self.on_error(LoaderError::Connection(format!(
                    "body ended at {downloaded} of {total} bytes"
                )));
                return;
            }
        }

        self.buffer.finalize_length();
        self.advance_pending();
        // Anything still registered cannot grow any further.
        let leftovers = self.pending.resolve_all(downloaded);
        self.deliver(leftovers);
        self.waiting_since = None;

        debug!(url = %self.url, downloaded, "coordinator: download complete");
        self.notifier.finished(self.buffer.snapshot());
        self.set_state(LoaderState::Completed);
    }

    fn on_error(&mut self, error: LoaderError) {
        if error.is_transient() && self.consecutive_failures < self.settings.max_transient_retries
        {
            self.consecutive_failures += 1;
            let from_offset = self.buffer.downloaded_length();
            warn!(
                %error,
                attempt = self.consecutive_failures,
                from_offset,
                "coordinator: transient download error, restarting"
            );
            if let Err(e) = self.session.start(from_offset, self.settings.retry_delay) {
                self.fail(e);
            }
            return;
        }
        self.fail(error);
    }

    /// Enter the terminal `Failed` state.
    fn fail(&mut self, error: LoaderError) {
        if self.failure.is_some() {
            return;
        }
        warn!(url = %self.url, %error, "coordinator: download failed");
        if self.session.is_active() {
            self.session.cancel();
        }
        self.failure = Some(error.clone());
        self.notifier.failed(&error);
        for req in self.pending.drain() {
            if let Some(tx) = self.waiters.remove(&req.id) {
                let _ = tx.send(Err(error.clone()));
            }
        }
        self.waiting_since = None;
        self.set_state(LoaderState::Failed);
    }

    // ----------------------------
    // Pending reads / readiness / stalls
    // ----------------------------

    fn read_range(&self, offset: u64, end: u64) -> LoaderResult<Bytes> {
        if end <= offset {
            return Ok(Bytes::new());
        }
        self.buffer.read(offset, end - offset)
    }

    fn advance_pending(&mut self) {
        let advances = self.pending.advance_all(&self.buffer);
        self.deliver(advances);
        if self.pending.is_empty() {
            self.waiting_since = None;
        }
    }

    fn deliver(&mut self, advances: Vec<Advance>) {
        for advance in advances {
            if !advance.satisfied {
                trace!(
                    id = %advance.id,
                    newly_available = advance.newly_available,
                    "coordinator: pending read progressed"
                );
                continue;
            }
            let result = self.read_range(advance.offset, advance.offset + advance.length);
            if let Some(tx) = self.waiters.remove(&advance.id) {
                trace!(id = %advance.id, len = advance.length, "coordinator: pending read fulfilled");
                let _ = tx.send(result);
            }
        }
    }

    /// `Priming -> Streaming` once the prebuffer threshold is reached or the first read is
    /// servable, whichever comes first.
    fn check_ready(&mut self) {
        if self.state != LoaderState::Priming {
            return;
        }
        let downloaded = self.buffer.downloaded_length();
        let total = self.buffer.total_length();
        let threshold = total.map_or(self.settings.prebuffer_bytes, |total| {
            self.settings.prebuffer_bytes.min(total)
        });
        let first_servable = self.first_request.is_some_and(|(offset, length)| {
            resolve_end(offset, length, total).is_some_and(|end| end <= downloaded)
        });

        if downloaded >= threshold || first_servable {
            self.notifier.ready_to_play();
            self.set_state(LoaderState::Streaming);
        }
    }

    pub(crate) fn check_stall(&mut self) {
        if self.state != LoaderState::Streaming
            || self.pending.is_empty()
            || !self.session.is_active()
        {
            return;
        }
        let since = match self.waiting_since {
            Some(waiting) => waiting.max(self.last_chunk_at),
            None => self.last_chunk_at,
        };
        if since.elapsed() >= self.settings.stall_timeout {
            warn!(
                pending = self.pending.len(),
                downloaded = self.buffer.downloaded_length(),
                "coordinator: playback stalled"
            );
            self.notifier.playback_stalled();
            self.set_state(LoaderState::Stalled);
        }
    }
}
