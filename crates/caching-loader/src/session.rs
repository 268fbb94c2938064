//! The single network fetch for a resource.
//!
//! A [`DownloadSession`] owns at most one running fetch task. Every start bumps the session
//! epoch; the task tags everything it sends with the epoch it was started under, and the
//! coordinator asks the session whether an event is still current before acting on it. A
//! cancelled (or superseded) fetch whose events are still queued is therefore ignored even
//! when a newer fetch is writing to the same buffer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::error::{LoaderError, LoaderResult};
use crate::transport::Transport;

/// Lifecycle of the download session.
#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    Active { from_offset: u64 },
    Finished,
    Failed(LoaderError),
}

/// Metadata from an opened response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub total_length: Option<u64>,
    pub content_type: Option<String>,
}

/// What a fetch task reports.
#[derive(Debug)]
pub enum SessionEventKind {
    Opened(ResponseMeta),
    Chunk { offset: u64, bytes: Bytes },
    Complete,
    Failed(LoaderError),
}

/// A fetch task report, tagged with the epoch it belongs to.
#[derive(Debug)]
pub struct SessionEvent {
    pub epoch: u64,
    pub kind: SessionEventKind,
}

/// Owner of the single active fetch.
pub struct DownloadSession {
    url: Url,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<SessionEvent>,
    parent_cancel: CancellationToken,
    idle_timeout: Duration,

    state: SessionState,
    epoch: u64,
    task_cancel: Option<CancellationToken>,
}

impl DownloadSession {
    pub fn new(
        url: Url,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<SessionEvent>,
        parent_cancel: CancellationToken,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            url,
            transport,
            events,
            parent_cancel,
            idle_timeout,
            state: SessionState::Idle,
            epoch: 0,
            task_cancel: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    /// Start fetching from `from_offset`, after waiting `delay`.
    ///
    /// Fails with [`LoaderError::AlreadyActive`] while a fetch is running. Returns the new epoch.
    pub fn start(&mut self, from_offset: u64, delay: Duration) -> LoaderResult<u64> {
        if let SessionState::Active { from_offset } = self.state {
            return Err(LoaderError::AlreadyActive { from_offset });
        }

        self.epoch += 1;
        let cancel = self.parent_cancel.child_token();
        self.task_cancel = Some(cancel.clone());
        self.state = SessionState::Active { from_offset };

        debug!(epoch = self.epoch, from_offset, ?delay, "session: start");

        let task = FetchTask {
            epoch: self.epoch,
            url: self.url.clone(),
            from_offset,
            delay,
            idle_timeout: self.idle_timeout,
            transport: Arc::clone(&self.transport),
            events: self.events.clone(),
            cancel,
        };
        tokio::spawn(task.run());

        Ok(self.epoch)
    }

    /// Stop the running fetch (if any) and go back to `Idle`.
    ///
    /// Events the task already queued stay in the channel; [`accepts`](Self::accepts) rejects
    /// them from now on.
    pub fn cancel(&mut self) {
        if let Some(token) = self.task_cancel.take() {
            debug!(epoch = self.epoch, "session: cancel");
            token.cancel();
        }
        self.state = SessionState::Idle;
    }

    /// Whether an event tagged with `epoch` belongs to the running fetch.
    pub fn accepts(&self, epoch: u64) -> bool {
        self.is_active() && epoch == self.epoch
    }

    /// Record completion of the current fetch. Returns `false` for stale events.
    pub fn on_complete(&mut self, epoch: u64) -> bool {
        if !self.accepts(epoch) {
            return false;
        }
        self.task_cancel = None;
        self.state = SessionState::Finished;
        true
    }

    /// Record failure of the current fetch. Returns `false` for stale events.
    pub fn on_error(&mut self, epoch: u64, error: LoaderError) -> bool {
        if !self.accepts(epoch) {
            return false;
        }
        self.task_cancel = None;
        self.state = SessionState::Failed(error);
        true
    }
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        if let Some(token) = self.task_cancel.take() {
            token.cancel();
        }
    }
}

struct FetchTask {
    epoch: u64,
    url: Url,
    from_offset: u64,
    delay: Duration,
    idle_timeout: Duration,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl FetchTask {
    async fn run(self) {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            outcome = self.fetch() => outcome,
        };

        let kind = match outcome {
            Ok(true) => SessionEventKind::Complete,
            // Coordinator went away.
            Ok(false) => return,
            Err(e) => SessionEventKind::Failed(e),
        };
        let _ = self.send(kind).await;
    }

    async fn send(&self, kind: SessionEventKind) -> bool {
        self.events
            .send(SessionEvent {
                epoch: self.epoch,
                kind,
            })
            .await
            .is_ok()
    }

    /// Returns `Ok(false)` if the coordinator stopped listening.
    async fn fetch(&self) -> LoaderResult<bool> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let response = self.transport.open(&self.url, self.from_offset).await?;
        if response.offset > self.from_offset {
            return Err(LoaderError::msg(format!(
                "response starts at {} past requested offset {}",
                response.offset, self.from_offset
            )));
        }

        let meta = ResponseMeta {
            total_length: response.total_length,
            content_type: response.content_type,
        };
        if !self.send(SessionEventKind::Opened(meta)).await {
            return Ok(false);
        }

        let mut body = response.body;
        let mut position = response.offset;

        loop {
            let next = match tokio::time::timeout(self.idle_timeout, body.next()).await {
                Ok(next) => next,
                Err(_) => return Err(LoaderError::Timeout(self.url.to_string())),
            };

            let mut chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(true),
            };

            // The server may have ignored the range: drop what is already buffered.
            if position < self.from_offset {
                let skip = (self.from_offset - position).min(chunk.len() as u64);
                chunk = chunk.slice(skip as usize..);
                position += skip;
            }
            if chunk.is_empty() {
                continue;
            }

            let len = chunk.len() as u64;
            trace!(epoch = self.epoch, offset = position, len, "session: chunk");
            if !self
                .send(SessionEventKind::Chunk {
                    offset: position,
                    bytes: chunk,
                })
                .await
            {
                return Ok(false);
            }
            position += len;
        }
    }
}
