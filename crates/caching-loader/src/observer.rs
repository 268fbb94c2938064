//! Lifecycle notifications for whoever owns playback.
//!
//! Two delivery paths exist side by side:
//! - [`LoaderObserver`]: a callback trait whose methods are all optional (default no-ops).
//!   The loader only holds it weakly, so an owner may keep the item without forming a cycle.
//! - [`LoaderEvent`]: the same notifications on a `broadcast` feed, for consumers that prefer
//!   channels (and for tests).
//!
//! [`Notifier`] is the single place both are fed from. It enforces the ordering contract:
//! - `ReadyToPlay` is emitted at most once and always precedes `Finished`;
//! - progress values never decrease;
//! - `Failed` is terminal: nothing is emitted after it.

use std::sync::Weak;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::LoaderError;

/// Receiver of loader lifecycle callbacks.
///
/// Callbacks run on the coordinator task; they should return quickly.
pub trait LoaderObserver: Send + Sync + 'static {
    /// A new portion of data was received.
    fn on_progress(&self, _bytes_downloaded: u64, _bytes_expected: Option<u64>) {}

    /// Initial prebuffering finished; playback can start.
    fn on_ready_to_play(&self) {}

    /// Data needed by the player did not arrive in time.
    fn on_playback_stalled(&self) {}

    /// The whole resource is downloaded.
    fn on_finished(&self, _data: Bytes) {}

    /// Downloading failed for good.
    fn on_failed(&self, _error: &LoaderError) {}
}

/// Events emitted on the loader's broadcast feed.
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    Progress {
        bytes_downloaded: u64,
        bytes_expected: Option<u64>,
    },
    ReadyToPlay,
    PlaybackStalled,
    Finished {
        data: Bytes,
    },
    Failed {
        error: LoaderError,
    },
}

/// Fan-out of notifications to the observer and the event feed.
pub(crate) struct Notifier {
    observer: Option<Weak<dyn LoaderObserver>>,
    events: broadcast::Sender<LoaderEvent>,
    ready_sent: bool,
    terminal: bool,
    last_progress: Option<u64>,
}

impl Notifier {
    pub(crate) fn new(
        observer: Option<Weak<dyn LoaderObserver>>,
        events: broadcast::Sender<LoaderEvent>,
    ) -> Self {
        Self {
            observer,
            events,
            ready_sent: false,
            terminal: false,
            last_progress: None,
        }
    }

    fn with_observer(&self, f: impl FnOnce(&dyn LoaderObserver)) {
        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            f(observer.as_ref());
        }
    }

    fn emit(&self, event: LoaderEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn progress(&mut self, bytes_downloaded: u64, bytes_expected: Option<u64>) {
        if self.terminal || self.last_progress.is_some_and(|last| bytes_downloaded < last) {
            return;
        }
        self.last_progress = Some(bytes_downloaded);
        self.with_observer(|o| o.on_progress(bytes_downloaded, bytes_expected));
        self.emit(LoaderEvent::Progress {
            bytes_downloaded,
            bytes_expected,
        });
    }

    pub(crate) fn ready_to_play(&mut self) {
        if self.terminal || self.ready_sent {
            return;
        }
        self.ready_sent = true;
        trace!("notifier: ready to play");
        self.with_observer(|o| o.on_ready_to_play());
        self.emit(LoaderEvent::ReadyToPlay);
    }

    pub(crate) fn playback_stalled(&mut self) {
        if self.terminal {
            return;
        }
        trace!("notifier: playback stalled");
        self.with_observer(|o| o.on_playback_stalled());
        self.emit(LoaderEvent::PlaybackStalled);
    }

    pub(crate) fn finished(&mut self, data: Bytes) {
        if self.terminal {
            return;
        }
        self.ready_to_play();
        trace!(len = data.len(), "notifier: finished");
        self.with_observer(|o| o.on_finished(data.clone()));
        self.emit(LoaderEvent::Finished { data });
    }

    pub(crate) fn failed(&mut self, error: &LoaderError) {
        if self.terminal {
            return;
        }
        self.terminal = true;
        trace!(%error, "notifier: failed");
        self.with_observer(|o| o.on_failed(error));
        self.emit(LoaderEvent::Failed {
            error: error.clone(),
        });
    }
}
