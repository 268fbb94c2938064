use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use caching_loader::{
    CachingPlayerItem, HttpTransport, LoaderError, LoaderObserver, LoaderParams, LoaderSettings,
    RangeResponse,
};
use tracing::metadata::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Logs lifecycle callbacks the way a player UI would react to them.
struct ConsoleObserver;

impl LoaderObserver for ConsoleObserver {
    fn on_progress(&self, bytes_downloaded: u64, bytes_expected: Option<u64>) {
        match bytes_expected {
            Some(total) if total > 0 => info!(
                "downloaded {bytes_downloaded}/{total} ({:.0}%)",
                bytes_downloaded as f64 * 100.0 / total as f64
            ),
            _ => info!("downloaded {bytes_downloaded} bytes"),
        }
    }

    fn on_ready_to_play(&self) {
        info!("ready to play");
    }

    fn on_playback_stalled(&self) {
        warn!("playback stalled");
    }

    fn on_finished(&self, data: bytes::Bytes) {
        info!("finished, {} bytes cached", data.len());
    }

    fn on_failed(&self, error: &LoaderError) {
        warn!("failed: {error}");
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::default()
                .add_directive("caching_loader=debug".parse()?)
                .add_directive(LevelFilter::INFO.into()),
        )
        .with_line_number(false)
        .with_file(false)
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://www.soundhelix.com/examples/mp3/SoundHelix-Song-1.mp3".into());
    let url = url::Url::parse(&url)?;

    let settings = LoaderSettings::default()
        .prebuffer_bytes(512 * 1024)
        .stall_timeout(Duration::from_secs(3));
    let observer = Arc::new(ConsoleObserver);
    let transport = HttpTransport::new(reqwest::Client::new(), settings.request_timeout);
    let params = LoaderParams::new(url, settings).observer(&observer);
    let item = CachingPlayerItem::spawn(params, Arc::new(transport));

    // A player typically probes the header first, then seeks around.
    let header = item.read(0, Some(16)).await?;
    info!("header: {:02x?}", &header[..]);

    let info = item.content_info().await?;
    info!(
        "content type: {:?}, length: {:?}",
        info.content_type, info.total_length
    );

    if let Some(total) = info.total_length {
        let tail_offset = total.saturating_sub(128);
        match item.request(tail_offset, Some(128)).await? {
            RangeResponse::Ready(bytes) => info!("tail already cached ({} bytes)", bytes.len()),
            RangeResponse::Pending(read) => {
                info!("tail pending as {}, waiting for the download", read.id());
                let bytes = read.wait().await?;
                info!("tail arrived ({} bytes)", bytes.len());
            }
        }
    }

    let mut state = item.watch_state();
    while !matches!(
        *state.borrow_and_update(),
        caching_loader::LoaderState::Completed | caching_loader::LoaderState::Failed
    ) {
        state.changed().await?;
    }
    info!("final state: {:?}", item.state());

    Ok(())
}
