//! Progress feedback shown on the placeholder message while a slow
//! generation runs. The ticker lives inside the select loop, so it stops the
//! instant the awaited operation produces a value and a stale status edit
//! can never land after real content.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use murmur_platform::ChatPlatform;

const PROGRESS_FRAMES: [&str; 3] = [
    "Still working on it...",
    "Still working, this one is taking a while...",
    "Almost there...",
];

/// Awaits `operation`, editing the placeholder with a progress frame every
/// `interval_ms`. A zero interval disables the ticker entirely. Edit
/// failures stop the ticker but never the operation.
pub(crate) async fn with_progress_ticks<T, F>(
    platform: &dyn ChatPlatform,
    channel_id: &str,
    message_ts: &str,
    interval_ms: u64,
    operation: F,
) -> T
where
    F: Future<Output = T>,
{
    if interval_ms == 0 {
        return operation.await;
    }

    tokio::pin!(operation);
    let mut frame_index = 0usize;
    let mut ticking = true;
    loop {
        tokio::select! {
            result = &mut operation => return result,
            _ = sleep(Duration::from_millis(interval_ms)), if ticking => {
                let frame = PROGRESS_FRAMES[frame_index.min(PROGRESS_FRAMES.len() - 1)];
                frame_index += 1;
                if let Err(error) = platform.update_message(channel_id, message_ts, frame).await {
                    debug!(%error, "progress update failed; stopping the ticker");
                    ticking = false;
                }
            }
        }
    }
}
