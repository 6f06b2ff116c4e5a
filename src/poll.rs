use crate::bus::{ChannelEvent, ChannelRegistry};
use crate::store::{Seq, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CURSOR_NAME: &str = "delivery";

/// Poll-based delivery producer: re-reads the message log tail beyond the
/// last-seen sequence on a fixed interval and publishes anything new to the
/// conversation channels.
///
/// The cursor survives a single-process restart through the store; it is
/// not shared across processes. A failing scan skips the cycle and retries
/// on the next tick.
pub struct PollWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollWorker {
    pub fn start(
        store: Arc<dyn Storage>,
        channels: Arc<ChannelRegistry>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut cursor = match store.load_cursor(CURSOR_NAME).await {
                Ok(saved) => saved.unwrap_or(0),
                Err(e) => {
                    warn!("could not load delivery cursor, starting from 0: {e}");
                    0
                }
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!("poll delivery worker started (interval {interval:?})");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cursor = scan(&*store, &channels, cursor).await;
                    }
                    _ = stop_rx.changed() => {
                        info!("poll delivery worker stopping");
                        break;
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Stop the worker and wait for the in-flight cycle to finish.
    /// No events are published after this returns.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// One poll cycle. Returns the advanced cursor; on a store failure the
/// cursor is left untouched so the next tick re-reads the same tail.
async fn scan(store: &dyn Storage, channels: &ChannelRegistry, cursor: Seq) -> Seq {
    let batch = match store.messages_after(cursor).await {
        Ok(batch) => batch,
        Err(e) => {
            warn!("poll cycle skipped, store unavailable: {e}");
            return cursor;
        }
    };

    if batch.is_empty() {
        return cursor;
    }

    debug!("poll cycle dispatching {} new message(s)", batch.len());
    let mut advanced = cursor;
    for (seq, message) in batch {
        advanced = advanced.max(seq);
        let conversation_id = message.conversation_id.clone();
        channels.publish(&conversation_id, ChannelEvent::Message(message));
    }

    if let Err(e) = store.save_cursor(CURSOR_NAME, advanced).await {
        // Not fatal: worst case a restart re-delivers the tail once.
        warn!("could not persist delivery cursor: {e}");
    }

    advanced
}
