//! Reactive watcher over the externally supplied referenced-attachment
//! stream.
//!
//! Each emission is the complete current set of referenced attachments and
//! is forwarded wholesale to the reconciler; diffing against stored state is
//! the reconciler's job. Backpressure is latest-emission-wins: if emissions
//! arrive faster than reconciliation, intermediate snapshots are dropped.

use marina_core::{WatchedAttachmentItem, WatchedAttachmentStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use futures::StreamExt;

/// A live subscription to the referenced-attachment stream.
pub(crate) struct WatcherSubscription {
    /// Latest emission; `None` until the source has emitted once. The
    /// `tokio::sync::watch` channel provides the required coalescing.
    pub emissions: watch::Receiver<Option<Vec<WatchedAttachmentItem>>>,
    /// The forwarding task; ends on shutdown or when the source terminates.
    pub task: JoinHandle<()>,
}

/// Subscribe to `stream`, forwarding emissions until `shutdown` flips true
/// or the source ends. Source termination is fatal to the subscription; a
/// later `start()` subscribes afresh.
pub(crate) fn subscribe(
    mut stream: WatchedAttachmentStream,
    mut shutdown: watch::Receiver<bool>,
) -> WatcherSubscription {
    let (tx, rx) = watch::channel(None);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("watcher: shutdown");
                        break;
                    }
                }
                emission = stream.next() => {
                    match emission {
                        Some(items) => {
                            debug!(referenced = items.len(), "watcher: emission");
                            if tx.send(Some(items)).is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!("watcher: source stream ended, subscription closed");
                            break;
                        }
                    }
                }
            }
        }
    });

    WatcherSubscription { emissions: rx, task }
}
