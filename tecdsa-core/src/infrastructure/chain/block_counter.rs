use crate::foundation::{CancelToken, OperatorError, Result};
use crate::infrastructure::chain::BlockCounter;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// First retry delay after the new-head subscription fails.
pub const SUBSCRIPTION_RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const SUBSCRIPTION_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Per-watcher buffer. A watcher that is not draining loses heights rather
/// than blocking the notification loop.
const WATCHER_CHANNEL_CAPACITY: usize = 1;

/// A source of new-head notifications the counter can (re)subscribe to.
#[async_trait]
pub trait HeadSubscription: Send + Sync {
    /// Opens a subscription; the stream ends when the subscription dies.
    async fn subscribe(&self) -> Result<mpsc::Receiver<u64>>;
}

struct Watcher {
    id: u64,
    sender: mpsc::Sender<u64>,
}

struct CounterState {
    latest_height: u64,
    waiters: BTreeMap<u64, Vec<oneshot::Sender<u64>>>,
    watchers: Vec<Watcher>,
    next_watcher_id: u64,
}

/// Block counter fed by new-head notifications.
///
/// A notification that jumps several heights fires every intermediate
/// height in order, so waiters registered between notifications are never
/// skipped. Waiters are only ever woken by real chain progress.
pub struct RelayedBlockCounter {
    state: Arc<Mutex<CounterState>>,
}

impl RelayedBlockCounter {
    pub fn new(initial_height: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(CounterState {
                latest_height: initial_height,
                waiters: BTreeMap::new(),
                watchers: Vec::new(),
                next_watcher_id: 0,
            })),
        })
    }

    /// Feeds one observed chain head into the counter.
    pub fn notify_height(&self, observed: u64) {
        loop {
            let (height, waiters, watchers) = {
                let mut state = self.state.lock().expect("counter lock");
                if state.latest_height >= observed {
                    return;
                }
                let height = state.latest_height + 1;
                state.latest_height = height;
                let waiters = state.waiters.remove(&height).unwrap_or_default();
                let watchers: Vec<(u64, mpsc::Sender<u64>)> =
                    state.watchers.iter().map(|w| (w.id, w.sender.clone())).collect();
                (height, waiters, watchers)
            };

            for waiter in waiters {
                let _ = waiter.send(height);
            }

            let mut closed = Vec::new();
            for (id, sender) in watchers {
                match sender.try_send(height) {
                    Ok(()) => {}
                    // Not ready: this watcher simply misses the height.
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
                }
            }
            if !closed.is_empty() {
                let mut state = self.state.lock().expect("counter lock");
                state.watchers.retain(|w| !closed.contains(&w.id));
            }
        }
    }

    /// Forwards heights from `source` into the counter, resubscribing with
    /// bounded exponential backoff whenever the subscription fails.
    pub fn spawn_subscription<S>(self: &Arc<Self>, source: S)
    where
        S: HeadSubscription + 'static,
    {
        self.spawn_subscription_with_backoff(source, SUBSCRIPTION_RETRY_INITIAL_BACKOFF);
    }

    pub fn spawn_subscription_with_backoff<S>(self: &Arc<Self>, source: S, initial_backoff: Duration)
    where
        S: HeadSubscription + 'static,
    {
        let counter = self.clone();
        tokio::spawn(async move {
            let mut backoff = initial_backoff;
            loop {
                match source.subscribe().await {
                    Ok(mut heights) => {
                        debug!("subscribed to new blocks");
                        backoff = initial_backoff;
                        while let Some(height) = heights.recv().await {
                            counter.notify_height(height);
                        }
                        warn!("subscription to new blocks interrupted");
                    }
                    Err(err) => {
                        warn!(%err, "could not create subscription to new blocks");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(SUBSCRIPTION_RETRY_MAX_BACKOFF);
            }
        });
    }

    pub fn latest_height(&self) -> u64 {
        self.state.lock().expect("counter lock").latest_height
    }
}

#[async_trait]
impl BlockCounter for RelayedBlockCounter {
    async fn wait_for_block_height(&self, height: u64) -> Result<()> {
        let receiver = {
            let mut state = self.state.lock().expect("counter lock");
            if state.latest_height >= height {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(height).or_default().push(tx);
            rx
        };
        receiver
            .await
            .map(|_| ())
            .map_err(|_| OperatorError::Message("block counter terminated".to_string()))
    }

    fn watch_blocks(&self, cancel: CancelToken) -> mpsc::Receiver<u64> {
        let (tx, rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
        let id = {
            let mut state = self.state.lock().expect("counter lock");
            let id = state.next_watcher_id;
            state.next_watcher_id += 1;
            state.watchers.push(Watcher { id, sender: tx });
            id
        };

        // Removing the watcher drops its sender, which ends the consumer's
        // stream. Weak keeps the watcher task from outliving the counter.
        let state = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(state) = state.upgrade() {
                let mut state = state.lock().expect("counter lock");
                state.watchers.retain(|w| w.id != id);
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::cancellation;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn waiting_for_reached_height_returns_immediately() {
        let counter = RelayedBlockCounter::new(100);
        counter.wait_for_block_height(100).await.expect("current height");
        counter.wait_for_block_height(1).await.expect("past height");
    }

    #[tokio::test]
    async fn waiter_fires_exactly_at_target_height() {
        let counter = RelayedBlockCounter::new(100);
        let waiter = tokio::spawn({
            let counter = counter.clone();
            async move { counter.wait_for_block_height(105).await }
        });

        for height in 101..=104 {
            counter.notify_height(height);
        }
        assert!(!waiter.is_finished());

        counter.notify_height(105);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("timely")
            .expect("join")
            .expect("wait result");
    }

    #[tokio::test]
    async fn watcher_observes_consecutive_heights() {
        let counter = RelayedBlockCounter::new(100);
        let (_handle, cancel) = cancellation();
        let mut watcher = counter.watch_blocks(cancel);

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(height) = watcher.recv().await {
                seen.push(height);
                if height == 105 {
                    break;
                }
            }
            seen
        });

        for height in 101..=105 {
            counter.notify_height(height);
            // Let the observer drain so no height is dropped.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let seen = tokio::time::timeout(Duration::from_secs(1), observer).await.expect("timely").expect("join");
        assert_eq!(seen, vec![101, 102, 103, 104, 105]);
    }

    #[tokio::test]
    async fn notification_jump_fires_intermediate_heights() {
        let counter = RelayedBlockCounter::new(10);
        let waiter = tokio::spawn({
            let counter = counter.clone();
            async move { counter.wait_for_block_height(12).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        counter.notify_height(15);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("timely")
            .expect("join")
            .expect("wait result");
        assert_eq!(counter.latest_height(), 15);
    }

    #[tokio::test]
    async fn slow_watcher_drops_heights_but_stays_increasing() {
        let counter = RelayedBlockCounter::new(0);
        let (_handle, cancel) = cancellation();
        let mut watcher = counter.watch_blocks(cancel);

        for height in 1..=50 {
            counter.notify_height(height);
        }

        let mut seen = Vec::new();
        while let Ok(height) = watcher.try_recv() {
            seen.push(height);
        }
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "heights must be strictly increasing");
    }

    #[tokio::test]
    async fn cancelled_watcher_stream_ends() {
        let counter = RelayedBlockCounter::new(0);
        let (handle, cancel) = cancellation();
        let mut watcher = counter.watch_blocks(cancel);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        counter.notify_height(1);
        assert!(tokio::time::timeout(Duration::from_millis(200), watcher.recv()).await.expect("closed").is_none());
    }

    struct FlakySource {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl HeadSubscription for FlakySource {
        async fn subscribe(&self) -> Result<mpsc::Receiver<u64>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                return Err(OperatorError::ChainTransient {
                    operation: "subscribe".to_string(),
                    details: "connection refused".to_string(),
                });
            }
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for height in 1..=3 {
                    let _ = tx.send(height).await;
                }
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn subscription_retries_until_heights_flow() {
        let counter = RelayedBlockCounter::new(0);
        counter.spawn_subscription_with_backoff(FlakySource { attempts: AtomicU32::new(0) }, Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(2), counter.wait_for_block_height(3))
            .await
            .expect("timely")
            .expect("heights flow after retries");
    }
}
