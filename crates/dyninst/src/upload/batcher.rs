#![forbid(unsafe_code)]

use crate::ratelimit::{LogLimiter, TokenBucket};
use crate::upload::{BatchId, BatcherState, Effects, Items, Outcome, SendResult, Sender};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Handle to a running batching loop.
///
/// `enqueue` and `stop` may be called concurrently from any task. Dropping
/// the handle without calling `stop` lets the loop flush and exit on its own,
/// but nothing waits for it.
#[derive(Debug)]
pub struct Batcher {
    name: Arc<str>,
    items_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Batcher {
    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(name: impl Into<Arc<str>>, policy: config::Upload, sender: Arc<dyn Sender>) -> Self {
        Self::spawn_with_log_limiter(
            name,
            policy,
            sender,
            Box::new(TokenBucket::new(Duration::from_secs(10), 1)),
        )
    }

    pub fn spawn_with_log_limiter(
        name: impl Into<Arc<str>>,
        policy: config::Upload,
        sender: Arc<dyn Sender>,
        log_limiter: Box<dyn LogLimiter>,
    ) -> Self {
        let name = name.into();
        let (items_tx, items_rx) = mpsc::channel(policy.queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let effects = LoopEffects {
            sender,
            results: results_tx,
            tracker: tracker.clone(),
            deadline: None,
        };
        let event_loop = EventLoop {
            name: Arc::clone(&name),
            state: BatcherState::new(policy),
            effects,
            items: items_rx,
            results: results_rx,
            log_limiter,
        };
        tracker.spawn(event_loop.run(cancel.clone()));

        Self {
            name,
            items_tx,
            cancel,
            tracker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand an item to the loop, waiting while the queue is full. Returns
    /// `false` if the batcher has been stopped, in which case the item is
    /// dropped.
    pub async fn enqueue(&self, item: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                trace!(batcher = %self.name, "batcher stopped, dropping item");
                false
            }
            sent = self.items_tx.send(item) => sent.is_ok(),
        }
    }

    /// Stop accepting items, flush or discard what is buffered, and wait for
    /// every outstanding send to finish. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct LoopEffects {
    sender: Arc<dyn Sender>,
    results: mpsc::UnboundedSender<SendResult>,
    tracker: TaskTracker,
    deadline: Option<Instant>,
}

impl Effects for LoopEffects {
    fn send_batch(&mut self, id: BatchId, items: Items) {
        let sender = Arc::clone(&self.sender);
        let results = self.results.clone();
        self.tracker.spawn(async move {
            let result = sender.send(&items).await;
            // The loop only goes away once every in-flight result is in.
            let _ = results.send(SendResult { id, result });
        });
    }

    fn reset_timer(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    fn clear_timer(&mut self) {
        self.deadline = None;
    }
}

struct EventLoop {
    name: Arc<str>,
    state: BatcherState,
    effects: LoopEffects,
    items: mpsc::Receiver<Bytes>,
    results: mpsc::UnboundedReceiver<SendResult>,
    log_limiter: Box<dyn LogLimiter>,
}

impl EventLoop {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let deadline = self.effects.deadline;
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(result) = self.results.recv() => self.on_result(result),
                item = self.items.recv() => match item {
                    Some(item) => self.on_item(item),
                    // Every handle is gone.
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.effects.deadline = None;
                    self.state.handle_timer_fired(Instant::now(), &mut self.effects);
                }
            }
        }

        // Items already accepted by `enqueue` are part of the final flush.
        self.items.close();
        while let Ok(item) = self.items.try_recv() {
            self.on_item(item);
        }
        let summary = self.state.handle_stop(&mut self.effects);
        while self.state.in_flight_batches() > 0 {
            match self.results.recv().await {
                Some(result) => self.on_result(result),
                None => break,
            }
        }
        info!(
            batcher = %self.name,
            flushed_batches = summary.flushed_batches,
            discarded_items = summary.discarded_items,
            "batcher stopped"
        );
    }

    fn on_item(&mut self, item: Bytes) {
        if let Err(err) = self
            .state
            .handle_enqueue(Instant::now(), item, &mut self.effects)
        {
            debug!(batcher = %self.name, %err, "dropping item");
        }
    }

    fn on_result(&mut self, result: SendResult) {
        let id = result.id;
        let outcome = match self
            .state
            .handle_outcome(Instant::now(), result, &mut self.effects)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(batcher = %self.name, %err, "ignoring send result");
                return;
            }
        };
        match outcome {
            Outcome::Delivered { items } => {
                debug!(batcher = %self.name, batch_id = %id, items, "batch delivered");
            }
            Outcome::Retrying {
                attempt,
                after,
                error,
            } => {
                if self.log_limiter.allow() {
                    warn!(batcher = %self.name, batch_id = %id, attempt, ?after, err = %error, "failed to send batch, will retry");
                } else {
                    debug!(batcher = %self.name, batch_id = %id, attempt, ?after, err = %error, "failed to send batch, will retry");
                }
            }
            Outcome::Dropped {
                attempts,
                items,
                error,
            } => {
                if self.log_limiter.allow() {
                    warn!(batcher = %self.name, batch_id = %id, attempts, items, err = %error, "dropping batch");
                } else {
                    debug!(batcher = %self.name, batch_id = %id, attempts, items, err = %error, "dropping batch");
                }
            }
        }
    }
}
