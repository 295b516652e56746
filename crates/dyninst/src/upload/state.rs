#![forbid(unsafe_code)]

//! Batching policy as a pure state machine.
//!
//! [`BatcherState`] never performs I/O or touches a clock. Every handler is
//! given the current time and an [`Effects`] sink through which it requests
//! sends and timer changes; the event loop in [`super::Batcher`] carries them
//! out and feeds the results back in as further events.

use crate::upload::SendError;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Items of one batch, in enqueue order. Shared between the state and the
/// send in progress so a retry resends the very same items.
pub type Items = Arc<[Bytes]>;

/// Side effects the state machine may request.
pub trait Effects {
    /// Start an asynchronous send whose outcome comes back as a
    /// [`SendResult`].
    fn send_batch(&mut self, id: BatchId, items: Items);

    /// Fire [`BatcherState::handle_timer_fired`] at `deadline`, replacing any
    /// previously armed deadline.
    fn reset_timer(&mut self, deadline: Instant);

    fn clear_timer(&mut self);
}

#[derive(Debug)]
pub struct SendResult {
    pub id: BatchId,
    pub result: Result<(), SendError>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("outcome for unknown batch {0}")]
    UnknownBatch(BatchId),

    #[error("batcher is stopped")]
    Stopped,
}

/// What became of a batch once its send finished.
#[derive(Debug)]
pub enum Outcome {
    Delivered { items: usize },
    /// The batch is parked and will be resent once `after` has elapsed.
    Retrying {
        attempt: u32,
        after: Duration,
        error: SendError,
    },
    /// Retries exhausted, or the batcher stopped before a retry could run.
    Dropped {
        attempts: u32,
        items: usize,
        error: SendError,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StopSummary {
    pub flushed_batches: usize,
    pub discarded_items: usize,
}

#[derive(Debug)]
struct Batch {
    items: Items,
    /// Failed sends so far.
    attempts: u32,
}

#[derive(Debug)]
struct Parked {
    batch: Batch,
    not_before: Instant,
}

#[derive(Debug)]
pub struct BatcherState {
    policy: config::Upload,
    buffer: Vec<Bytes>,
    buffer_bytes: usize,
    /// When the oldest buffered item arrived.
    buffer_since: Option<Instant>,
    /// Formed batches waiting for a send slot. Keyed by id, so the oldest
    /// batch, including one coming back from a retry, goes first.
    ready: BTreeMap<BatchId, Batch>,
    in_flight: BTreeMap<BatchId, Batch>,
    parked: BTreeMap<BatchId, Parked>,
    next_id: u64,
    /// Deadline last handed to [`Effects::reset_timer`].
    timer: Option<Instant>,
    stopped: bool,
}

impl BatcherState {
    pub fn new(policy: config::Upload) -> Self {
        Self {
            policy,
            buffer: Vec::new(),
            buffer_bytes: 0,
            buffer_since: None,
            ready: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            parked: BTreeMap::new(),
            next_id: 0,
            timer: None,
            stopped: false,
        }
    }

    pub fn handle_enqueue(
        &mut self,
        now: Instant,
        item: Bytes,
        effects: &mut dyn Effects,
    ) -> Result<(), StateError> {
        if self.stopped {
            return Err(StateError::Stopped);
        }
        if !self.buffer.is_empty()
            && self.buffer_bytes.saturating_add(item.len()) > self.policy.max_batch_bytes
        {
            self.cut();
        }
        if self.buffer.is_empty() {
            self.buffer_since = Some(now);
        }
        self.buffer_bytes += item.len();
        self.buffer.push(item);
        if self.buffer.len() >= self.policy.max_batch_items
            || self.buffer_bytes >= self.policy.max_batch_bytes
        {
            self.cut();
        }
        self.dispatch(effects);
        self.rearm(effects);
        Ok(())
    }

    /// The deadline most recently requested through [`Effects::reset_timer`]
    /// has passed.
    pub fn handle_timer_fired(&mut self, now: Instant, effects: &mut dyn Effects) {
        self.timer = None;
        if self.stopped {
            return;
        }
        if self
            .buffer_since
            .and_then(|since| since.checked_add(self.policy.max_buffer_duration))
            .is_some_and(|due| due <= now)
        {
            self.cut();
        }
        let due: Vec<BatchId> = self
            .parked
            .iter()
            .filter(|(_, parked)| parked.not_before <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(parked) = self.parked.remove(&id) {
                self.ready.insert(id, parked.batch);
            }
        }
        self.dispatch(effects);
        self.rearm(effects);
    }

    pub fn handle_outcome(
        &mut self,
        now: Instant,
        result: SendResult,
        effects: &mut dyn Effects,
    ) -> Result<Outcome, StateError> {
        let SendResult { id, result } = result;
        let mut batch = self
            .in_flight
            .remove(&id)
            .ok_or(StateError::UnknownBatch(id))?;

        let outcome = match result {
            Ok(()) => Outcome::Delivered {
                items: batch.items.len(),
            },
            Err(error) => {
                batch.attempts += 1;
                let exhausted = self
                    .policy
                    .retry
                    .max_attempts
                    .is_some_and(|max| batch.attempts >= max);
                let after = self.policy.retry.backoff(batch.attempts);
                match now.checked_add(after) {
                    Some(not_before) if !exhausted && !self.stopped => {
                        let attempt = batch.attempts;
                        self.parked.insert(id, Parked { batch, not_before });
                        Outcome::Retrying {
                            attempt,
                            after,
                            error,
                        }
                    }
                    // Exhausted, stopped, or a backoff too long to schedule.
                    _ => Outcome::Dropped {
                        attempts: batch.attempts,
                        items: batch.items.len(),
                        error,
                    },
                }
            }
        };

        if !self.stopped {
            self.dispatch(effects);
            self.rearm(effects);
        }
        Ok(outcome)
    }

    /// Flush or discard everything not yet sent, depending on
    /// `flush_on_stop`, and disarm the timer. Sends already in flight are
    /// left to finish; their outcomes are still accepted, but failures are
    /// no longer retried. Calling this again is a no-op.
    pub fn handle_stop(&mut self, effects: &mut dyn Effects) -> StopSummary {
        let mut summary = StopSummary::default();
        if self.stopped {
            return summary;
        }
        self.stopped = true;

        if !self.buffer.is_empty() {
            self.cut();
        }
        for (id, parked) in std::mem::take(&mut self.parked) {
            self.ready.insert(id, parked.batch);
        }
        for (id, batch) in std::mem::take(&mut self.ready) {
            if self.policy.flush_on_stop {
                effects.send_batch(id, Arc::clone(&batch.items));
                self.in_flight.insert(id, batch);
                summary.flushed_batches += 1;
            } else {
                summary.discarded_items += batch.items.len();
            }
        }

        if self.timer.take().is_some() {
            effects.clear_timer();
        }
        summary
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn buffered_items(&self) -> usize {
        self.buffer.len()
    }

    pub fn ready_batches(&self) -> usize {
        self.ready.len()
    }

    pub fn in_flight_batches(&self) -> usize {
        self.in_flight.len()
    }

    pub fn parked_batches(&self) -> usize {
        self.parked.len()
    }

    pub fn timer(&self) -> Option<Instant> {
        self.timer
    }

    fn cut(&mut self) {
        let id = BatchId(self.next_id);
        self.next_id += 1;
        let items: Items = std::mem::take(&mut self.buffer).into();
        self.buffer_bytes = 0;
        self.buffer_since = None;
        self.ready.insert(id, Batch { items, attempts: 0 });
    }

    fn dispatch(&mut self, effects: &mut dyn Effects) {
        while self
            .policy
            .max_in_flight
            .is_none_or(|cap| self.in_flight.len() < cap)
        {
            let Some((id, batch)) = self.ready.pop_first() else {
                break;
            };
            effects.send_batch(id, Arc::clone(&batch.items));
            self.in_flight.insert(id, batch);
        }
    }

    /// Point the timer at the earliest of the buffer's age limit and the
    /// next parked retry.
    fn rearm(&mut self, effects: &mut dyn Effects) {
        let buffer_deadline = self
            .buffer_since
            .and_then(|since| since.checked_add(self.policy.max_buffer_duration));
        let retry_deadline = self.parked.values().map(|parked| parked.not_before).min();
        let deadline = buffer_deadline.into_iter().chain(retry_deadline).min();
        if deadline == self.timer {
            return;
        }
        self.timer = deadline;
        match deadline {
            Some(deadline) => effects.reset_timer(deadline),
            None => effects.clear_timer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Default)]
    struct Recorder {
        sent: Vec<(BatchId, Vec<Bytes>)>,
        timer: Option<Instant>,
    }

    impl Effects for Recorder {
        fn send_batch(&mut self, id: BatchId, items: Items) {
            self.sent.push((id, items.to_vec()));
        }

        fn reset_timer(&mut self, deadline: Instant) {
            self.timer = Some(deadline);
        }

        fn clear_timer(&mut self) {
            self.timer = None;
        }
    }

    /// Fire the timer the way the event loop does: the armed deadline is
    /// consumed before the state sees the event.
    fn fire(state: &mut BatcherState, fx: &mut Recorder, at: Instant) {
        fx.timer = None;
        state.handle_timer_fired(at, fx);
    }

    fn policy(max_items: usize) -> config::Upload {
        config::Upload {
            max_batch_items: max_items,
            max_batch_bytes: 1 << 20,
            max_buffer_duration: Duration::from_secs(1),
            max_in_flight: None,
            queue_capacity: 8,
            flush_on_stop: true,
            retry: config::Retry {
                base_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(4),
                max_attempts: Some(3),
            },
        }
    }

    fn item(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    fn failed(id: BatchId) -> SendResult {
        SendResult {
            id,
            result: Err(SendError::Rejected { status: 503 }),
        }
    }

    fn delivered(id: BatchId) -> SendResult {
        SendResult { id, result: Ok(()) }
    }

    #[test]
    fn size_and_timer_cut_batches_in_order() {
        let now = Instant::now();
        let mut state = BatcherState::new(policy(2));
        let mut fx = Recorder::default();

        for text in ["a", "b", "c", "d", "e"] {
            state.handle_enqueue(now, item(text), &mut fx).unwrap();
        }
        assert_eq!(fx.sent.len(), 2);
        assert_eq!(state.buffered_items(), 1);
        assert_eq!(fx.timer, Some(now + Duration::from_secs(1)));

        fire(&mut state, &mut fx, now + Duration::from_secs(1));
        let sent: Vec<_> = fx.sent.iter().map(|(_, items)| items.clone()).collect();
        assert_eq!(
            sent,
            vec![
                vec![item("a"), item("b")],
                vec![item("c"), item("d")],
                vec![item("e")],
            ]
        );
        assert_eq!(state.timer(), None);
        assert_eq!(fx.timer, None);
    }

    #[test]
    fn early_timer_leaves_young_buffer() {
        let now = Instant::now();
        let mut state = BatcherState::new(policy(10));
        let mut fx = Recorder::default();

        state.handle_enqueue(now, item("a"), &mut fx).unwrap();
        fire(&mut state, &mut fx, now + Duration::from_millis(999));
        assert!(fx.sent.is_empty());
        assert_eq!(fx.timer, Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn byte_limit_cuts_before_overflow() {
        let now = Instant::now();
        let mut state = BatcherState::new(config::Upload {
            max_batch_bytes: 8,
            ..policy(100)
        });
        let mut fx = Recorder::default();

        state.handle_enqueue(now, item("abc"), &mut fx).unwrap();
        state.handle_enqueue(now, item("defgh"), &mut fx).unwrap();
        assert_eq!(fx.sent, vec![(BatchId(0), vec![item("abc"), item("defgh")])]);

        state.handle_enqueue(now, item("xyz"), &mut fx).unwrap();
        state.handle_enqueue(now, item("0123456789abcdef"), &mut fx).unwrap();
        assert_eq!(fx.sent[1], (BatchId(1), vec![item("xyz")]));
        assert_eq!(fx.sent[2], (BatchId(2), vec![item("0123456789abcdef")]));
        assert_eq!(state.buffered_items(), 0);
    }

    #[test]
    fn failed_batch_is_resent_after_backoff() {
        let now = Instant::now();
        let mut state = BatcherState::new(policy(2));
        let mut fx = Recorder::default();
        state.handle_enqueue(now, item("a"), &mut fx).unwrap();
        state.handle_enqueue(now, item("b"), &mut fx).unwrap();
        assert_eq!(fx.sent.len(), 1);

        let outcome = state.handle_outcome(now, failed(BatchId(0)), &mut fx).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Retrying { attempt: 1, after, .. } if after == Duration::from_millis(500)
        ));
        assert_eq!(state.parked_batches(), 1);
        assert_eq!(fx.timer, Some(now + Duration::from_millis(500)));

        fire(&mut state, &mut fx, now + Duration::from_millis(500));
        assert_eq!(fx.sent.len(), 2);
        assert_eq!(fx.sent[1], (BatchId(0), vec![item("a"), item("b")]));

        let outcome = state
            .handle_outcome(now + Duration::from_secs(1), delivered(BatchId(0)), &mut fx)
            .unwrap();
        assert!(matches!(outcome, Outcome::Delivered { items: 2 }));
        assert_eq!(state.in_flight_batches(), 0);
        assert_eq!(state.parked_batches(), 0);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let now = Instant::now();
        let mut state = BatcherState::new(policy(1));
        let mut fx = Recorder::default();
        state.handle_enqueue(now, item("a"), &mut fx).unwrap();

        let mut at = now;
        for attempt in 1..3 {
            let outcome = state.handle_outcome(at, failed(BatchId(0)), &mut fx).unwrap();
            let Outcome::Retrying { attempt: got, after, .. } = outcome else {
                panic!("expected a retry after failure {attempt}");
            };
            assert_eq!(got, attempt);
            at += after;
            fire(&mut state, &mut fx, at);
        }
        let outcome = state.handle_outcome(at, failed(BatchId(0)), &mut fx).unwrap();
        assert!(matches!(outcome, Outcome::Dropped { attempts: 3, items: 1, .. }));
        assert_eq!(fx.sent.len(), 3);
        assert_eq!(state.parked_batches(), 0);
        assert_eq!(fx.timer, None);
    }

    #[test]
    fn in_flight_cap_holds_ready_batches() {
        let now = Instant::now();
        let mut state = BatcherState::new(config::Upload {
            max_in_flight: Some(1),
            ..policy(1)
        });
        let mut fx = Recorder::default();
        for text in ["a", "b", "c"] {
            state.handle_enqueue(now, item(text), &mut fx).unwrap();
        }
        assert_eq!(fx.sent.len(), 1);
        assert_eq!(state.ready_batches(), 2);

        state.handle_outcome(now, delivered(BatchId(0)), &mut fx).unwrap();
        assert_eq!(fx.sent.len(), 2);
        assert_eq!(fx.sent[1].0, BatchId(1));

        // A retried batch goes ahead of newer ones once it is due.
        state.handle_outcome(now, failed(BatchId(1)), &mut fx).unwrap();
        assert_eq!(fx.sent[2].0, BatchId(2));
        fire(&mut state, &mut fx, now + Duration::from_millis(500));
        assert_eq!(fx.sent.len(), 3);
        assert_eq!(state.ready_batches(), 1);
        state.handle_outcome(now, delivered(BatchId(2)), &mut fx).unwrap();
        assert_eq!(fx.sent[3].0, BatchId(1));
    }

    #[test]
    fn unknown_outcome_is_rejected() {
        let now = Instant::now();
        let mut state = BatcherState::new(policy(2));
        let mut fx = Recorder::default();
        let err = state
            .handle_outcome(now, delivered(BatchId(9)), &mut fx)
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownBatch(BatchId(9))));
    }

    #[test]
    fn stop_flushes_buffer_and_parked_retries() {
        let now = Instant::now();
        let mut state = BatcherState::new(policy(2));
        let mut fx = Recorder::default();
        for text in ["a", "b", "c"] {
            state.handle_enqueue(now, item(text), &mut fx).unwrap();
        }
        state.handle_outcome(now, failed(BatchId(0)), &mut fx).unwrap();

        assert!(!state.is_stopped());
        let summary = state.handle_stop(&mut fx);
        assert!(state.is_stopped());
        assert_eq!(
            summary,
            StopSummary {
                flushed_batches: 2,
                discarded_items: 0
            }
        );
        assert_eq!(fx.sent[1], (BatchId(0), vec![item("a"), item("b")]));
        assert_eq!(fx.sent[2], (BatchId(1), vec![item("c")]));
        assert_eq!(fx.timer, None);
        assert_eq!(state.timer(), None);

        // Late failures are no longer retried and nothing re-arms.
        let outcome = state.handle_outcome(now, failed(BatchId(1)), &mut fx).unwrap();
        assert!(matches!(outcome, Outcome::Dropped { .. }));
        assert_eq!(fx.timer, None);
        assert!(matches!(
            state.handle_enqueue(now, item("d"), &mut fx),
            Err(StateError::Stopped)
        ));
        assert_eq!(state.handle_stop(&mut fx), StopSummary::default());
    }

    #[test]
    fn unschedulable_durations_do_not_arm_the_timer() {
        let now = Instant::now();
        let mut state = BatcherState::new(config::Upload {
            max_buffer_duration: Duration::MAX,
            retry: config::Retry {
                base_backoff: Duration::MAX,
                max_backoff: Duration::MAX,
                max_attempts: None,
            },
            ..policy(1)
        });
        let mut fx = Recorder::default();

        state.handle_enqueue(now, item("a"), &mut fx).unwrap();
        let outcome = state.handle_outcome(now, failed(BatchId(0)), &mut fx).unwrap();
        assert!(matches!(outcome, Outcome::Dropped { attempts: 1, .. }));
        assert_eq!(state.parked_batches(), 0);
        assert_eq!(fx.timer, None);

        let mut state = BatcherState::new(config::Upload {
            max_buffer_duration: Duration::MAX,
            ..policy(2)
        });
        state.handle_enqueue(now, item("b"), &mut fx).unwrap();
        assert_eq!(state.buffered_items(), 1);
        assert_eq!(fx.timer, None);
        fire(&mut state, &mut fx, now + Duration::from_secs(3600));
        assert_eq!(state.buffered_items(), 1);
    }

    #[test]
    fn stop_can_discard() {
        let now = Instant::now();
        let mut state = BatcherState::new(config::Upload {
            flush_on_stop: false,
            max_in_flight: Some(1),
            ..policy(2)
        });
        let mut fx = Recorder::default();
        for text in ["a", "b", "c", "d", "e"] {
            state.handle_enqueue(now, item(text), &mut fx).unwrap();
        }
        assert_eq!(fx.sent.len(), 1);

        let summary = state.handle_stop(&mut fx);
        assert_eq!(summary.discarded_items, 3);
        assert_eq!(summary.flushed_batches, 0);
        assert_eq!(fx.sent.len(), 1);
        assert_eq!(fx.timer, None);
        assert_eq!(state.in_flight_batches(), 1);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Enqueue(usize),
        Tick(u64),
        Deliver,
    }

    fn events() -> impl Strategy<Value = Vec<Event>> {
        prop::collection::vec(
            prop_oneof![
                4 => (1usize..6).prop_map(Event::Enqueue),
                1 => (0u64..1500).prop_map(Event::Tick),
                2 => Just(Event::Deliver),
            ],
            0..80,
        )
    }

    proptest! {
        #[test]
        fn delivers_every_item_once_in_order(
            max_items in 1usize..5,
            max_bytes in 4usize..16,
            cap in prop::option::of(1usize..3),
            events in events(),
        ) {
            let mut now = Instant::now();
            let mut state = BatcherState::new(config::Upload {
                max_batch_items: max_items,
                max_batch_bytes: max_bytes,
                max_in_flight: cap,
                ..policy(max_items)
            });
            let mut fx = Recorder::default();
            let mut enqueued = Vec::new();
            let mut acked = 0;

            for event in events {
                match event {
                    Event::Enqueue(len) => {
                        let payload = Bytes::from(vec![enqueued.len() as u8; len]);
                        enqueued.push(payload.clone());
                        state.handle_enqueue(now, payload, &mut fx).unwrap();
                    }
                    Event::Tick(ms) => {
                        now += Duration::from_millis(ms);
                        if fx.timer.is_some_and(|deadline| deadline <= now) {
                            fire(&mut state, &mut fx, now);
                        }
                    }
                    Event::Deliver => {
                        if acked < fx.sent.len() {
                            let id = fx.sent[acked].0;
                            acked += 1;
                            state.handle_outcome(now, delivered(id), &mut fx).unwrap();
                        }
                    }
                }
                if let Some(cap) = cap {
                    prop_assert!(state.in_flight_batches() <= cap);
                }
            }
            state.handle_stop(&mut fx);

            let mut sent = fx.sent.clone();
            sent.sort_by_key(|(id, _)| *id);
            for pair in sent.windows(2) {
                prop_assert!(pair[0].0 < pair[1].0);
            }
            for (_, items) in &sent {
                prop_assert!(!items.is_empty());
                prop_assert!(items.len() <= max_items);
                let bytes: usize = items.iter().map(Bytes::len).sum();
                prop_assert!(items.len() == 1 || bytes <= max_bytes);
            }
            let flat: Vec<Bytes> = sent.into_iter().flat_map(|(_, items)| items).collect();
            prop_assert_eq!(flat, enqueued);
        }
    }
}
