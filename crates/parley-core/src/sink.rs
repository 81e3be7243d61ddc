//! Per-session outbound queue.
//!
//! One bounded queue per session, drained by the session's writer task.
//! Pushes never await: the router calls `push` for every recipient of a plan
//! without holding any registry lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_models::Envelope;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::session::CloseReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Priority {
    /// Never dropped; a full queue of these makes the session a slow consumer.
    Essential,
    /// Typing indicators and presence heartbeats.
    Nonessential,
    /// Replaces any queued item with the same key.
    Coalesce(String),
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub capacity: usize,
    pub grace: Duration,
    pub hard_limit: usize,
}

impl SinkConfig {
    pub fn new(capacity: usize, grace: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            grace,
            hard_limit: capacity.saturating_mul(4),
        }
    }

    fn near_full(&self) -> usize {
        (self.capacity * 8 / 10).max(1)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self::new(256, Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// A queued item with the same coalescing key was overwritten.
    Replaced,
    /// Queued after evicting the oldest nonessential item.
    DroppedOldest,
    /// The new nonessential item itself was discarded.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("sink closed")]
    Closed,
    #[error("slow consumer")]
    SlowConsumer,
}

pub enum SinkRead {
    Items(Vec<Arc<Envelope>>),
    Closed(CloseReason),
}

struct Queued {
    envelope: Arc<Envelope>,
    priority: Priority,
}

struct SinkState {
    queue: VecDeque<Queued>,
    blocked_since: Option<Instant>,
    closed: Option<CloseReason>,
}

pub struct SessionSink {
    state: Mutex<SinkState>,
    notify: Notify,
    closed_signal: CancellationToken,
    config: SinkConfig,
    dropped: AtomicU64,
}

impl SessionSink {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            state: Mutex::new(SinkState {
                queue: VecDeque::with_capacity(config.capacity.min(64)),
                blocked_since: None,
                closed: None,
            }),
            notify: Notify::new(),
            closed_signal: CancellationToken::new(),
            config,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(
        &self,
        envelope: Arc<Envelope>,
        priority: Priority,
    ) -> Result<PushOutcome, PushError> {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return Err(PushError::Closed);
            }
            self.push_locked(&mut state, envelope, priority)?
        };
        if outcome != PushOutcome::Dropped {
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    fn push_locked(
        &self,
        state: &mut SinkState,
        envelope: Arc<Envelope>,
        priority: Priority,
    ) -> Result<PushOutcome, PushError> {
        if let Priority::Coalesce(key) = &priority {
            let existing = state
                .queue
                .iter_mut()
                .find(|q| matches!(&q.priority, Priority::Coalesce(k) if k == key));
            if let Some(slot) = existing {
                slot.envelope = envelope;
                return Ok(PushOutcome::Replaced);
            }
        }

        if priority == Priority::Nonessential {
            if state.queue.len() >= self.config.near_full() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return match oldest_nonessential(&state.queue) {
                    Some(pos) => {
                        state.queue.remove(pos);
                        state.queue.push_back(Queued { envelope, priority });
                        Ok(PushOutcome::DroppedOldest)
                    }
                    None => Ok(PushOutcome::Dropped),
                };
            }
            state.queue.push_back(Queued { envelope, priority });
            return Ok(PushOutcome::Queued);
        }

        let mut outcome = PushOutcome::Queued;
        if state.queue.len() >= self.config.capacity {
            if let Some(pos) = oldest_nonessential(&state.queue) {
                state.queue.remove(pos);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                outcome = PushOutcome::DroppedOldest;
            } else {
                let now = Instant::now();
                let since = *state.blocked_since.get_or_insert(now);
                if now.duration_since(since) >= self.config.grace
                    || state.queue.len() >= self.config.hard_limit
                {
                    return Err(PushError::SlowConsumer);
                }
            }
        }
        state.queue.push_back(Queued { envelope, priority });
        Ok(outcome)
    }

    /// Wait for queued items and take up to `max` of them in order.
    /// Returns `Closed` once the sink is closed and drained.
    pub async fn next_batch(&self, max: usize) -> SinkRead {
        loop {
            {
                let mut state = self.state.lock();
                if !state.queue.is_empty() {
                    let take = max.max(1).min(state.queue.len());
                    let batch = state.queue.drain(..take).map(|q| q.envelope).collect();
                    if state.queue.len() < self.config.capacity {
                        state.blocked_since = None;
                    }
                    return SinkRead::Items(batch);
                }
                if let Some(reason) = state.closed {
                    return SinkRead::Closed(reason);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of `next_batch` used by drain loops and tests.
    pub fn try_take(&self, max: usize) -> Vec<Arc<Envelope>> {
        let mut state = self.state.lock();
        let take = max.min(state.queue.len());
        let batch = state.queue.drain(..take).map(|q| q.envelope).collect();
        if state.queue.len() < self.config.capacity {
            state.blocked_since = None;
        }
        batch
    }

    /// Stop accepting pushes. Reasons that do not drain discard queued items.
    /// The first reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason);
            if !reason.drains() {
                state.queue.clear();
            }
        }
        self.notify.notify_one();
        self.closed_signal.cancel();
        true
    }

    /// Resolves once `close` has been called, whatever the reason.
    pub async fn closed(&self) {
        self.closed_signal.cancelled().await;
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().closed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How long the queue has been at capacity with only essential items.
    pub fn blocked_for(&self, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .blocked_since
            .map(|since| now.duration_since(since))
    }

    pub fn grace(&self) -> Duration {
        self.config.grace
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn oldest_nonessential(queue: &VecDeque<Queued>) -> Option<usize> {
    queue
        .iter()
        .position(|q| q.priority == Priority::Nonessential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_models::ChatMessage;

    fn chat(n: usize) -> Arc<Envelope> {
        Arc::new(Envelope::message(ChatMessage::text(
            "u1",
            "u2",
            &format!("m{n}"),
        )))
    }

    fn typing() -> Arc<Envelope> {
        Arc::new(Envelope::state("typing", "u1", Vec::new()))
    }

    fn content(env: &Envelope) -> String {
        env.as_message()
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "<state>".into())
    }

    #[test]
    fn typing_is_dropped_before_chat_under_pressure() {
        let sink = SessionSink::new(SinkConfig::new(10, Duration::from_secs(5)));
        for i in 0..4 {
            sink.push(chat(i), Priority::Essential).unwrap();
        }
        for _ in 0..4 {
            sink.push(typing(), Priority::Nonessential).unwrap();
        }
        // Near full: new typing replaces the oldest typing.
        assert_eq!(
            sink.push(typing(), Priority::Nonessential).unwrap(),
            PushOutcome::DroppedOldest
        );
        // At capacity: essential pushes evict typing items first.
        for i in 4..14 {
            sink.push(chat(i), Priority::Essential).unwrap();
        }
        let items = sink.try_take(100);
        let chats: Vec<_> = items
            .iter()
            .filter(|e| e.as_message().is_some())
            .map(|e| content(e))
            .collect();
        assert_eq!(chats.len(), 14);
        assert_eq!(chats.first().map(String::as_str), Some("m0"));
        assert_eq!(chats.last().map(String::as_str), Some("m13"));
        assert!(sink.dropped_count() >= 5);
    }

    #[test]
    fn new_typing_is_dropped_when_queue_holds_only_chat() {
        let sink = SessionSink::new(SinkConfig::new(5, Duration::from_secs(5)));
        for i in 0..5 {
            sink.push(chat(i), Priority::Essential).unwrap();
        }
        assert_eq!(
            sink.push(typing(), Priority::Nonessential).unwrap(),
            PushOutcome::Dropped
        );
        assert_eq!(sink.len(), 5);
    }

    #[test]
    fn coalescing_replaces_in_place() {
        let sink = SessionSink::new(SinkConfig::default());
        sink.push(chat(1), Priority::Coalesce("u2".into())).unwrap();
        sink.push(chat(2), Priority::Coalesce("g1".into())).unwrap();
        assert_eq!(
            sink.push(chat(3), Priority::Coalesce("u2".into())).unwrap(),
            PushOutcome::Replaced
        );
        let items: Vec<_> = sink.try_take(10).iter().map(|e| content(e)).collect();
        assert_eq!(items, vec!["m3", "m2"]);
    }

    #[test]
    fn overflow_beyond_hard_limit_is_slow_consumer() {
        let sink = SessionSink::new(SinkConfig::new(4, Duration::from_secs(60)));
        let mut result = Ok(PushOutcome::Queued);
        for i in 0..32 {
            result = sink.push(chat(i), Priority::Essential);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(PushError::SlowConsumer));
        assert_eq!(sink.len(), 16);
        assert!(sink.blocked_for(Instant::now()).is_some());
    }

    #[tokio::test]
    async fn overflow_past_grace_is_slow_consumer_and_drain_resets() {
        let sink = SessionSink::new(SinkConfig::new(2, Duration::from_millis(30)));
        for i in 0..3 {
            sink.push(chat(i), Priority::Essential).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            sink.push(chat(3), Priority::Essential),
            Err(PushError::SlowConsumer)
        );

        let drained = sink.try_take(3);
        assert_eq!(drained.len(), 3);
        assert!(sink.blocked_for(Instant::now()).is_none());
        assert!(sink.push(chat(4), Priority::Essential).is_ok());
    }

    #[tokio::test]
    async fn next_batch_waits_and_close_drains_first() {
        let sink = Arc::new(SessionSink::new(SinkConfig::default()));
        let reader = {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    match sink.next_batch(8).await {
                        SinkRead::Items(items) => seen.extend(items.iter().map(|e| content(e))),
                        SinkRead::Closed(reason) => return (seen, reason),
                    }
                }
            })
        };
        sink.push(chat(1), Priority::Essential).unwrap();
        sink.push(chat(2), Priority::Essential).unwrap();
        assert!(sink.close(CloseReason::Normal));
        assert_eq!(sink.push(chat(3), Priority::Essential), Err(PushError::Closed));

        let (seen, reason) = reader.await.unwrap();
        assert_eq!(seen, vec!["m1", "m2"]);
        assert_eq!(reason, CloseReason::Normal);
    }

    #[test]
    fn slow_consumer_close_discards_queue() {
        let sink = SessionSink::new(SinkConfig::default());
        sink.push(chat(1), Priority::Essential).unwrap();
        sink.close(CloseReason::SlowConsumer);
        assert!(sink.is_empty());
        assert!(!sink.close(CloseReason::Normal));
        assert_eq!(sink.close_reason(), Some(CloseReason::SlowConsumer));
    }

    #[tokio::test]
    async fn closed_resolves_for_every_waiter() {
        let sink = Arc::new(SessionSink::new(SinkConfig::default()));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.closed().await })
            })
            .collect();
        tokio::task::yield_now().await;
        sink.close(CloseReason::SlowConsumer);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("close signal")
                .unwrap();
        }
        // Already closed: resolves immediately.
        tokio::time::timeout(Duration::from_millis(50), sink.closed())
            .await
            .expect("closed sink");
    }
}
