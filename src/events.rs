//! Automation event bus.
//!
//! Run progress is pushed to any number of observers over a
//! `tokio::sync::broadcast` channel. Publishing never waits on a subscriber: a
//! subscriber that falls further behind than the channel capacity is dropped
//! (its subscription ends) instead of stalling the controller.
//!
//! The bus also keeps the last few events. [`EventBus::subscribe_with_replay`]
//! hands those to a reconnecting observer first, so a client that reconnects
//! just after a run finished still sees the terminal event.
//!
//! Events serialize as one JSON object with a `type` tag:
//!
//! ```json
//! {"seq":7,"type":"automation_progress","current":3,"total":17,...}
//! ```

use crate::data::ReportRef;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Broadcast channel capacity per subscriber
pub const DEFAULT_CAPACITY: usize = 256;
/// Events retained for replay
pub const DEFAULT_REPLAY: usize = 16;

/// One step of a run's lifecycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationEvent {
    /// Run accepted and started
    AutomationStart {
        /// Board under test
        board_no: u32,
        /// Channel under test
        channel_no: u32,
        /// Number of spots in the run
        total: usize,
        /// Human-readable summary
        message: String,
    },
    /// One spot finished (successfully or not)
    AutomationProgress {
        /// Spots done so far, including this one
        current: usize,
        /// Spots in the run
        total: usize,
        /// Board under test
        board_no: u32,
        /// Channel under test
        channel_no: u32,
        /// Spot as `0xNN`
        spot: String,
        /// Marker frequency, absent if the read failed
        freq: Option<f64>,
        /// Human-readable summary
        message: String,
    },
    /// Run finished and its report was written
    AutomationComplete {
        /// Where the report went
        report_ref: ReportRef,
        /// Human-readable summary
        message: String,
    },
    /// Run aborted
    AutomationError {
        /// Full diagnostic text
        message: String,
    },
}

impl AutomationEvent {
    /// True for `automation_complete` and `automation_error`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AutomationEvent::AutomationComplete { .. } | AutomationEvent::AutomationError { .. }
        )
    }
}

/// An event with its position in the bus order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Strictly increasing per bus
    pub seq: u64,
    /// The event
    #[serde(flatten)]
    pub event: AutomationEvent,
}

struct History {
    next_seq: u64,
    recent: VecDeque<Envelope>,
}

/// Multi-subscriber event bus with a bounded replay buffer
///
/// ```
/// use rf_daq::events::{AutomationEvent, EventBus};
///
/// # tokio_test::block_on(async {
/// let bus = EventBus::new();
/// let mut sub = bus.subscribe();
/// bus.publish(AutomationEvent::AutomationError { message: "analyzer lost".into() });
/// assert!(sub.recv().await.unwrap().event.is_terminal());
/// # });
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
    history: Arc<Mutex<History>>,
    replay: usize,
}

impl EventBus {
    /// Bus with the default capacity and replay depth
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_REPLAY)
    }

    /// Bus with explicit capacity and replay depth
    pub fn with_capacity(capacity: usize, replay: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Arc::new(Mutex::new(History {
                next_seq: 0,
                recent: VecDeque::with_capacity(replay),
            })),
            replay,
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, History> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish an event; returns its sequence number
    ///
    /// Never blocks. Having no subscribers is not an error.
    pub fn publish(&self, event: AutomationEvent) -> u64 {
        let mut history = self.history();
        let seq = history.next_seq;
        history.next_seq += 1;

        let envelope = Envelope { seq, event };
        if self.replay > 0 {
            if history.recent.len() == self.replay {
                history.recent.pop_front();
            }
            history.recent.push_back(envelope.clone());
        }

        // sent under the history lock so replay and live delivery never overlap
        let receivers = self.sender.send(envelope).unwrap_or(0);
        debug!(seq, receivers, "Event published");
        seq
    }

    /// Receive events published from now on
    pub fn subscribe(&self) -> Subscription {
        let _history = self.history();
        Subscription {
            backlog: VecDeque::new(),
            receiver: self.sender.subscribe(),
            lagged: false,
        }
    }

    /// Receive the retained recent events, then everything published after them
    pub fn subscribe_with_replay(&self) -> Subscription {
        let history = self.history();
        Subscription {
            backlog: history.recent.clone(),
            receiver: self.sender.subscribe(),
            lagged: false,
        }
    }

    /// Most recent retained event
    pub fn last(&self) -> Option<Envelope> {
        self.history().recent.back().cloned()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer's view of the bus. Dropping it unsubscribes.
pub struct Subscription {
    backlog: VecDeque<Envelope>,
    receiver: broadcast::Receiver<Envelope>,
    lagged: bool,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone or this subscriber fell behind
    pub async fn recv(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }
        if self.lagged {
            return None;
        }
        match self.receiver.recv().await {
            Ok(envelope) => Some(envelope),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event subscriber fell behind and was dropped");
                self.lagged = true;
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// True if this subscription ended because it fell behind
    pub fn lagged(&self) -> bool {
        self.lagged
    }

    /// Consume the subscription as a stream with the same semantics as [`Self::recv`]
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send + Unpin {
        let backlog = tokio_stream::iter(self.backlog);
        let live = BroadcastStream::new(self.receiver).map_while(|item| match item {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("Event stream dropped: {}", e);
                None
            }
        });
        backlog.chain(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(message: &str) -> AutomationEvent {
        AutomationEvent::AutomationError {
            message: message.to_string(),
        }
    }

    fn progress(current: usize) -> AutomationEvent {
        AutomationEvent::AutomationProgress {
            current,
            total: 3,
            board_no: 1,
            channel_no: 1,
            spot: format!("0x{:02X}", current),
            freq: Some(3.0e9),
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_ordered_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        for i in 1..=3 {
            bus.publish(progress(i));
        }

        for sub in [&mut a, &mut b] {
            let seqs: Vec<u64> = vec![
                sub.recv().await.expect("1").seq,
                sub.recv().await.expect("2").seq,
                sub.recv().await.expect("3").seq,
            ];
            assert_eq!(seqs, vec![0, 1, 2]);
        }
    }

    #[tokio::test]
    async fn test_replay_delivers_terminal_event_to_late_subscriber() {
        let bus = EventBus::new();
        bus.publish(progress(1));
        bus.publish(error("analyzer lost"));

        let mut late = bus.subscribe_with_replay();
        let first = late.recv().await.expect("replayed");
        let second = late.recv().await.expect("replayed");
        assert_eq!(first.seq, 0);
        assert!(second.event.is_terminal());

        bus.publish(progress(2));
        assert_eq!(late.recv().await.expect("live").seq, 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::with_capacity(4, 2);
        for i in 0..10 {
            assert_eq!(bus.publish(progress(i)), i as u64);
        }
        assert_eq!(bus.last().expect("retained").seq, 9);
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_not_blocking() {
        let bus = EventBus::with_capacity(2, 0);
        let mut slow = bus.subscribe();
        for i in 0..10 {
            bus.publish(progress(i));
        }
        assert!(slow.recv().await.is_none());
        assert!(slow.lagged());
    }

    #[tokio::test]
    async fn test_stream_cancel_by_drop() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe_with_replay().into_stream();
        bus.publish(progress(1));
        assert_eq!(stream.next().await.expect("event").seq, 0);
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Envelope {
            seq: 4,
            event: progress(2),
        })
        .expect("json");
        assert_eq!(json["type"], "automation_progress");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["spot"], "0x02");
    }
}
