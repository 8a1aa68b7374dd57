//! Headless, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others, and in particular without a slow subscriber ever blocking a
//! camera session.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::SessionLifecycle`] | session started / state changed / stopped |
//! | [`Topic::Perception`] | scene descriptions |
//! | [`Topic::Decisions`] | planning decisions, suppressed duplicates |
//! | [`Topic::DeviceCommands`] | device command outcomes |
//! | [`Topic::Alerts`] | stage failures and operator-facing alerts |
//!
//! Every event is also copied to a firehose channel available through
//! [`EventBus::subscribe_all`].

use homesight_types::{Event, EventPayload, HistoryEntry};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SessionLifecycle,
    Perception,
    Decisions,
    DeviceCommands,
    Alerts,
}

impl Topic {
    /// The lane an event belongs on, derived from its payload.
    pub fn for_payload(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::SessionStarted { .. }
            | EventPayload::SessionStateChanged { .. }
            | EventPayload::SessionStopped { .. } => Topic::SessionLifecycle,
            EventPayload::History { entry, .. } => match entry {
                HistoryEntry::Perception(_) => Topic::Perception,
                HistoryEntry::Decision(_) | HistoryEntry::Suppressed(_) => Topic::Decisions,
                HistoryEntry::Command(_) => Topic::DeviceCommands,
                HistoryEntry::Failure(_) => Topic::Alerts,
            },
            EventPayload::Alert { .. } => Topic::Alerts,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    session_lifecycle: broadcast::Sender<Event>,
    perception: broadcast::Sender<Event>,
    decisions: broadcast::Sender<Event>,
    device_commands: broadcast::Sender<Event>,
    alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every channel independently.
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        let (session_lifecycle, _) = broadcast::channel(capacity);
        let (perception, _) = broadcast::channel(capacity);
        let (decisions, _) = broadcast::channel(capacity);
        let (device_commands, _) = broadcast::channel(capacity);
        let (alerts, _) = broadcast::channel(capacity);
        Self {
            all,
            session_lifecycle,
            perception,
            decisions,
            device_commands,
            alerts,
        }
    }

    /// Publish `event` on the lane matching its payload (and the firehose).
    ///
    /// Returns the number of receivers that were handed the event. Having no
    /// subscribers is a normal condition and yields `0`.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    /// Publish `event` to an explicit [`Topic`] (and the firehose).
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        let on_topic = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        let on_all = self.all.send(event).unwrap_or(0);
        trace!(?topic, receivers = on_topic + on_all, "event published");
        on_topic + on_all
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic: Some(topic),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe_all(&self) -> TopicReceiver {
        TopicReceiver {
            topic: None,
            receiver: self.all.subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::SessionLifecycle => &self.session_lifecycle,
            Topic::Perception => &self.perception,
            Topic::Decisions => &self.decisions,
            Topic::DeviceCommands => &self.device_commands,
            Topic::Alerts => &self.alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to one [`Topic`] channel, or to the firehose.
pub struct TopicReceiver {
    topic: Option<Topic>,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   messages were dropped.  The caller decides whether to continue.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, for draining between ticks.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to; `None` for the firehose.
    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use homesight_types::{Backend, HomeError, SessionId, SessionState, Stage, StageFailure};

    fn state_change() -> Event {
        Event::new(
            "homesight-runtime::session",
            EventPayload::SessionStateChanged {
                session_id: SessionId::new("porch"),
                from: SessionState::Sampling,
                to: SessionState::Perceiving,
            },
        )
    }

    fn failure() -> Event {
        Event::new(
            "homesight-runtime::session",
            EventPayload::History {
                session_id: SessionId::new("porch"),
                entry: HistoryEntry::Failure(StageFailure {
                    session_id: SessionId::new("porch"),
                    stage: Stage::Perception,
                    epoch: 0,
                    sequence: 4,
                    error: HomeError::InferenceTimeout {
                        backend: Backend::Vision,
                        after_ms: 5000,
                    },
                    at: Utc::now(),
                }),
            },
        )
    }

    #[tokio::test]
    async fn publish_routes_by_payload() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut lifecycle = bus.subscribe_to(Topic::SessionLifecycle);
        let mut alerts = bus.subscribe_to(Topic::Alerts);

        let change = state_change();
        let fail = failure();
        bus.publish(change.clone());
        bus.publish(fail.clone());

        assert_eq!(lifecycle.recv().await?.id, change.id);
        assert_eq!(alerts.recv().await?.id, fail.id);
        assert!(lifecycle.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn firehose_sees_every_topic() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut all = bus.subscribe_all();
        assert_eq!(all.topic(), None);

        bus.publish(state_change());
        bus.publish(failure());

        assert!(matches!(
            all.recv().await?.payload,
            EventPayload::SessionStateChanged { .. }
        ));
        assert!(matches!(all.recv().await?.payload, EventPayload::History { .. }));
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(state_change()), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe_to(Topic::SessionLifecycle);
        let mut rx2 = bus.subscribe_to(Topic::SessionLifecycle);

        let event = state_change();
        assert_eq!(bus.publish(event.clone()), 2);

        assert_eq!(rx1.recv().await?.id, event.id);
        assert_eq!(rx2.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::SessionLifecycle);
        for _ in 0..1_000 {
            bus.publish(state_change());
        }
        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
