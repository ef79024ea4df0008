//! In-process subscriber bus.
//!
//! One bounded broadcast channel per topic. Delivery is fire-and-forget and
//! at-most-once: a subscriber that falls behind loses the oldest events and
//! the drop is counted. Publish never blocks and never holds a lock during
//! delivery.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Enumerated bus topics. The WebSocket edge subscribes to these and
/// serializes the envelopes to clients unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Message,
    AdsbBatch,
    HfgcsAircraft,
    EamDetected,
    TranscriptionComplete,
    RecordingComplete,
    StatsUpdated,
    SourceStatus,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::Message,
        Topic::AdsbBatch,
        Topic::HfgcsAircraft,
        Topic::EamDetected,
        Topic::TranscriptionComplete,
        Topic::RecordingComplete,
        Topic::StatsUpdated,
        Topic::SourceStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Message => "message",
            Topic::AdsbBatch => "adsb_batch",
            Topic::HfgcsAircraft => "hfgcs_aircraft",
            Topic::EamDetected => "eam_detected",
            Topic::TranscriptionComplete => "transcription_complete",
            Topic::RecordingComplete => "recording_complete",
            Topic::StatsUpdated => "stats_updated",
            Topic::SourceStatus => "source_status",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Wire envelope delivered to every subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub topic: &'static str,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

pub struct EventBus {
    channels: [broadcast::Sender<Event>; 8],
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let channels = std::array::from_fn(|_| broadcast::channel(capacity).0);
        Self { channels }
    }

    /// Publish to a topic. Serialization failures and zero-subscriber sends
    /// are counted, never surfaced; the bus owns no records and makes no
    /// delivery promises.
    pub fn publish<T: Serialize>(&self, topic: Topic, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                metrics::counter!("bus.publish.serialize_failed").increment(1);
                trace!(topic = topic.as_str(), error = %e, "unserializable bus payload");
                return;
            }
        };

        let event = Event {
            topic: topic.as_str(),
            timestamp: Utc::now(),
            data,
        };

        metrics::counter!("bus.publish.total", "topic" => topic.as_str()).increment(1);
        // send() only fails when there are no subscribers, which is fine.
        let _ = self.channels[topic.index()].send(event);
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.channels[topic.index()].subscribe()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.channels[topic.index()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Drain helper for internal subscribers: counts lag-induced drops so
/// backpressure is visible on the dashboard.
pub async fn next_event(
    rx: &mut broadcast::Receiver<Event>,
    topic: Topic,
) -> Option<Event> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                metrics::counter!("bus.subscriber.dropped", "topic" => topic.as_str())
                    .increment(skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscriber_receives_typed_envelope() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(Topic::Message);

        bus.publish(Topic::Message, &json!({"id": "m1"}));

        let event = next_event(&mut rx, Topic::Message).await.unwrap();
        assert_eq!(event.topic, "message");
        assert_eq!(event.data["id"], "m1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fire_and_forget() {
        let bus = EventBus::default();
        bus.publish(Topic::EamDetected, &json!({"confidence": 70}));
        // A subscriber created afterwards sees nothing: at-most-once, no
        // persistence.
        let mut rx = bus.subscribe(Topic::EamDetected);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe(Topic::AdsbBatch);

        for i in 0..10 {
            bus.publish(Topic::AdsbBatch, &json!({"seq": i}));
        }

        // The first recv reports the lag, then the newest retained events
        // arrive in order.
        let event = next_event(&mut rx, Topic::AdsbBatch).await.unwrap();
        assert_eq!(event.data["seq"], 6);
        let event = next_event(&mut rx, Topic::AdsbBatch).await.unwrap();
        assert_eq!(event.data["seq"], 7);
    }

    #[test]
    fn test_topics_are_distinct_channels() {
        let bus = EventBus::default();
        let _rx = bus.subscribe(Topic::Message);
        assert_eq!(bus.subscriber_count(Topic::Message), 1);
        assert_eq!(bus.subscriber_count(Topic::SourceStatus), 0);
    }
}
