//! Tokio broadcast bus for in-process change notifications.

use serde_json::Value;
use tokio::sync::broadcast;

const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// A payload published on a named channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Channel name.
    pub channel: String,
    /// JSON payload.
    pub payload: Value,
}

/// Broadcasts notifications to every subscriber in the process.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Notification>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Creates a new event bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes a notification to all subscribers (best effort).
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, notification: Notification) -> usize {
        metrics::counter!("event_bus_publish_total").increment(1);
        self.sender.send(notification).unwrap_or_else(|_| {
            // No subscribers.
            metrics::counter!("event_bus_publish_dropped_total").increment(1);
            0
        })
    }

    /// Subscribes to one channel.
    #[must_use]
    pub fn subscribe(&self, channel: impl Into<String>) -> ChannelReceiver {
        metrics::counter!("event_bus_subscriptions_total").increment(1);
        ChannelReceiver {
            receiver: self.sender.subscribe(),
            channel: channel.into(),
        }
    }
}

/// Receiver yielding only the notifications of one channel.
pub struct ChannelReceiver {
    receiver: broadcast::Receiver<Notification>,
    channel: String,
}

impl ChannelReceiver {
    /// Receives the next payload on the channel.
    ///
    /// Returns `None` once the bus is dropped. Lagged notifications are
    /// skipped and counted.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) if notification.channel == self.channel => {
                    return Some(notification.payload);
                },
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    metrics::counter!("event_bus_lagged_total").increment(skipped);
                    tracing::warn!(channel = %self.channel, skipped, "Notification receiver lagged");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_receiver_skips_other_channels() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe("users");

        bus.publish(Notification {
            channel: "apps".to_string(),
            payload: json!({"id": "a1"}),
        });
        bus.publish(Notification {
            channel: "users".to_string(),
            payload: json!({"id": "u1"}),
        });

        assert_eq!(receiver.recv().await, Some(json!({"id": "u1"})));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        let delivered = bus.publish(Notification {
            channel: "users".to_string(),
            payload: Value::Null,
        });
        assert_eq!(delivered, 0);
    }
}
