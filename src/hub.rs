use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Notification;

const CHANNEL_CAPACITY: usize = 256;

/// In-process fan-out of freshly queued notifications, keyed by user id.
///
/// Channels are created lazily on first subscribe and dropped once the last
/// receiver goes away. Slow consumers miss messages (broadcast semantics) —
/// the durable copy lives in the store, this is only the live signal.
pub struct EventHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to live notifications for one user.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a notification to any live subscribers of its user.
    /// Returns the number of receivers that got it (0 if nobody is listening).
    pub fn publish(&self, notification: &Notification) -> usize {
        let user_id = notification.user_id;
        let delivered = match self.channels.get(&user_id) {
            Some(tx) => tx.send(notification.clone()).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            // Drop the channel once the last receiver is gone
            self.channels
                .remove_if(&user_id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(user_id: Ulid, message: &str) -> Notification {
        Notification {
            id: Ulid::new(),
            user_id,
            message: message.into(),
            created_at: 0,
            sent_at: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_notification() {
        let hub = EventHub::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);

        let delivered = hub.publish(&note(user, "Booking approved."));
        assert_eq!(delivered, 1);

        let got = rx.recv().await.unwrap();
        assert_eq!(got.message, "Booking approved.");
        assert_eq!(got.user_id, user);
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let hub = EventHub::new();
        let delivered = hub.publish(&note(Ulid::new(), "nobody home"));
        assert_eq!(delivered, 0);
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn channel_removed_after_last_receiver_drops() {
        let hub = EventHub::new();
        let user = Ulid::new();
        let rx = hub.subscribe(user);
        assert_eq!(hub.channel_count(), 1);
        drop(rx);

        // Publish triggers the cleanup of the dead channel
        let delivered = hub.publish(&note(user, "gone"));
        assert_eq!(delivered, 0);
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn separate_users_do_not_cross() {
        let hub = EventHub::new();
        let alice = Ulid::new();
        let bob = Ulid::new();
        let mut alice_rx = hub.subscribe(alice);
        let mut bob_rx = hub.subscribe(bob);

        hub.publish(&note(alice, "for alice"));

        assert_eq!(alice_rx.recv().await.unwrap().message, "for alice");
        assert!(bob_rx.try_recv().is_err());
    }
}
