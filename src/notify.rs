use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, Promotion};

const CHANNEL_CAPACITY: usize = 256;

/// What subscribers of a provider see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A state change applied to the provider.
    Event(Event),
    /// A freed slot went to this waitlist entry's user.
    Promoted(Promotion),
}

/// Broadcast hub, one channel per provider.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a provider. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, provider_id: Ulid, event: &Event) {
        self.publish(provider_id, Notification::Event(event.clone()));
    }

    pub fn send_promotion(&self, provider_id: Ulid, promotion: &Promotion) {
        self.publish(provider_id, Notification::Promoted(promotion.clone()));
    }

    fn publish(&self, provider_id: Ulid, notification: Notification) {
        if let Some(sender) = self.channels.get(&provider_id) {
            let _ = sender.send(notification);
        }
    }

    /// Remove a channel (e.g. when the provider is deleted).
    pub fn remove(&self, provider_id: &Ulid) {
        self.channels.remove(provider_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);

        let event = Event::ProviderDeleted { id: pid };
        hub.send(pid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, Notification::Event(event));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        hub.send(pid, &Event::ProviderDeleted { id: pid });
    }

    #[tokio::test]
    async fn removed_channel_closes_receivers() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);
        hub.remove(&pid);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
