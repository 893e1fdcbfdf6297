//! In-process bus used by tests, the simulated gateway, and demo mode.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{Result, SlicerError};

use super::{Bus, BusMessage};

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>;

/// A trivially small pub/sub hub. Publishing is fan-out to every
/// subscriber of the exact channel name; there is no pattern matching.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    topics: Arc<Mutex<Subscribers>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Subscribers>> {
        self.topics
            .lock()
            .map_err(|_| SlicerError::Bus("bus lock poisoned".into()))
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut topics = self.lock()?;
        if let Some(senders) = topics.get_mut(channel) {
            senders.retain(|tx| {
                tx.send(BusMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::UnboundedReceiver<BusMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.lock()?;
        for channel in channels {
            topics.entry(channel.clone()).or_default().push(tx.clone());
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscribers_in_order() {
        let bus = InMemoryBus::new();
        let mut rx = bus
            .subscribe(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        bus.publish("a", "1".to_string()).await.unwrap();
        bus.publish("b", "2".to_string()).await.unwrap();
        bus.publish("c", "3".to_string()).await.unwrap(); // nobody listens

        let m1 = rx.recv().await.unwrap();
        let m2 = rx.recv().await.unwrap();
        assert_eq!((m1.channel.as_str(), m1.payload.as_str()), ("a", "1"));
        assert_eq!((m2.channel.as_str(), m2.payload.as_str()), ("b", "2"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryBus::new();
        let rx = bus.subscribe(&["a".to_string()]).await.unwrap();
        drop(rx);
        bus.publish("a", "1".to_string()).await.unwrap();
        assert!(bus.lock().unwrap().get("a").unwrap().is_empty());
    }
}
