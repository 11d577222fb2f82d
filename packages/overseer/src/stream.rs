//! Per-instance output fan-out to external viewers.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// One piece of output destined for a viewer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamChunk {
    pub instance_id: String,
    pub data: String,
}

/// A viewer connection, identified by the transport's connection id.
#[derive(Clone, Debug)]
pub struct Subscriber {
    id: String,
    sender: mpsc::Sender<StreamChunk>,
}

impl Subscriber {
    pub fn new(id: impl Into<String>, sender: mpsc::Sender<StreamChunk>) -> Self {
        Self {
            id: id.into(),
            sender,
        }
    }

    /// Subscriber plus the receiving end the transport drains
    pub fn channel(
        id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<StreamChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Maps instance id -> subscriber id -> subscriber.
///
/// Delivery never blocks: a viewer that can't keep up loses the chunk, and
/// one whose receiver is gone is detached on the next delivery attempt.
#[derive(Default)]
pub struct StreamMultiplexer {
    streams: RwLock<HashMap<String, HashMap<String, Subscriber>>>,
}

impl StreamMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `subscriber` to an instance's output. Re-attaching replaces
    /// the previous sender for that subscriber id.
    pub async fn forward(&self, instance_id: &str, subscriber: Subscriber) {
        debug!(
            "Forwarding output of {} to subscriber {}",
            instance_id, subscriber.id
        );
        self.streams
            .write()
            .await
            .entry(instance_id.to_string())
            .or_default()
            .insert(subscriber.id.clone(), subscriber);
    }

    /// Detach a subscriber. Returns whether it was attached.
    pub async fn stop_forward(&self, instance_id: &str, subscriber_id: &str) -> bool {
        let mut streams = self.streams.write().await;
        let Some(subscribers) = streams.get_mut(instance_id) else {
            return false;
        };
        let removed = subscribers.remove(subscriber_id).is_some();
        if subscribers.is_empty() {
            streams.remove(instance_id);
        }
        if removed {
            debug!(
                "Stopped forwarding {} to subscriber {}",
                instance_id, subscriber_id
            );
        }
        removed
    }

    /// Visit every subscriber currently attached to an instance
    pub async fn for_each_forward(&self, instance_id: &str, mut f: impl FnMut(&Subscriber)) {
        let streams = self.streams.read().await;
        if let Some(subscribers) = streams.get(instance_id) {
            subscribers.values().for_each(&mut f);
        }
    }

    pub async fn subscriber_count(&self, instance_id: &str) -> usize {
        self.streams
            .read()
            .await
            .get(instance_id)
            .map_or(0, HashMap::len)
    }

    /// Deliver one chunk to every subscriber of an instance.
    /// Returns how many subscribers accepted it.
    pub async fn fan_out(&self, instance_id: &str, data: &str) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let streams = self.streams.read().await;
            let Some(subscribers) = streams.get(instance_id) else {
                return 0;
            };
            for subscriber in subscribers.values() {
                let chunk = StreamChunk {
                    instance_id: instance_id.to_string(),
                    data: data.to_string(),
                };
                match subscriber.sender.try_send(chunk) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Subscriber {} is not keeping up with {}, dropping chunk",
                            subscriber.id, instance_id
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(subscriber.id.clone()),
                }
            }
        }

        for subscriber_id in closed {
            debug!("Subscriber {} went away", subscriber_id);
            self.stop_forward(instance_id, &subscriber_id).await;
        }
        delivered
    }

    /// Detach a subscriber from every instance, e.g. when its connection closes.
    /// Returns how many attachments were removed.
    pub async fn disconnect(&self, subscriber_id: &str) -> usize {
        let mut streams = self.streams.write().await;
        let mut removed = 0;
        streams.retain(|_, subscribers| {
            if subscribers.remove(subscriber_id).is_some() {
                removed += 1;
            }
            !subscribers.is_empty()
        });
        if removed > 0 {
            debug!(
                "Subscriber {} disconnected from {} streams",
                subscriber_id, removed
            );
        }
        removed
    }

    /// Forget every subscriber of a removed instance
    pub async fn drop_instance(&self, instance_id: &str) {
        self.streams.write().await.remove(instance_id);
    }
}
