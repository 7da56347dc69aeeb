//! In-process publish/subscribe fan-out
//!
//! A single actor task owns the subscriber set and a bounded inbound command
//! queue. Publishing never waits on subscribers and never drops a message for
//! a live one: each subscriber has a forwarding task that drains an unbounded
//! backlog into its bounded delivery queue. Closed subscribers are removed.

use crate::{InvalidationError, Result};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Capacity of the actor's inbound command queue
    pub inbound_capacity: usize,
    /// Capacity of each subscriber's delivery queue. Messages beyond it
    /// wait in the subscriber's backlog.
    pub subscriber_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 1024,
            subscriber_capacity: 256,
        }
    }
}

enum HubCommand {
    Subscribe {
        channel: String,
        reply: oneshot::Sender<mpsc::Receiver<String>>,
    },
    Publish {
        channel: String,
        payload: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the fan-out actor. Cloning shares the actor; it stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct FanoutHub {
    commands: mpsc::Sender<HubCommand>,
}

impl FanoutHub {
    /// Spawn the actor on the current Tokio runtime.
    pub fn spawn(config: HubConfig) -> Self {
        let (commands, inbound) = mpsc::channel(config.inbound_capacity.max(1));
        tokio::spawn(run_hub(inbound, config.subscriber_capacity.max(1)));
        Self { commands }
    }

    /// Register a subscriber on `channel` and return its delivery queue.
    pub async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Subscribe {
                channel: channel.to_string(),
                reply,
            })
            .await
            .map_err(|_| InvalidationError::HubClosed)?;
        rx.await.map_err(|_| InvalidationError::HubClosed)
    }

    /// Same as [`subscribe`](Self::subscribe), as a stream.
    pub async fn subscribe_stream(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let rx = self.subscribe(channel).await?;
        Ok(receiver_stream(rx))
    }

    /// Deliver `payload` to every current subscriber of `channel`.
    ///
    /// Returns the number of subscribers the message was queued for.
    pub async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Publish {
                channel: channel.to_string(),
                payload,
                reply,
            })
            .await
            .map_err(|_| InvalidationError::HubClosed)?;
        rx.await.map_err(|_| InvalidationError::HubClosed)
    }
}

/// Adapt a delivery queue into a stream that ends when the queue closes.
pub fn receiver_stream(rx: mpsc::Receiver<String>) -> BoxStream<'static, String> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|msg| (msg, rx)) }).boxed()
}

struct Subscriber {
    backlog: mpsc::UnboundedSender<String>,
    /// Kept to detect a dropped receiver without waiting on the forwarder
    delivery: mpsc::Sender<String>,
}

impl Subscriber {
    fn spawn(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (delivery, rx) = mpsc::channel(capacity);
        let (backlog, mut pending) = mpsc::unbounded_channel::<String>();

        let out = delivery.clone();
        tokio::spawn(async move {
            while let Some(msg) = pending.recv().await {
                if out.send(msg).await.is_err() {
                    break;
                }
            }
        });

        (Self { backlog, delivery }, rx)
    }

    /// Queue `payload`; false once the receiver is gone.
    fn offer(&self, payload: &str) -> bool {
        !self.delivery.is_closed() && self.backlog.send(payload.to_string()).is_ok()
    }
}

async fn run_hub(mut inbound: mpsc::Receiver<HubCommand>, subscriber_capacity: usize) {
    let mut subscribers: HashMap<String, Vec<Subscriber>> = HashMap::new();

    while let Some(command) = inbound.recv().await {
        match command {
            HubCommand::Subscribe { channel, reply } => {
                let (subscriber, rx) = Subscriber::spawn(subscriber_capacity);
                if reply.send(rx).is_ok() {
                    let list = subscribers.entry(channel.clone()).or_default();
                    list.push(subscriber);
                    debug!(channel = %channel, subscribers = list.len(), "Hub subscriber registered");
                }
            }
            HubCommand::Publish {
                channel,
                payload,
                reply,
            } => {
                let mut delivered = 0;
                if let Some(list) = subscribers.get_mut(&channel) {
                    list.retain(|subscriber| {
                        let live = subscriber.offer(&payload);
                        if live {
                            delivered += 1;
                        }
                        live
                    });
                    if list.is_empty() {
                        subscribers.remove(&channel);
                        debug!(channel = %channel, "Last hub subscriber gone");
                    }
                }
                let _ = reply.send(delivered);
            }
        }
    }

    debug!("Fan-out hub stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = FanoutHub::spawn(HubConfig::default());
        let mut a = hub.subscribe("updates").await.unwrap();
        let mut b = hub.subscribe("updates").await.unwrap();

        let delivered = hub.publish("updates", "hello".into()).await.unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = FanoutHub::spawn(HubConfig::default());
        let mut other = hub.subscribe("other").await.unwrap();

        let delivered = hub.publish("updates", "x".into()).await.unwrap();
        assert_eq!(delivered, 0);

        let res = tokio::time::timeout(Duration::from_millis(50), other.recv()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let hub = FanoutHub::spawn(HubConfig::default());
        let keep = hub.subscribe("updates").await.unwrap();
        let gone = hub.subscribe("updates").await.unwrap();
        drop(gone);

        assert_eq!(hub.publish("updates", "1".into()).await.unwrap(), 1);
        assert_eq!(hub.publish("updates", "2".into()).await.unwrap(), 1);
        drop(keep);
        assert_eq!(hub.publish("updates", "3".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_every_message_in_order() {
        let hub = FanoutHub::spawn(HubConfig {
            inbound_capacity: 8,
            subscriber_capacity: 1,
        });
        let mut slow = hub.subscribe("updates").await.unwrap();
        let mut fast = hub.subscribe("updates").await.unwrap();

        // Far past the delivery queue capacity; publishing never waits
        for i in 0..50 {
            let delivered = hub.publish("updates", i.to_string()).await.unwrap();
            assert_eq!(delivered, 2);
            assert_eq!(fast.recv().await.unwrap(), i.to_string());
        }

        for i in 0..50 {
            assert_eq!(slow.recv().await.unwrap(), i.to_string());
        }
    }

    #[tokio::test]
    async fn test_subscribe_stream() {
        let hub = FanoutHub::spawn(HubConfig::default());
        let mut stream = hub.subscribe_stream("updates").await.unwrap();

        hub.publish("updates", "a".into()).await.unwrap();
        hub.publish("updates", "b".into()).await.unwrap();

        assert_eq!(stream.next().await.unwrap(), "a");
        assert_eq!(stream.next().await.unwrap(), "b");
    }
}
