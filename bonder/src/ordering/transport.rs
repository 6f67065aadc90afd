// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::HeartbeatMessage;
use crate::error::{BonderError, BonderResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Pub/sub channel carrying heartbeats between bonder instances.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    async fn publish(&self, message: &HeartbeatMessage) -> BonderResult<()>;

    /// Stream of every heartbeat published after the call, our own included.
    async fn subscribe(&self) -> BonderResult<BoxStream<'static, HeartbeatMessage>>;
}

/// In-process transport, for single-host deployments and tests.
#[derive(Clone)]
pub struct LocalTransport {
    sender: broadcast::Sender<HeartbeatMessage>,
}

impl LocalTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HeartbeatTransport for LocalTransport {
    async fn publish(&self, message: &HeartbeatMessage) -> BonderResult<()> {
        // no receivers is fine
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> BonderResult<BoxStream<'static, HeartbeatMessage>> {
        let receiver = self.sender.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("heartbeat receiver lagged, {} skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Heartbeats over a Redis pub/sub channel.
pub struct RedisTransport {
    client: redis::Client,
    channel: String,
    publisher: Mutex<Option<redis::aio::Connection>>,
}

impl RedisTransport {
    pub fn new(redis_url: &str, channel: &str) -> BonderResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BonderError::ConfigError(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            channel: channel.to_string(),
            publisher: Mutex::new(None),
        })
    }
}

#[async_trait]
impl HeartbeatTransport for RedisTransport {
    async fn publish(&self, message: &HeartbeatMessage) -> BonderResult<()> {
        let payload = serde_json::to_string(message)
            .map_err(|e| BonderError::SerializationError(e.to_string()))?;
        let mut publisher = self.publisher.lock().await;
        if publisher.is_none() {
            *publisher = Some(self.client.get_async_connection().await?);
        }
        let Some(conn) = publisher.as_mut() else {
            return Err(BonderError::InternalError("redis connection missing".into()));
        };
        let result: redis::RedisResult<()> = conn.publish(&self.channel, payload).await;
        if let Err(e) = result {
            // reconnect on the next heartbeat
            *publisher = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn subscribe(&self) -> BonderResult<BoxStream<'static, HeartbeatMessage>> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(&self.channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload = msg.get_payload::<String>().ok()?;
            match serde_json::from_str::<HeartbeatMessage>(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    debug!("dropping malformed heartbeat: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_transport_fans_out() {
        let transport = LocalTransport::new();
        let mut a = transport.subscribe().await.unwrap();
        let mut b = transport.subscribe().await.unwrap();
        let message = HeartbeatMessage {
            hostname: "bonder-a".into(),
            declared_order: 0,
            sent_at_ms: 1,
        };
        transport.publish(&message).await.unwrap();
        assert_eq!(a.next().await.unwrap(), message);
        assert_eq!(b.next().await.unwrap(), message);
    }

    #[test]
    fn test_redis_url_is_validated() {
        assert!(RedisTransport::new("redis://127.0.0.1:6379", "hb").is_ok());
        assert!(matches!(
            RedisTransport::new("not a url", "hb"),
            Err(BonderError::ConfigError(_))
        ));
    }
}
