use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use ratchet_core::error::{RatchetError, Result};
use ratchet_core::settings::EngineStatus;

/// Capacity of each in-memory fan-out channel. Slow websocket clients that
/// fall further behind than this miss messages; delivery is best-effort.
const MEMORY_CHANNEL_CAPACITY: usize = 256;

/// The closed set of broadcast channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Per-process updates for process list/detail views.
    Processes,
    /// Engine status changes.
    EngineSettings,
    /// Cache invalidation events.
    Events,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processes => "processes",
            Self::EngineSettings => "engine-settings",
            Self::Events => "events",
        }
    }

    /// Parse a channel name as used in websocket routes.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processes" => Some(Self::Processes),
            "engine-settings" => Some(Self::EngineSettings),
            "events" => Some(Self::Events),
            _ => None,
        }
    }
}

enum Backend {
    Memory {
        processes: broadcast::Sender<String>,
        engine_settings: broadcast::Sender<String>,
        events: broadcast::Sender<String>,
    },
    Redis {
        client: redis::Client,
        manager: redis::aio::ConnectionManager,
    },
}

/// Channeled pub/sub fabric pushing invalidation events and per-process
/// updates to connected websocket clients.
///
/// The memory backend fans out within the process; the redis backend
/// publishes to pub/sub so every instance can serve its own websocket
/// clients. A disabled broadcaster turns every publish into a no-op.
#[derive(Clone)]
pub struct Broadcaster {
    backend: Option<Arc<Backend>>,
}

impl Broadcaster {
    /// A broadcaster that drops everything.
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    /// In-process fan-out backend.
    pub fn memory() -> Self {
        Self {
            backend: Some(Arc::new(Backend::Memory {
                processes: broadcast::channel(MEMORY_CHANNEL_CAPACITY).0,
                engine_settings: broadcast::channel(MEMORY_CHANNEL_CAPACITY).0,
                events: broadcast::channel(MEMORY_CHANNEL_CAPACITY).0,
            })),
        }
    }

    /// Redis pub/sub backend.
    pub async fn redis(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RatchetError::Broker(format!("Invalid redis url: {}", e)))?;
        let manager = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| RatchetError::Broker(format!("Failed to connect to redis: {}", e)))?;

        Ok(Self {
            backend: Some(Arc::new(Backend::Redis { client, manager })),
        })
    }

    /// Build the backend selected by `broadcaster_url`, or a disabled
    /// broadcaster when websockets are off.
    pub async fn from_config(enable: bool, broadcaster_url: &str) -> Result<Self> {
        if !enable {
            return Ok(Self::disabled());
        }
        if broadcaster_url.starts_with("memory://") {
            Ok(Self::memory())
        } else {
            Self::redis(broadcaster_url).await
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Publish a JSON message to the given channels.
    pub async fn broadcast(&self, channels: &[Channel], data: &Value) -> Result<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let message = data.to_string();

        match backend.as_ref() {
            Backend::Memory {
                processes,
                engine_settings,
                events,
            } => {
                for channel in channels {
                    let sender = match channel {
                        Channel::Processes => processes,
                        Channel::EngineSettings => engine_settings,
                        Channel::Events => events,
                    };
                    // A send error only means nobody is subscribed.
                    let _ = sender.send(message.clone());
                }
                Ok(())
            }
            Backend::Redis { manager, .. } => {
                let mut conn = manager.clone();
                for channel in channels {
                    let _: i64 = redis::cmd("PUBLISH")
                        .arg(channel.as_str())
                        .arg(&message)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| RatchetError::Broker(format!("Publish failed: {}", e)))?;
                }
                Ok(())
            }
        }
    }

    /// Subscribe to one channel.
    pub async fn subscribe(&self, channel: Channel) -> Result<Subscription> {
        let Some(backend) = &self.backend else {
            return Err(RatchetError::Broker("Broadcasting is disabled".to_string()));
        };

        match backend.as_ref() {
            Backend::Memory {
                processes,
                engine_settings,
                events,
            } => {
                let receiver = match channel {
                    Channel::Processes => processes.subscribe(),
                    Channel::EngineSettings => engine_settings.subscribe(),
                    Channel::Events => events.subscribe(),
                };
                Ok(Subscription::Memory(receiver))
            }
            Backend::Redis { client, .. } => {
                let mut pubsub = client
                    .get_async_pubsub()
                    .await
                    .map_err(|e| RatchetError::Broker(format!("Subscribe failed: {}", e)))?;
                pubsub
                    .subscribe(channel.as_str())
                    .await
                    .map_err(|e| RatchetError::Broker(format!("Subscribe failed: {}", e)))?;
                Ok(Subscription::Redis(Box::pin(pubsub.into_on_message())))
            }
        }
    }

    /// Emit a cache-invalidation event on the events channel.
    pub async fn invalidate_cache(&self, cache_object: Value) -> Result<()> {
        self.broadcast(
            &[Channel::Events],
            &json!({"name": "invalidateCache", "value": cache_object}),
        )
        .await
    }

    /// Invalidate the list view and the detail view of one process.
    pub async fn broadcast_process_update(&self, process_id: Uuid) -> Result<()> {
        self.invalidate_cache(json!({"type": "processes", "id": "LIST"}))
            .await?;
        self.invalidate_cache(json!({"type": "processes", "id": process_id.to_string()}))
            .await
    }

    /// Invalidate the aggregate status counters.
    pub async fn invalidate_status_counts(&self) -> Result<()> {
        self.invalidate_cache(json!({"type": "processStatusCounts"}))
            .await
    }

    /// Push an engine status change to its channel and invalidate caches.
    pub async fn broadcast_engine_status(&self, status: &EngineStatus) -> Result<()> {
        self.broadcast(
            &[Channel::EngineSettings],
            &json!({"engine-status": status}),
        )
        .await?;
        self.invalidate_cache(json!({"type": "engineStatus"})).await
    }
}

/// A live subscription to one broadcast channel.
pub enum Subscription {
    Memory(broadcast::Receiver<String>),
    Redis(Pin<Box<dyn Stream<Item = redis::Msg> + Send>>),
}

impl Subscription {
    /// Next message, or `None` once the channel is gone. Lagged in-memory
    /// subscribers skip ahead rather than erroring.
    pub async fn recv(&mut self) -> Option<String> {
        match self {
            Self::Memory(receiver) => loop {
                match receiver.recv().await {
                    Ok(message) => return Some(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Websocket subscriber lagged, skipping ahead");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Self::Redis(stream) => {
                let msg = stream.next().await?;
                msg.get_payload::<String>().ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!(Channel::parse("processes"), Some(Channel::Processes));
        assert_eq!(Channel::parse("engine-settings"), Some(Channel::EngineSettings));
        assert_eq!(Channel::parse("events"), Some(Channel::Events));
        assert_eq!(Channel::parse("other"), None);
    }

    #[tokio::test]
    async fn test_disabled_broadcast_is_noop() {
        let broadcaster = Broadcaster::disabled();
        assert!(!broadcaster.is_enabled());
        broadcaster
            .broadcast(&[Channel::Processes], &json!({"type": "processes"}))
            .await
            .unwrap();
        assert!(broadcaster.subscribe(Channel::Processes).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_fanout_delivers_to_subscribers() {
        let broadcaster = Broadcaster::memory();
        let mut first = broadcaster.subscribe(Channel::Events).await.unwrap();
        let mut second = broadcaster.subscribe(Channel::Events).await.unwrap();

        broadcaster
            .invalidate_cache(json!({"type": "processStatusCounts"}))
            .await
            .unwrap();

        for sub in [&mut first, &mut second] {
            let message = sub.recv().await.unwrap();
            let value: Value = serde_json::from_str(&message).unwrap();
            assert_eq!(value["name"], "invalidateCache");
            assert_eq!(value["value"]["type"], "processStatusCounts");
        }
    }

    #[tokio::test]
    async fn test_process_update_shapes() {
        let broadcaster = Broadcaster::memory();
        let mut sub = broadcaster.subscribe(Channel::Events).await.unwrap();

        let id = Uuid::new_v4();
        broadcaster.broadcast_process_update(id).await.unwrap();

        let list: Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(list["value"]["id"], "LIST");
        let detail: Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(detail["value"]["id"], id.to_string());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let broadcaster = Broadcaster::memory();
        let mut events = broadcaster.subscribe(Channel::Events).await.unwrap();
        let mut settings = broadcaster.subscribe(Channel::EngineSettings).await.unwrap();

        broadcaster
            .broadcast(&[Channel::EngineSettings], &json!({"engine-status": "x"}))
            .await
            .unwrap();

        assert!(settings.recv().await.is_some());
        // Nothing was published on events; the receiver must still be empty.
        assert!(matches!(
            tokio::time::timeout(std::time::Duration::from_millis(50), events.recv()).await,
            Err(_)
        ));
    }
}
