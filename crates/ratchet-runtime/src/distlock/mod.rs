use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use uuid::Uuid;

use ratchet_core::error::{RatchetError, Result};

/// Namespace prefix for redis lock keys.
const REDIS_NAMESPACE: &str = "ratchet:distlock";

/// Cadence of the in-memory expiration sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// A held advisory lock. Release it through the manager that issued it;
/// the backend also releases it once the TTL expires.
#[derive(Debug, Clone)]
pub struct DistLock {
    resource: String,
    token: Uuid,
}

impl DistLock {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

struct MemoryLocks {
    locks: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl MemoryLocks {
    fn sweep(&self) {
        let now = Instant::now();
        let mut locks = self.locks.lock().expect("distlock map poisoned");
        locks.retain(|resource, (_, expire_at)| {
            let keep = *expire_at > now;
            if !keep {
                tracing::debug!(resource = %resource, "Released expired lock");
            }
            keep
        });
    }
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<MemoryLocks>),
    Redis(redis::aio::ConnectionManager),
}

/// Advisory locks with TTL over a pluggable backend.
///
/// The lock is advisory; it is up to callers to respect it. Acquisition is
/// non-blocking and succeeds or fails immediately. The memory backend is
/// limited to a single process and exists for development and tests; the
/// redis backend gives cluster-wide exclusion.
#[derive(Clone)]
pub struct DistLockManager {
    enabled: bool,
    backend: Backend,
}

impl DistLockManager {
    /// In-memory backend with a background expiration sweeper.
    pub fn memory() -> Self {
        let locks = Arc::new(MemoryLocks {
            locks: Mutex::new(HashMap::new()),
        });

        let weak: Weak<MemoryLocks> = Arc::downgrade(&locks);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(locks) = weak.upgrade() else {
                    break;
                };
                locks.sweep();
            }
        });

        Self {
            enabled: true,
            backend: Backend::Memory(locks),
        }
    }

    /// Redis backend using `SET NX PX` with token-checked release.
    pub async fn redis(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RatchetError::LockBackend(format!("Invalid redis url: {}", e)))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| RatchetError::LockBackend(format!("Failed to connect to redis: {}", e)))?;

        Ok(Self {
            enabled: true,
            backend: Backend::Redis(manager),
        })
    }

    /// A manager that refuses every lock. Callers relying on a lock for
    /// mutual exclusion stay safe: they simply never enter the critical
    /// section.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            backend: Backend::Memory(Arc::new(MemoryLocks {
                locks: Mutex::new(HashMap::new()),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Try to lock `resource` for `ttl`. Returns `None` when the resource
    /// is already locked, the manager is disabled, or the backend errored.
    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> Option<DistLock> {
        if !self.enabled {
            return None;
        }

        let token = Uuid::new_v4();
        match &self.backend {
            Backend::Memory(locks) => {
                let mut map = locks.locks.lock().expect("distlock map poisoned");
                let now = Instant::now();
                match map.get(resource) {
                    Some((_, expire_at)) if *expire_at > now => {
                        tracing::debug!(resource = %resource, "Resource is already locked");
                        None
                    }
                    _ => {
                        map.insert(resource.to_string(), (token, now + ttl));
                        Some(DistLock {
                            resource: resource.to_string(),
                            token,
                        })
                    }
                }
            }
            Backend::Redis(manager) => {
                let key = format!("{}:{}", REDIS_NAMESPACE, resource);
                let mut conn = manager.clone();
                let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
                    .arg(&key)
                    .arg(token.to_string())
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await;

                match result {
                    Ok(Some(_)) => Some(DistLock {
                        resource: resource.to_string(),
                        token,
                    }),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::error!(resource = %resource, error = %e, "Could not acquire lock");
                        None
                    }
                }
            }
        }
    }

    /// Release a held lock. Releasing an expired or foreign lock is a no-op.
    pub async fn release(&self, lock: DistLock) {
        match &self.backend {
            Backend::Memory(locks) => {
                let mut map = locks.locks.lock().expect("distlock map poisoned");
                if let Some((token, _)) = map.get(&lock.resource) {
                    if *token == lock.token {
                        map.remove(&lock.resource);
                        tracing::debug!(resource = %lock.resource, "Released lock");
                    }
                }
            }
            Backend::Redis(manager) => {
                let key = format!("{}:{}", REDIS_NAMESPACE, lock.resource);
                let script = redis::Script::new(
                    r#"
                    if redis.call('get', KEYS[1]) == ARGV[1] then
                        return redis.call('del', KEYS[1])
                    else
                        return 0
                    end
                    "#,
                );
                let mut conn = manager.clone();
                let released: redis::RedisResult<i64> = script
                    .key(&key)
                    .arg(lock.token.to_string())
                    .invoke_async(&mut conn)
                    .await;
                if let Err(e) = released {
                    tracing::error!(resource = %lock.resource, error = %e, "Could not release lock");
                }
            }
        }
    }

    /// Fire-and-forget release for contexts that cannot await.
    pub fn release_sync(&self, lock: DistLock) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.release(lock).await;
        });
    }
}
