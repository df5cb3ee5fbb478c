//! Per-instance pools of long-lived stdio children.
//!
//! A request against a stdio instance borrows one child for the duration of
//! the call. The pool caps concurrent borrows at the policy's `pool_size`;
//! when saturated, waiters queue up to a bounded depth and overflow is
//! rejected so the router can answer 503 instead of piling up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcpgrid_mcp::{ConnectionError, StdioConnection, StdioSpawn};
use tracing::debug;

use crate::registry::Instance;

/// Waiters allowed behind a saturated pool before 503.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

#[derive(Debug)]
pub enum PoolError {
    /// Pool saturated and the wait queue is full.
    QueueFull,
    /// The instance has no usable exec spec.
    NoCommand,
    /// Spawning or initializing a fresh child failed.
    Spawn(ConnectionError),
}

struct InstancePool {
    spawn: StdioSpawn,
    timeout: Duration,
    semaphore: Arc<tokio::sync::Semaphore>,
    waiters: AtomicUsize,
    max_waiters: usize,
    idle: tokio::sync::Mutex<Vec<StdioConnection>>,
}

/// All stdio pools, keyed by instance id.
pub struct StdioPool {
    pools: Mutex<HashMap<String, Arc<InstancePool>>>,
    queue_depth: usize,
}

/// A borrowed child. Return it with `release`; a healthy child goes back
/// to the idle set, a broken one is dropped (and killed with it).
pub struct PooledConnection {
    connection: Option<StdioConnection>,
    pool: Arc<InstancePool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn connection(&self) -> &StdioConnection {
        self.connection.as_ref().expect("present until release")
    }

    /// Hand the child back. Pass `reusable: false` after transport errors.
    pub async fn release(mut self, reusable: bool) {
        let connection = self.connection.take().expect("released once");
        if reusable && !connection.is_closed() {
            self.pool.idle.lock().await.push(connection);
        } else {
            connection.close().await;
        }
        // The permit drops with self, freeing the slot.
    }
}

impl StdioPool {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            queue_depth,
        }
    }

    /// Borrow a child for `instance`, spawning one if the pool has capacity
    /// but no idle children.
    pub async fn acquire(
        &self,
        instance: &Instance,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        let pool = self.pool_for(instance, pool_size, timeout)?;

        // Bounded wait: try for a free slot, else count ourselves as a
        // waiter and reject once the queue is full.
        let permit = match pool.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if pool.waiters.load(Ordering::SeqCst) >= pool.max_waiters {
                    return Err(PoolError::QueueFull);
                }
                pool.waiters.fetch_add(1, Ordering::SeqCst);
                let acquired = pool.semaphore.clone().acquire_owned().await;
                pool.waiters.fetch_sub(1, Ordering::SeqCst);
                acquired.expect("pool semaphore never closes")
            }
        };

        // Prefer an idle child; discard any that died while parked.
        loop {
            let candidate = pool.idle.lock().await.pop();
            match candidate {
                Some(connection) if connection.is_closed() => {
                    debug!(instance = %instance.id, "dropping dead pooled child");
                    connection.close().await;
                }
                Some(connection) => {
                    return Ok(PooledConnection {
                        connection: Some(connection),
                        pool,
                        _permit: permit,
                    })
                }
                None => break,
            }
        }

        let connection =
            StdioConnection::spawn(&pool.spawn, pool.timeout).map_err(PoolError::Spawn)?;
        connection.initialize().await.map_err(PoolError::Spawn)?;
        debug!(instance = %instance.id, "spawned pooled stdio child");
        Ok(PooledConnection {
            connection: Some(connection),
            pool,
            _permit: permit,
        })
    }

    /// Tear down an instance's pool (on deregistration).
    pub async fn evict(&self, instance_id: &str) {
        let pool = self.pools.lock().expect("pool map lock").remove(instance_id);
        if let Some(pool) = pool {
            let mut idle = pool.idle.lock().await;
            for connection in idle.drain(..) {
                connection.close().await;
            }
        }
    }

    fn pool_for(
        &self,
        instance: &Instance,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<Arc<InstancePool>, PoolError> {
        let mut pools = self.pools.lock().expect("pool map lock");
        if let Some(pool) = pools.get(&instance.id) {
            return Ok(pool.clone());
        }

        let command = instance.command.as_deref().ok_or(PoolError::NoCommand)?;
        let (program, args) = command.split_first().ok_or(PoolError::NoCommand)?;
        let mut spawn = StdioSpawn::new(program.clone(), args.to_vec());
        if let Some(env) = &instance.env {
            spawn.env = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }

        let pool = Arc::new(InstancePool {
            spawn,
            timeout,
            semaphore: Arc::new(tokio::sync::Semaphore::new(pool_size.max(1))),
            waiters: AtomicUsize::new(0),
            max_waiters: self.queue_depth,
            idle: tokio::sync::Mutex::new(Vec::new()),
        });
        pools.insert(instance.id.clone(), pool.clone());
        Ok(pool)
    }
}

impl Default for StdioPool {
    fn default() -> Self {
        Self::new()
    }
}
