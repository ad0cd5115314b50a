//! Bounded connection pool
//!
//! Connections are created lazily up to `max_size` (with `min_size` created
//! eagerly and kept topped up by the health checker). A semaphore with
//! `max_size` permits bounds the number of live leases; a lease owns its
//! connection exclusively until it is dropped, at which point the connection
//! goes back to the idle list or, if it was marked broken or the pool has
//! closed, is destroyed.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A poolable client handle
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Liveness probe used by the idle health checker
    async fn is_healthy(&self) -> bool;

    /// Release underlying resources
    async fn close(&self) {}
}

/// Creates new connections for a pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self) -> Result<Self::Conn>;
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub created: u64,
    pub destroyed: u64,
}

struct PooledConn<C> {
    id: u64,
    conn: C,
    created_at: Instant,
}

struct PoolShared<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledConn<F::Conn>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    next_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl<F: ConnectionFactory> PoolShared<F> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<PooledConn<F::Conn>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, pc: &PooledConn<F::Conn>) -> bool {
        self.config
            .max_lifetime()
            .is_some_and(|lifetime| pc.created_at.elapsed() > lifetime)
    }

    fn in_use(&self) -> usize {
        self.config
            .max_size
            .saturating_sub(self.permits.available_permits())
    }

    async fn open(&self) -> Result<PooledConn<F::Conn>> {
        let conn = self.factory.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn_id = id, "Opened pooled connection");
        Ok(PooledConn {
            id,
            conn,
            created_at: Instant::now(),
        })
    }

    async fn destroy(&self, pc: PooledConn<F::Conn>) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn_id = pc.id, "Closing pooled connection");
        pc.conn.close().await;
    }

    fn destroy_detached(&self, pc: PooledConn<F::Conn>) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn_id = pc.id, "Closing pooled connection");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { pc.conn.close().await });
        }
    }

    /// One health-check pass over idle connections, then top up to `min_size`.
    /// Returns the number of connections discarded.
    async fn check_idle(&self) -> usize {
        let mut discarded = 0;
        let candidates = self.idle().len();

        for _ in 0..candidates {
            // A connection under inspection counts as in use.
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(pc) = self.idle().pop_front() else {
                break;
            };
            if self.is_expired(&pc) || !pc.conn.is_healthy().await {
                tracing::warn!(conn_id = pc.id, "Discarding unhealthy idle connection");
                self.destroy(pc).await;
                discarded += 1;
            } else {
                self.idle().push_back(pc);
            }
            drop(permit);
        }

        while !self.closed.load(Ordering::Acquire)
            && self.idle().len() + self.in_use() < self.config.min_size
        {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            match self.open().await {
                Ok(pc) => self.idle().push_back(pc),
                Err(e) => {
                    tracing::warn!("Failed to replenish connection pool: {}", e);
                    break;
                }
            }
            drop(permit);
        }

        discarded
    }
}

/// Bounded pool of reusable connections
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<PoolShared<F>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool, opening `min_size` connections up front
    pub async fn new(factory: F, config: PoolConfig) -> Result<Self> {
        if config.max_size == 0 {
            return Err(Error::Config("pool max_size must be positive".to_string()));
        }
        if config.min_size > config.max_size {
            return Err(Error::Config("pool min_size exceeds max_size".to_string()));
        }

        let shared = Arc::new(PoolShared {
            permits: Arc::new(Semaphore::new(config.max_size)),
            factory,
            config,
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        });

        for _ in 0..shared.config.min_size {
            let pc = shared.open().await?;
            shared.idle().push_back(pc);
        }

        let health_task = shared
            .config
            .health_check_interval()
            .map(|period| spawn_health_checker(Arc::downgrade(&shared), period));

        Ok(Self {
            shared,
            health_task: Mutex::new(health_task),
        })
    }

    /// Borrow a connection, waiting up to the acquire timeout
    pub async fn acquire(&self) -> Result<Lease<F>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let timeout = self.shared.config.acquire_timeout();
        let permit = match tokio::time::timeout(
            timeout,
            self.shared.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => return Err(Error::PoolExhausted { waited: timeout }),
        };

        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        loop {
            let candidate = self.shared.idle().pop_back();
            match candidate {
                Some(pc) if self.shared.is_expired(&pc) => self.shared.destroy(pc).await,
                Some(pc) => return Ok(Lease::new(pc, self.shared.clone(), permit)),
                None => break,
            }
        }

        let pc = self.shared.open().await?;
        Ok(Lease::new(pc, self.shared.clone(), permit))
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: Lease<F>) {
        drop(lease);
    }

    /// Run one idle health-check pass immediately
    pub async fn check_idle(&self) -> usize {
        self.shared.check_idle().await
    }

    /// Close the pool: idle connections are closed now, borrowed ones when
    /// their lease is dropped. Subsequent `acquire` calls fail.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.permits.close();

        let task = self
            .health_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let drained: Vec<_> = self.shared.idle().drain(..).collect();
        for pc in drained {
            self.shared.destroy(pc).await;
        }
        tracing::info!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.shared.idle().len(),
            in_use: if self.is_closed() { 0 } else { self.shared.in_use() },
            min_size: self.shared.config.min_size,
            max_size: self.shared.config.max_size,
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
        }
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        if let Some(task) = self
            .health_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

fn spawn_health_checker<F: ConnectionFactory>(
    shared: Weak<PoolShared<F>>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.closed.load(Ordering::Acquire) {
                break;
            }
            let discarded = shared.check_idle().await;
            if discarded > 0 {
                tracing::info!(discarded, "Pool health check replaced connections");
            }
        }
    })
}

/// Exclusive handle to a pooled connection
pub struct Lease<F: ConnectionFactory> {
    conn: Option<PooledConn<F::Conn>>,
    shared: Arc<PoolShared<F>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> Lease<F> {
    fn new(pc: PooledConn<F::Conn>, shared: Arc<PoolShared<F>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(pc),
            shared,
            broken: false,
            _permit: permit,
        }
    }

    /// Identifier of the underlying connection
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |pc| pc.id)
    }

    /// Do not return this connection to the pool
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl<F: ConnectionFactory> Deref for Lease<F> {
    type Target = F::Conn;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(pc) => &pc.conn,
            None => unreachable!("lease connection is only taken on drop"),
        }
    }
}

impl<F: ConnectionFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        let Some(pc) = self.conn.take() else {
            return;
        };
        if self.broken || self.shared.closed.load(Ordering::Acquire) {
            self.shared.destroy_detached(pc);
        } else {
            // Back to idle before the permit is released, so a waiter finds it.
            self.shared.idle().push_back(pc);
        }
    }
}
