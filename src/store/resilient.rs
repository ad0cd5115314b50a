//! Resilient store client
//!
//! Three wrappers, each a [`StoragePort`] delegating to the next:
//!
//! - [`RetryStore`] retries transient failures under a [`BackoffPolicy`] and
//!   surfaces `StoreUnavailable` once the attempt cap is reached
//! - [`BreakerStore`] routes each call through a per-target [`CircuitBreaker`]
//! - [`PooledStore`] checks out one lease per call, bounds the call with a
//!   deadline, and discards the connection on transient failure
//!
//! [`ResilientStore`] assembles the chain and enforces query bounds before
//! anything reaches the network.

use super::StoragePort;
use crate::config::MemSyncConfig;
use crate::error::{Error, Result};
use crate::memory::{Chunk, ScoredChunk, SearchQuery, StoreStats};
use crate::resilience::{
    BackoffPolicy, BreakerRegistry, BreakerStats, CircuitBreaker, ConnectionFactory,
    ConnectionPool, Lease, PoolStats,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Pool layer
// ============================================================================

/// Borrows a pooled connection for exactly one store call
pub struct PooledStore<F: ConnectionFactory>
where
    F::Conn: StoragePort,
{
    pool: Arc<ConnectionPool<F>>,
    call_timeout: Duration,
}

impl<F: ConnectionFactory> PooledStore<F>
where
    F::Conn: StoragePort,
{
    pub fn new(pool: Arc<ConnectionPool<F>>, call_timeout: Duration) -> Self {
        Self { pool, call_timeout }
    }

    async fn with_deadline<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transient(format!(
                "{} timed out after {:?}",
                what, self.call_timeout
            ))),
        }
    }

    /// Return the lease, dropping its connection if the call failed transiently
    fn settle<T>(mut lease: Lease<F>, result: &Result<T>) {
        if matches!(result, Err(e) if e.is_transient()) {
            lease.discard();
        }
    }
}

#[async_trait]
impl<F: ConnectionFactory> StoragePort for PooledStore<F>
where
    F::Conn: StoragePort,
{
    async fn initialize(&self) -> Result<()> {
        let lease = self.pool.acquire().await?;
        let result = self.with_deadline("initialize", lease.initialize()).await;
        Self::settle(lease, &result);
        result
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        let lease = self.pool.acquire().await?;
        let result = self.with_deadline("upsert", lease.upsert(chunk)).await;
        Self::settle(lease, &result);
        result
    }

    async fn get(&self, id: &str) -> Result<Chunk> {
        let lease = self.pool.acquire().await?;
        let result = self.with_deadline("get", lease.get(id)).await;
        Self::settle(lease, &result);
        result
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let lease = self.pool.acquire().await?;
        let result = self.with_deadline("delete", lease.delete(id)).await;
        Self::settle(lease, &result);
        result
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        let lease = self.pool.acquire().await?;
        let result = self.with_deadline("search", lease.search(query)).await;
        Self::settle(lease, &result);
        result
    }

    async fn stats(&self) -> Result<StoreStats> {
        let lease = self.pool.acquire().await?;
        let result = self.with_deadline("stats", lease.stats()).await;
        Self::settle(lease, &result);
        result
    }
}

// ============================================================================
// Breaker layer
// ============================================================================

/// Fails fast while the target's circuit is open
pub struct BreakerStore<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S: StoragePort> BreakerStore<S> {
    pub fn new(inner: S, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl<S: StoragePort> StoragePort for BreakerStore<S> {
    async fn initialize(&self) -> Result<()> {
        self.breaker.call(|| self.inner.initialize()).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        self.breaker.call(|| self.inner.upsert(chunk)).await
    }

    async fn get(&self, id: &str) -> Result<Chunk> {
        self.breaker.call(|| self.inner.get(id)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.breaker.call(|| self.inner.delete(id)).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        self.breaker.call(|| self.inner.search(query)).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.breaker.call(|| self.inner.stats()).await
    }
}

// ============================================================================
// Retry layer
// ============================================================================

/// Retries transient failures with exponential backoff
pub struct RetryStore<S> {
    inner: S,
    policy: BackoffPolicy,
    max_attempts: u32,
}

impl<S: StoragePort> RetryStore<S> {
    pub fn new(inner: S, policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            inner,
            policy,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn run<T, Op, Fut>(&self, what: &str, mut op: Op) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            operation = what,
                            attempts = attempt,
                            "Store unavailable: {}",
                            e
                        );
                        return Err(Error::StoreUnavailable {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.policy.next_delay(attempt - 1);
                    tracing::debug!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after transient store error: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<S: StoragePort> StoragePort for RetryStore<S> {
    async fn initialize(&self) -> Result<()> {
        self.run("initialize", || self.inner.initialize()).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        self.run("upsert", || self.inner.upsert(chunk)).await
    }

    async fn get(&self, id: &str) -> Result<Chunk> {
        self.run("get", || self.inner.get(id)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.run("delete", || self.inner.delete(id)).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        self.run("search", || self.inner.search(query)).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.run("stats", || self.inner.stats()).await
    }
}

// ============================================================================
// Composition
// ============================================================================

/// Health counters of a resilient store
pub trait StoreProbe: Send + Sync {
    fn pool_stats(&self) -> PoolStats;
    fn breaker_stats(&self) -> BreakerStats;
}

/// Pool + breaker + retry around a raw driver
pub struct ResilientStore<F: ConnectionFactory>
where
    F::Conn: StoragePort,
{
    chain: RetryStore<BreakerStore<PooledStore<F>>>,
    pool: Arc<ConnectionPool<F>>,
    breaker: Arc<CircuitBreaker>,
    max_top_k: usize,
}

impl<F: ConnectionFactory> ResilientStore<F>
where
    F::Conn: StoragePort,
{
    /// Open the pool and assemble the wrapper chain for `target`
    pub async fn connect(
        factory: F,
        target: &str,
        config: &MemSyncConfig,
        breakers: &BreakerRegistry,
    ) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new(factory, config.pool.clone()).await?);
        let breaker = breakers.get(target);
        let chain = RetryStore::new(
            BreakerStore::new(
                PooledStore::new(pool.clone(), config.store.call_timeout()),
                breaker.clone(),
            ),
            BackoffPolicy::from_config(&config.retry),
            config.retry.max_attempts,
        );
        tracing::info!(
            endpoint = target,
            pool_max = config.pool.max_size,
            retry_attempts = config.retry.max_attempts,
            "Resilient store ready"
        );
        Ok(Self {
            chain,
            pool,
            breaker,
            max_top_k: config.repository.max_top_k,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn validate_query(&self, query: &SearchQuery) -> Result<()> {
        if query.vector.is_empty() {
            return Err(Error::Validation("query vector must not be empty".to_string()));
        }
        if query.top_k == 0 || query.top_k > self.max_top_k {
            return Err(Error::Validation(format!(
                "top_k must be within 1..={}, got {}",
                self.max_top_k, query.top_k
            )));
        }
        Ok(())
    }
}

impl<F: ConnectionFactory> StoreProbe for ResilientStore<F>
where
    F::Conn: StoragePort,
{
    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }
}

#[async_trait]
impl<F: ConnectionFactory> StoragePort for ResilientStore<F>
where
    F::Conn: StoragePort,
{
    async fn initialize(&self) -> Result<()> {
        self.chain.initialize().await
    }

    async fn close(&self) -> Result<()> {
        self.chain.close().await
    }

    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        self.chain.upsert(chunk).await
    }

    async fn get(&self, id: &str) -> Result<Chunk> {
        self.chain.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.chain.delete(id).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        self.validate_query(query)?;
        self.chain.search(query).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.chain.stats().await
    }
}
