//! Scriptable store for exercising the resilience layers

use super::{MemoryStore, StoragePort};
use crate::error::{Error, Result};
use crate::memory::{Chunk, ScoredChunk, SearchQuery, StoreStats};
use crate::resilience::{Connection, ConnectionFactory};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Failure injected into the next store call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Validation,
    /// Never complete; the caller's deadline must fire
    Hang,
}

/// Memory store that fails on demand and counts calls reaching it
#[derive(Clone, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Arc<Mutex<VecDeque<Fault>>>,
    always: Arc<Mutex<Option<Fault>>>,
    calls: Arc<AtomicUsize>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `fault`
    pub fn fail_next(&self, n: usize, fault: Fault) {
        let mut faults = self.faults.lock().unwrap();
        faults.extend(std::iter::repeat(fault).take(n));
    }

    /// Fail every call with `fault` until cleared with `None`
    pub fn fail_always(&self, fault: Option<Fault>) {
        *self.always.lock().unwrap() = fault;
    }

    /// Calls that reached the store, failed or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    async fn inject(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = self
            .faults
            .lock()
            .unwrap()
            .pop_front()
            .or(*self.always.lock().unwrap());
        match fault {
            None => Ok(()),
            Some(Fault::Transient) => Err(Error::Transient("connection reset by peer".into())),
            Some(Fault::Validation) => Err(Error::Validation("rejected payload".into())),
            Some(Fault::Hang) => std::future::pending().await,
        }
    }
}

#[async_trait]
impl StoragePort for FaultyStore {
    async fn initialize(&self) -> Result<()> {
        self.inject().await?;
        self.inner.initialize().await
    }

    async fn close(&self) -> Result<()> {
        StoragePort::close(&self.inner).await
    }

    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        self.inject().await?;
        self.inner.upsert(chunk).await
    }

    async fn get(&self, id: &str) -> Result<Chunk> {
        self.inject().await?;
        self.inner.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inject().await?;
        self.inner.delete(id).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredChunk>> {
        self.inject().await?;
        self.inner.search(query).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inject().await?;
        self.inner.stats().await
    }
}

#[async_trait]
impl Connection for FaultyStore {
    async fn is_healthy(&self) -> bool {
        true
    }
}

#[async_trait]
impl ConnectionFactory for FaultyStore {
    type Conn = FaultyStore;

    async fn connect(&self) -> Result<FaultyStore> {
        Ok(self.clone())
    }
}
