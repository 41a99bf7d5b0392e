//! In-memory transactional [`Store`] implementation.
//!
//! Rows live in a single `RwLock<HashMap>`; a transaction stages its writes
//! privately and applies the whole batch under one write lock on commit, so
//! readers never observe a partially applied transaction. Suitable for
//! development, tests and read models that fit in memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::RwLock;

use super::{Store, Transaction};
use crate::context::ExecutionContext;
use crate::error::StoreError;

struct Shared<V> {
    rows: RwLock<HashMap<String, V>>,
    /// Keys whose writes are refused, for failure drills.
    poisoned: DashSet<String>,
    unavailable: AtomicBool,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Cloneable handle to an in-memory table keyed by string.
pub struct MemoryStore<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> MemoryStore<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                rows: RwLock::new(HashMap::new()),
                poisoned: DashSet::new(),
                unavailable: AtomicBool::new(false),
                commits: AtomicU64::new(0),
                rollbacks: AtomicU64::new(0),
            }),
        }
    }

    /// Reads the committed value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.shared.rows.read().get(key).cloned()
    }

    /// Writes a row outside of any transaction (seeding, fixtures).
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.shared.rows.write().insert(key.into(), value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.rows.read().is_empty()
    }

    /// Point-in-time copy of all committed rows.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, V> {
        self.shared.rows.read().clone()
    }

    /// Makes every transactional write to `key` fail with [`StoreError::Rejected`].
    pub fn poison_key(&self, key: impl Into<String>) {
        self.shared.poisoned.insert(key.into());
    }

    pub fn clear_poison(&self, key: &str) {
        self.shared.poisoned.remove(key);
    }

    /// While unavailable, `begin` and `commit` fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Number of transactions rolled back, explicitly or by being dropped.
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

impl<V: Clone + Send + Sync + 'static> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Store for MemoryStore<V> {
    type Tx = MemoryTransaction<V>;

    async fn begin(&self, _ctx: &ExecutionContext) -> Result<Self::Tx, StoreError> {
        self.ensure_available()?;
        Ok(MemoryTransaction {
            store: self.clone(),
            staged: HashMap::new(),
            finished: false,
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryTransaction
// ---------------------------------------------------------------------------

/// Staged writes against a [`MemoryStore`]. `None` marks a deletion.
pub struct MemoryTransaction<V: Clone + Send + Sync + 'static> {
    store: MemoryStore<V>,
    staged: HashMap<String, Option<V>>,
    finished: bool,
}

impl<V: Clone + Send + Sync + 'static> MemoryTransaction<V> {
    /// Reads `key`, seeing this transaction's own staged writes first.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.store.get(key),
        }
    }

    /// Stages an insert or update of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Rejected`] if `key` is poisoned.
    pub fn put(&mut self, key: impl Into<String>, value: V) -> Result<(), StoreError> {
        let key = key.into();
        self.check_writable(&key)?;
        self.staged.insert(key, Some(value));
        Ok(())
    }

    /// Stages a deletion of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Rejected`] if `key` is poisoned.
    pub fn delete(&mut self, key: impl Into<String>) -> Result<(), StoreError> {
        let key = key.into();
        self.check_writable(&key)?;
        self.staged.insert(key, None);
        Ok(())
    }

    /// Number of staged writes.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn check_writable(&self, key: &str) -> Result<(), StoreError> {
        if self.store.shared.poisoned.contains(key) {
            return Err(StoreError::Rejected {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Transaction for MemoryTransaction<V> {
    async fn commit(mut self) -> Result<(), StoreError> {
        // On failure the transaction is dropped unfinished and counted as a rollback.
        self.store.ensure_available()?;
        let staged = std::mem::take(&mut self.staged);
        {
            let mut rows = self.store.shared.rows.write();
            for (key, value) in staged {
                match value {
                    Some(value) => {
                        rows.insert(key, value);
                    }
                    None => {
                        rows.remove(&key);
                    }
                }
            }
        }
        self.finished = true;
        self.store.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.staged.clear();
        self.finished = true;
        self.store.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<V: Clone + Send + Sync + 'static> Drop for MemoryTransaction<V> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
