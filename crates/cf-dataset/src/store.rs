use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cf_runtime::UpdateId;
use thiserror::Error;

use crate::Dataset;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dataset not found: {0}")]
    UnknownDataset(String),
    #[error("dataset store lock poisoned")]
    Poisoned,
}

/// Result of asking for the update lease on a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Granted,
    /// The dataset is still being imported or rebuilt.
    NotReady,
    /// An update issued earlier for this dataset has not finished.
    EarlierPending(UpdateId),
    /// Another update holds a live lease.
    Leased(UpdateId),
}

impl Claim {
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Persistence for datasets plus the per-dataset update lease.
pub trait DatasetStore {
    /// A snapshot of the stored dataset.
    fn get(&self, id: &str) -> Result<Dataset, StoreError>;

    /// Insert or overwrite a dataset.
    fn put(&self, dataset: Dataset) -> Result<(), StoreError>;

    fn contains(&self, id: &str) -> Result<bool, StoreError>;

    /// Record that `update_id` has been issued for `id`.
    fn register_pending(&self, id: &str, update_id: UpdateId) -> Result<(), StoreError>;

    /// Atomically check readiness and take the lease for `update_id`.
    fn try_claim(&self, id: &str, update_id: UpdateId, ttl: Duration) -> Result<Claim, StoreError>;

    /// Drop the lease held by `update_id` and mark it complete.
    fn release(&self, id: &str, update_id: UpdateId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    holder: UpdateId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct StoreState {
    datasets: BTreeMap<String, Dataset>,
    pending: BTreeMap<String, BTreeSet<UpdateId>>,
    leases: BTreeMap<String, Lease>,
}

/// Process-local store; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    #[must_use]
    pub fn pending_updates(&self, id: &str) -> Vec<UpdateId> {
        self.lock()
            .map(|state| {
                state
                    .pending
                    .get(id)
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl DatasetStore for InMemoryStore {
    fn get(&self, id: &str) -> Result<Dataset, StoreError> {
        self.lock()?
            .datasets
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownDataset(id.to_owned()))
    }

    fn put(&self, dataset: Dataset) -> Result<(), StoreError> {
        self.lock()?
            .datasets
            .insert(dataset.id().to_owned(), dataset);
        Ok(())
    }

    fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.datasets.contains_key(id))
    }

    fn register_pending(&self, id: &str, update_id: UpdateId) -> Result<(), StoreError> {
        self.lock()?
            .pending
            .entry(id.to_owned())
            .or_default()
            .insert(update_id);
        Ok(())
    }

    fn try_claim(&self, id: &str, update_id: UpdateId, ttl: Duration) -> Result<Claim, StoreError> {
        let mut state = self.lock()?;
        let ready = state
            .datasets
            .get(id)
            .ok_or_else(|| StoreError::UnknownDataset(id.to_owned()))?
            .is_ready();
        if !ready {
            return Ok(Claim::NotReady);
        }

        if let Some(earlier) = state
            .pending
            .get(id)
            .and_then(|ids| ids.range(..update_id).next().copied())
        {
            return Ok(Claim::EarlierPending(earlier));
        }

        let now = Instant::now();
        if let Some(lease) = state.leases.get(id)
            && lease.holder != update_id
            && lease.expires_at > now
        {
            return Ok(Claim::Leased(lease.holder));
        }

        state.leases.insert(
            id.to_owned(),
            Lease {
                holder: update_id,
                expires_at: now + ttl,
            },
        );
        Ok(Claim::Granted)
    }

    fn release(&self, id: &str, update_id: UpdateId) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state
            .leases
            .get(id)
            .is_some_and(|lease| lease.holder == update_id)
        {
            state.leases.remove(id);
        }
        if let Some(ids) = state.pending.get_mut(id) {
            ids.remove(&update_id);
            if ids.is_empty() {
                state.pending.remove(id);
            }
        }
        Ok(())
    }
}
