use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{
    validate_delegation, validate_stats, ConditionalUpdateOutcome, DelegationUpdate, DocumentStore,
};
use crate::error::StoreError;
use crate::filter::{select, DelegationField, Document, Filter, FindQuery, FpStatsField};
use crate::types::{DelegationRecord, FinalityProviderStats};

/// Volatile store keyed by document key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    delegations: RwLock<BTreeMap<String, DelegationRecord>>,
    fp_stats: RwLock<BTreeMap<String, FinalityProviderStats>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_delegation(&self, record: DelegationRecord) -> Result<(), StoreError> {
        self.ensure_available()?;
        validate_delegation(&record)?;
        let mut guard = self.delegations.write().map_err(|_| poisoned())?;
        if guard.contains_key(&record.staking_tx_hash_hex) {
            return Err(StoreError::DuplicateKey {
                key: record.staking_tx_hash_hex,
            });
        }
        guard.insert(record.staking_tx_hash_hex.clone(), record);
        Ok(())
    }

    async fn find_delegations(
        &self,
        query: &FindQuery<DelegationField>,
    ) -> Result<Vec<DelegationRecord>, StoreError> {
        self.ensure_available()?;
        let guard = self.delegations.read().map_err(|_| poisoned())?;
        Ok(select(guard.values(), query))
    }

    async fn update_delegation(
        &self,
        filter: &Filter<DelegationField>,
        update: &DelegationUpdate,
    ) -> Result<ConditionalUpdateOutcome, StoreError> {
        self.ensure_available()?;
        let mut guard = self.delegations.write().map_err(|_| poisoned())?;
        let target = match filter.pinned_key(DelegationRecord::KEY_FIELD) {
            Some(key) => guard.get_mut(key).filter(|record| filter.matches(&**record)),
            None => guard.values_mut().find(|record| filter.matches(&**record)),
        };
        match target {
            Some(record) => {
                update.apply_to(record);
                Ok(ConditionalUpdateOutcome::Applied)
            }
            None => Ok(ConditionalUpdateOutcome::NoMatch),
        }
    }

    async fn upsert_finality_provider_stats(
        &self,
        stats: FinalityProviderStats,
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        validate_stats(&stats)?;
        let mut guard = self.fp_stats.write().map_err(|_| poisoned())?;
        guard.insert(stats.finality_provider_pk_hex.clone(), stats);
        Ok(())
    }

    async fn find_finality_provider_stats(
        &self,
        query: &FindQuery<FpStatsField>,
    ) -> Result<Vec<FinalityProviderStats>, StoreError> {
        self.ensure_available()?;
        let guard = self.fp_stats.read().map_err(|_| poisoned())?;
        Ok(select(guard.values(), query))
    }
}
