//! Document store contract and its local backends.
//!
//! The core only relies on three capabilities: single-document atomic
//! updates, filtering, and sorted retrieval. [`MemoryStore`] and
//! [`FjallStore`] provide exactly those.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::filter::{DelegationField, Filter, FindQuery, FpStatsField};
use crate::types::{
    DelegationRecord, DelegationState, FinalityProviderStats, TimelockTransaction, MAX_FIELD_BYTES,
};

mod fjall_store;
mod memory;

pub use fjall_store::FjallStore;
pub use memory::MemoryStore;

/// Auxiliary field written in the same atomic update as a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationFieldUpdate {
    UnbondingTx(TimelockTransaction),
}

/// `$set` payload of a conditional delegation update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationUpdate {
    pub state: DelegationState,
    pub extra: Vec<DelegationFieldUpdate>,
}

impl DelegationUpdate {
    pub fn apply_to(&self, record: &mut DelegationRecord) {
        record.state = self.state;
        for field in &self.extra {
            match field {
                DelegationFieldUpdate::UnbondingTx(tx) => record.unbonding_tx = Some(tx.clone()),
            }
        }
    }
}

fn check_field(name: &str, value: &str) -> Result<(), StoreError> {
    if value.len() > MAX_FIELD_BYTES {
        return Err(StoreError::InvalidDocument(format!(
            "{name} is {} bytes, limit is {MAX_FIELD_BYTES}",
            value.len()
        )));
    }
    Ok(())
}

fn check_key(name: &str, key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidDocument(format!("{name} is empty")));
    }
    check_field(name, key)
}

/// Enforced by every backend before a delegation is written.
pub(crate) fn validate_delegation(record: &DelegationRecord) -> Result<(), StoreError> {
    check_key("staking_tx_hash_hex", &record.staking_tx_hash_hex)?;
    check_field("staker_pk_hex", &record.staker_pk_hex)?;
    check_field("finality_provider_pk_hex", &record.finality_provider_pk_hex)?;
    check_field(
        "staker_btc_address.taproot_address",
        &record.staker_btc_address.taproot_address,
    )
}

/// Enforced by every backend before a stats document is written.
pub(crate) fn validate_stats(stats: &FinalityProviderStats) -> Result<(), StoreError> {
    check_key("finality_provider_pk_hex", &stats.finality_provider_pk_hex)
}

/// Result of a conditional single-document update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalUpdateOutcome {
    Applied,
    NoMatch,
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Inserts a new delegation; an existing key yields [`StoreError::DuplicateKey`].
    async fn insert_delegation(&self, record: DelegationRecord) -> Result<(), StoreError>;

    async fn find_delegations(
        &self,
        query: &FindQuery<DelegationField>,
    ) -> Result<Vec<DelegationRecord>, StoreError>;

    /// Applies `update` to the first delegation (by key) matching `filter`,
    /// atomically with respect to other updates of the same document.
    async fn update_delegation(
        &self,
        filter: &Filter<DelegationField>,
        update: &DelegationUpdate,
    ) -> Result<ConditionalUpdateOutcome, StoreError>;

    /// Replaces the stats document for one provider.
    async fn upsert_finality_provider_stats(
        &self,
        stats: FinalityProviderStats,
    ) -> Result<(), StoreError>;

    async fn find_finality_provider_stats(
        &self,
        query: &FindQuery<FpStatsField>,
    ) -> Result<Vec<FinalityProviderStats>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StakerBtcAddress;

    #[test]
    fn update_sets_state_and_unbonding_tx_together() {
        let mut record = DelegationRecord {
            staking_tx_hash_hex: "k".into(),
            staker_pk_hex: "s".into(),
            finality_provider_pk_hex: "f".into(),
            staking_value: 1,
            state: DelegationState::Active,
            staking_tx: TimelockTransaction {
                tx_hex: "00".into(),
                output_index: 0,
                start_timestamp: 0,
                start_height: 1,
                timelock: 10,
            },
            unbonding_tx: None,
            is_overflow: false,
            staker_btc_address: StakerBtcAddress::default(),
        };
        let unbonding = TimelockTransaction {
            tx_hex: "01".into(),
            output_index: 0,
            start_timestamp: 5,
            start_height: 2,
            timelock: 3,
        };
        DelegationUpdate {
            state: DelegationState::UnbondingRequested,
            extra: vec![DelegationFieldUpdate::UnbondingTx(unbonding.clone())],
        }
        .apply_to(&mut record);
        assert_eq!(record.state, DelegationState::UnbondingRequested);
        assert_eq!(record.unbonding_tx, Some(unbonding));
    }
}
