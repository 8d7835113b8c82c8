//! Delegation creation and guarded lifecycle transitions.
//!
//! A transition is a single conditional store update: it applies only when the
//! document exists and its current state is one of the allowed priors. A
//! missing document and a document in the wrong state are reported the same
//! way, as [`StakeError::NotEligible`].

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::RequestContext;
use crate::error::StakeError;
use crate::filter::{DelegationField, Filter};
use crate::metrics::ServiceMetrics;
use crate::store::{ConditionalUpdateOutcome, DelegationFieldUpdate, DelegationUpdate, DocumentStore};
use crate::types::{DelegationRecord, DelegationState, NewDelegation, TimelockTransaction};

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Checks every `(prior, target)` pair against the transition table.
pub fn validate_transition(
    allowed_prior: &[DelegationState],
    target: DelegationState,
) -> Result<(), StakeError> {
    match allowed_prior
        .iter()
        .find(|prior| !prior.can_transition_to(target))
    {
        Some(from) => Err(StakeError::IllegalTransition {
            from: *from,
            to: target,
        }),
        None => Ok(()),
    }
}

#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn DocumentStore>,
    metrics: Arc<ServiceMetrics>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn DocumentStore>, metrics: Arc<ServiceMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Creates the document; an existing key is a benign no-op.
    pub async fn insert(
        &self,
        ctx: &RequestContext,
        record: DelegationRecord,
    ) -> Result<InsertOutcome, StakeError> {
        let key = record.staking_tx_hash_hex.clone();
        match ctx
            .run("insert_delegation", self.store.insert_delegation(record))
            .await
        {
            Ok(()) => Ok(InsertOutcome::Inserted),
            Err(StakeError::Store(err)) if err.is_duplicate_key() => {
                self.metrics.record_duplicate_insert();
                warn!(
                    staking_tx_hash = %key,
                    "skip the active staking event as it already exists"
                );
                Ok(InsertOutcome::AlreadyExists)
            }
            Err(err) => Err(err),
        }
    }

    /// Records the first observation of a staking event as an `Active` delegation.
    pub async fn save_active_delegation(
        &self,
        ctx: &RequestContext,
        delegation: NewDelegation,
    ) -> Result<InsertOutcome, StakeError> {
        self.insert(ctx, delegation.into_record()).await
    }

    /// Moves `key` to `target` if its current state is in `allowed_prior`,
    /// writing `extra` in the same update.
    pub async fn transition(
        &self,
        ctx: &RequestContext,
        key: &str,
        target: DelegationState,
        allowed_prior: &[DelegationState],
        extra: Vec<DelegationFieldUpdate>,
    ) -> Result<(), StakeError> {
        validate_transition(allowed_prior, target)?;
        let filter = Filter::eq(DelegationField::StakingTxHash, key).and(Filter::in_set(
            DelegationField::State,
            allowed_prior.iter().copied(),
        ));
        let update = DelegationUpdate {
            state: target,
            extra,
        };
        let outcome = ctx
            .run(
                "update_delegation",
                self.store.update_delegation(&filter, &update),
            )
            .await?;
        match outcome {
            ConditionalUpdateOutcome::Applied => {
                self.metrics.record_transition(true);
                info!(staking_tx_hash = %key, state = %target, "delegation transitioned");
                Ok(())
            }
            ConditionalUpdateOutcome::NoMatch => {
                self.metrics.record_transition(false);
                warn!(
                    staking_tx_hash = %key,
                    target = %target,
                    "delegation not found or not in eligible state to transition"
                );
                Err(StakeError::NotEligible {
                    key: key.to_string(),
                    target,
                })
            }
        }
    }

    /// Transition to `target` from every state the table allows.
    async fn transition_from_table(
        &self,
        ctx: &RequestContext,
        key: &str,
        target: DelegationState,
        extra: Vec<DelegationFieldUpdate>,
    ) -> Result<(), StakeError> {
        let priors = DelegationState::eligible_predecessors(target);
        self.transition(ctx, key, target, &priors, extra).await
    }

    /// Staker asked to unbond; the unbonding tx is not yet confirmed.
    pub async fn request_unbonding(
        &self,
        ctx: &RequestContext,
        key: &str,
        unbonding_tx: TimelockTransaction,
    ) -> Result<(), StakeError> {
        self.transition_from_table(
            ctx,
            key,
            DelegationState::UnbondingRequested,
            vec![DelegationFieldUpdate::UnbondingTx(unbonding_tx)],
        )
        .await
    }

    /// Unbonding tx observed on chain.
    pub async fn confirm_unbonding(
        &self,
        ctx: &RequestContext,
        key: &str,
        unbonding_tx: TimelockTransaction,
    ) -> Result<(), StakeError> {
        self.transition_from_table(
            ctx,
            key,
            DelegationState::Unbonding,
            vec![DelegationFieldUpdate::UnbondingTx(unbonding_tx)],
        )
        .await
    }

    /// Staking or unbonding timelock expired.
    pub async fn mark_unbonded(&self, ctx: &RequestContext, key: &str) -> Result<(), StakeError> {
        self.transition_from_table(ctx, key, DelegationState::Unbonded, Vec::new())
            .await
    }

    pub async fn mark_withdrawn(&self, ctx: &RequestContext, key: &str) -> Result<(), StakeError> {
        self.transition_from_table(ctx, key, DelegationState::Withdrawn, Vec::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FindQuery;
    use crate::store::MemoryStore;

    fn new_delegation(key: &str) -> NewDelegation {
        NewDelegation {
            staking_tx_hash_hex: key.to_string(),
            staker_pk_hex: "staker".to_string(),
            finality_provider_pk_hex: "fp".to_string(),
            staking_value: 5_000,
            staking_tx: TimelockTransaction {
                tx_hex: "00".to_string(),
                output_index: 1,
                start_timestamp: 1_700_000_000,
                start_height: 800_000,
                timelock: 64_000,
            },
            is_overflow: false,
            staker_taproot_address: "bc1pstaker".to_string(),
        }
    }

    fn unbonding_tx() -> TimelockTransaction {
        TimelockTransaction {
            tx_hex: "02".to_string(),
            output_index: 0,
            start_timestamp: 1_700_100_000,
            start_height: 800_500,
            timelock: 1_008,
        }
    }

    fn machine() -> (StateMachine, Arc<MemoryStore>, Arc<ServiceMetrics>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(ServiceMetrics::default());
        (StateMachine::new(store.clone(), metrics.clone()), store, metrics)
    }

    async fn state_of(store: &MemoryStore, key: &str) -> DelegationRecord {
        store
            .find_delegations(&FindQuery::new(Filter::eq(DelegationField::StakingTxHash, key)))
            .await
            .expect("find")
            .pop()
            .expect("record present")
    }

    #[test]
    fn validation_rejects_pairs_outside_the_table() {
        assert!(validate_transition(&[DelegationState::Active], DelegationState::Unbonding).is_ok());
        let err = validate_transition(
            &[DelegationState::Active, DelegationState::Withdrawn],
            DelegationState::Unbonding,
        )
        .expect_err("withdrawn cannot unbond");
        assert!(matches!(
            err,
            StakeError::IllegalTransition {
                from: DelegationState::Withdrawn,
                to: DelegationState::Unbonding
            }
        ));
        for from in DelegationState::ALL {
            for to in DelegationState::ALL {
                assert_eq!(
                    validate_transition(&[from], to).is_ok(),
                    from.can_transition_to(to)
                );
            }
        }
    }

    #[tokio::test]
    async fn double_insert_leaves_one_record_without_error() {
        let (machine, store, metrics) = machine();
        let ctx = RequestContext::new();
        let first = machine
            .save_active_delegation(&ctx, new_delegation("a"))
            .await
            .expect("first insert");
        let second = machine
            .save_active_delegation(&ctx, new_delegation("a"))
            .await
            .expect("duplicate insert is benign");
        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::AlreadyExists);
        let all = store
            .find_delegations(&FindQuery::new(Filter::All))
            .await
            .expect("find all");
        assert_eq!(all.len(), 1);
        assert_eq!(metrics.snapshot().duplicate_inserts, 1);
    }

    #[tokio::test]
    async fn transition_succeeds_once_then_is_not_eligible() {
        let (machine, store, metrics) = machine();
        let ctx = RequestContext::new();
        machine
            .save_active_delegation(&ctx, new_delegation("a"))
            .await
            .expect("insert");

        machine
            .transition(
                &ctx,
                "a",
                DelegationState::UnbondingRequested,
                &[DelegationState::Active],
                vec![DelegationFieldUpdate::UnbondingTx(unbonding_tx())],
            )
            .await
            .expect("first transition");
        let record = state_of(&store, "a").await;
        assert_eq!(record.state, DelegationState::UnbondingRequested);
        assert_eq!(record.unbonding_tx, Some(unbonding_tx()));

        let err = machine
            .transition(
                &ctx,
                "a",
                DelegationState::UnbondingRequested,
                &[DelegationState::Active],
                Vec::new(),
            )
            .await
            .expect_err("repeat must fail");
        assert!(matches!(err, StakeError::NotEligible { .. }));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transitions_applied, 1);
        assert_eq!(snapshot.transitions_rejected, 1);
    }

    #[tokio::test]
    async fn missing_record_and_wrong_state_are_indistinguishable() {
        let (machine, _store, _metrics) = machine();
        let ctx = RequestContext::new();
        machine
            .save_active_delegation(&ctx, new_delegation("a"))
            .await
            .expect("insert");

        let wrong_state = machine
            .mark_withdrawn(&ctx, "a")
            .await
            .expect_err("active cannot be withdrawn");
        let missing = machine
            .mark_withdrawn(&ctx, "nope")
            .await
            .expect_err("missing record");
        assert!(matches!(wrong_state, StakeError::NotEligible { .. }));
        assert!(matches!(missing, StakeError::NotEligible { .. }));
        assert_eq!(wrong_state.class(), missing.class());
    }

    #[tokio::test]
    async fn full_lifecycle_follows_table_helpers() {
        let (machine, store, _metrics) = machine();
        let ctx = RequestContext::new();
        machine
            .save_active_delegation(&ctx, new_delegation("a"))
            .await
            .expect("insert");
        machine
            .request_unbonding(&ctx, "a", unbonding_tx())
            .await
            .expect("request unbonding");
        machine
            .confirm_unbonding(&ctx, "a", unbonding_tx())
            .await
            .expect("confirm unbonding");
        machine.mark_unbonded(&ctx, "a").await.expect("unbonded");
        machine.mark_withdrawn(&ctx, "a").await.expect("withdrawn");
        assert_eq!(state_of(&store, "a").await.state, DelegationState::Withdrawn);
        assert!(machine.mark_unbonded(&ctx, "a").await.is_err());
    }

    #[tokio::test]
    async fn illegal_transition_never_reaches_the_store() {
        let (machine, store, metrics) = machine();
        let ctx = RequestContext::new();
        machine
            .save_active_delegation(&ctx, new_delegation("a"))
            .await
            .expect("insert");
        store.set_unavailable(true);
        let err = machine
            .transition(
                &ctx,
                "a",
                DelegationState::Active,
                &[DelegationState::Unbonded],
                Vec::new(),
            )
            .await
            .expect_err("illegal");
        assert!(matches!(err, StakeError::IllegalTransition { .. }));
        assert_eq!(metrics.snapshot().transitions_rejected, 0);
    }
}
