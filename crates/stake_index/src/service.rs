//! Caller-facing staking operations.
//!
//! [`StakingService`] wires the query engine, state machine and stats
//! aggregator to one store and classifies every failure into an [`ApiError`]
//! exactly once, at this boundary.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use serde::Serialize;
use tracing::{error, warn};

use crate::config::StakeIndexConfig;
use crate::context::RequestContext;
use crate::error::StakeError;
use crate::metrics::{ServiceMetrics, ServiceMetricsSnapshot};
use crate::query::{DelegationFilter, Page, PageRequest, QueryEngine};
use crate::state_machine::{InsertOutcome, StateMachine};
use crate::stats::{FinalityProviderDetails, StatsAggregator};
use crate::store::{DelegationFieldUpdate, DocumentStore};
use crate::types::{
    DelegationRecord, DelegationState, FinalityProviderReference, NewDelegation,
    TimelockTransaction,
};

/// Classified failure returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn with_message(err: &StakeError, message: impl Into<String>) -> Self {
        let class = err.class();
        Self {
            status: class.status_code(),
            code: class.code(),
            message: message.into(),
        }
    }
}

impl From<StakeError> for ApiError {
    fn from(err: StakeError) -> Self {
        let message = err.to_string();
        Self::with_message(&err, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionPublic {
    pub tx_hex: String,
    pub output_index: u64,
    /// RFC 3339, UTC.
    pub start_timestamp: String,
    pub start_height: u64,
    pub timelock: u64,
}

impl From<&TimelockTransaction> for TransactionPublic {
    fn from(tx: &TimelockTransaction) -> Self {
        Self {
            tx_hex: tx.tx_hex.clone(),
            output_index: tx.output_index,
            start_timestamp: format_timestamp(tx.start_timestamp),
            start_height: tx.start_height,
            timelock: tx.timelock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelegationPublic {
    pub staking_tx_hash_hex: String,
    pub staker_pk_hex: String,
    pub finality_provider_pk_hex: String,
    pub state: DelegationState,
    pub staking_value: u64,
    pub staking_tx: TransactionPublic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unbonding_tx: Option<TransactionPublic>,
    pub is_overflow: bool,
}

impl From<&DelegationRecord> for DelegationPublic {
    fn from(record: &DelegationRecord) -> Self {
        Self {
            staking_tx_hash_hex: record.staking_tx_hash_hex.clone(),
            staker_pk_hex: record.staker_pk_hex.clone(),
            finality_provider_pk_hex: record.finality_provider_pk_hex.clone(),
            state: record.state,
            staking_value: record.staking_value,
            staking_tx: TransactionPublic::from(&record.staking_tx),
            unbonding_tx: record
                .unbonding_tx
                .as_ref()
                .filter(|tx| !tx.tx_hex.is_empty())
                .map(TransactionPublic::from),
            is_overflow: record.is_overflow,
        }
    }
}

/// Unix seconds as an RFC 3339 UTC string; out-of-range values render raw.
pub fn format_timestamp(unix_seconds: i64) -> String {
    match DateTime::from_timestamp(unix_seconds, 0) {
        Some(at) => at.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => unix_seconds.to_string(),
    }
}

/// Empty string is the first page, mirroring the HTTP query parameter.
fn page_token(raw: &str) -> Option<&str> {
    (!raw.is_empty()).then_some(raw)
}

/// A page of caller-facing items; `next_token` is empty on the last page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicPage<T> {
    pub data: Vec<T>,
    pub next_token: String,
}

impl<T> PublicPage<T> {
    fn from_page<S>(page: Page<S>, map: impl FnMut(S) -> T) -> Self {
        Self {
            data: page.items.into_iter().map(map).collect(),
            next_token: page.next_token.unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
pub struct StakingService {
    engine: QueryEngine,
    machine: StateMachine,
    aggregator: StatsAggregator,
    metrics: Arc<ServiceMetrics>,
    config: StakeIndexConfig,
}

impl StakingService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        reference: Arc<[FinalityProviderReference]>,
        config: StakeIndexConfig,
    ) -> Self {
        let metrics = Arc::new(ServiceMetrics::default());
        let engine = QueryEngine::new(store.clone(), config.max_pagination_limit, metrics.clone());
        let machine = StateMachine::new(store, metrics.clone());
        let aggregator = StatsAggregator::new(engine.clone(), reference, metrics.clone());
        Self {
            engine,
            machine,
            aggregator,
            metrics,
            config,
        }
    }

    /// Request context carrying the configured per-call store timeout.
    /// Callers add their own cancellation or deadline on top.
    pub fn context(&self) -> RequestContext {
        let ctx = RequestContext::new();
        match self.config.store_timeout {
            Some(timeout) => ctx.with_store_timeout(timeout),
            None => ctx,
        }
    }

    pub fn metrics(&self) -> ServiceMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn delegations_by_staker_pk(
        &self,
        ctx: &RequestContext,
        staker_pk_hex: &str,
        page: &str,
    ) -> Result<PublicPage<DelegationPublic>, ApiError> {
        let request = PageRequest {
            cursor: page_token(page),
            limit: None,
        };
        match self
            .engine
            .delegations_by_staker_pk(ctx, staker_pk_hex, request)
            .await
        {
            Ok(page) => Ok(PublicPage::from_page(page, |record| {
                DelegationPublic::from(&record)
            })),
            Err(err) if err.is_invalid_token() => {
                warn!(error = ?err, "invalid pagination token when fetching delegations by staker pk");
                Err(err.into())
            }
            Err(err) => {
                error!(error = ?err, staker_pk = %staker_pk_hex, "failed to find delegations by staker pk");
                Err(err.into())
            }
        }
    }

    /// Records an `Active` delegation; an already-known staking tx is not an error.
    pub async fn save_active_staking_delegation(
        &self,
        ctx: &RequestContext,
        delegation: NewDelegation,
    ) -> Result<InsertOutcome, ApiError> {
        self.machine
            .save_active_delegation(ctx, delegation)
            .await
            .map_err(|err| {
                error!(error = ?err, "failed to save active staking delegation");
                ApiError::from(err)
            })
    }

    pub async fn is_delegation_present(
        &self,
        ctx: &RequestContext,
        staking_tx_hash_hex: &str,
    ) -> Result<bool, ApiError> {
        match self.engine.delegation_by_tx_hash(ctx, staking_tx_hash_hex).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => {
                error!(error = ?err, "failed to find delegation by tx hash hex");
                Err(err.into())
            }
        }
    }

    pub async fn get_delegation(
        &self,
        ctx: &RequestContext,
        staking_tx_hash_hex: &str,
    ) -> Result<DelegationRecord, ApiError> {
        match self.engine.delegation_by_tx_hash(ctx, staking_tx_hash_hex).await {
            Ok(record) => Ok(record),
            Err(err) if err.is_not_found() => {
                warn!(error = ?err, staking_tx_hash = %staking_tx_hash_hex, "staking delegation not found");
                Err(ApiError::with_message(
                    &err,
                    "staking delegation not found, please retry",
                ))
            }
            Err(err) => {
                error!(error = ?err, "failed to find delegation by tx hash hex");
                Err(err.into())
            }
        }
    }

    /// `true` when the address owns an `Active` delegation that started at or
    /// after `after_timestamp` (`0` disables the bound).
    pub async fn check_staker_has_active_delegation_by_address(
        &self,
        ctx: &RequestContext,
        taproot_address: &str,
        after_timestamp: i64,
    ) -> Result<bool, ApiError> {
        let filter = DelegationFilter {
            states: Some(vec![DelegationState::Active]),
            after_timestamp,
            taproot_address: None,
        };
        self.engine
            .delegation_exists_by_taproot_address(ctx, taproot_address, &filter)
            .await
            .map_err(|err| {
                error!(error = ?err, "failed to check if staker has active delegation");
                ApiError::from(err)
            })
    }

    pub async fn finality_providers(
        &self,
        ctx: &RequestContext,
        page: &str,
    ) -> Result<PublicPage<FinalityProviderDetails>, ApiError> {
        match self.aggregator.providers(ctx, page_token(page)).await {
            Ok(page) => Ok(PublicPage::from_page(page, |details| details)),
            Err(err) if err.is_invalid_token() => {
                warn!(error = ?err, "invalid pagination token when fetching finality providers");
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The static reference list, treated as the active provider set.
    pub fn finality_providers_from_params(&self) -> &[FinalityProviderReference] {
        self.aggregator.reference()
    }

    /// Moves a delegation to `target` if it is currently in one of
    /// `allowed_prior`, writing `extra` in the same update.
    pub async fn transition(
        &self,
        ctx: &RequestContext,
        staking_tx_hash_hex: &str,
        target: DelegationState,
        allowed_prior: &[DelegationState],
        extra: Vec<DelegationFieldUpdate>,
    ) -> Result<(), ApiError> {
        self.machine
            .transition(ctx, staking_tx_hash_hex, target, allowed_prior, extra)
            .await
            .map_err(ApiError::from)
    }

    pub async fn request_unbonding(
        &self,
        ctx: &RequestContext,
        staking_tx_hash_hex: &str,
        unbonding_tx: TimelockTransaction,
    ) -> Result<(), ApiError> {
        self.machine
            .request_unbonding(ctx, staking_tx_hash_hex, unbonding_tx)
            .await
            .map_err(ApiError::from)
    }

    pub async fn confirm_unbonding(
        &self,
        ctx: &RequestContext,
        staking_tx_hash_hex: &str,
        unbonding_tx: TimelockTransaction,
    ) -> Result<(), ApiError> {
        self.machine
            .confirm_unbonding(ctx, staking_tx_hash_hex, unbonding_tx)
            .await
            .map_err(ApiError::from)
    }

    pub async fn mark_unbonded(
        &self,
        ctx: &RequestContext,
        staking_tx_hash_hex: &str,
    ) -> Result<(), ApiError> {
        self.machine
            .mark_unbonded(ctx, staking_tx_hash_hex)
            .await
            .map_err(ApiError::from)
    }

    pub async fn mark_withdrawn(
        &self,
        ctx: &RequestContext,
        staking_tx_hash_hex: &str,
    ) -> Result<(), ApiError> {
        self.machine
            .mark_withdrawn(ctx, staking_tx_hash_hex)
            .await
            .map_err(ApiError::from)
    }
}
