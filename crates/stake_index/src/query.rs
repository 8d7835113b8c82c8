//! Cursor-paged queries over the delegation and stats collections.
//!
//! Every page is ordered by `(sort field desc, key asc)`. A continuation token
//! resumes strictly after the last row of the previous page, so a sequential
//! walk over an unmutated collection visits each document exactly once.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::StakeError;
use crate::filter::{
    DelegationField, Document, DocumentField, Filter, FindQuery, FpStatsField,
};
use crate::metrics::ServiceMetrics;
use crate::pagination::{decode_token, Cursor};
use crate::store::DocumentStore;
use crate::types::{DelegationRecord, DelegationState, FinalityProviderStats};

/// One page of results. `next_token` is `None` at the end of the result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.next_token.is_none()
    }
}

/// Caller paging input. `cursor: None` requests the first page.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageRequest<'a> {
    pub cursor: Option<&'a str>,
    pub limit: Option<usize>,
}

impl<'a> PageRequest<'a> {
    pub fn first() -> Self {
        Self::default()
    }

    pub fn after(cursor: &'a str) -> Self {
        Self {
            cursor: Some(cursor),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Optional narrowing applied to delegation queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegationFilter {
    pub states: Option<Vec<DelegationState>>,
    /// Lower bound on the staking start timestamp; `0` disables it.
    pub after_timestamp: i64,
    pub taproot_address: Option<String>,
}

impl DelegationFilter {
    /// ANDs the configured terms onto `base`.
    pub fn apply(&self, base: Filter<DelegationField>) -> Filter<DelegationField> {
        let mut filter = base;
        if let Some(address) = &self.taproot_address {
            filter = filter.and(Filter::eq(DelegationField::TaprootAddress, address.as_str()));
        }
        if let Some(states) = &self.states {
            filter = filter.and(Filter::in_set(DelegationField::State, states.iter().copied()));
        }
        if self.after_timestamp != 0 {
            filter = filter.and(Filter::gte(
                DelegationField::StartTimestamp,
                self.after_timestamp,
            ));
        }
        filter
    }
}

/// Store query for one page: base filter AND the cursor frontier.
fn paged_query<F: DocumentField>(
    base: Filter<F>,
    sort: F,
    key_field: F,
    cursor: Option<&Cursor<F>>,
    limit: usize,
) -> FindQuery<F> {
    let filter = match cursor {
        Some(cursor) => base.and(cursor.after_filter(key_field)),
        None => base,
    };
    FindQuery::new(filter).sorted_by(sort).limit(limit)
}

/// Seals a page: a full page carries a token for its last row.
fn finish_page<D: Document>(items: Vec<D>, sort: D::Field, limit: usize) -> Page<D> {
    let next_token = if items.len() >= limit {
        items.last().map(|last| Cursor::at(last, sort).encode())
    } else {
        None
    };
    Page { items, next_token }
}

#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn DocumentStore>,
    max_limit: usize,
    metrics: Arc<ServiceMetrics>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn DocumentStore>, max_limit: usize, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            store,
            max_limit: max_limit.max(1),
            metrics,
        }
    }

    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    /// Clamps a requested page size to `[1, max_limit]`; absent means the max.
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.max_limit).clamp(1, self.max_limit)
    }

    fn decode_cursor<F: DocumentField>(
        &self,
        token: Option<&str>,
        sort: F,
    ) -> Result<Option<Cursor<F>>, StakeError> {
        let Some(token) = token else {
            return Ok(None);
        };
        match decode_token(token, sort) {
            Ok(cursor) => Ok(Some(cursor)),
            Err(err) => {
                self.metrics.record_invalid_token();
                warn!(error = ?err, sort = sort.name(), "rejected pagination token");
                Err(err)
            }
        }
    }

    /// One page of delegations matching `base`, sorted by `sort` descending.
    pub async fn page_delegations(
        &self,
        ctx: &RequestContext,
        base: Filter<DelegationField>,
        sort: DelegationField,
        request: PageRequest<'_>,
    ) -> Result<Page<DelegationRecord>, StakeError> {
        let cursor = self.decode_cursor(request.cursor, sort)?;
        let limit = self.effective_limit(request.limit);
        let query = paged_query(
            base,
            sort,
            DelegationRecord::KEY_FIELD,
            cursor.as_ref(),
            limit,
        );
        debug!(filter = %query.filter.describe(), limit, "delegation page query");
        let items = ctx
            .run("find_delegations", self.store.find_delegations(&query))
            .await?;
        self.metrics.record_page();
        Ok(finish_page(items, sort, limit))
    }

    /// One page of finality-provider stats matching `base`.
    pub async fn page_finality_provider_stats(
        &self,
        ctx: &RequestContext,
        base: Filter<FpStatsField>,
        sort: FpStatsField,
        request: PageRequest<'_>,
    ) -> Result<Page<FinalityProviderStats>, StakeError> {
        let cursor = self.decode_cursor(request.cursor, sort)?;
        let limit = self.effective_limit(request.limit);
        let query = paged_query(
            base,
            sort,
            FinalityProviderStats::KEY_FIELD,
            cursor.as_ref(),
            limit,
        );
        debug!(filter = %query.filter.describe(), limit, "finality provider stats page query");
        let items = ctx
            .run(
                "find_finality_provider_stats",
                self.store.find_finality_provider_stats(&query),
            )
            .await?;
        self.metrics.record_page();
        Ok(finish_page(items, sort, limit))
    }

    /// Delegations of one staker, newest staking height first.
    pub async fn delegations_by_staker_pk(
        &self,
        ctx: &RequestContext,
        staker_pk_hex: &str,
        request: PageRequest<'_>,
    ) -> Result<Page<DelegationRecord>, StakeError> {
        self.page_delegations(
            ctx,
            Filter::eq(DelegationField::StakerPk, staker_pk_hex),
            DelegationField::StartHeight,
            request,
        )
        .await
    }

    /// Delegations staked to one finality provider, newest staking height first.
    pub async fn delegations_by_finality_provider_pk(
        &self,
        ctx: &RequestContext,
        finality_provider_pk_hex: &str,
        extra: &DelegationFilter,
        request: PageRequest<'_>,
    ) -> Result<Page<DelegationRecord>, StakeError> {
        let base = extra.apply(Filter::eq(
            DelegationField::FinalityProviderPk,
            finality_provider_pk_hex,
        ));
        self.page_delegations(ctx, base, DelegationField::StartHeight, request)
            .await
    }

    pub async fn delegation_by_tx_hash(
        &self,
        ctx: &RequestContext,
        staking_tx_hash_hex: &str,
    ) -> Result<DelegationRecord, StakeError> {
        let query = FindQuery::new(Filter::eq(
            DelegationField::StakingTxHash,
            staking_tx_hash_hex,
        ))
        .limit(1);
        let mut found = ctx
            .run("find_delegation", self.store.find_delegations(&query))
            .await?;
        found.pop().ok_or_else(|| StakeError::NotFound {
            key: staking_tx_hash_hex.to_string(),
            message: "Delegation not found",
        })
    }

    /// `true` when the address owns at least one delegation matching `extra`.
    pub async fn delegation_exists_by_taproot_address(
        &self,
        ctx: &RequestContext,
        taproot_address: &str,
        extra: &DelegationFilter,
    ) -> Result<bool, StakeError> {
        let filter = extra.apply(Filter::eq(DelegationField::TaprootAddress, taproot_address));
        let query = FindQuery::new(filter).limit(1);
        let found = ctx
            .run("find_delegation_by_address", self.store.find_delegations(&query))
            .await?;
        Ok(!found.is_empty())
    }

    /// Finality-provider stats ordered by active TVL.
    pub async fn finality_provider_stats(
        &self,
        ctx: &RequestContext,
        request: PageRequest<'_>,
    ) -> Result<Page<FinalityProviderStats>, StakeError> {
        self.page_finality_provider_stats(ctx, Filter::All, FpStatsField::ActiveTvl, request)
            .await
    }

    /// Stats documents for the given provider keys, in key order. Unpaged.
    pub async fn finality_provider_stats_by_pks(
        &self,
        ctx: &RequestContext,
        pks: &[String],
    ) -> Result<Vec<FinalityProviderStats>, StakeError> {
        let query = FindQuery::new(Filter::in_set(
            FpStatsField::FinalityProviderPk,
            pks.iter().cloned(),
        ));
        ctx.run(
            "find_finality_provider_stats_by_pks",
            self.store.find_finality_provider_stats(&query),
        )
        .await
    }
}
