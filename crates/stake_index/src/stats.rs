//! Finality-provider listing that merges store stats with the reference list.
//!
//! Store pages contain only providers the upstream aggregation has observed.
//! The last page additionally carries every reference provider without a
//! stats document, zero-filled, in reference-list order. A failing stats read
//! degrades to the reference list alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, warn};

use crate::context::RequestContext;
use crate::error::StakeError;
use crate::metrics::ServiceMetrics;
use crate::query::{Page, PageRequest, QueryEngine};
use crate::types::{FinalityProviderDescription, FinalityProviderReference, FinalityProviderStats};

/// Caller-facing provider entry: reference metadata plus counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalityProviderDetails {
    pub description: FinalityProviderDescription,
    pub commission: String,
    pub btc_pk: String,
    pub active_tvl: i64,
    pub total_tvl: i64,
    pub active_delegations: i64,
    pub total_delegations: i64,
}

impl FinalityProviderDetails {
    fn zero_filled(reference: &FinalityProviderReference) -> Self {
        Self {
            description: reference.description.clone(),
            commission: reference.commission.clone(),
            btc_pk: reference.btc_pk.clone(),
            active_tvl: 0,
            total_tvl: 0,
            active_delegations: 0,
            total_delegations: 0,
        }
    }

    /// Joins store counters with reference metadata; unknown providers get
    /// empty metadata.
    fn merged(stats: FinalityProviderStats, reference: Option<&FinalityProviderReference>) -> Self {
        let (description, commission) = match reference {
            Some(reference) => (reference.description.clone(), reference.commission.clone()),
            None => (FinalityProviderDescription::default(), String::new()),
        };
        Self {
            description,
            commission,
            btc_pk: stats.finality_provider_pk_hex,
            active_tvl: stats.active_tvl,
            total_tvl: stats.total_tvl,
            active_delegations: stats.active_delegations,
            total_delegations: stats.total_delegations,
        }
    }
}

#[derive(Clone)]
pub struct StatsAggregator {
    engine: QueryEngine,
    reference: Arc<[FinalityProviderReference]>,
    metrics: Arc<ServiceMetrics>,
}

impl StatsAggregator {
    pub fn new(
        engine: QueryEngine,
        reference: Arc<[FinalityProviderReference]>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            engine,
            reference,
            metrics,
        }
    }

    pub fn reference(&self) -> &[FinalityProviderReference] {
        &self.reference
    }

    /// Reference providers with zero counters, in reference order.
    pub fn fallback(&self) -> Vec<FinalityProviderDetails> {
        self.reference
            .iter()
            .map(FinalityProviderDetails::zero_filled)
            .collect()
    }

    /// One page of provider details. `page: None` is the first page.
    pub async fn providers(
        &self,
        ctx: &RequestContext,
        page: Option<&str>,
    ) -> Result<Page<FinalityProviderDetails>, StakeError> {
        if self.reference.is_empty() {
            error!("no finality providers found from global params");
            return Err(StakeError::NoReferenceData);
        }

        let request = PageRequest {
            cursor: page,
            limit: None,
        };
        let stats_page = match self.engine.finality_provider_stats(ctx, request).await {
            Ok(stats_page) => stats_page,
            // A store call hitting the store timeout is a StoreError and degrades below.
            Err(err) if err.is_invalid_token() || err.is_interrupted() => return Err(err),
            Err(err) => {
                self.metrics.record_aggregation_fallback();
                error!(error = ?err, "error while fetching finality providers from store, serving reference list");
                return Ok(Page {
                    items: self.fallback(),
                    next_token: None,
                });
            }
        };

        let by_pk = self
            .reference
            .iter()
            .map(|reference| (reference.btc_pk.as_str(), reference))
            .collect::<HashMap<_, _>>();
        let Page { items, next_token } = stats_page;
        let mut details = items
            .into_iter()
            .map(|stats| {
                let reference = by_pk.get(stats.finality_provider_pk_hex.as_str()).copied();
                FinalityProviderDetails::merged(stats, reference)
            })
            .collect::<Vec<_>>();

        if next_token.is_none() {
            details.extend(self.providers_not_in_store(ctx).await?);
        }
        Ok(Page {
            items: details,
            next_token,
        })
    }

    /// Reference providers that have no stats document anywhere in the store.
    async fn providers_not_in_store(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<FinalityProviderDetails>, StakeError> {
        let pks = self
            .reference
            .iter()
            .map(|reference| reference.btc_pk.clone())
            .collect::<Vec<_>>();
        let observed = self
            .engine
            .finality_provider_stats_by_pks(ctx, &pks)
            .await
            .inspect_err(|err| {
                warn!(error = ?err, "error while fetching finality providers not in use");
            })?;
        let observed = observed
            .into_iter()
            .map(|stats| stats.finality_provider_pk_hex)
            .collect::<HashSet<_>>();
        Ok(self
            .reference
            .iter()
            .filter(|reference| !observed.contains(&reference.btc_pk))
            .map(FinalityProviderDetails::zero_filled)
            .collect())
    }
}
