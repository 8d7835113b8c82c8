use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stake_index::error::StoreError;
use stake_index::filter::{DelegationField, Filter, FindQuery, FpStatsField};
use stake_index::metrics::ServiceMetrics;
use stake_index::store::{ConditionalUpdateOutcome, DelegationUpdate};
use stake_index::{
    DelegationRecord, DocumentStore, FinalityProviderDescription, FinalityProviderDetails,
    FinalityProviderReference, FinalityProviderStats, MemoryStore, QueryEngine, RequestContext,
    StakeError, StakeIndexConfig, StakingService, StatsAggregator,
};
use tokio_util::sync::CancellationToken;

fn reference(pk: &str) -> FinalityProviderReference {
    FinalityProviderReference {
        description: FinalityProviderDescription {
            moniker: format!("moniker-{pk}"),
            ..Default::default()
        },
        commission: "0.10".to_string(),
        btc_pk: pk.to_string(),
    }
}

fn stats(pk: &str, active_tvl: i64, total_tvl: i64) -> FinalityProviderStats {
    FinalityProviderStats {
        finality_provider_pk_hex: pk.to_string(),
        active_tvl,
        total_tvl,
        active_delegations: 1,
        total_delegations: 2,
    }
}

fn aggregator(
    store: Arc<dyn DocumentStore>,
    max_limit: usize,
) -> (StatsAggregator, Arc<ServiceMetrics>) {
    let metrics = Arc::new(ServiceMetrics::default());
    let engine = QueryEngine::new(store, max_limit, metrics.clone());
    let refs = ["A", "B", "C"].map(reference).to_vec();
    (StatsAggregator::new(engine, refs.into(), metrics.clone()), metrics)
}

fn summary(items: &[FinalityProviderDetails]) -> Vec<(&str, i64, i64)> {
    items
        .iter()
        .map(|item| (item.btc_pk.as_str(), item.active_tvl, item.total_tvl))
        .collect()
}

#[tokio::test]
async fn single_observed_provider_is_followed_by_zero_filled_rest() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.upsert_finality_provider_stats(stats("A", 5, 10)).await?;
    let (aggregator, _) = aggregator(store, 10);

    let page = aggregator.providers(&RequestContext::new(), None).await?;
    assert_eq!(summary(&page.items), vec![("A", 5, 10), ("B", 0, 0), ("C", 0, 0)]);
    assert!(page.next_token.is_none());
    assert_eq!(page.items[0].description.moniker, "moniker-A");
    assert_eq!(page.items[1].commission, "0.10");
    assert_eq!(page.items[1].active_delegations, 0);
    Ok(())
}

#[tokio::test]
async fn only_the_final_page_carries_unobserved_providers() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.upsert_finality_provider_stats(stats("A", 5, 10)).await?;
    store.upsert_finality_provider_stats(stats("C", 3, 4)).await?;
    let (aggregator, _) = aggregator(store, 1);
    let ctx = RequestContext::new();

    let first = aggregator.providers(&ctx, None).await?;
    assert_eq!(summary(&first.items), vec![("A", 5, 10)]);
    let token = first.next_token.expect("first page is full");

    let second = aggregator.providers(&ctx, Some(&token)).await?;
    assert_eq!(summary(&second.items), vec![("C", 3, 4)]);
    let token = second.next_token.expect("second page is full");

    let last = aggregator.providers(&ctx, Some(&token)).await?;
    assert_eq!(summary(&last.items), vec![("B", 0, 0)]);
    assert!(last.next_token.is_none());
    Ok(())
}

#[tokio::test]
async fn empty_store_yields_full_reference_list() -> anyhow::Result<()> {
    let (aggregator, metrics) = aggregator(Arc::new(MemoryStore::new()), 10);
    let page = aggregator.providers(&RequestContext::new(), None).await?;
    assert_eq!(summary(&page.items), vec![("A", 0, 0), ("B", 0, 0), ("C", 0, 0)]);
    assert_eq!(metrics.snapshot().aggregation_fallbacks, 0);
    Ok(())
}

#[tokio::test]
async fn unreachable_store_degrades_to_reference_list() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.upsert_finality_provider_stats(stats("B", 9, 9)).await?;
    store.set_unavailable(true);
    let (aggregator, metrics) = aggregator(store, 10);

    let page = aggregator.providers(&RequestContext::new(), None).await?;
    assert_eq!(summary(&page.items), vec![("A", 0, 0), ("B", 0, 0), ("C", 0, 0)]);
    assert!(page.next_token.is_none());
    assert_eq!(page.items, aggregator.fallback());
    assert_eq!(metrics.snapshot().aggregation_fallbacks, 1);
    Ok(())
}

/// Serves stats pages but fails the unsorted lookup by provider keys.
struct FailingKeyLookup {
    inner: MemoryStore,
}

#[async_trait]
impl DocumentStore for FailingKeyLookup {
    async fn insert_delegation(&self, record: DelegationRecord) -> Result<(), StoreError> {
        self.inner.insert_delegation(record).await
    }

    async fn find_delegations(
        &self,
        query: &FindQuery<DelegationField>,
    ) -> Result<Vec<DelegationRecord>, StoreError> {
        self.inner.find_delegations(query).await
    }

    async fn update_delegation(
        &self,
        filter: &Filter<DelegationField>,
        update: &DelegationUpdate,
    ) -> Result<ConditionalUpdateOutcome, StoreError> {
        self.inner.update_delegation(filter, update).await
    }

    async fn upsert_finality_provider_stats(
        &self,
        stats: FinalityProviderStats,
    ) -> Result<(), StoreError> {
        self.inner.upsert_finality_provider_stats(stats).await
    }

    async fn find_finality_provider_stats(
        &self,
        query: &FindQuery<FpStatsField>,
    ) -> Result<Vec<FinalityProviderStats>, StoreError> {
        if query.sort.is_none() {
            return Err(StoreError::Unavailable("key lookup failed".into()));
        }
        self.inner.find_finality_provider_stats(query).await
    }
}

#[tokio::test]
async fn failed_unobserved_lookup_is_surfaced() -> anyhow::Result<()> {
    let store = FailingKeyLookup {
        inner: MemoryStore::new(),
    };
    store.upsert_finality_provider_stats(stats("A", 5, 10)).await?;
    let (aggregator, metrics) = aggregator(Arc::new(store), 10);

    let err = aggregator
        .providers(&RequestContext::new(), None)
        .await
        .expect_err("lookup failure must surface");
    assert!(matches!(err, StakeError::Store(StoreError::Unavailable(_))));
    assert_eq!(err.class().status_code(), 500);
    assert_eq!(metrics.snapshot().aggregation_fallbacks, 0);
    Ok(())
}

/// What the stats scan does before answering.
enum StatsScan {
    /// Never answers within a test's lifetime.
    Stall,
    /// Fires the token, then answers normally.
    Cancel(CancellationToken),
}

/// Delegates to a [`MemoryStore`] but intercepts the sorted stats scan.
struct InterceptedStatsScan {
    inner: MemoryStore,
    scan: StatsScan,
}

#[async_trait]
impl DocumentStore for InterceptedStatsScan {
    async fn insert_delegation(&self, record: DelegationRecord) -> Result<(), StoreError> {
        self.inner.insert_delegation(record).await
    }

    async fn find_delegations(
        &self,
        query: &FindQuery<DelegationField>,
    ) -> Result<Vec<DelegationRecord>, StoreError> {
        self.inner.find_delegations(query).await
    }

    async fn update_delegation(
        &self,
        filter: &Filter<DelegationField>,
        update: &DelegationUpdate,
    ) -> Result<ConditionalUpdateOutcome, StoreError> {
        self.inner.update_delegation(filter, update).await
    }

    async fn upsert_finality_provider_stats(
        &self,
        stats: FinalityProviderStats,
    ) -> Result<(), StoreError> {
        self.inner.upsert_finality_provider_stats(stats).await
    }

    async fn find_finality_provider_stats(
        &self,
        query: &FindQuery<FpStatsField>,
    ) -> Result<Vec<FinalityProviderStats>, StoreError> {
        if query.sort.is_some() {
            match &self.scan {
                StatsScan::Stall => tokio::time::sleep(Duration::from_secs(5)).await,
                StatsScan::Cancel(token) => token.cancel(),
            }
        }
        self.inner.find_finality_provider_stats(query).await
    }
}

#[tokio::test]
async fn store_timeout_degrades_service_listing_to_reference() -> anyhow::Result<()> {
    let store = InterceptedStatsScan {
        inner: MemoryStore::new(),
        scan: StatsScan::Stall,
    };
    store.upsert_finality_provider_stats(stats("B", 9, 9)).await?;
    let config = StakeIndexConfig {
        store_timeout: Some(Duration::from_millis(50)),
        ..StakeIndexConfig::default()
    };
    let refs = ["A", "B", "C"].map(reference).to_vec();
    let service = StakingService::new(Arc::new(store), refs.into(), config);

    let page = service.finality_providers(&service.context(), "").await?;
    assert_eq!(summary(&page.data), vec![("A", 0, 0), ("B", 0, 0), ("C", 0, 0)]);
    assert_eq!(page.next_token, "");
    assert_eq!(service.metrics().aggregation_fallbacks, 1);
    Ok(())
}

#[tokio::test]
async fn caller_deadline_during_listing_is_surfaced() -> anyhow::Result<()> {
    let store = InterceptedStatsScan {
        inner: MemoryStore::new(),
        scan: StatsScan::Stall,
    };
    let (aggregator, metrics) = aggregator(Arc::new(store), 10);
    let ctx = RequestContext::new().with_deadline(Duration::from_millis(50));

    let err = aggregator
        .providers(&ctx, None)
        .await
        .expect_err("caller deadline must surface");
    assert!(matches!(err, StakeError::Timeout { .. }));
    assert_eq!(metrics.snapshot().aggregation_fallbacks, 0);
    Ok(())
}

#[tokio::test]
async fn cancellation_during_stats_scan_aborts_listing() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let store = InterceptedStatsScan {
        inner: MemoryStore::new(),
        scan: StatsScan::Cancel(cancel.clone()),
    };
    store.upsert_finality_provider_stats(stats("A", 5, 10)).await?;
    let (aggregator, metrics) = aggregator(Arc::new(store), 10);
    let ctx = RequestContext::with_cancellation(cancel);

    let result = aggregator.providers(&ctx, None).await;
    let err = match result {
        Ok(page) => panic!("cancelled listing returned {} items", page.items.len()),
        Err(err) => err,
    };
    assert!(matches!(err, StakeError::Cancelled { .. }));
    assert_eq!(metrics.snapshot().aggregation_fallbacks, 0);
    Ok(())
}
