use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{
    validate_delegation, validate_stats, ConditionalUpdateOutcome, DelegationUpdate, DocumentStore,
};
use crate::error::StoreError;
use crate::filter::{select, DelegationField, Document, Filter, FindQuery, FpStatsField};
use crate::types::{DelegationRecord, FinalityProviderStats};

const DELEGATIONS_PARTITION: &str = "delegations";
const FP_STATS_PARTITION: &str = "fp_stats";

/// Persistent store on a fjall keyspace. Documents are JSON values keyed by
/// their unique key; a write lock serializes read-modify-write updates.
///
/// Every call runs on the blocking pool. A query without a pinned key decodes
/// the whole partition, so a page costs O(documents in the collection).
pub struct FjallStore {
    keyspace: Arc<Keyspace>,
    partitions: Arc<Partitions>,
}

struct Partitions {
    delegations: PartitionHandle,
    fp_stats: PartitionHandle,
    lock: RwLock<()>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("create store dir {}", path.display()))?;
        let keyspace = fjall::Config::new(path)
            .open()
            .context("open fjall keyspace")?;
        Self::with_keyspace(Arc::new(keyspace))
    }

    pub fn with_keyspace(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let delegations =
            keyspace.open_partition(DELEGATIONS_PARTITION, PartitionCreateOptions::default())?;
        let fp_stats =
            keyspace.open_partition(FP_STATS_PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            partitions: Arc::new(Partitions {
                delegations,
                fp_stats,
                lock: RwLock::new(()),
            }),
        })
    }

    /// Flushes the journal to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist fjall journal")
    }

    async fn blocking<T, W>(&self, work: W) -> Result<T, StoreError>
    where
        T: Send + 'static,
        W: FnOnce(&Partitions) -> Result<T, StoreError> + Send + 'static,
    {
        let partitions = self.partitions.clone();
        tokio::task::spawn_blocking(move || work(&partitions))
            .await
            .map_err(|err| StoreError::Backend(format!("fjall task failed: {err}")))?
    }
}

fn backend(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn poisoned() -> StoreError {
    StoreError::Backend("fjall store lock poisoned".into())
}

fn encode_doc<D: Serialize>(doc: &D) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(doc).map_err(|err| StoreError::Codec(err.to_string()))
}

fn decode_doc<D: DeserializeOwned>(bytes: &[u8]) -> Result<D, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Codec(err.to_string()))
}

fn get_doc<D: DeserializeOwned>(
    partition: &PartitionHandle,
    key: &str,
) -> Result<Option<D>, StoreError> {
    match partition.get(key.as_bytes()).map_err(backend)? {
        Some(bytes) => decode_doc(&bytes).map(Some),
        None => Ok(None),
    }
}

/// Loads every document of a partition in key order.
fn load_all<D: DeserializeOwned>(partition: &PartitionHandle) -> Result<Vec<D>, StoreError> {
    let mut out = Vec::new();
    for item in partition.iter() {
        let (_, value) = item.map_err(backend)?;
        out.push(decode_doc(&value)?);
    }
    Ok(out)
}

#[async_trait]
impl DocumentStore for FjallStore {
    async fn insert_delegation(&self, record: DelegationRecord) -> Result<(), StoreError> {
        validate_delegation(&record)?;
        self.blocking(move |parts| {
            let _guard = parts.lock.write().map_err(|_| poisoned())?;
            let key = record.staking_tx_hash_hex.as_bytes();
            if parts.delegations.contains_key(key).map_err(backend)? {
                return Err(StoreError::DuplicateKey {
                    key: record.staking_tx_hash_hex,
                });
            }
            parts
                .delegations
                .insert(key, encode_doc(&record)?)
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn find_delegations(
        &self,
        query: &FindQuery<DelegationField>,
    ) -> Result<Vec<DelegationRecord>, StoreError> {
        let query = query.clone();
        self.blocking(move |parts| {
            let _guard = parts.lock.read().map_err(|_| poisoned())?;
            if let Some(key) = query.filter.pinned_key(DelegationRecord::KEY_FIELD) {
                let doc = get_doc::<DelegationRecord>(&parts.delegations, key)?;
                return Ok(select(doc.iter(), &query));
            }
            let docs = load_all::<DelegationRecord>(&parts.delegations)?;
            Ok(select(docs.iter(), &query))
        })
        .await
    }

    async fn update_delegation(
        &self,
        filter: &Filter<DelegationField>,
        update: &DelegationUpdate,
    ) -> Result<ConditionalUpdateOutcome, StoreError> {
        let filter = filter.clone();
        let update = update.clone();
        self.blocking(move |parts| {
            let _guard = parts.lock.write().map_err(|_| poisoned())?;
            let target = match filter.pinned_key(DelegationRecord::KEY_FIELD) {
                Some(key) => get_doc::<DelegationRecord>(&parts.delegations, key)?
                    .filter(|record| filter.matches(record)),
                None => load_all::<DelegationRecord>(&parts.delegations)?
                    .into_iter()
                    .find(|record| filter.matches(record)),
            };
            let Some(mut record) = target else {
                return Ok(ConditionalUpdateOutcome::NoMatch);
            };
            update.apply_to(&mut record);
            parts
                .delegations
                .insert(record.staking_tx_hash_hex.as_bytes(), encode_doc(&record)?)
                .map_err(backend)?;
            debug!(
                staking_tx_hash = %record.staking_tx_hash_hex,
                state = %record.state,
                "fjall delegation updated"
            );
            Ok(ConditionalUpdateOutcome::Applied)
        })
        .await
    }

    async fn upsert_finality_provider_stats(
        &self,
        stats: FinalityProviderStats,
    ) -> Result<(), StoreError> {
        validate_stats(&stats)?;
        self.blocking(move |parts| {
            let _guard = parts.lock.write().map_err(|_| poisoned())?;
            parts
                .fp_stats
                .insert(stats.finality_provider_pk_hex.as_bytes(), encode_doc(&stats)?)
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn find_finality_provider_stats(
        &self,
        query: &FindQuery<FpStatsField>,
    ) -> Result<Vec<FinalityProviderStats>, StoreError> {
        let query = query.clone();
        self.blocking(move |parts| {
            let _guard = parts.lock.read().map_err(|_| poisoned())?;
            let docs = load_all::<FinalityProviderStats>(&parts.fp_stats)?;
            Ok(select(docs.iter(), &query))
        })
        .await
    }
}
