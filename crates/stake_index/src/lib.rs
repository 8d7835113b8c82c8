//! Staking delegation index.
//!
//! Mirrors Bitcoin staking delegations and finality-provider statistics in a
//! document store and exposes three primitives over it:
//!
//! - cursor pagination with opaque, checksummed continuation tokens
//!   ([`pagination`], [`query`]);
//! - lifecycle transitions guarded by a single conditional update
//!   ([`state_machine`]);
//! - a provider listing that merges store stats with the static reference
//!   list and degrades to that list when the store fails ([`stats`]).
//!
//! [`service::StakingService`] composes them for callers.

pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod pagination;
pub mod query;
pub mod service;
pub mod state_machine;
pub mod stats;
pub mod store;
pub mod types;

pub use config::{load_finality_providers, StakeIndexConfig};
pub use context::RequestContext;
pub use error::{ErrorClass, StakeError, StoreError};
pub use query::{DelegationFilter, Page, PageRequest, QueryEngine};
pub use service::{ApiError, DelegationPublic, PublicPage, StakingService, TransactionPublic};
pub use state_machine::{InsertOutcome, StateMachine};
pub use stats::{FinalityProviderDetails, StatsAggregator};
pub use store::{DocumentStore, FjallStore, MemoryStore};
pub use types::{
    DelegationRecord, DelegationState, FinalityProviderDescription, FinalityProviderReference,
    FinalityProviderStats, NewDelegation, StakerBtcAddress, TimelockTransaction, MAX_FIELD_BYTES,
};
