//! Delegation and finality-provider document types.
//!
//! These are the shapes persisted by the store backends and returned by the
//! query layer. Field names match the on-disk JSON documents.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the byte length of every string field of a stored document.
/// A continuation token carries at most two such strings: the sort value and
/// the last key.
pub const MAX_FIELD_BYTES: usize = 128;

/// Lifecycle state of one delegation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationState {
    Active,
    UnbondingRequested,
    Unbonding,
    Unbonded,
    Withdrawn,
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown delegation state '{0}'")]
pub struct UnknownState(pub String);

impl DelegationState {
    pub const ALL: [DelegationState; 5] = [
        DelegationState::Active,
        DelegationState::UnbondingRequested,
        DelegationState::Unbonding,
        DelegationState::Unbonded,
        DelegationState::Withdrawn,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::UnbondingRequested => "unbonding_requested",
            Self::Unbonding => "unbonding",
            Self::Unbonded => "unbonded",
            Self::Withdrawn => "withdrawn",
        }
    }

    /// Forward transition table. Every lifecycle change goes through here.
    pub fn allowed_targets(self) -> &'static [DelegationState] {
        match self {
            Self::Active => &[
                DelegationState::UnbondingRequested,
                DelegationState::Unbonding,
                DelegationState::Unbonded,
            ],
            Self::UnbondingRequested => &[DelegationState::Unbonding, DelegationState::Unbonded],
            Self::Unbonding => &[DelegationState::Unbonded],
            Self::Unbonded => &[DelegationState::Withdrawn],
            Self::Withdrawn => &[],
        }
    }

    pub fn can_transition_to(self, target: DelegationState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// States from which `target` is reachable in one step, in declaration order.
    pub fn eligible_predecessors(target: DelegationState) -> Vec<DelegationState> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(target))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Stable single-byte code used by the cursor codec.
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::UnbondingRequested => 1,
            Self::Unbonding => 2,
            Self::Unbonded => 3,
            Self::Withdrawn => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }
}

impl fmt::Display for DelegationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DelegationState {
    type Err = UnknownState;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == raw)
            .ok_or_else(|| UnknownState(raw.to_string()))
    }
}

/// A BTC transaction output locked for `timelock` blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelockTransaction {
    pub tx_hex: String,
    pub output_index: u64,
    /// Unix seconds of the block that included the transaction.
    pub start_timestamp: i64,
    pub start_height: u64,
    pub timelock: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakerBtcAddress {
    pub taproot_address: String,
}

/// One staking delegation, keyed by the staking transaction hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub staking_tx_hash_hex: String,
    pub staker_pk_hex: String,
    pub finality_provider_pk_hex: String,
    pub staking_value: u64,
    pub state: DelegationState,
    pub staking_tx: TimelockTransaction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbonding_tx: Option<TimelockTransaction>,
    pub is_overflow: bool,
    #[serde(default)]
    pub staker_btc_address: StakerBtcAddress,
}

/// Input for the first observation of a staking event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDelegation {
    pub staking_tx_hash_hex: String,
    pub staker_pk_hex: String,
    pub finality_provider_pk_hex: String,
    pub staking_value: u64,
    pub staking_tx: TimelockTransaction,
    pub is_overflow: bool,
    pub staker_taproot_address: String,
}

impl NewDelegation {
    /// Builds the initial `Active` document.
    pub fn into_record(self) -> DelegationRecord {
        DelegationRecord {
            staking_tx_hash_hex: self.staking_tx_hash_hex,
            staker_pk_hex: self.staker_pk_hex,
            finality_provider_pk_hex: self.finality_provider_pk_hex,
            staking_value: self.staking_value,
            state: DelegationState::Active,
            staking_tx: self.staking_tx,
            unbonding_tx: None,
            is_overflow: self.is_overflow,
            staker_btc_address: StakerBtcAddress {
                taproot_address: self.staker_taproot_address,
            },
        }
    }
}

/// Continuously aggregated counters for one finality provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityProviderStats {
    pub finality_provider_pk_hex: String,
    pub active_tvl: i64,
    pub total_tvl: i64,
    pub active_delegations: i64,
    pub total_delegations: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityProviderDescription {
    #[serde(default)]
    pub moniker: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub security_contact: String,
    #[serde(default)]
    pub details: String,
}

/// Entry of the static finality-provider list from the global params.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityProviderReference {
    #[serde(default)]
    pub description: FinalityProviderDescription,
    #[serde(default)]
    pub commission: String,
    pub btc_pk: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_exhaustive_over_all_pairs() {
        let expected = [
            (DelegationState::Active, DelegationState::UnbondingRequested),
            (DelegationState::Active, DelegationState::Unbonding),
            (DelegationState::Active, DelegationState::Unbonded),
            (DelegationState::UnbondingRequested, DelegationState::Unbonding),
            (DelegationState::UnbondingRequested, DelegationState::Unbonded),
            (DelegationState::Unbonding, DelegationState::Unbonded),
            (DelegationState::Unbonded, DelegationState::Withdrawn),
        ];
        for from in DelegationState::ALL {
            for to in DelegationState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    expected.contains(&(from, to)),
                    "unexpected table entry for {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn no_state_transitions_to_itself_or_back_to_active() {
        for state in DelegationState::ALL {
            assert!(!state.can_transition_to(state));
            assert!(!state.can_transition_to(DelegationState::Active));
        }
        assert!(DelegationState::Withdrawn.is_terminal());
    }

    #[test]
    fn eligible_predecessors_follow_the_table() {
        assert_eq!(
            DelegationState::eligible_predecessors(DelegationState::Unbonding),
            vec![DelegationState::Active, DelegationState::UnbondingRequested]
        );
        assert_eq!(
            DelegationState::eligible_predecessors(DelegationState::Withdrawn),
            vec![DelegationState::Unbonded]
        );
        assert!(DelegationState::eligible_predecessors(DelegationState::Active).is_empty());
    }

    #[test]
    fn state_names_round_trip_through_from_str_and_serde() {
        for state in DelegationState::ALL {
            assert_eq!(state.as_str().parse::<DelegationState>(), Ok(state));
            let json = serde_json::to_string(&state).expect("serialize state");
            assert_eq!(json, format!("\"{}\"", state.as_str()));
            assert_eq!(DelegationState::from_code(state.code()), Some(state));
        }
        assert_eq!(
            "overflow".parse::<DelegationState>(),
            Err(UnknownState("overflow".to_string()))
        );
    }

    #[test]
    fn new_delegation_starts_active_without_unbonding_tx() {
        let record = NewDelegation {
            staking_tx_hash_hex: "aa".to_string(),
            staker_pk_hex: "bb".to_string(),
            finality_provider_pk_hex: "cc".to_string(),
            staking_value: 1_000,
            staking_tx: TimelockTransaction {
                tx_hex: "00".to_string(),
                output_index: 0,
                start_timestamp: 1_700_000_000,
                start_height: 100,
                timelock: 150,
            },
            is_overflow: false,
            staker_taproot_address: "bc1p".to_string(),
        }
        .into_record();
        assert_eq!(record.state, DelegationState::Active);
        assert!(record.unbonding_tx.is_none());
        assert_eq!(record.staker_btc_address.taproot_address, "bc1p");
    }
}
