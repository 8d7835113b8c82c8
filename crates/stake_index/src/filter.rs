//! Typed filter IR evaluated by the store backends.
//!
//! Each collection exposes a field enum; a [`Filter`] over that enum is
//! composed by the query and transition layers and handed to the store as-is.
//! Backends evaluate it with [`Filter::matches`] and order results with
//! [`compare_descending`].

use std::cmp::Ordering;
use std::fmt;

use crate::types::{DelegationRecord, DelegationState, FinalityProviderStats};

/// Semantic type of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    U64,
    I64,
    Str,
    Bool,
    State,
}

/// A single field value extracted from a document or used in a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    U64(u64),
    I64(i64),
    Str(String),
    Bool(bool),
    State(DelegationState),
}

impl FieldValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::U64(_) => ValueKind::U64,
            Self::I64(_) => ValueKind::I64,
            Self::Str(_) => ValueKind::Str,
            Self::Bool(_) => ValueKind::Bool,
            Self::State(_) => ValueKind::State,
        }
    }

    /// Orders two values of the same kind; mixed kinds never compare.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (Self::U64(a), Self::U64(b)) => Some(a.cmp(b)),
            (Self::I64(a), Self::I64(b)) => Some(a.cmp(b)),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::State(a), Self::State(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U64(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "'{v}'"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::State(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::U64(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DelegationState> for FieldValue {
    fn from(value: DelegationState) -> Self {
        Self::State(value)
    }
}

/// Field of one document collection.
pub trait DocumentField: Copy + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Stored path of the field, used in log output.
    fn name(self) -> &'static str;
    /// Collection-unique tag written into cursor tokens.
    fn tag(self) -> u8;
    fn value_kind(self) -> ValueKind;
}

/// A stored document with a unique string key.
pub trait Document: Clone + Send + Sync + 'static {
    type Field: DocumentField;

    /// Field holding the unique key; always the tie-break sort criterion.
    const KEY_FIELD: Self::Field;

    fn key(&self) -> &str;
    fn field(&self, field: Self::Field) -> FieldValue;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering.is_eq(),
            Self::Lt => ordering.is_lt(),
            Self::LtEq => ordering.is_le(),
            Self::Gt => ordering.is_gt(),
            Self::GtEq => ordering.is_ge(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        }
    }
}

/// Typed predicate over the fields of one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter<F> {
    All,
    Cmp {
        field: F,
        op: CmpOp,
        value: FieldValue,
    },
    In {
        field: F,
        values: Vec<FieldValue>,
    },
    And(Vec<Filter<F>>),
    Or(Vec<Filter<F>>),
}

impl<F: DocumentField> Filter<F> {
    pub fn eq(field: F, value: impl Into<FieldValue>) -> Self {
        Self::cmp(field, CmpOp::Eq, value)
    }

    pub fn lt(field: F, value: impl Into<FieldValue>) -> Self {
        Self::cmp(field, CmpOp::Lt, value)
    }

    pub fn gt(field: F, value: impl Into<FieldValue>) -> Self {
        Self::cmp(field, CmpOp::Gt, value)
    }

    pub fn gte(field: F, value: impl Into<FieldValue>) -> Self {
        Self::cmp(field, CmpOp::GtEq, value)
    }

    pub fn cmp(field: F, op: CmpOp, value: impl Into<FieldValue>) -> Self {
        Self::Cmp {
            field,
            op,
            value: value.into(),
        }
    }

    pub fn in_set<V: Into<FieldValue>>(field: F, values: impl IntoIterator<Item = V>) -> Self {
        Self::In {
            field,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Conjunction that flattens nested `And` terms and drops `All`.
    pub fn and(self, other: Filter<F>) -> Self {
        let mut terms = Vec::new();
        for term in [self, other] {
            match term {
                Self::All => {}
                Self::And(inner) => terms.extend(inner),
                other => terms.push(other),
            }
        }
        match terms.len() {
            0 => Self::All,
            1 => terms.remove(0),
            _ => Self::And(terms),
        }
    }

    pub fn or(self, other: Filter<F>) -> Self {
        let mut terms = Vec::new();
        for term in [self, other] {
            match term {
                Self::Or(inner) => terms.extend(inner),
                other => terms.push(other),
            }
        }
        Self::Or(terms)
    }

    pub fn matches<D: Document<Field = F>>(&self, doc: &D) -> bool {
        match self {
            Self::All => true,
            Self::Cmp { field, op, value } => doc
                .field(*field)
                .compare(value)
                .map(|ordering| op.holds(ordering))
                .unwrap_or(false),
            Self::In { field, values } => {
                let actual = doc.field(*field);
                values.iter().any(|value| value == &actual)
            }
            Self::And(terms) => terms.iter().all(|term| term.matches(doc)),
            Self::Or(terms) => terms.iter().any(|term| term.matches(doc)),
        }
    }

    /// Returns the key when the filter pins one document by equality.
    pub fn pinned_key(&self, key_field: F) -> Option<&str> {
        match self {
            Self::Cmp {
                field,
                op: CmpOp::Eq,
                value: FieldValue::Str(key),
            } if *field == key_field => Some(key.as_str()),
            Self::And(terms) => terms.iter().find_map(|term| term.pinned_key(key_field)),
            _ => None,
        }
    }

    /// Compact textual form for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::All => "TRUE".to_string(),
            Self::Cmp { field, op, value } => {
                format!("{} {} {value}", field.name(), op.as_str())
            }
            Self::In { field, values } => format!(
                "{} IN ({})",
                field.name(),
                values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::And(terms) => terms
                .iter()
                .map(|term| match term {
                    Self::Or(_) => format!("({})", term.describe()),
                    _ => term.describe(),
                })
                .collect::<Vec<_>>()
                .join(" AND "),
            Self::Or(terms) => terms
                .iter()
                .map(|term| match term {
                    Self::And(_) => format!("({})", term.describe()),
                    _ => term.describe(),
                })
                .collect::<Vec<_>>()
                .join(" OR "),
        }
    }
}

/// Store query: filter, optional descending sort, optional row limit.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery<F> {
    pub filter: Filter<F>,
    pub sort: Option<F>,
    pub limit: Option<usize>,
}

impl<F: DocumentField> FindQuery<F> {
    pub fn new(filter: Filter<F>) -> Self {
        Self {
            filter,
            sort: None,
            limit: None,
        }
    }

    pub fn sorted_by(mut self, field: F) -> Self {
        self.sort = Some(field);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Total order `(sort field desc, key asc)`.
pub fn compare_descending<D: Document>(a: &D, b: &D, sort: D::Field) -> Ordering {
    b.field(sort)
        .compare(&a.field(sort))
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.key().cmp(b.key()))
}

/// Applies `query` to an iterator of documents already ordered by key.
pub fn select<'a, D, I>(docs: I, query: &FindQuery<D::Field>) -> Vec<D>
where
    D: Document,
    I: IntoIterator<Item = &'a D>,
{
    let mut out = docs
        .into_iter()
        .filter(|doc| query.filter.matches(*doc))
        .cloned()
        .collect::<Vec<_>>();
    if let Some(sort) = query.sort {
        out.sort_by(|a, b| compare_descending(a, b, sort));
    }
    if let Some(limit) = query.limit {
        out.truncate(limit);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationField {
    StakingTxHash,
    StakerPk,
    FinalityProviderPk,
    StakingValue,
    State,
    StartHeight,
    StartTimestamp,
    TaprootAddress,
    IsOverflow,
}

impl DocumentField for DelegationField {
    fn name(self) -> &'static str {
        match self {
            Self::StakingTxHash => "_id",
            Self::StakerPk => "staker_pk_hex",
            Self::FinalityProviderPk => "finality_provider_pk_hex",
            Self::StakingValue => "staking_value",
            Self::State => "state",
            Self::StartHeight => "staking_tx.start_height",
            Self::StartTimestamp => "staking_tx.start_timestamp",
            Self::TaprootAddress => "staker_btc_address.taproot_address",
            Self::IsOverflow => "is_overflow",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::StakingTxHash => 0x01,
            Self::StakerPk => 0x02,
            Self::FinalityProviderPk => 0x03,
            Self::StakingValue => 0x04,
            Self::State => 0x05,
            Self::StartHeight => 0x06,
            Self::StartTimestamp => 0x07,
            Self::TaprootAddress => 0x08,
            Self::IsOverflow => 0x09,
        }
    }

    fn value_kind(self) -> ValueKind {
        match self {
            Self::StakingTxHash
            | Self::StakerPk
            | Self::FinalityProviderPk
            | Self::TaprootAddress => ValueKind::Str,
            Self::StakingValue | Self::StartHeight => ValueKind::U64,
            Self::StartTimestamp => ValueKind::I64,
            Self::State => ValueKind::State,
            Self::IsOverflow => ValueKind::Bool,
        }
    }
}

impl Document for DelegationRecord {
    type Field = DelegationField;

    const KEY_FIELD: DelegationField = DelegationField::StakingTxHash;

    fn key(&self) -> &str {
        &self.staking_tx_hash_hex
    }

    fn field(&self, field: DelegationField) -> FieldValue {
        match field {
            DelegationField::StakingTxHash => self.staking_tx_hash_hex.as_str().into(),
            DelegationField::StakerPk => self.staker_pk_hex.as_str().into(),
            DelegationField::FinalityProviderPk => self.finality_provider_pk_hex.as_str().into(),
            DelegationField::StakingValue => self.staking_value.into(),
            DelegationField::State => self.state.into(),
            DelegationField::StartHeight => self.staking_tx.start_height.into(),
            DelegationField::StartTimestamp => self.staking_tx.start_timestamp.into(),
            DelegationField::TaprootAddress => {
                self.staker_btc_address.taproot_address.as_str().into()
            }
            DelegationField::IsOverflow => self.is_overflow.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpStatsField {
    FinalityProviderPk,
    ActiveTvl,
    TotalTvl,
    ActiveDelegations,
    TotalDelegations,
}

impl DocumentField for FpStatsField {
    fn name(self) -> &'static str {
        match self {
            Self::FinalityProviderPk => "_id",
            Self::ActiveTvl => "active_tvl",
            Self::TotalTvl => "total_tvl",
            Self::ActiveDelegations => "active_delegations",
            Self::TotalDelegations => "total_delegations",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::FinalityProviderPk => 0x21,
            Self::ActiveTvl => 0x22,
            Self::TotalTvl => 0x23,
            Self::ActiveDelegations => 0x24,
            Self::TotalDelegations => 0x25,
        }
    }

    fn value_kind(self) -> ValueKind {
        match self {
            Self::FinalityProviderPk => ValueKind::Str,
            _ => ValueKind::I64,
        }
    }
}

impl Document for FinalityProviderStats {
    type Field = FpStatsField;

    const KEY_FIELD: FpStatsField = FpStatsField::FinalityProviderPk;

    fn key(&self) -> &str {
        &self.finality_provider_pk_hex
    }

    fn field(&self, field: FpStatsField) -> FieldValue {
        match field {
            FpStatsField::FinalityProviderPk => self.finality_provider_pk_hex.as_str().into(),
            FpStatsField::ActiveTvl => self.active_tvl.into(),
            FpStatsField::TotalTvl => self.total_tvl.into(),
            FpStatsField::ActiveDelegations => self.active_delegations.into(),
            FpStatsField::TotalDelegations => self.total_delegations.into(),
        }
    }
}
