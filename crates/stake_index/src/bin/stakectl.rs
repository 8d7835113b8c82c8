//! Admin client for a local fjall-backed stake index.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use stake_index::store::DelegationFieldUpdate;
use stake_index::{
    load_finality_providers, DelegationState, DocumentStore, FinalityProviderStats, FjallStore,
    InsertOutcome, NewDelegation, StakeIndexConfig, StakingService, TimelockTransaction,
};

#[derive(Parser)]
#[command(name = "stakectl")]
#[command(about = "Inspect and edit a local stake index", long_about = None)]
struct Cli {
    /// Store directory; defaults to STAKE_INDEX_DATA_DIR or ./data.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Page size cap; defaults to STAKE_INDEX_MAX_PAGINATION_LIMIT.
    #[arg(long)]
    max_limit: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a newly observed staking tx as an active delegation.
    Insert {
        #[arg(long)]
        staking_tx_hash: String,
        #[arg(long)]
        staker_pk: String,
        #[arg(long)]
        finality_provider_pk: String,
        #[arg(long)]
        value: u64,
        #[arg(long)]
        taproot_address: String,
        #[arg(long, default_value_t = false)]
        overflow: bool,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Move a delegation to a new state.
    Transition {
        #[arg(long)]
        staking_tx_hash: String,
        /// Target state, e.g. `unbonding_requested`.
        #[arg(long)]
        to: DelegationState,
        /// Allowed prior state; repeatable. Defaults to every state the table allows.
        #[arg(long = "from")]
        from: Vec<DelegationState>,
        /// Unbonding tx hex written with the transition.
        #[arg(long)]
        unbonding_tx_hex: Option<String>,
        #[arg(long, default_value_t = 0)]
        unbonding_output_index: u64,
        #[arg(long, default_value_t = 0)]
        unbonding_start_height: u64,
        #[arg(long, default_value_t = 0)]
        unbonding_start_timestamp: i64,
        #[arg(long, default_value_t = 0)]
        unbonding_timelock: u64,
    },
    /// List delegations of a staker, newest first.
    Delegations {
        #[arg(long)]
        staker_pk: String,
        /// Continuation token from a previous page.
        #[arg(long, default_value = "")]
        page: String,
    },
    /// List finality providers merged with the global params.
    Providers {
        /// Global params JSON; defaults to STAKE_INDEX_GLOBAL_PARAMS.
        #[arg(long)]
        params: Option<PathBuf>,
        #[arg(long, default_value = "")]
        page: String,
    },
    /// Write the stats document of one finality provider.
    PutStats {
        #[arg(long)]
        finality_provider_pk: String,
        #[arg(long, default_value_t = 0)]
        active_tvl: i64,
        #[arg(long, default_value_t = 0)]
        total_tvl: i64,
        #[arg(long, default_value_t = 0)]
        active_delegations: i64,
        #[arg(long, default_value_t = 0)]
        total_delegations: i64,
    },
}

#[derive(Args)]
struct TxArgs {
    #[arg(long)]
    tx_hex: String,
    #[arg(long, default_value_t = 0)]
    output_index: u64,
    #[arg(long)]
    start_height: u64,
    #[arg(long)]
    start_timestamp: i64,
    #[arg(long)]
    timelock: u64,
}

impl From<TxArgs> for TimelockTransaction {
    fn from(args: TxArgs) -> Self {
        Self {
            tx_hex: args.tx_hex,
            output_index: args.output_index,
            start_timestamp: args.start_timestamp,
            start_height: args.start_height,
            timelock: args.timelock,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("encode output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fjall=warn,lsm_tree=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = StakeIndexConfig::from_env()?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(max_limit) = cli.max_limit {
        config.max_pagination_limit = max_limit.max(1);
    }

    let store = Arc::new(FjallStore::open(&config.data_dir)?);
    let reference = match &cli.command {
        Command::Providers { params, .. } => {
            let path = params
                .clone()
                .or_else(|| config.global_params.clone())
                .context("providers needs --params or STAKE_INDEX_GLOBAL_PARAMS")?;
            load_finality_providers(&path)?
        }
        _ => Vec::new(),
    };
    let service = StakingService::new(store.clone(), reference.into(), config);
    let ctx = service.context();

    match cli.command {
        Command::Insert {
            staking_tx_hash,
            staker_pk,
            finality_provider_pk,
            value,
            taproot_address,
            overflow,
            tx,
        } => {
            let outcome = service
                .save_active_staking_delegation(
                    &ctx,
                    NewDelegation {
                        staking_tx_hash_hex: staking_tx_hash.clone(),
                        staker_pk_hex: staker_pk,
                        finality_provider_pk_hex: finality_provider_pk,
                        staking_value: value,
                        staking_tx: tx.into(),
                        is_overflow: overflow,
                        staker_taproot_address: taproot_address,
                    },
                )
                .await?;
            store.persist()?;
            let outcome = match outcome {
                InsertOutcome::Inserted => "inserted",
                InsertOutcome::AlreadyExists => "already_exists",
            };
            print_json(&json!({ "staking_tx_hash_hex": staking_tx_hash, "outcome": outcome }))
        }
        Command::Transition {
            staking_tx_hash,
            to,
            from,
            unbonding_tx_hex,
            unbonding_output_index,
            unbonding_start_height,
            unbonding_start_timestamp,
            unbonding_timelock,
        } => {
            let allowed_prior = if from.is_empty() {
                DelegationState::eligible_predecessors(to)
            } else {
                from
            };
            let extra = unbonding_tx_hex
                .map(|tx_hex| {
                    DelegationFieldUpdate::UnbondingTx(TimelockTransaction {
                        tx_hex,
                        output_index: unbonding_output_index,
                        start_timestamp: unbonding_start_timestamp,
                        start_height: unbonding_start_height,
                        timelock: unbonding_timelock,
                    })
                })
                .into_iter()
                .collect();
            service
                .transition(&ctx, &staking_tx_hash, to, &allowed_prior, extra)
                .await?;
            store.persist()?;
            let record = service.get_delegation(&ctx, &staking_tx_hash).await?;
            print_json(&record)
        }
        Command::Delegations { staker_pk, page } => {
            let page = service
                .delegations_by_staker_pk(&ctx, &staker_pk, &page)
                .await?;
            print_json(&page)
        }
        Command::Providers { page, .. } => {
            let page = service.finality_providers(&ctx, &page).await?;
            print_json(&page)
        }
        Command::PutStats {
            finality_provider_pk,
            active_tvl,
            total_tvl,
            active_delegations,
            total_delegations,
        } => {
            let stats = FinalityProviderStats {
                finality_provider_pk_hex: finality_provider_pk,
                active_tvl,
                total_tvl,
                active_delegations,
                total_delegations,
            };
            store
                .upsert_finality_provider_stats(stats.clone())
                .await
                .context("write finality provider stats")?;
            store.persist()?;
            print_json(&stats)
        }
    }
}
