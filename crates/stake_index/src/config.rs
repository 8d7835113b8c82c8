//! Environment configuration and the global params loader.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

use crate::types::FinalityProviderReference;

/// Length in hex characters of a 32-byte x-only public key.
const BTC_PK_HEX_LEN: usize = 64;

/// Runtime settings for a stake index process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeIndexConfig {
    pub data_dir: PathBuf,
    /// Upper bound on page size; always at least 1.
    pub max_pagination_limit: usize,
    /// Per store call; `None` when disabled.
    pub store_timeout: Option<Duration>,
    pub global_params: Option<PathBuf>,
}

impl Default for StakeIndexConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_pagination_limit: 10,
            store_timeout: Some(Duration::from_millis(5_000)),
            global_params: None,
        }
    }
}

impl StakeIndexConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let data_dir = lookup("STAKE_INDEX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let max_pagination_limit = parse_usize(
            lookup("STAKE_INDEX_MAX_PAGINATION_LIMIT"),
            defaults.max_pagination_limit,
        )
        .context("STAKE_INDEX_MAX_PAGINATION_LIMIT")?
        .max(1);
        let store_timeout_ms = parse_u64(lookup("STAKE_INDEX_STORE_TIMEOUT_MS"), 5_000)
            .context("STAKE_INDEX_STORE_TIMEOUT_MS")?;
        let global_params = lookup("STAKE_INDEX_GLOBAL_PARAMS")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            data_dir,
            max_pagination_limit,
            store_timeout: (store_timeout_ms > 0).then(|| Duration::from_millis(store_timeout_ms)),
            global_params,
        })
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

#[derive(Deserialize)]
struct GlobalParamsFile {
    finality_providers: Vec<FinalityProviderReference>,
}

/// Loads and validates the finality-provider reference list.
pub fn load_finality_providers(path: &Path) -> Result<Vec<FinalityProviderReference>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read global params {}", path.display()))?;
    parse_finality_providers(&raw).with_context(|| format!("parse global params {}", path.display()))
}

pub fn parse_finality_providers(raw: &str) -> Result<Vec<FinalityProviderReference>> {
    let params: GlobalParamsFile =
        serde_json::from_str(raw).context("malformed global params JSON")?;
    let mut seen = HashSet::with_capacity(params.finality_providers.len());
    for provider in &params.finality_providers {
        validate_btc_pk(&provider.btc_pk)?;
        if !seen.insert(provider.btc_pk.as_str()) {
            bail!("duplicate finality provider btc_pk {}", provider.btc_pk);
        }
    }
    Ok(params.finality_providers)
}

fn validate_btc_pk(btc_pk: &str) -> Result<()> {
    ensure!(
        btc_pk.len() == BTC_PK_HEX_LEN,
        "btc_pk {btc_pk} must be {BTC_PK_HEX_LEN} hex characters"
    );
    hex::decode(btc_pk).with_context(|| format!("btc_pk {btc_pk} is not valid hex"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| vars.get(key).cloned()
    }

    fn pk(fill: char) -> String {
        std::iter::repeat(fill).take(BTC_PK_HEX_LEN).collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = StakeIndexConfig::from_lookup(lookup_from(&[])).expect("config");
        assert_eq!(config, StakeIndexConfig::default());
    }

    #[test]
    fn overrides_are_parsed_and_clamped() {
        let config = StakeIndexConfig::from_lookup(lookup_from(&[
            ("STAKE_INDEX_DATA_DIR", "/tmp/stake"),
            ("STAKE_INDEX_MAX_PAGINATION_LIMIT", "0"),
            ("STAKE_INDEX_STORE_TIMEOUT_MS", "0"),
            ("STAKE_INDEX_GLOBAL_PARAMS", "params.json"),
        ]))
        .expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/stake"));
        assert_eq!(config.max_pagination_limit, 1);
        assert_eq!(config.store_timeout, None);
        assert_eq!(config.global_params, Some(PathBuf::from("params.json")));
    }

    #[test]
    fn bad_number_names_the_variable() {
        let err = StakeIndexConfig::from_lookup(lookup_from(&[(
            "STAKE_INDEX_MAX_PAGINATION_LIMIT",
            "ten",
        )]))
        .expect_err("invalid number");
        assert!(format!("{err:#}").contains("STAKE_INDEX_MAX_PAGINATION_LIMIT"));
    }

    #[test]
    fn params_parse_and_keep_order() {
        let raw = format!(
            r#"{{"finality_providers":[
                {{"description":{{"moniker":"one"}},"commission":"0.05","btc_pk":"{}"}},
                {{"commission":"0.10","btc_pk":"{}"}}
            ]}}"#,
            pk('b'),
            pk('a')
        );
        let providers = parse_finality_providers(&raw).expect("valid params");
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].description.moniker, "one");
        assert_eq!(providers[1].btc_pk, pk('a'));
        assert_eq!(providers[1].description.moniker, "");
    }

    #[test]
    fn params_reject_bad_keys_and_duplicates() {
        let short = r#"{"finality_providers":[{"btc_pk":"abcd"}]}"#;
        assert!(parse_finality_providers(short).is_err());

        let not_hex = format!(r#"{{"finality_providers":[{{"btc_pk":"{}"}}]}}"#, pk('z'));
        assert!(parse_finality_providers(&not_hex).is_err());

        let dup = format!(
            r#"{{"finality_providers":[{{"btc_pk":"{0}"}},{{"btc_pk":"{0}"}}]}}"#,
            pk('c')
        );
        let err = parse_finality_providers(&dup).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"));

        assert!(parse_finality_providers("{not json").is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = load_finality_providers(&dir.path().join("absent.json")).expect_err("missing");
        assert!(format!("{err:#}").contains("read global params"));
    }
}
