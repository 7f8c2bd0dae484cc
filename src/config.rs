//! Configuration management for the Lattice dataworker
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{DataworkerError, DataworkerResult};

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub dataworker: DataworkerConfig,
    pub bundle: BundleConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataworkerConfig {
    pub hub_chain_id: u64,
    pub hub_pool_address: String,
    /// Generic multicall aggregator used for batched prove/finalize calls
    pub multicall_address: String,
    /// Extra blocks read before each range so in-range fills can resolve
    /// deposits from earlier bundles
    pub deposit_lookback_blocks: u64,
    /// Bridge messages encoded below this version predate the current
    /// protocol upgrade and are skipped
    pub min_message_version: u16,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub read_timeout_secs: u64,
}

/// Leaf construction caps enforced by the hub contract
#[derive(Debug, Clone, Deserialize)]
pub struct BundleConfig {
    pub max_l1_tokens_per_pool_rebalance_leaf: usize,
    pub max_refunds_per_relayer_refund_leaf: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub spoke_pool_address: String,
    pub confirmation_blocks: u64,
    pub protocol_family: ProtocolFamily,
    /// Native bridge contract driving withdrawals toward the hub chain
    pub bridge_portal_address: String,
    /// Blocks a withdrawal must age before finalization is attempted
    pub finalization_delay_blocks: u64,
    pub enabled: bool,
}

/// Native bridge protocol family of a spoke chain. Selects the withdrawal
/// state-transition table used by the finalizer.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// Two-phase prove then finalize after a challenge window
    Optimistic,
    /// Single-phase execution once the delay elapses
    Delayed,
    /// Single proof-carrying finalization after inclusion
    Proof,
    /// Finalize once a checkpoint covering the withdrawal is posted
    Checkpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub decimals: u8,
    pub l1_address: String,
    pub l2_addresses: Vec<L2TokenAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct L2TokenAddress {
    pub chain_id: u64,
    pub address: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("LATTICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.get_chain_by_id(self.dataworker.hub_chain_id).is_none() {
            anyhow::bail!(
                "Hub chain {} is not present in the chain set",
                self.dataworker.hub_chain_id
            );
        }

        Address::from_str(&self.dataworker.hub_pool_address)
            .map_err(|e| anyhow::anyhow!("Bad hub pool address: {}", e))?;
        Address::from_str(&self.dataworker.multicall_address)
            .map_err(|e| anyhow::anyhow!("Bad multicall address: {}", e))?;

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_url.is_empty() {
                anyhow::bail!("Chain {} has no RPC URL configured", name);
            }
        }

        if self.bundle.max_l1_tokens_per_pool_rebalance_leaf == 0
            || self.bundle.max_refunds_per_relayer_refund_leaf == 0
        {
            anyhow::bail!("Leaf caps must be nonzero");
        }

        for token in &self.tokens {
            Address::from_str(&token.l1_address)
                .map_err(|e| anyhow::anyhow!("Token {}: bad L1 address: {}", token.symbol, e))?;
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Resolved token identity used for refund keying and withdrawal reporting
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
    pub l1_address: Address,
}

/// Bidirectional mapping between L1 tokens and their per-chain deployments
#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    by_l1: HashMap<Address, TokenInfo>,
    // (chain, l2 token) -> l1 token
    l1_by_l2: HashMap<(u64, Address), Address>,
}

impl TokenMap {
    pub fn from_configs(tokens: &[TokenConfig]) -> DataworkerResult<Self> {
        let mut by_l1 = HashMap::new();
        let mut l1_by_l2 = HashMap::new();

        for token in tokens {
            let l1_address = Address::from_str(&token.l1_address).map_err(|e| {
                DataworkerError::Config(format!("Token {}: {}", token.symbol, e))
            })?;
            by_l1.insert(
                l1_address,
                TokenInfo {
                    symbol: token.symbol.clone(),
                    decimals: token.decimals,
                    l1_address,
                },
            );
            // The hub chain deployment maps to itself
            l1_by_l2.insert((0, l1_address), l1_address);
            for l2 in &token.l2_addresses {
                let address = Address::from_str(&l2.address).map_err(|e| {
                    DataworkerError::Config(format!(
                        "Token {} on chain {}: {}",
                        token.symbol, l2.chain_id, e
                    ))
                })?;
                l1_by_l2.insert((l2.chain_id, address), l1_address);
            }
        }

        Ok(Self { by_l1, l1_by_l2 })
    }

    /// Resolve a chain-local token address to its L1 token
    pub fn l1_token(&self, chain_id: u64, local_token: Address) -> DataworkerResult<Address> {
        // L1 deployments resolve regardless of which chain asked
        if self.by_l1.contains_key(&local_token) {
            return Ok(local_token);
        }
        self.l1_by_l2
            .get(&(chain_id, local_token))
            .copied()
            .ok_or_else(|| DataworkerError::UnknownToken {
                chain_id,
                token: format!("{:?}", local_token),
            })
    }

    pub fn info(&self, l1_token: Address) -> Option<&TokenInfo> {
        self.by_l1.get(&l1_token)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    const SAMPLE: &str = r#"
[dataworker]
hub_chain_id = 1
hub_pool_address = "0x00000000000000000000000000000000000000cc"
multicall_address = "0x00000000000000000000000000000000000000dd"
deposit_lookback_blocks = 7200
min_message_version = 1
max_retries = 3
retry_delay_ms = 1000
read_timeout_secs = 30

[bundle]
max_l1_tokens_per_pool_rebalance_leaf = 25
max_refunds_per_relayer_refund_leaf = 25

[chains.mainnet]
chain_id = 1
name = "mainnet"
rpc_url = "http://localhost:8545"
spoke_pool_address = "0x00000000000000000000000000000000000000aa"
confirmation_blocks = 32
protocol_family = "optimistic"
bridge_portal_address = "0x00000000000000000000000000000000000000ee"
finalization_delay_blocks = 0
enabled = true

[chains.opchain]
chain_id = 10
name = "opchain"
rpc_url = "http://localhost:9545"
spoke_pool_address = "0x00000000000000000000000000000000000000bb"
confirmation_blocks = 64
protocol_family = "optimistic"
bridge_portal_address = "0x00000000000000000000000000000000000000ff"
finalization_delay_blocks = 50400
enabled = true

[[tokens]]
symbol = "USDC"
decimals = 6
l1_address = "0x0000000000000000000000000000000000000001"
l2_addresses = [{ chain_id = 10, address = "0x0000000000000000000000000000000000000002" }]
"#;

    #[test]
    fn test_load_sample_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(&file.path().to_path_buf()).unwrap();
        assert_eq!(settings.dataworker.hub_chain_id, 1);
        assert_eq!(settings.enabled_chains().len(), 2);
        assert_eq!(
            settings.get_chain_by_id(10).unwrap().protocol_family,
            ProtocolFamily::Optimistic
        );
    }

    #[test]
    fn test_token_map_resolution() {
        let tokens = vec![TokenConfig {
            symbol: "USDC".into(),
            decimals: 6,
            l1_address: "0x0000000000000000000000000000000000000001".into(),
            l2_addresses: vec![L2TokenAddress {
                chain_id: 10,
                address: "0x0000000000000000000000000000000000000002".into(),
            }],
        }];

        let map = TokenMap::from_configs(&tokens).unwrap();
        let l1 = Address::from_str("0x0000000000000000000000000000000000000001").unwrap();
        let l2 = Address::from_str("0x0000000000000000000000000000000000000002").unwrap();

        assert_eq!(map.l1_token(10, l2).unwrap(), l1);
        assert_eq!(map.l1_token(1, l1).unwrap(), l1);
        assert!(map.l1_token(10, Address::repeat_byte(9)).is_err());
        assert_eq!(map.info(l1).unwrap().symbol, "USDC");
    }
}
