//! Node configuration
//!
//! Read once when a [`crate::Consensus`] is built and never mutated.
//! Every validator receives it explicitly.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_MAX_BLOCK_SIZE;
use crate::params::{ChainParams, Network};
use crate::types::RuleSet;

fn default_network() -> Network {
    Network::Regtest
}

fn default_parallel_script_checks() -> bool {
    true
}

fn default_max_block_size() -> usize {
    DEFAULT_MAX_BLOCK_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    #[serde(default = "default_network")]
    pub network: Network,
    /// Overrides the network's script rule set when present
    pub legacy_script_rules: Option<bool>,
    pub enable_miner_fund: bool,
    pub enable_staking_rewards: bool,
    /// Flatten miner fund and staking reward into the template's top level
    pub simple_gbt: bool,
    #[serde(default = "default_parallel_script_checks")]
    pub parallel_script_checks: bool,
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: default_network(),
            legacy_script_rules: None,
            enable_miner_fund: false,
            enable_staking_rewards: false,
            simple_gbt: false,
            parallel_script_checks: default_parallel_script_checks(),
            max_block_size: default_max_block_size(),
        }
    }
}

impl NodeConfig {
    pub fn regtest() -> Self {
        Self::default()
    }

    pub fn legacy_regtest() -> Self {
        NodeConfig {
            legacy_script_rules: Some(true),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: NodeConfig =
            serde_json::from_str(json).context("failed to parse node configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_block_size < crate::constants::BLOCK_MAXBYTES_MAXSIGCHECKS_RATIO {
            anyhow::bail!("max_block_size {} is too small", self.max_block_size);
        }
        Ok(())
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams::for_network(self.network)
    }

    /// Rule set in force: the explicit override, else the network default
    pub fn rule_set(&self, params: &ChainParams) -> RuleSet {
        if self.legacy_script_rules.unwrap_or(params.legacy_rules) {
            RuleSet::Legacy
        } else {
            RuleSet::Modern
        }
    }
}
