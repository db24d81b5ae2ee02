//! Configuration loading and validation.
//!
//! Configuration comes from a TOML file; every option has the daemon's
//! historical default where one exists. Invalid base-chain configuration is
//! fatal at load time, never at job-assembly time.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::registry::StaticUpstream;
use crate::stratum::vardiff::VardiffConfig;
use crate::template::{TemplateKey, TemplateType};

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP listen address for miners.
    #[serde(default = "default_stratum_bind")]
    pub stratum_bind: String,

    /// The chain whose header miners actually hash.
    pub base_currency: TemplateKey,

    /// Chains merged in through the aux commitment.
    #[serde(default)]
    pub aux_currencies: Vec<TemplateKey>,

    /// Share-chain name persisted on every share and block row.
    pub share_chain_name: String,

    /// SQL connection URL.
    pub db_connection_string: String,

    /// Run the in-process loopback miner.
    #[serde(default)]
    pub enable_cpuminer: bool,

    /// One of debug|info|warn|error|crit; RUST_LOG overrides.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Desired accepted shares per minute per session.
    #[serde(default = "default_vardiff_target")]
    pub vardiff_target: f64,

    #[serde(default = "default_vardiff_min")]
    pub vardiff_min: f64,

    #[serde(default = "default_vardiff_max")]
    pub vardiff_max: f64,

    /// Client extranonce width in bytes. Fixed per deployment, never
    /// negotiated per session.
    #[serde(default = "default_extranonce2_size")]
    pub extranonce2_size: usize,

    /// Upstreams pinned in configuration, bypassing service discovery.
    #[serde(default)]
    pub static_upstreams: Vec<StaticUpstream>,
}

fn default_stratum_bind() -> String {
    "127.0.0.1:3333".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_vardiff_target() -> f64 {
    20.0
}

fn default_vardiff_min() -> f64 {
    1.0
}

fn default_vardiff_max() -> f64 {
    65536.0
}

fn default_extranonce2_size() -> usize {
    4
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate from a TOML string.
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.base_currency.template_type != TemplateType::Base {
            anyhow::bail!(
                "base_currency must have template_type \"base\", got \"{}\"",
                self.base_currency.template_type
            );
        }
        for aux in &self.aux_currencies {
            if aux.template_type != TemplateType::Aux {
                anyhow::bail!(
                    "aux_currencies entries must have template_type \"aux\", {} does not",
                    aux
                );
            }
        }
        if !(1..=8).contains(&self.extranonce2_size) {
            anyhow::bail!(
                "extranonce2_size must be 1-8 bytes, got {}",
                self.extranonce2_size
            );
        }
        if self.vardiff_min > self.vardiff_max {
            anyhow::bail!(
                "vardiff_min ({}) exceeds vardiff_max ({})",
                self.vardiff_min,
                self.vardiff_max
            );
        }
        Ok(())
    }

    /// The template keys this deployment mines: every aux plus the base.
    pub fn interest_keys(&self) -> Vec<TemplateKey> {
        let mut keys = self.aux_currencies.clone();
        keys.push(self.base_currency.clone());
        keys
    }

    pub fn vardiff(&self) -> VardiffConfig {
        VardiffConfig {
            target_per_minute: self.vardiff_target,
            min_difficulty: self.vardiff_min,
            max_difficulty: self.vardiff_max,
        }
    }
}
