use std::time::Duration;

use bitcoin::Network;
use clap::Args;
use reqwest::Url;

use crate::relay::{RelayEndpoint, RelayFormat};
use crate::DatabaseLocation;

pub const DEFAULT_FEE_ENDPOINT: &str = "https://mempool.space/api/v1/fees/recommended";
pub const DEFAULT_EXPLORER_URL: &str = "https://blockstream.info/api";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MIN_AVAILABLE_ADDRESSES: u64 = 10;

fn default_relay_endpoints() -> Vec<RelayEndpoint> {
    vec![
        RelayEndpoint::new("https://mempool.space/api/tx", RelayFormat::RawHex),
        RelayEndpoint::new("https://blockstream.info/api/tx", RelayFormat::RawHex),
        RelayEndpoint::new(
            "https://api.blockcypher.com/v1/btc/main/txs/push",
            RelayFormat::JsonHex,
        ),
    ]
}

/// Engine settings. Derives `clap::Args` so a host binary can `#[command(flatten)]` it.
#[derive(Args, Debug, Clone)]
pub struct EngineConfig {
    /// Bitcoin network the wallet operates on (bitcoin, testnet, signet, regtest)
    #[arg(long, env, default_value = "bitcoin")]
    pub network: Network,

    /// Name the wallet's rows are stored under
    #[arg(long, env, default_value = "default")]
    pub wallet_name: String,

    /// Database location, one of "memory" or a path to a directory
    #[arg(long, env, default_value = "memory")]
    pub database_location: DatabaseLocation,

    /// Endpoint returning the five tier fee recommendation JSON
    #[arg(long, env, default_value = DEFAULT_FEE_ENDPOINT)]
    pub fee_endpoint: String,

    /// Ordered relay endpoints, `raw:<url>` or `json:<url>`, comma separated
    #[arg(long, env, value_delimiter = ',', default_values_t = default_relay_endpoints())]
    pub relay_endpoints: Vec<RelayEndpoint>,

    /// Esplora compatible explorer used for outspend checks and mempool verification
    #[arg(long, env, default_value = DEFAULT_EXPLORER_URL)]
    pub explorer_url: String,

    /// Electrum server used to fetch transactions missing from the local store
    #[arg(long, env)]
    pub electrum_url: Option<String>,

    /// Timeout applied to every outbound network call
    #[arg(long, env, default_value_t = DEFAULT_HTTP_TIMEOUT_SECS)]
    pub http_timeout_secs: u64,

    /// Delay before the first mempool visibility check after a submission
    #[arg(long, env, default_value = "3")]
    pub verify_initial_delay_secs: u64,

    /// Number of mempool visibility checks before giving up
    #[arg(long, env, default_value = "5")]
    pub verify_attempts: u32,

    /// Interval between mempool visibility checks
    #[arg(long, env, default_value = "2")]
    pub verify_interval_secs: u64,

    /// Minimum number of available addresses kept per kind
    #[arg(long, env, default_value_t = DEFAULT_MIN_AVAILABLE_ADDRESSES)]
    pub min_available_addresses: u64,

    /// Interval of the background address pool check
    #[arg(long, env, default_value = "60")]
    pub address_check_interval_secs: u64,

    /// Upper bound on time spent retrying a single address derivation
    #[arg(long, env, default_value = "5")]
    pub derivation_retry_secs: u64,

    /// Age after which an output lock is considered stale and released
    #[arg(long, env, default_value = "600")]
    pub lock_expiry_secs: u64,

    /// Minimum confirmations for outputs to be selectable
    #[arg(long, env, default_value = "1")]
    pub min_confirmations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            wallet_name: "default".to_string(),
            database_location: DatabaseLocation::InMemory,
            fee_endpoint: DEFAULT_FEE_ENDPOINT.to_string(),
            relay_endpoints: default_relay_endpoints(),
            explorer_url: DEFAULT_EXPLORER_URL.to_string(),
            electrum_url: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            verify_initial_delay_secs: 3,
            verify_attempts: 5,
            verify_interval_secs: 2,
            min_available_addresses: DEFAULT_MIN_AVAILABLE_ADDRESSES,
            address_check_interval_secs: 60,
            derivation_retry_secs: 5,
            lock_expiry_secs: 600,
            min_confirmations: 1,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.wallet_name.trim().is_empty() {
            return Err(eyre::eyre!("wallet_name must not be empty"));
        }

        if self.http_timeout_secs == 0 {
            return Err(eyre::eyre!("http_timeout_secs must be greater than 0"));
        }

        if self.verify_attempts == 0 {
            return Err(eyre::eyre!("verify_attempts must be greater than 0"));
        }

        if self.min_available_addresses == 0 {
            return Err(eyre::eyre!("min_available_addresses must be greater than 0"));
        }

        for url in [&self.fee_endpoint, &self.explorer_url] {
            Url::parse(url).map_err(|e| eyre::eyre!("Invalid url {}: {}", url, e))?;
        }
        for endpoint in &self.relay_endpoints {
            Url::parse(&endpoint.url)
                .map_err(|e| eyre::eyre!("Invalid relay url {}: {}", endpoint.url, e))?;
        }

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.relay_endpoints.len(), 3);
        assert_eq!(config.http_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_zero_verify_attempts() {
        let config = EngineConfig {
            verify_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_relay_url() {
        let config = EngineConfig {
            relay_endpoints: vec![RelayEndpoint::new("not a url", RelayFormat::RawHex)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
