pub mod chain;
pub mod mock_server;
pub mod wallet;

use custody_engine::config::EngineConfig;
use custody_engine::relay::{RelayEndpoint, RelayFormat};
use custody_engine::DatabaseLocation;

use bitcoin::Network;

use self::mock_server::MockServer;

/// Engine settings pointing every HTTP collaborator at `server`, with two
/// relays named `alpha` (raw hex) and `beta` (JSON wrapped).
pub fn engine_config(server: &MockServer, database_location: DatabaseLocation) -> EngineConfig {
    EngineConfig {
        network: Network::Regtest,
        wallet_name: "integration".to_string(),
        database_location,
        fee_endpoint: format!("{}/fees", server.base_url),
        relay_endpoints: vec![
            RelayEndpoint::new(format!("{}/relay/raw/alpha", server.base_url), RelayFormat::RawHex),
            RelayEndpoint::new(format!("{}/relay/json/beta", server.base_url), RelayFormat::JsonHex),
        ],
        explorer_url: format!("{}/esplora", server.base_url),
        electrum_url: None,
        http_timeout_secs: 5,
        verify_initial_delay_secs: 0,
        verify_attempts: 2,
        verify_interval_secs: 0,
        min_available_addresses: 3,
        address_check_interval_secs: 1,
        derivation_retry_secs: 1,
        lock_expiry_secs: 600,
        min_confirmations: 1,
    }
}
