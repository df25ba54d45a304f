use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::constants::{DEFAULT_IPFS_URL, DEFAULT_LIGHTHOUSE_URL};
use crate::{Result, SdkError};

const DEFAULT_DIAL: Duration = Duration::from_secs(15);
const DEFAULT_RPC_UNARY: Duration = Duration::from_secs(15);
const DEFAULT_RPC_STREAM: Duration = Duration::from_secs(60);
const DEFAULT_CHAIN_READ: Duration = Duration::from_secs(13);
const DEFAULT_CHAIN_SUBMIT: Duration = Duration::from_secs(25);
const DEFAULT_RECEIPT_WAIT: Duration = Duration::from_secs(90);
const DEFAULT_STRATEGY_REFRESH: Duration = Duration::from_secs(15);
const DEFAULT_PAYMENT_OPERATION: Duration = Duration::from_secs(60);

/// Optional per-operation timeouts, in seconds. Missing values fall back to
/// the defaults documented on [`Timeouts`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub dial: Option<u64>,
    pub rpc_unary: Option<u64>,
    pub rpc_stream: Option<u64>,
    pub chain_read: Option<u64>,
    pub chain_submit: Option<u64>,
    pub receipt_wait: Option<u64>,
    pub strategy_refresh: Option<u64>,
    pub payment_ensure: Option<u64>,
}

/// Resolved timeouts.
///
/// | field | default |
/// |---|---|
/// | dial | 15 s |
/// | rpc_unary | 15 s |
/// | rpc_stream | 60 s |
/// | chain_read | 13 s |
/// | chain_submit | 25 s |
/// | receipt_wait | 90 s |
/// | strategy_refresh | 15 s |
/// | payment_operation | `payment_ensure`, else `strategy_refresh`, else 60 s |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub dial: Duration,
    pub rpc_unary: Duration,
    pub rpc_stream: Duration,
    pub chain_read: Duration,
    pub chain_submit: Duration,
    pub receipt_wait: Duration,
    pub strategy_refresh: Duration,
    pub payment_operation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_config(&TimeoutsConfig::default())
    }
}

impl Timeouts {
    pub fn from_config(cfg: &TimeoutsConfig) -> Self {
        let secs = |v: Option<u64>, default: Duration| v.map(Duration::from_secs).unwrap_or(default);
        let payment_operation = cfg
            .payment_ensure
            .or(cfg.strategy_refresh)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PAYMENT_OPERATION);
        Self {
            dial: secs(cfg.dial, DEFAULT_DIAL),
            rpc_unary: secs(cfg.rpc_unary, DEFAULT_RPC_UNARY),
            rpc_stream: secs(cfg.rpc_stream, DEFAULT_RPC_STREAM),
            chain_read: secs(cfg.chain_read, DEFAULT_CHAIN_READ),
            chain_submit: secs(cfg.chain_submit, DEFAULT_CHAIN_SUBMIT),
            receipt_wait: secs(cfg.receipt_wait, DEFAULT_RECEIPT_WAIT),
            strategy_refresh: secs(cfg.strategy_refresh, DEFAULT_STRATEGY_REFRESH),
            payment_operation,
        }
    }
}

/// Engine configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Ethereum JSON-RPC endpoint (http(s):// or ws(s)://).
    pub rpc_endpoint: String,
    /// Registry contract override. Defaults to the network's registry.
    #[serde(default)]
    pub registry_address: Option<Address>,
    /// Hex-encoded secp256k1 key (with or without 0x). NEVER log this field.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_ipfs_url")]
    pub ipfs_url: String,
    #[serde(default = "default_lighthouse_url")]
    pub lighthouse_url: String,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

fn default_ipfs_url() -> String {
    DEFAULT_IPFS_URL.to_string()
}

fn default_lighthouse_url() -> String {
    DEFAULT_LIGHTHOUSE_URL.to_string()
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("rpc_endpoint", &self.rpc_endpoint)
            .field("registry_address", &self.registry_address)
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .field("debug", &self.debug)
            .field("ipfs_url", &self.ipfs_url)
            .field("lighthouse_url", &self.lighthouse_url)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl Config {
    /// Minimal configuration for an RPC endpoint, everything else defaulted.
    pub fn new(rpc_endpoint: impl Into<String>) -> Self {
        Self {
            rpc_endpoint: rpc_endpoint.into(),
            registry_address: None,
            private_key: None,
            debug: false,
            ipfs_url: default_ipfs_url(),
            lighthouse_url: default_lighthouse_url(),
            timeouts: TimeoutsConfig::default(),
        }
    }

    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    pub fn with_registry(mut self, registry: Address) -> Self {
        self.registry_address = Some(registry);
        self
    }

    /// Load configuration from `SNET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let rpc_endpoint = env::var("SNET_RPC_ENDPOINT")
            .map_err(|_| SdkError::Config("SNET_RPC_ENDPOINT is required".to_string()))?;

        let registry_address = match env::var("SNET_REGISTRY_ADDRESS") {
            Ok(s) if !s.is_empty() => Some(
                s.parse::<Address>()
                    .map_err(|e| SdkError::Config(format!("invalid SNET_REGISTRY_ADDRESS: {e}")))?,
            ),
            _ => None,
        };

        let private_key = env::var("SNET_PRIVATE_KEY").ok().filter(|s| !s.is_empty());
        let debug = env::var("SNET_DEBUG")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let ipfs_url = env::var("SNET_IPFS_URL").unwrap_or_else(|_| default_ipfs_url());
        let lighthouse_url =
            env::var("SNET_LIGHTHOUSE_URL").unwrap_or_else(|_| default_lighthouse_url());

        let secs = |name: &str| -> Option<u64> {
            env::var(format!("SNET_TIMEOUT_{name}_SECS"))
                .ok()
                .and_then(|s| s.parse().ok())
        };
        let timeouts = TimeoutsConfig {
            dial: secs("DIAL"),
            rpc_unary: secs("RPC_UNARY"),
            rpc_stream: secs("RPC_STREAM"),
            chain_read: secs("CHAIN_READ"),
            chain_submit: secs("CHAIN_SUBMIT"),
            receipt_wait: secs("RECEIPT_WAIT"),
            strategy_refresh: secs("STRATEGY_REFRESH"),
            payment_ensure: secs("PAYMENT_ENSURE"),
        };

        let config = Self {
            rpc_endpoint,
            registry_address,
            private_key,
            debug,
            ipfs_url,
            lighthouse_url,
            timeouts,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_endpoint.trim().is_empty() {
            return Err(SdkError::Config("rpc endpoint must not be empty".to_string()));
        }
        if let Some(ref key) = self.private_key {
            parse_private_key(key)?;
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from_config(&self.timeouts)
    }

    /// Signer derived from the configured key, if any.
    pub fn signer(&self) -> Result<Option<PrivateKeySigner>> {
        self.private_key.as_deref().map(parse_private_key).transpose()
    }

    pub fn is_websocket(&self) -> bool {
        is_websocket_endpoint(&self.rpc_endpoint)
    }
}

pub fn is_websocket_endpoint(endpoint: &str) -> bool {
    let lower = endpoint.trim().to_ascii_lowercase();
    lower.starts_with("ws://") || lower.starts_with("wss://")
}

/// Escrow and prepaid strategies listen for contract events and therefore
/// need a websocket RPC endpoint.
pub fn require_websocket(endpoint: &str) -> Result<()> {
    if is_websocket_endpoint(endpoint) {
        Ok(())
    } else {
        Err(SdkError::NeedsWebSocket(endpoint.to_string()))
    }
}

/// Parse a hex private key: exactly 64 hex characters after an optional `0x`.
pub fn parse_private_key(key: &str) -> Result<PrivateKeySigner> {
    let hex = key.trim();
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    if hex.len() != 64 {
        return Err(SdkError::Config(format!(
            "private key must be 64 hex characters, got {}",
            hex.len()
        )));
    }
    hex.parse::<PrivateKeySigner>()
        .map_err(|e| SdkError::Config(format!("invalid private key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_timeout_defaults() {
        let t = Timeouts::default();
        assert_eq!(t.dial, Duration::from_secs(15));
        assert_eq!(t.rpc_unary, Duration::from_secs(15));
        assert_eq!(t.chain_read, Duration::from_secs(13));
        assert_eq!(t.chain_submit, Duration::from_secs(25));
        assert_eq!(t.receipt_wait, Duration::from_secs(90));
        assert_eq!(t.strategy_refresh, Duration::from_secs(15));
        assert_eq!(t.payment_operation, Duration::from_secs(60));
    }

    #[test]
    fn test_payment_operation_precedence() {
        let only_refresh = TimeoutsConfig {
            strategy_refresh: Some(30),
            ..Default::default()
        };
        assert_eq!(
            Timeouts::from_config(&only_refresh).payment_operation,
            Duration::from_secs(30)
        );

        let both = TimeoutsConfig {
            strategy_refresh: Some(30),
            payment_ensure: Some(200),
            ..Default::default()
        };
        assert_eq!(
            Timeouts::from_config(&both).payment_operation,
            Duration::from_secs(200)
        );
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        assert!(matches!(
            Config::new("  ").validate(),
            Err(SdkError::Config(_))
        ));
    }

    #[test]
    fn test_private_key_length() {
        assert!(parse_private_key(KEY).is_ok());
        assert!(parse_private_key(KEY.trim_start_matches("0x")).is_ok());
        assert!(matches!(
            parse_private_key("0xabcdef"),
            Err(SdkError::Config(_))
        ));
        let cfg = Config::new("wss://node").with_private_key("1234");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_websocket_guard() {
        assert!(matches!(
            require_websocket("https://mainnet.infura.io/v3/x"),
            Err(SdkError::NeedsWebSocket(_))
        ));
        assert!(require_websocket("wss://mainnet.infura.io/ws/v3/x").is_ok());
        assert!(require_websocket("ws://localhost:8546").is_ok());
        assert!(!Config::new("http://localhost:8545").is_websocket());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let cfg = Config::new("wss://node").with_private_key(KEY);
        let out = format!("{cfg:?}");
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("ac0974"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"rpc_endpoint":"wss://node","timeouts":{"dial":3}}"#,
        )
        .unwrap();
        assert_eq!(cfg.ipfs_url, DEFAULT_IPFS_URL);
        assert_eq!(cfg.timeouts().dial, Duration::from_secs(3));
        assert_eq!(cfg.timeouts().rpc_unary, Duration::from_secs(15));
    }
}
