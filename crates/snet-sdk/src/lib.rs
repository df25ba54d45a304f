//! Client engine for SingularityNET AI services.
//!
//! Discovers a service through the on-chain Registry and decentralized
//! storage, compiles the service's protobuf schema at runtime and invokes any
//! method dynamically. Each call is authorized by one of three payment
//! strategies:
//!
//! - **Free call** ([`FreeCallStrategy`]): daemon-issued token, no chain access
//! - **Escrow** ([`EscrowStrategy`]): per-call signed claims against a
//!   MultiPartyEscrow payment channel
//! - **Prepaid** ([`PrepaidStrategy`]): a daemon token pre-authorizing a
//!   batch of calls against a funded channel
//!
//! # Quick example
//!
//! ```no_run
//! use snet_sdk::{Config, Sdk};
//!
//! # #[tokio::main]
//! # async fn main() -> snet_sdk::Result<()> {
//! let config = Config::new("wss://sepolia.infura.io/ws/v3/KEY").with_private_key("0xYOUR_KEY");
//! let sdk = Sdk::new(config).await?;
//! let client = sdk.service_client("snet", "example-service", "default_group").await?;
//!
//! let reply = client.call_with_json("add", br#"{"a": 1, "b": 2}"#).await?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod error;

// Identities, signing and configuration
pub mod config;
pub mod signing;

// Chain access
pub mod chain;
pub mod registry;
pub mod token;

// Service discovery and dynamic invocation
pub mod bundle;
pub mod metadata;
pub mod rpc;
pub mod schema;
pub mod storage;

// Payments
pub mod channel;
pub mod daemon;
pub mod strategy;

// Facade and auxiliary clients
pub mod health;
pub mod sdk;
pub mod service;
pub mod training;

use alloy::sol;

// Service registry. Identifiers are bytes32, right-padded with zeros.
sol! {
    #[sol(rpc)]
    interface Registry {
        function listOrganizations() external view returns (bytes32[] orgIds);
        function getOrganizationById(bytes32 orgId) external view returns (
            bool found,
            bytes32 id,
            bytes orgMetadataURI,
            address owner,
            address[] members,
            bytes32[] serviceIds
        );
        function getServiceRegistrationById(bytes32 orgId, bytes32 serviceId) external view returns (
            bool found,
            bytes32 id,
            bytes metadataURI
        );
        function listServicesForOrganization(bytes32 orgId) external view returns (
            bool found,
            bytes32[] serviceIds
        );
        function updateServiceRegistration(bytes32 orgId, bytes32 serviceId, bytes metadataURI) external;
        function deleteServiceRegistration(bytes32 orgId, bytes32 serviceId) external;
    }
}

// MultiPartyEscrow payment channels.
sol! {
    #[sol(rpc)]
    interface MultiPartyEscrow {
        event ChannelOpen(
            uint256 channelId,
            uint256 nonce,
            address indexed sender,
            address signer,
            address indexed recipient,
            bytes32 indexed groupId,
            uint256 amount,
            uint256 expiration
        );
        event ChannelExtend(uint256 indexed channelId, uint256 newExpiration);
        event ChannelAddFunds(uint256 indexed channelId, uint256 additionalFunds);
        event DepositFunds(address indexed sender, uint256 amount);

        function token() external view returns (address);
        function balances(address owner) external view returns (uint256);
        function channels(uint256 channelId) external view returns (
            uint256 nonce,
            address sender,
            address signer,
            address recipient,
            bytes32 groupId,
            uint256 value,
            uint256 expiration
        );
        function deposit(uint256 value) external returns (bool);
        function openChannel(address signer, address recipient, bytes32 groupId, uint256 value, uint256 expiration) external returns (bool);
        function depositAndOpenChannel(address signer, address recipient, bytes32 groupId, uint256 value, uint256 expiration) external returns (bool);
        function channelAddFunds(uint256 channelId, uint256 amount) external returns (bool);
        function channelExtend(uint256 channelId, uint256 newExpiration) external returns (bool);
        function channelExtendAndAddFunds(uint256 channelId, uint256 newExpiration, uint256 amount) external returns (bool);
    }
}

// ERC-20 token used to fund the escrow.
sol! {
    #[sol(rpc)]
    interface ERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 value) external returns (bool);
    }
}

// Re-exports
pub use config::{Config, Timeouts};
pub use constants::Network;
pub use error::{Result, SdkError};
pub use sdk::Sdk;
pub use service::ServiceClient;
pub use strategy::escrow::EscrowStrategy;
pub use strategy::free_call::FreeCallStrategy;
pub use strategy::prepaid::PrepaidStrategy;
pub use strategy::{PaymentHeaders, PaymentStrategy, StrategyKind};
