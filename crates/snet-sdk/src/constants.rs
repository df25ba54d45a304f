use alloy::primitives::{address, Address};

/// Ethereum mainnet chain ID.
pub const MAINNET_CHAIN_ID: u64 = 1;

/// Sepolia testnet chain ID.
pub const SEPOLIA_CHAIN_ID: u64 = 11155111;

/// Registry contract on Ethereum mainnet.
pub const MAINNET_REGISTRY: Address = address!("247DEbEBB766E4fA99667265A158060018D5f4F8");

/// Registry contract on Sepolia.
pub const SEPOLIA_REGISTRY: Address = address!("4DCc70c6FCE4064803f0ae0cE48497B3f7182e5D");

/// Default IPFS API endpoint for metadata and schema archives.
pub const DEFAULT_IPFS_URL: &str = "https://ipfs.singularitynet.io:443";

/// Default Filecoin (Lighthouse) HTTP gateway.
pub const DEFAULT_LIGHTHOUSE_URL: &str = "https://gateway.lighthouse.storage/ipfs";

/// Blocks added on top of the group's expiration threshold when opening or
/// extending a channel, so the channel is not opened at the edge of its
/// minimum validity window.
pub const EXPIRATION_BUFFER_BLOCKS: u64 = 240;

// Signing prefixes. Embedded verbatim as ASCII at the start of each payload.
pub const CLAIM_PREFIX: &str = "__MPE_claim_message";
pub const FREE_CALL_PREFIX: &str = "__prefix_free_trial";
pub const CHANNEL_STATE_PREFIX: &str = "__get_channel_state";

// Outgoing gRPC metadata.
pub const HEADER_PAYMENT_TYPE: &str = "snet-payment-type";
pub const HEADER_CHANNEL_ID: &str = "snet-payment-channel-id";
pub const HEADER_CHANNEL_NONCE: &str = "snet-payment-channel-nonce";
pub const HEADER_CHANNEL_AMOUNT: &str = "snet-payment-channel-amount";
pub const HEADER_CHANNEL_SIGNATURE: &str = "snet-payment-channel-signature-bin";
pub const HEADER_FREE_CALL_TOKEN: &str = "snet-free-call-auth-token-bin";
pub const HEADER_FREE_CALL_USER_ADDRESS: &str = "snet-free-call-user-address";
pub const HEADER_CURRENT_BLOCK: &str = "snet-current-block-number";
pub const HEADER_PREPAID_TOKEN: &str = "snet-prepaid-auth-token-bin";

pub const PAYMENT_TYPE_FREE_CALL: &str = "free-call";
pub const PAYMENT_TYPE_ESCROW: &str = "escrow";
pub const PAYMENT_TYPE_PREPAID: &str = "prepaid-call";

/// Extension of service-definition files kept from a schema archive.
pub const PROTO_EXTENSION: &str = ".proto";

/// Default training pagination.
pub const DEFAULT_PAGE_SIZE: u64 = 100;
pub const DEFAULT_PAGE: u64 = 0;

/// Network descriptor for an engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub chain_id: String,
    pub name: String,
}

impl Network {
    /// Describe a chain by its numeric id.
    pub fn from_chain_id(chain_id: u64) -> Self {
        let name = match chain_id {
            MAINNET_CHAIN_ID => "mainnet",
            SEPOLIA_CHAIN_ID => "sepolia",
            _ => "unknown",
        };
        Self {
            chain_id: chain_id.to_string(),
            name: name.to_string(),
        }
    }

    /// Registry address deployed on this network, if one is known.
    pub fn default_registry(&self) -> Option<Address> {
        match self.chain_id.parse::<u64>().ok()? {
            MAINNET_CHAIN_ID => Some(MAINNET_REGISTRY),
            SEPOLIA_CHAIN_ID => Some(SEPOLIA_REGISTRY),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_networks() {
        let mainnet = Network::from_chain_id(1);
        assert_eq!(mainnet.name, "mainnet");
        assert_eq!(mainnet.default_registry(), Some(MAINNET_REGISTRY));

        let sepolia = Network::from_chain_id(SEPOLIA_CHAIN_ID);
        assert_eq!(sepolia.chain_id, "11155111");
        assert_eq!(sepolia.default_registry(), Some(SEPOLIA_REGISTRY));
    }

    #[test]
    fn test_unknown_network_has_no_registry() {
        let net = Network::from_chain_id(31337);
        assert_eq!(net.name, "unknown");
        assert!(net.default_registry().is_none());
    }
}
