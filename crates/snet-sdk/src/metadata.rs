//! Organization and service metadata documents.

use alloy::primitives::{Address, B256, U256};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{Result, SdkError};

/// Decode a base64 group id into its 32-byte form.
pub fn group_id_from_b64(s: &str) -> Result<B256> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| SdkError::Config(format!("invalid group id {s:?}: {e}")))?;
    if bytes.len() != 32 {
        return Err(SdkError::Config(format!(
            "group id must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(&bytes))
}

pub fn group_id_to_b64(id: &B256) -> String {
    base64::engine::general_purpose::STANDARD.encode(id.as_slice())
}

/// Organization metadata as published to content storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationMetadata {
    pub org_id: String,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub groups: Vec<OrganizationGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationGroup {
    pub group_name: String,
    pub group_id: String,
    pub payment: Payment,
    /// Licensing terms; carried through but not interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licenses: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub payment_address: Address,
    pub payment_expiration_threshold: u64,
    #[serde(default)]
    pub payment_channel_storage_type: String,
    /// Daemon-side channel storage settings; opaque to the client.
    #[serde(default)]
    pub payment_channel_storage_client: serde_json::Value,
}

impl Payment {
    pub fn expiration_threshold(&self) -> U256 {
        U256::from(self.payment_expiration_threshold)
    }
}

impl OrganizationMetadata {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SdkError::Storage(format!("invalid organization metadata: {e}")))
    }

    pub fn group(&self, name: &str) -> Result<&OrganizationGroup> {
        self.groups
            .iter()
            .find(|g| g.group_name == name)
            .ok_or_else(|| SdkError::NotFound(format!("group {name} in organization {}", self.org_id)))
    }
}

impl OrganizationGroup {
    pub fn group_id_bytes(&self) -> Result<B256> {
        group_id_from_b64(&self.group_id)
    }
}

/// Service metadata as published to content storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetadata {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub groups: Vec<ServiceGroup>,
    /// Location of the schema archive. Older documents use `model_ipfs_hash`.
    #[serde(default, alias = "model_ipfs_hash")]
    pub service_api_source: String,
    pub mpe_address: Address,
    #[serde(default)]
    pub training_methods: Vec<String>,
}

fn default_encoding() -> String {
    "proto".to_string()
}

fn default_service_type() -> String {
    "grpc".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub group_name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub pricing: Vec<Pricing>,
    #[serde(default)]
    pub free_calls: u64,
    #[serde(default)]
    pub free_call_signer_address: Option<Address>,
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub price_model: String,
    pub price_in_cogs: u64,
    #[serde(default)]
    pub default: bool,
}

impl ServiceMetadata {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SdkError::Storage(format!("invalid service metadata: {e}")))
    }

    pub fn group(&self, name: &str) -> Result<&ServiceGroup> {
        self.groups
            .iter()
            .find(|g| g.group_name == name)
            .ok_or_else(|| SdkError::NotFound(format!("group {name} in service metadata")))
    }

    pub fn api_source_uri(&self) -> &str {
        &self.service_api_source
    }
}

impl ServiceGroup {
    /// Canonical per-call price: the first pricing entry.
    pub fn price_per_call(&self) -> Result<U256> {
        self.pricing
            .first()
            .map(|p| U256::from(p.price_in_cogs))
            .ok_or_else(|| SdkError::NotFound(format!("pricing for group {}", self.group_name)))
    }

    /// The first endpoint. Endpoints are not load balanced.
    pub fn endpoint(&self) -> Result<&str> {
        self.endpoints
            .first()
            .map(String::as_str)
            .ok_or_else(|| SdkError::NotFound(format!("endpoint for group {}", self.group_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORG: &str = r#"{
        "org_name": "SNet",
        "org_id": "snet",
        "groups": [{
            "group_name": "default_group",
            "group_id": "EoFmN3nvaXpf6ew8jJbIPVghE5NXfYupFF7PkRmVyGQ=",
            "payment": {
                "payment_address": "0x3Bb9b2499c283cec176e7C707Ecb495B7a961ebf",
                "payment_expiration_threshold": 40320,
                "payment_channel_storage_type": "etcd",
                "payment_channel_storage_client": {"connection_timeout": "5s", "endpoints": ["http://127.0.0.1:2379"]}
            }
        }]
    }"#;

    const SERVICE: &str = r#"{
        "version": 1,
        "display_name": "Example",
        "encoding": "proto",
        "service_type": "grpc",
        "model_ipfs_hash": "QmeyrQkEyba8dd4rc3jrLd5pEwsxHutfH2RvsSaeSMqTtQ",
        "mpe_address": "0x7E0aF8988DF45B824b2E0e0A87c6196897744970",
        "groups": [{
            "group_name": "default_group",
            "pricing": [{"price_model": "fixed_price", "price_in_cogs": 2, "default": true}],
            "endpoints": ["https://example.daemon:7000"],
            "free_calls": 5,
            "free_call_signer_address": "0x7DF35C98f41F3Af0df1dc4c7F7D4C19a71Dd059F"
        }]
    }"#;

    #[test]
    fn test_parse_organization_metadata() {
        let org = OrganizationMetadata::from_json(ORG.as_bytes()).unwrap();
        let group = org.group("default_group").unwrap();
        assert_eq!(group.payment.expiration_threshold(), U256::from(40320u64));
        assert_eq!(group.group_id_bytes().unwrap().len(), 32);
        assert!(matches!(org.group("missing"), Err(SdkError::NotFound(_))));
    }

    #[test]
    fn test_parse_service_metadata() {
        let svc = ServiceMetadata::from_json(SERVICE.as_bytes()).unwrap();
        assert_eq!(svc.api_source_uri(), "QmeyrQkEyba8dd4rc3jrLd5pEwsxHutfH2RvsSaeSMqTtQ");
        let group = svc.group("default_group").unwrap();
        assert_eq!(group.price_per_call().unwrap(), U256::from(2u64));
        assert_eq!(group.endpoint().unwrap(), "https://example.daemon:7000");
        assert_eq!(group.free_calls, 5);
        assert!(svc.training_methods.is_empty());
    }

    #[test]
    fn test_group_id_b64_roundtrip() {
        let id = B256::repeat_byte(0xab);
        assert_eq!(group_id_from_b64(&group_id_to_b64(&id)).unwrap(), id);
    }

    #[test]
    fn test_group_id_wrong_length() {
        assert!(group_id_from_b64("AAAA").is_err());
        assert!(group_id_from_b64("***").is_err());
    }
}
