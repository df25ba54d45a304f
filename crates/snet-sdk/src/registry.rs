//! Lookups against the on-chain service Registry.

use alloy::primitives::{Address, TxHash, B256};
use alloy::providers::DynProvider;

use crate::chain::{self, wait_for_receipt};
use crate::{Registry, Result, SdkError, Timeouts};

/// Right-pad an identifier with zeros into 32 bytes. Inputs longer than 32
/// bytes are truncated.
pub fn string_to_bytes32(s: &str) -> B256 {
    let mut out = [0u8; 32];
    let bytes = s.as_bytes();
    let len = bytes.len().min(32);
    out[..len].copy_from_slice(&bytes[..len]);
    B256::from(out)
}

/// Reverse of [`string_to_bytes32`]: trailing NUL bytes are trimmed.
pub fn bytes32_to_string(b: &B256) -> String {
    let bytes = b.as_slice();
    let end = bytes.iter().rposition(|c| *c != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Metadata URIs are stored as raw bytes, possibly NUL-padded.
fn uri_from_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// An organization's registry entry.
#[derive(Debug, Clone)]
pub struct OrganizationRecord {
    pub org_id: String,
    pub metadata_uri: String,
    pub owner: Address,
    pub members: Vec<Address>,
    pub service_ids: Vec<String>,
}

/// Read/write access to the Registry contract.
#[derive(Clone)]
pub struct RegistryClient {
    provider: DynProvider,
    address: Address,
    timeouts: Timeouts,
}

impl RegistryClient {
    pub fn new(provider: DynProvider, address: Address, timeouts: Timeouts) -> Self {
        Self {
            provider,
            address,
            timeouts,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    fn contract(&self) -> Registry::RegistryInstance<&DynProvider> {
        Registry::new(self.address, &self.provider)
    }

    pub async fn list_organizations(&self) -> Result<Vec<String>> {
        let contract = self.contract();
        let ids = chain::read(
            self.timeouts.chain_read,
            "listOrganizations",
            contract.listOrganizations().call(),
        )
        .await?;
        Ok(ids.iter().map(bytes32_to_string).collect())
    }

    pub async fn get_organization(&self, org_id: &str) -> Result<OrganizationRecord> {
        let contract = self.contract();
        let org = chain::read(
            self.timeouts.chain_read,
            "getOrganizationById",
            contract.getOrganizationById(string_to_bytes32(org_id)).call(),
        )
        .await?;
        if !org.found {
            return Err(SdkError::NotFound(format!("organization {org_id}")));
        }
        Ok(OrganizationRecord {
            org_id: org_id.to_string(),
            metadata_uri: uri_from_bytes(&org.orgMetadataURI),
            owner: org.owner,
            members: org.members,
            service_ids: org.serviceIds.iter().map(bytes32_to_string).collect(),
        })
    }

    /// Metadata URI of a registered service.
    pub async fn get_service_metadata_uri(&self, org_id: &str, service_id: &str) -> Result<String> {
        let contract = self.contract();
        let svc = chain::read(
            self.timeouts.chain_read,
            "getServiceRegistrationById",
            contract
                .getServiceRegistrationById(string_to_bytes32(org_id), string_to_bytes32(service_id))
                .call(),
        )
        .await?;
        if !svc.found {
            return Err(SdkError::NotFound(format!("service {org_id}/{service_id}")));
        }
        Ok(uri_from_bytes(&svc.metadataURI))
    }

    pub async fn list_services(&self, org_id: &str) -> Result<Vec<String>> {
        let contract = self.contract();
        let res = chain::read(
            self.timeouts.chain_read,
            "listServicesForOrganization",
            contract
                .listServicesForOrganization(string_to_bytes32(org_id))
                .call(),
        )
        .await?;
        if !res.found {
            return Err(SdkError::NotFound(format!("organization {org_id}")));
        }
        Ok(res.serviceIds.iter().map(bytes32_to_string).collect())
    }

    /// Point a service registration at new metadata. Requires the
    /// organization owner's or a member's key.
    pub async fn update_service_registration(
        &self,
        org_id: &str,
        service_id: &str,
        metadata_uri: &str,
    ) -> Result<TxHash> {
        let contract = self.contract();
        let call = contract.updateServiceRegistration(
            string_to_bytes32(org_id),
            string_to_bytes32(service_id),
            metadata_uri.as_bytes().to_vec().into(),
        );
        let pending =
            chain::submit(self.timeouts.chain_submit, "updateServiceRegistration", call.send())
                .await?;
        let receipt =
            wait_for_receipt(&self.provider, *pending.tx_hash(), self.timeouts.receipt_wait)
                .await?;
        tracing::info!(org_id, service_id, tx = %receipt.transaction_hash, "service metadata updated");
        Ok(receipt.transaction_hash)
    }

    pub async fn delete_service_registration(&self, org_id: &str, service_id: &str) -> Result<TxHash> {
        let contract = self.contract();
        let call = contract
            .deleteServiceRegistration(string_to_bytes32(org_id), string_to_bytes32(service_id));
        let pending =
            chain::submit(self.timeouts.chain_submit, "deleteServiceRegistration", call.send())
                .await?;
        let receipt =
            wait_for_receipt(&self.provider, *pending.tx_hash(), self.timeouts.receipt_wait)
                .await?;
        tracing::info!(org_id, service_id, tx = %receipt.transaction_hash, "service deleted");
        Ok(receipt.transaction_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_bytes32_right_pads() {
        let b = string_to_bytes32("snet");
        assert_eq!(&b[..4], b"snet");
        assert!(b[4..].iter().all(|c| *c == 0));
    }

    #[test]
    fn test_bytes32_roundtrip_up_to_32_bytes() {
        for s in ["", "a", "example-service", &"x".repeat(32)] {
            assert_eq!(bytes32_to_string(&string_to_bytes32(s)), s);
        }
    }

    #[test]
    fn test_string_to_bytes32_is_lossy_above_32() {
        let long = "y".repeat(40);
        assert_eq!(bytes32_to_string(&string_to_bytes32(&long)), "y".repeat(32));
    }

    #[test]
    fn test_uri_from_bytes_trims_nul_padding() {
        assert_eq!(uri_from_bytes(b"ipfs://Qm123\0\0\0"), "ipfs://Qm123");
    }
}
