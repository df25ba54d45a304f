//! Content-addressed storage for metadata documents and schema archives.
//!
//! URIs take the form `ipfs://<cid>`, `filecoin://<cid>` or a bare CID.
//! The hash part is sanitized aggressively (everything outside
//! `[A-Za-z0-9=]` is removed) to match what publishers have historically
//! written to the Registry. This can corrupt multibase CIDs that use other
//! characters; the behavior is kept for compatibility with the daemon.

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::{Result, SdkError};

const IPFS_SCHEME: &str = "ipfs://";

/// Multihash code for sha2-256.
const SHA2_256: u64 = 0x12;
/// Multicodec for raw bytes. UnixFS (dag-pb) CIDs hash the encoded node,
/// not the file content.
const RAW: u64 = 0x55;

/// Where a URI's content lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Ipfs,
    Filecoin,
}

/// Strip the scheme and every character outside `[A-Za-z0-9=]`.
pub fn format_hash(uri: &str) -> String {
    let trimmed = uri.trim();
    let rest = trimmed.split_once("://").map_or(trimmed, |(_, hash)| hash);
    rest.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '=')
        .collect()
}

/// IPFS for a bare hash or `ipfs://`, the Filecoin gateway for any other scheme.
pub fn storage_kind(uri: &str) -> StorageKind {
    let trimmed = uri.trim();
    if trimmed.starts_with(IPFS_SCHEME) || !trimmed.contains("://") {
        StorageKind::Ipfs
    } else {
        StorageKind::Filecoin
    }
}

/// Outcome of comparing fetched bytes against their CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidCheck {
    Match,
    Mismatch,
    /// The CID could not be parsed or uses a hash we do not compute.
    Unverifiable,
}

/// Compare `content` against the sha2-256 digest carried by `hash`.
pub fn verify_cid(hash: &str, content: &[u8]) -> CidCheck {
    let Ok(cid) = cid::Cid::try_from(hash) else {
        return CidCheck::Unverifiable;
    };
    let mh = cid.hash();
    if cid.codec() != RAW || mh.code() != SHA2_256 {
        return CidCheck::Unverifiable;
    }
    if mh.digest() == Sha256::digest(content).as_slice() {
        CidCheck::Match
    } else {
        CidCheck::Mismatch
    }
}

/// Fetches documents from IPFS or the Filecoin HTTP gateway.
#[derive(Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    ipfs_url: String,
    lighthouse_url: String,
    timeout: Duration,
}

impl StorageClient {
    pub fn new(ipfs_url: &str, lighthouse_url: &str, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            ipfs_url: ipfs_url.trim_end_matches('/').to_string(),
            lighthouse_url: lighthouse_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Fetch the content behind `uri`.
    pub async fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        let hash = format_hash(uri);
        if hash.is_empty() {
            return Err(SdkError::Storage(format!("empty content hash in {uri:?}")));
        }
        match storage_kind(uri) {
            StorageKind::Ipfs => self.fetch_ipfs(&hash).await,
            StorageKind::Filecoin => self.fetch_filecoin(&hash).await,
        }
    }

    async fn fetch_ipfs(&self, hash: &str) -> Result<Vec<u8>> {
        let url = format!("{}/api/v0/cat", self.ipfs_url);
        let resp = self
            .http
            .post(&url)
            .query(&[("arg", hash)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SdkError::Storage(format!("ipfs cat {hash} failed: {e}")))?;
        let content = read_body(resp, hash).await?;

        match verify_cid(hash, &content) {
            CidCheck::Match => {}
            CidCheck::Mismatch => {
                tracing::warn!(cid = %hash, "fetched content does not match its CID")
            }
            CidCheck::Unverifiable => tracing::debug!(cid = %hash, "CID not verifiable"),
        }
        Ok(content)
    }

    async fn fetch_filecoin(&self, hash: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.lighthouse_url, hash);
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SdkError::Storage(format!("filecoin fetch {hash} failed: {e}")))?;
        read_body(resp, hash).await
    }
}

async fn read_body(resp: reqwest::Response, hash: &str) -> Result<Vec<u8>> {
    let status = resp.status();
    if !status.is_success() {
        return Err(SdkError::Storage(format!(
            "fetching {hash} returned HTTP {status}"
        )));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| SdkError::Storage(format!("reading {hash} failed: {e}")))?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hash_strips_schemes_and_symbols() {
        assert_eq!(format_hash("ipfs://QmAbc123"), "QmAbc123");
        assert_eq!(format_hash("filecoin://bafy-abc/def"), "bafyabcdef");
        assert_eq!(format_hash("  Qm=x_y.z\0\0"), "Qm=xyz");
        assert_eq!(format_hash("ar://abc"), "abc");
    }

    #[test]
    fn test_storage_kind_dispatch() {
        assert_eq!(storage_kind("ipfs://Qm1"), StorageKind::Ipfs);
        assert_eq!(storage_kind("Qm1"), StorageKind::Ipfs);
        assert_eq!(storage_kind("filecoin://bafy"), StorageKind::Filecoin);
    }

    #[test]
    fn test_unknown_scheme_goes_to_filecoin() {
        assert_eq!(storage_kind("ar://abc"), StorageKind::Filecoin);
        assert_eq!(storage_kind("https://gateway.example/bafy"), StorageKind::Filecoin);
        assert_eq!(storage_kind("  ipfs://Qm1"), StorageKind::Ipfs);
    }

    #[test]
    fn test_verify_cid_raw_sha256() {
        let content = b"hello world";
        let digest = Sha256::digest(content);
        let mh = cid::multihash::Multihash::<64>::wrap(SHA2_256, &digest).unwrap();
        let cid = cid::Cid::new_v1(RAW, mh).to_string();

        assert_eq!(verify_cid(&cid, content), CidCheck::Match);
        assert_eq!(verify_cid(&cid, b"tampered"), CidCheck::Mismatch);
    }

    #[test]
    fn test_verify_cid_unparseable() {
        assert_eq!(verify_cid("not-a-cid", b"x"), CidCheck::Unverifiable);
    }
}
