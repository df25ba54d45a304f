//! Canonical signing payloads and personal-sign signatures.
//!
//! Every payload is a plain concatenation of byte fields with no length
//! prefixes or separators. Payloads are hashed with keccak256 and wrapped in
//! the EIP-191 envelope (`"\x19Ethereum Signed Message:\n32" ∥ keccak256(payload)`)
//! before signing. Signatures are 65 bytes `R ∥ S ∥ V` with `V ∈ {27, 28}`.
//!
//! Addresses are embedded as 20 raw bytes, except in the free-call payloads
//! where the daemon expects the `0x`-prefixed hex string as ASCII.

use alloy::primitives::{keccak256, Address, Signature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

use crate::constants::{CHANNEL_STATE_PREFIX, CLAIM_PREFIX, FREE_CALL_PREFIX};
use crate::{Result, SdkError};

const PERSONAL_SIGN_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// 32-byte big-endian encoding, zero-padded on the left.
pub fn u256_be(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

/// Inverse of [`u256_be`]. Shorter inputs are treated as left-padded.
pub fn u256_from_be(bytes: &[u8]) -> Result<U256> {
    if bytes.len() > 32 {
        return Err(SdkError::Marshal(format!(
            "big-endian integer is {} bytes, at most 32 allowed",
            bytes.len()
        )));
    }
    Ok(U256::from_be_slice(bytes))
}

/// `keccak256("\x19Ethereum Signed Message:\n32" ∥ keccak256(payload))`
pub fn personal_hash(payload: &[u8]) -> B256 {
    let inner = keccak256(payload);
    let mut envelope = Vec::with_capacity(PERSONAL_SIGN_PREFIX.len() + 32);
    envelope.extend_from_slice(PERSONAL_SIGN_PREFIX);
    envelope.extend_from_slice(inner.as_slice());
    keccak256(envelope)
}

/// Sign a payload and return the 65-byte compact signature.
pub fn sign_payload(signer: &PrivateKeySigner, payload: &[u8]) -> Result<[u8; 65]> {
    let hash = personal_hash(payload);
    let sig = signer
        .sign_hash_sync(&hash)
        .map_err(|e| SdkError::Sign(format!("signing failed: {e}")))?;
    Ok(sig.as_bytes())
}

/// Same as [`sign_payload`], for callers that may not hold a key.
pub fn sign_with(signer: Option<&PrivateKeySigner>, payload: &[u8]) -> Result<[u8; 65]> {
    let signer = signer.ok_or_else(|| SdkError::Sign("no signing key configured".to_string()))?;
    sign_payload(signer, payload)
}

/// Recover the address that produced `signature` over `payload`.
pub fn recover_signer(payload: &[u8], signature: &[u8]) -> Result<Address> {
    if signature.len() != 65 {
        return Err(SdkError::Sign(format!(
            "signature must be 65 bytes, got {}",
            signature.len()
        )));
    }
    let sig = Signature::from_raw(signature)
        .map_err(|e| SdkError::Sign(format!("invalid signature: {e}")))?;
    sig.recover_address_from_prehash(&personal_hash(payload))
        .map_err(|e| SdkError::Sign(format!("recovery failed: {e}")))
}

/// `"__MPE_claim_message" ∥ mpe ∥ channel_id ∥ nonce ∥ signed_amount`
pub fn claim_message(mpe: Address, channel_id: U256, nonce: U256, signed_amount: U256) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CLAIM_PREFIX.len() + 20 + 96);
    msg.extend_from_slice(CLAIM_PREFIX.as_bytes());
    msg.extend_from_slice(mpe.as_slice());
    msg.extend_from_slice(&u256_be(channel_id));
    msg.extend_from_slice(&u256_be(nonce));
    msg.extend_from_slice(&u256_be(signed_amount));
    msg
}

/// `"__prefix_free_trial" ∥ signer_hex ∥ org_id ∥ service_id ∥ group_id ∥ block`
///
/// `signer_hex` is the `0x`-prefixed address string and is embedded as ASCII.
pub fn free_call_token_request_message(
    signer_hex: &str,
    org_id: &str,
    service_id: &str,
    group_id: &str,
    block: u64,
) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(FREE_CALL_PREFIX.as_bytes());
    msg.extend_from_slice(signer_hex.as_bytes());
    msg.extend_from_slice(org_id.as_bytes());
    msg.extend_from_slice(service_id.as_bytes());
    msg.extend_from_slice(group_id.as_bytes());
    msg.extend_from_slice(&u256_be(U256::from(block)));
    msg
}

/// The token-request payload followed by the free-call token bytes.
pub fn free_call_message(
    signer_hex: &str,
    org_id: &str,
    service_id: &str,
    group_id: &str,
    block: u64,
    token: &[u8],
) -> Vec<u8> {
    let mut msg = free_call_token_request_message(signer_hex, org_id, service_id, group_id, block);
    msg.extend_from_slice(token);
    msg
}

/// `method_name ∥ signer ∥ block`
pub fn training_message(method_name: &str, signer: Address, block: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(method_name.len() + 52);
    msg.extend_from_slice(method_name.as_bytes());
    msg.extend_from_slice(signer.as_slice());
    msg.extend_from_slice(&u256_be(U256::from(block)));
    msg
}

/// `"__get_channel_state" ∥ mpe ∥ channel_id ∥ block`
pub fn channel_state_message(mpe: Address, channel_id: U256, block: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CHANNEL_STATE_PREFIX.len() + 84);
    msg.extend_from_slice(CHANNEL_STATE_PREFIX.as_bytes());
    msg.extend_from_slice(mpe.as_slice());
    msg.extend_from_slice(&u256_be(channel_id));
    msg.extend_from_slice(&u256_be(U256::from(block)));
    msg
}

/// `claim_signature ∥ block`, signed when asking the daemon for a prepaid token.
pub fn prepaid_token_message(claim_signature: &[u8], block: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(claim_signature.len() + 32);
    msg.extend_from_slice(claim_signature);
    msg.extend_from_slice(&u256_be(U256::from(block)));
    msg
}
