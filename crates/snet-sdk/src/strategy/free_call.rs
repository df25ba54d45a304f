use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{PaymentHeaders, PaymentStrategy, StrategyKind};
use crate::chain::BlockSource;
use crate::constants::{
    HEADER_CHANNEL_SIGNATURE, HEADER_CURRENT_BLOCK, HEADER_FREE_CALL_TOKEN,
    HEADER_FREE_CALL_USER_ADDRESS, PAYMENT_TYPE_FREE_CALL,
};
use crate::daemon::{FreeCallStateRequest, FreeCallToken, GetFreeCallTokenRequest, PaymentStateService};
use crate::signing::{free_call_message, free_call_token_request_message, sign_payload};
use crate::Result;

/// Identifies the service a free-call token is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeCallScope {
    pub org_id: String,
    pub service_id: String,
    /// Base64 group id, embedded as-is in signed payloads.
    pub group_id: String,
}

/// Uses the caller's free-call allowance; no chain writes.
pub struct FreeCallStrategy {
    scope: FreeCallScope,
    signer: PrivateKeySigner,
    address: String,
    blocks: Arc<dyn BlockSource>,
    daemon: Arc<dyn PaymentStateService>,
    token_lifetime_blocks: Option<u64>,
    token: Mutex<Option<FreeCallToken>>,
}

impl FreeCallStrategy {
    pub fn new(
        scope: FreeCallScope,
        signer: PrivateKeySigner,
        blocks: Arc<dyn BlockSource>,
        daemon: Arc<dyn PaymentStateService>,
    ) -> Self {
        let address = signer.address().to_checksum(None);
        Self {
            scope,
            signer,
            address,
            blocks,
            daemon,
            token_lifetime_blocks: None,
            token: Mutex::new(None),
        }
    }

    /// Ask the daemon for tokens valid for `blocks` blocks.
    pub fn with_token_lifetime(mut self, blocks: u64) -> Self {
        self.token_lifetime_blocks = Some(blocks);
        self
    }

    /// `0x`-prefixed checksummed address of the caller.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current token, requesting a new one when absent or expired at `block`.
    async fn token_at(&self, block: u64) -> Result<FreeCallToken> {
        let mut token = self.token.lock().await;
        if let Some(ref t) = *token {
            if t.token_expiration_block == 0 || t.token_expiration_block > block {
                return Ok(t.clone());
            }
            tracing::debug!(expired_at = t.token_expiration_block, block, "free-call token expired");
        }

        let message = free_call_token_request_message(
            &self.address,
            &self.scope.org_id,
            &self.scope.service_id,
            &self.scope.group_id,
            block,
        );
        let signature = sign_payload(&self.signer, &message)?;
        let issued = self
            .daemon
            .free_call_token(GetFreeCallTokenRequest {
                address: self.address.clone(),
                signature: signature.to_vec(),
                current_block: block,
                token_lifetime_in_blocks: self.token_lifetime_blocks,
            })
            .await?;
        tracing::info!(expires_at = issued.token_expiration_block, "free-call token issued");
        *token = Some(issued.clone());
        Ok(issued)
    }

    fn invocation_signature(&self, block: u64, token: &[u8]) -> Result<[u8; 65]> {
        let message = free_call_message(
            &self.address,
            &self.scope.org_id,
            &self.scope.service_id,
            &self.scope.group_id,
            block,
            token,
        );
        sign_payload(&self.signer, &message)
    }
}

impl std::fmt::Debug for FreeCallStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeCallStrategy")
            .field("scope", &self.scope)
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl PaymentStrategy for FreeCallStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FreeCall
    }

    async fn refresh(&self) -> Result<()> {
        let block = self.blocks.head_block().await?;
        self.token_at(block).await.map(|_| ())
    }

    async fn headers_for(&self) -> Result<PaymentHeaders> {
        let block = self.blocks.head_block().await?;
        let token = self.token_at(block).await?;
        let signature = self.invocation_signature(block, &token.token)?;
        Ok(PaymentHeaders::new(PAYMENT_TYPE_FREE_CALL)
            .binary(HEADER_FREE_CALL_TOKEN, token.token)
            .ascii(HEADER_FREE_CALL_USER_ADDRESS, self.address.clone())
            .binary(HEADER_CHANNEL_SIGNATURE, signature.to_vec())
            .ascii(HEADER_CURRENT_BLOCK, block.to_string()))
    }

    async fn free_calls_available(&self) -> Result<u64> {
        let block = self.blocks.head_block().await?;
        let token = self.token_at(block).await?;
        let signature = self.invocation_signature(block, &token.token)?;
        self.daemon
            .free_calls_available(FreeCallStateRequest {
                address: self.address.clone(),
                token_for_free_call: token.token,
                token_expiry_date_block: token.token_expiration_block,
                signature: signature.to_vec(),
                current_block: block,
            })
            .await
    }
}
