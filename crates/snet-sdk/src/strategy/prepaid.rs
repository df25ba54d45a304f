use std::sync::Arc;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{prepare_channel, top_up_channel, ChannelSetup, PaymentHeaders, PaymentStrategy, StrategyKind};
use crate::channel::ChannelManager;
use crate::config::Timeouts;
use crate::constants::{HEADER_CHANNEL_ID, HEADER_CHANNEL_NONCE, HEADER_PREPAID_TOKEN, PAYMENT_TYPE_PREPAID};
use crate::daemon::{PaymentStateService, TokenRequest};
use crate::signing::{claim_message, prepaid_token_message, sign_payload};
use crate::{Result, SdkError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct PrepaidState {
    channel_id: U256,
    nonce: U256,
    /// Amount covered by claims the daemon has accepted.
    signed_amount: U256,
    channel_value: U256,
    token: Option<String>,
    /// Successful calls made with the current token.
    used: u64,
}

/// Pays for a batch of `count` calls up front; the daemon answers with a
/// token that authorizes them. Once the batch is spent the next call signs
/// for another `count` calls.
pub struct PrepaidStrategy {
    setup: ChannelSetup,
    signer: PrivateKeySigner,
    daemon: Arc<dyn PaymentStateService>,
    manager: ChannelManager,
    timeouts: Timeouts,
    count: u64,
    state: Mutex<PrepaidState>,
}

impl PrepaidStrategy {
    /// Ensure a channel covering `count` calls and obtain the first token.
    pub async fn new(
        setup: ChannelSetup,
        signer: PrivateKeySigner,
        manager: ChannelManager,
        daemon: Arc<dyn PaymentStateService>,
        timeouts: Timeouts,
        count: u64,
    ) -> Result<Self> {
        if count == 0 {
            return Err(SdkError::Config("prepaid call count must be positive".to_string()));
        }
        let batch = setup.price_per_call * U256::from(count);
        let position = tokio::time::timeout(
            timeouts.payment_operation,
            prepare_channel(&manager, daemon.as_ref(), &signer, &setup, batch),
        )
        .await
        .map_err(|_| SdkError::WaitTimeout {
            event: "prepaid channel setup",
        })??;

        let strategy = Self {
            setup,
            signer,
            daemon,
            manager,
            timeouts,
            count,
            state: Mutex::new(PrepaidState {
                channel_id: position.channel_id,
                nonce: position.nonce,
                signed_amount: position.signed_amount,
                channel_value: position.value,
                token: None,
                used: 0,
            }),
        };
        strategy.refresh().await?;
        Ok(strategy)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub async fn channel_id(&self) -> U256 {
        self.state.lock().await.channel_id
    }

    async fn fetch_token(&self, state: &mut PrepaidState) -> Result<()> {
        let batch = self.setup.price_per_call * U256::from(self.count);
        let amount = state.signed_amount + batch;
        if amount > state.channel_value {
            let top_up = top_up_channel(
                &self.manager,
                self.signer.address(),
                &self.setup,
                state.channel_id,
                state.signed_amount,
                batch,
            );
            state.channel_value = tokio::time::timeout(self.timeouts.payment_operation, top_up)
                .await
                .map_err(|_| SdkError::WaitTimeout {
                    event: "prepaid channel top-up",
                })??;
        }
        let block = self.manager.backend().head_block().await?;

        let claim = sign_payload(
            &self.signer,
            &claim_message(self.setup.mpe, state.channel_id, state.nonce, amount),
        )?;
        let signature = sign_payload(&self.signer, &prepaid_token_message(&claim, block))?;

        let request = TokenRequest {
            channel_id: to_u64(state.channel_id, "channel id")?,
            current_nonce: to_u64(state.nonce, "nonce")?,
            signed_amount: to_u64(amount, "signed amount")?,
            signature: signature.to_vec(),
            current_block: block,
            claim_signature: claim.to_vec(),
        };
        let reply = self.daemon.prepaid_token(request).await?;
        tracing::info!(
            channel_id = %state.channel_id,
            planned = reply.planned_amount,
            used = reply.used_amount,
            "prepaid token issued"
        );
        state.signed_amount = amount;
        state.token = Some(reply.token);
        state.used = 0;
        Ok(())
    }
}

impl std::fmt::Debug for PrepaidStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepaidStrategy")
            .field("setup", &self.setup)
            .field("count", &self.count)
            .finish()
    }
}

fn to_u64(value: U256, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| SdkError::Marshal(format!("{what} {value} does not fit in 64 bits")))
}

#[async_trait]
impl PaymentStrategy for PrepaidStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Prepaid
    }

    async fn refresh(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.token.is_some() {
            return Ok(());
        }
        self.fetch_token(&mut state).await
    }

    async fn headers_for(&self) -> Result<PaymentHeaders> {
        let mut state = self.state.lock().await;
        if state.token.is_none() {
            self.fetch_token(&mut state).await?;
        }
        let token = state.token.clone().unwrap_or_default();
        Ok(PaymentHeaders::new(PAYMENT_TYPE_PREPAID)
            .binary(HEADER_PREPAID_TOKEN, token.into_bytes())
            .ascii(HEADER_CHANNEL_ID, state.channel_id.to_string())
            .ascii(HEADER_CHANNEL_NONCE, state.nonce.to_string()))
    }

    async fn call_succeeded(&self, _headers: &PaymentHeaders) {
        let mut state = self.state.lock().await;
        state.used += 1;
        if state.used >= self.count {
            tracing::debug!(count = self.count, "prepaid batch spent");
            state.token = None;
        }
    }
}
