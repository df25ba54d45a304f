use std::sync::Arc;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{prepare_channel, top_up_channel, ChannelSetup, PaymentHeaders, PaymentStrategy, StrategyKind};
use crate::channel::{new_expiration, ChannelManager, EnsureRequest, OpenChannel};
use crate::config::Timeouts;
use crate::constants::{
    HEADER_CHANNEL_AMOUNT, HEADER_CHANNEL_ID, HEADER_CHANNEL_NONCE, HEADER_CHANNEL_SIGNATURE,
    PAYMENT_TYPE_ESCROW,
};
use crate::daemon::PaymentStateService;
use crate::signing::{claim_message, sign_payload};
use crate::{Result, SdkError};

/// Claim state for the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowState {
    pub channel_id: U256,
    pub nonce: U256,
    /// Cumulative amount the next claim authorizes.
    pub signed_amount: U256,
    /// Channel value on chain as last seen.
    pub channel_value: U256,
}

/// Pays each call with a claim signed over the channel's running total.
///
/// Building headers reserves the claimed amount, so concurrent calls never
/// sign the same total. A failed call hands its amount back only while no
/// later claim has been issued.
pub struct EscrowStrategy {
    setup: ChannelSetup,
    signer: PrivateKeySigner,
    manager: ChannelManager,
    daemon: Arc<dyn PaymentStateService>,
    timeouts: Timeouts,
    state: Mutex<EscrowState>,
}

impl EscrowStrategy {
    /// Discover or open a funded channel and read the daemon's view of it.
    pub async fn new(
        setup: ChannelSetup,
        signer: PrivateKeySigner,
        manager: ChannelManager,
        daemon: Arc<dyn PaymentStateService>,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let price = setup.price_per_call;
        let position = tokio::time::timeout(
            timeouts.payment_operation,
            prepare_channel(&manager, daemon.as_ref(), &signer, &setup, price),
        )
        .await
        .map_err(|_| SdkError::WaitTimeout {
            event: "escrow channel setup",
        })??;

        let state = EscrowState {
            channel_id: position.channel_id,
            nonce: position.nonce,
            signed_amount: position.signed_amount + price,
            channel_value: position.value,
        };
        tracing::info!(
            channel_id = %state.channel_id,
            nonce = %state.nonce,
            signed_amount = %state.signed_amount,
            "escrow strategy ready"
        );
        Ok(Self::from_state(setup, signer, manager, daemon, timeouts, state))
    }

    /// Resume from a known claim state without touching the chain.
    pub fn from_state(
        setup: ChannelSetup,
        signer: PrivateKeySigner,
        manager: ChannelManager,
        daemon: Arc<dyn PaymentStateService>,
        timeouts: Timeouts,
        state: EscrowState,
    ) -> Self {
        Self {
            setup,
            signer,
            manager,
            daemon,
            timeouts,
            state: Mutex::new(state),
        }
    }

    pub async fn state(&self) -> EscrowState {
        *self.state.lock().await
    }

    pub fn price_per_call(&self) -> U256 {
        self.setup.price_per_call
    }

    async fn resync(&self) -> Result<()> {
        let backend = self.manager.backend();
        let block = backend.head_block().await?;
        let price = self.setup.price_per_call;
        let mut state = self.state.lock().await;

        let daemon_state = match self
            .daemon
            .channel_state(&self.signer, self.setup.mpe, state.channel_id, block)
            .await
        {
            Ok(remote) => Some(remote),
            Err(e) if e.is_channel_not_found() => None,
            Err(e) => return Err(e),
        };
        let accepted = daemon_state.map(|s| s.signed_amount).unwrap_or(U256::ZERO);

        let mut channel = backend.channel(state.channel_id).await?;
        let short_funds = channel.value.saturating_sub(accepted) < price;
        let short_time = channel.expiration <= U256::from(block) + self.setup.expiration_threshold;
        if short_funds || short_time {
            let request = EnsureRequest {
                sender: self.signer.address(),
                recipient: self.setup.recipient,
                group_id: self.setup.group_id,
                price,
                desired_expiration: new_expiration(block, self.setup.expiration_threshold),
                signed_amount: accepted,
            };
            let current = OpenChannel {
                channel_id: state.channel_id,
                snapshot: channel,
            };
            self.manager.ensure_channel_with(&request, Some(current)).await?;
            channel = backend.channel(state.channel_id).await?;
        }
        state.channel_value = channel.value;

        if let Some(remote) = daemon_state {
            let next = remote.signed_amount + price;
            if remote.nonce != state.nonce {
                tracing::info!(old = %state.nonce, new = %remote.nonce, "channel nonce advanced");
                state.nonce = remote.nonce;
                state.signed_amount = next;
            } else if next > state.signed_amount {
                tracing::debug!(from = %state.signed_amount, to = %next, "adopting daemon signed amount");
                state.signed_amount = next;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EscrowStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowStrategy")
            .field("setup", &self.setup)
            .field("signer", &self.signer.address())
            .finish()
    }
}

#[async_trait]
impl PaymentStrategy for EscrowStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Escrow
    }

    async fn refresh(&self) -> Result<()> {
        tokio::time::timeout(self.timeouts.payment_operation, self.resync())
            .await
            .map_err(|_| SdkError::WaitTimeout {
                event: "escrow refresh",
            })?
    }

    async fn headers_for(&self) -> Result<PaymentHeaders> {
        let price = self.setup.price_per_call;
        let mut state = self.state.lock().await;
        if state.signed_amount > state.channel_value {
            // Everything below this claim is signed or in flight already.
            let reserved = state.signed_amount.saturating_sub(price);
            let top_up = top_up_channel(
                &self.manager,
                self.signer.address(),
                &self.setup,
                state.channel_id,
                reserved,
                price,
            );
            state.channel_value = tokio::time::timeout(self.timeouts.payment_operation, top_up)
                .await
                .map_err(|_| SdkError::WaitTimeout {
                    event: "escrow channel top-up",
                })??;
            tracing::info!(channel_id = %state.channel_id, value = %state.channel_value, "channel topped up");
        }

        let claim = state.signed_amount;
        let message = claim_message(self.setup.mpe, state.channel_id, state.nonce, claim);
        let signature = sign_payload(&self.signer, &message)?;
        let headers = PaymentHeaders::new(PAYMENT_TYPE_ESCROW)
            .ascii(HEADER_CHANNEL_ID, state.channel_id.to_string())
            .ascii(HEADER_CHANNEL_NONCE, state.nonce.to_string())
            .ascii(HEADER_CHANNEL_AMOUNT, claim.to_string())
            .binary(HEADER_CHANNEL_SIGNATURE, signature.to_vec())
            .with_claim(claim);
        state.signed_amount = claim + price;
        Ok(headers)
    }

    async fn call_failed(&self, headers: &PaymentHeaders) {
        let Some(claimed) = headers.claimed_amount() else {
            return;
        };
        let mut state = self.state.lock().await;
        if state.signed_amount == claimed + self.setup.price_per_call {
            tracing::debug!(%claimed, "call failed, releasing claim");
            state.signed_amount = claimed;
        }
    }
}
