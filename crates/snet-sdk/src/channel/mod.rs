//! Escrow payment channels: discovery, funding and extension.

pub mod backend;
pub mod events;

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};

pub use backend::{AlloyEscrowBackend, EscrowBackend};
pub use events::{EscrowEvent, EventKind, EventSubscription, EVENT_WAIT_TIMEOUT};

use crate::constants::EXPIRATION_BUFFER_BLOCKS;
use crate::{Result, SdkError};
use events::{wait_add_funds, wait_channel_open, wait_deposit, wait_extend};

/// Read-only view of a channel's on-chain state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub sender: Address,
    pub signer: Address,
    pub recipient: Address,
    pub group_id: B256,
    pub value: U256,
    pub nonce: U256,
    pub expiration: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannel {
    pub channel_id: U256,
    pub snapshot: ChannelSnapshot,
}

impl OpenChannel {
    /// Value not yet covered by signed claims.
    pub fn available(&self, signed_amount: U256) -> U256 {
        self.snapshot.value.saturating_sub(signed_amount)
    }
}

/// `current_block + threshold + 240`
pub fn new_expiration(current_block: u64, threshold: U256) -> U256 {
    U256::from(current_block) + threshold + U256::from(EXPIRATION_BUFFER_BLOCKS)
}

/// Parameters of one `ensure_channel` call. The sender is also the signer.
#[derive(Debug, Clone)]
pub struct EnsureRequest {
    pub sender: Address,
    pub recipient: Address,
    pub group_id: B256,
    pub price: U256,
    pub desired_expiration: U256,
    pub signed_amount: U256,
}

/// What an existing channel lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    Ready,
    AddFunds { missing: U256 },
    Extend,
    ExtendAndAddFunds { missing: U256 },
}

impl ChannelAction {
    pub fn for_channel(channel: &OpenChannel, req: &EnsureRequest) -> Self {
        let available = channel.available(req.signed_amount);
        let missing = req.price.saturating_sub(available);
        let funds_ok = missing.is_zero();
        let expiration_ok = channel.snapshot.expiration > req.desired_expiration;
        match (funds_ok, expiration_ok) {
            (true, true) => ChannelAction::Ready,
            (false, true) => ChannelAction::AddFunds { missing },
            (true, false) => ChannelAction::Extend,
            (false, false) => ChannelAction::ExtendAndAddFunds { missing },
        }
    }
}

/// Brings a channel into a state that can pay for the next call.
///
/// Not safe to run concurrently for the same `(sender, recipient, group)`.
#[derive(Clone)]
pub struct ChannelManager {
    backend: Arc<dyn EscrowBackend>,
    wait_timeout: Duration,
}

impl ChannelManager {
    pub fn new(backend: Arc<dyn EscrowBackend>) -> Self {
        Self {
            backend,
            wait_timeout: EVENT_WAIT_TIMEOUT,
        }
    }

    /// Bound each event wait by `timeout` (never more than one minute).
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout.min(EVENT_WAIT_TIMEOUT);
        self
    }

    pub fn backend(&self) -> &Arc<dyn EscrowBackend> {
        &self.backend
    }

    pub async fn find_channel(&self, sender: Address, recipient: Address, group_id: B256) -> Result<Option<OpenChannel>> {
        self.backend.find_channel(sender, recipient, group_id).await
    }

    /// Return the id of a channel with at least `price` available beyond
    /// `signed_amount` and expiring after `desired_expiration`, opening,
    /// funding or extending one as needed.
    pub async fn ensure_channel(&self, req: &EnsureRequest) -> Result<U256> {
        let existing = self.find_channel(req.sender, req.recipient, req.group_id).await?;
        self.ensure_channel_with(req, existing).await
    }

    /// Same as [`ChannelManager::ensure_channel`] for a caller that already
    /// holds the channel. `None` opens a new one.
    pub async fn ensure_channel_with(&self, req: &EnsureRequest, existing: Option<OpenChannel>) -> Result<U256> {
        self.ensure_allowance(req.sender, req.price).await?;

        let Some(channel) = existing else {
            return self.open_new_channel(req).await;
        };
        let channel_id = channel.channel_id;

        match ChannelAction::for_channel(&channel, req) {
            ChannelAction::Ready => {
                tracing::debug!(%channel_id, "channel ready");
            }
            ChannelAction::AddFunds { missing } => {
                self.deposit_if_needed(req.sender, missing).await?;
                self.add_funds(channel_id, missing).await?;
            }
            ChannelAction::Extend => {
                self.extend(channel_id, req.desired_expiration).await?;
            }
            ChannelAction::ExtendAndAddFunds { missing } => {
                self.deposit_if_needed(req.sender, missing).await?;
                self.extend_and_add_funds(channel_id, req.desired_expiration, missing)
                    .await?;
            }
        }
        Ok(channel_id)
    }

    async fn ensure_allowance(&self, owner: Address, need: U256) -> Result<()> {
        let allowance = self.backend.allowance(owner).await?;
        if allowance < need {
            tracing::info!(%allowance, %need, "approving escrow for token transfers");
            self.backend.approve_max().await?;
        }
        Ok(())
    }

    async fn ensure_token_balance(&self, owner: Address, need: U256) -> Result<()> {
        let have = self.backend.token_balance(owner).await?;
        if have < need {
            return Err(SdkError::InsufficientFunds { need, have });
        }
        Ok(())
    }

    async fn open_new_channel(&self, req: &EnsureRequest) -> Result<U256> {
        let balance = self.backend.escrow_balance(req.sender).await?;
        let channel_id = if balance >= req.price {
            let mut opened = self.backend.subscribe(EventKind::ChannelOpen).await?;
            self.backend
                .open_channel(req.sender, req.recipient, req.group_id, req.price, req.desired_expiration)
                .await?;
            wait_channel_open(&mut opened, self.wait_timeout, req.sender, req.recipient, req.group_id).await?
        } else {
            self.ensure_token_balance(req.sender, req.price).await?;
            let mut opened = self.backend.subscribe(EventKind::ChannelOpen).await?;
            let mut deposited = self.backend.subscribe(EventKind::DepositFunds).await?;
            self.backend
                .deposit_and_open_channel(req.sender, req.recipient, req.group_id, req.price, req.desired_expiration)
                .await?;
            let (channel_id, _) = tokio::try_join!(
                wait_channel_open(&mut opened, self.wait_timeout, req.sender, req.recipient, req.group_id),
                wait_deposit(&mut deposited, self.wait_timeout, req.sender),
            )?;
            channel_id
        };
        tracing::info!(%channel_id, value = %req.price, expiration = %req.desired_expiration, "channel opened");
        Ok(channel_id)
    }

    async fn deposit_if_needed(&self, sender: Address, missing: U256) -> Result<()> {
        let balance = self.backend.escrow_balance(sender).await?;
        if balance >= missing {
            return Ok(());
        }
        self.ensure_token_balance(sender, missing).await?;
        let mut deposited = self.backend.subscribe(EventKind::DepositFunds).await?;
        self.backend.deposit(missing).await?;
        let amount = wait_deposit(&mut deposited, self.wait_timeout, sender).await?;
        tracing::info!(%amount, "deposited into escrow");
        Ok(())
    }

    async fn add_funds(&self, channel_id: U256, amount: U256) -> Result<()> {
        let mut added = self.backend.subscribe(EventKind::ChannelAddFunds).await?;
        self.backend.channel_add_funds(channel_id, amount).await?;
        wait_add_funds(&mut added, self.wait_timeout, channel_id).await?;
        tracing::info!(%channel_id, %amount, "channel funds added");
        Ok(())
    }

    async fn extend(&self, channel_id: U256, expiration: U256) -> Result<()> {
        let mut extended = self.backend.subscribe(EventKind::ChannelExtend).await?;
        self.backend.channel_extend(channel_id, expiration).await?;
        wait_extend(&mut extended, self.wait_timeout, channel_id).await?;
        tracing::info!(%channel_id, %expiration, "channel extended");
        Ok(())
    }

    async fn extend_and_add_funds(&self, channel_id: U256, expiration: U256, amount: U256) -> Result<()> {
        let mut extended = self.backend.subscribe(EventKind::ChannelExtend).await?;
        let mut added = self.backend.subscribe(EventKind::ChannelAddFunds).await?;
        self.backend
            .channel_extend_and_add_funds(channel_id, expiration, amount)
            .await?;
        tokio::try_join!(
            wait_extend(&mut extended, self.wait_timeout, channel_id),
            wait_add_funds(&mut added, self.wait_timeout, channel_id),
        )?;
        tracing::info!(%channel_id, %expiration, %amount, "channel extended and funded");
        Ok(())
    }
}
