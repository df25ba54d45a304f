//! Chain operations the channel manager depends on.

use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::Filter;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;

use super::events::{EscrowEvent, EventKind, EventSubscription};
use super::{ChannelSnapshot, OpenChannel};
use crate::chain::{self, wait_for_receipt, BlockSource};
use crate::config::Timeouts;
use crate::token;
use crate::MultiPartyEscrow;
use crate::{Result, SdkError};

const SUBSCRIPTION_BUFFER: usize = 16;

/// Reads and writes against a MultiPartyEscrow contract, as seen by one
/// signing account. Submissions return once the transaction is mined.
#[async_trait]
pub trait EscrowBackend: BlockSource {
    fn mpe_address(&self) -> Address;

    /// Latest `ChannelOpen` with exactly this sender (also the signer),
    /// recipient and group, together with the channel's current state.
    async fn find_channel(&self, sender: Address, recipient: Address, group_id: B256) -> Result<Option<OpenChannel>>;

    async fn channel(&self, channel_id: U256) -> Result<ChannelSnapshot>;

    /// The account's internal escrow balance.
    async fn escrow_balance(&self, owner: Address) -> Result<U256>;

    /// ERC-20 balance `owner` can still deposit.
    async fn token_balance(&self, owner: Address) -> Result<U256>;

    /// ERC-20 allowance from `owner` to the escrow contract.
    async fn allowance(&self, owner: Address) -> Result<U256>;

    /// Approve the escrow contract for the maximum amount.
    async fn approve_max(&self) -> Result<TxHash>;

    /// Start delivering events of `kind` emitted by the escrow contract.
    async fn subscribe(&self, kind: EventKind) -> Result<EventSubscription>;

    async fn open_channel(
        &self,
        signer: Address,
        recipient: Address,
        group_id: B256,
        value: U256,
        expiration: U256,
    ) -> Result<TxHash>;

    async fn deposit_and_open_channel(
        &self,
        signer: Address,
        recipient: Address,
        group_id: B256,
        value: U256,
        expiration: U256,
    ) -> Result<TxHash>;

    async fn deposit(&self, amount: U256) -> Result<TxHash>;

    async fn channel_add_funds(&self, channel_id: U256, amount: U256) -> Result<TxHash>;

    async fn channel_extend(&self, channel_id: U256, new_expiration: U256) -> Result<TxHash>;

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: U256,
        new_expiration: U256,
        amount: U256,
    ) -> Result<TxHash>;
}

/// [`EscrowBackend`] over an alloy provider whose wallet signs transactions.
/// Subscriptions require a websocket provider.
#[derive(Clone)]
pub struct AlloyEscrowBackend {
    provider: DynProvider,
    mpe: Address,
    timeouts: Timeouts,
}

impl AlloyEscrowBackend {
    pub fn new(provider: DynProvider, mpe: Address, timeouts: Timeouts) -> Self {
        Self {
            provider,
            mpe,
            timeouts,
        }
    }

    fn contract(&self) -> MultiPartyEscrow::MultiPartyEscrowInstance<&DynProvider> {
        MultiPartyEscrow::new(self.mpe, &self.provider)
    }

    async fn token_address(&self) -> Result<Address> {
        chain::read(self.timeouts.chain_read, "token", self.contract().token().call()).await
    }

    async fn confirm(&self, what: &str, tx_hash: TxHash) -> Result<TxHash> {
        tracing::info!(tx = %tx_hash, "{what} submitted");
        let receipt = wait_for_receipt(&self.provider, tx_hash, self.timeouts.receipt_wait).await?;
        tracing::debug!(tx = %tx_hash, block = ?receipt.block_number, "{what} mined");
        Ok(receipt.transaction_hash)
    }
}

#[async_trait]
impl BlockSource for AlloyEscrowBackend {
    async fn head_block(&self) -> Result<u64> {
        chain::read(
            self.timeouts.chain_read,
            "eth_blockNumber",
            self.provider.get_block_number(),
        )
        .await
    }
}

#[async_trait]
impl EscrowBackend for AlloyEscrowBackend {
    fn mpe_address(&self) -> Address {
        self.mpe
    }

    async fn find_channel(&self, sender: Address, recipient: Address, group_id: B256) -> Result<Option<OpenChannel>> {
        let head = self.head_block().await?;
        let filter = Filter::new()
            .address(self.mpe)
            .event_signature(MultiPartyEscrow::ChannelOpen::SIGNATURE_HASH)
            .topic1(sender.into_word())
            .topic2(recipient.into_word())
            .topic3(group_id)
            .from_block(0u64)
            .to_block(head);
        let logs = chain::read(self.timeouts.chain_read, "eth_getLogs(ChannelOpen)", self.provider.get_logs(&filter)).await?;

        let latest = logs
            .iter()
            .filter_map(|log| EscrowEvent::decode(EventKind::ChannelOpen, log).ok())
            .filter_map(|ev| match ev {
                EscrowEvent::ChannelOpen {
                    channel_id,
                    sender: s,
                    signer,
                    recipient: r,
                    group_id: g,
                    ..
                } if s == sender && signer == sender && r == recipient && g == group_id => Some(channel_id),
                _ => None,
            })
            .last();

        match latest {
            Some(channel_id) => {
                let snapshot = self.channel(channel_id).await?;
                tracing::debug!(%channel_id, value = %snapshot.value, expiration = %snapshot.expiration, "found existing channel");
                Ok(Some(OpenChannel { channel_id, snapshot }))
            }
            None => Ok(None),
        }
    }

    async fn channel(&self, channel_id: U256) -> Result<ChannelSnapshot> {
        let c = chain::read(
            self.timeouts.chain_read,
            "channels",
            self.contract().channels(channel_id).call(),
        )
        .await?;
        Ok(ChannelSnapshot {
            sender: c.sender,
            signer: c.signer,
            recipient: c.recipient,
            group_id: c.groupId,
            value: c.value,
            nonce: c.nonce,
            expiration: c.expiration,
        })
    }

    async fn escrow_balance(&self, owner: Address) -> Result<U256> {
        chain::read(self.timeouts.chain_read, "balances", self.contract().balances(owner).call()).await
    }

    async fn token_balance(&self, owner: Address) -> Result<U256> {
        let token = self.token_address().await?;
        token::balance_of(&self.provider, &self.timeouts, token, owner).await
    }

    async fn allowance(&self, owner: Address) -> Result<U256> {
        let token = self.token_address().await?;
        token::allowance(&self.provider, &self.timeouts, token, owner, self.mpe).await
    }

    async fn approve_max(&self) -> Result<TxHash> {
        let token = self.token_address().await?;
        token::approve(&self.provider, &self.timeouts, token, self.mpe, U256::MAX).await
    }

    async fn subscribe(&self, kind: EventKind) -> Result<EventSubscription> {
        let filter = Filter::new()
            .address(self.mpe)
            .event_signature(kind.signature_hash());
        let mut sub = self
            .provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| SdkError::Subscription {
                event: kind.name(),
                reason: format!("eth_subscribe failed: {e}"),
            })?;
        let id = *sub.local_id();
        let (tx, subscription) = EventSubscription::channel(kind, SUBSCRIPTION_BUFFER);
        let provider = self.provider.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    item = sub.recv() => {
                        let delivery = match item {
                            Ok(log) => match EscrowEvent::decode(kind, &log) {
                                Ok(ev) => Ok(ev),
                                Err(e) => {
                                    tracing::warn!(event = kind.name(), error = %e, "skipping undecodable log");
                                    continue;
                                }
                            },
                            Err(RecvError::Lagged(missed)) => {
                                tracing::warn!(event = kind.name(), missed, "log subscription lagged");
                                continue;
                            }
                            Err(RecvError::Closed) => Err("subscription stream closed by node".to_string()),
                        };
                        let fatal = delivery.is_err();
                        if tx.send(delivery).await.is_err() || fatal {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = provider.unsubscribe(id).await {
                tracing::debug!(event = kind.name(), error = %e, "eth_unsubscribe failed");
            }
        });

        Ok(subscription)
    }

    async fn open_channel(
        &self,
        signer: Address,
        recipient: Address,
        group_id: B256,
        value: U256,
        expiration: U256,
    ) -> Result<TxHash> {
        let contract = self.contract();
        let call = contract.openChannel(signer, recipient, group_id, value, expiration);
        let pending = chain::submit(self.timeouts.chain_submit, "openChannel", call.send()).await?;
        self.confirm("openChannel", *pending.tx_hash()).await
    }

    async fn deposit_and_open_channel(
        &self,
        signer: Address,
        recipient: Address,
        group_id: B256,
        value: U256,
        expiration: U256,
    ) -> Result<TxHash> {
        let contract = self.contract();
        let call = contract.depositAndOpenChannel(signer, recipient, group_id, value, expiration);
        let pending = chain::submit(self.timeouts.chain_submit, "depositAndOpenChannel", call.send()).await?;
        self.confirm("depositAndOpenChannel", *pending.tx_hash()).await
    }

    async fn deposit(&self, amount: U256) -> Result<TxHash> {
        let contract = self.contract();
        let call = contract.deposit(amount);
        let pending = chain::submit(self.timeouts.chain_submit, "deposit", call.send()).await?;
        self.confirm("deposit", *pending.tx_hash()).await
    }

    async fn channel_add_funds(&self, channel_id: U256, amount: U256) -> Result<TxHash> {
        let contract = self.contract();
        let call = contract.channelAddFunds(channel_id, amount);
        let pending = chain::submit(self.timeouts.chain_submit, "channelAddFunds", call.send()).await?;
        self.confirm("channelAddFunds", *pending.tx_hash()).await
    }

    async fn channel_extend(&self, channel_id: U256, new_expiration: U256) -> Result<TxHash> {
        let contract = self.contract();
        let call = contract.channelExtend(channel_id, new_expiration);
        let pending = chain::submit(self.timeouts.chain_submit, "channelExtend", call.send()).await?;
        self.confirm("channelExtend", *pending.tx_hash()).await
    }

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: U256,
        new_expiration: U256,
        amount: U256,
    ) -> Result<TxHash> {
        let contract = self.contract();
        let call = contract.channelExtendAndAddFunds(channel_id, new_expiration, amount);
        let pending = chain::submit(self.timeouts.chain_submit, "channelExtendAndAddFunds", call.send()).await?;
        self.confirm("channelExtendAndAddFunds", *pending.tx_hash()).await
    }
}
