//! In-memory escrow contract and daemon for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::mpsc;

use snet_sdk::chain::BlockSource;
use snet_sdk::channel::events::Delivery;
use snet_sdk::channel::{ChannelSnapshot, EscrowBackend, EscrowEvent, EventKind, EventSubscription, OpenChannel};
use snet_sdk::daemon::{
    ChannelState, FreeCallStateRequest, FreeCallToken, GetFreeCallTokenRequest, PaymentStateService,
    TokenReply, TokenRequest,
};
use snet_sdk::{Result, SdkError};

pub const MPE: Address = Address::with_last_byte(0xaa);
pub const RECIPIENT: Address = Address::with_last_byte(0xbb);
pub const GROUP: B256 = B256::with_last_byte(0xcc);

/// Mutable contract state.
#[derive(Debug, Default)]
pub struct Ledger {
    pub head: u64,
    pub channels: BTreeMap<u64, ChannelSnapshot>,
    pub balance: U256,
    pub allowance: U256,
    /// ERC-20 balance outside the escrow.
    pub token_balance: U256,
    /// Number of `ChannelOpen` log scans.
    pub lookups: usize,
    /// Submitted transactions, by contract function name.
    pub submitted: Vec<&'static str>,
}

/// An escrow contract used by a single account.
pub struct MockEscrow {
    pub account: Address,
    pub ledger: Mutex<Ledger>,
    subscribers: Mutex<Vec<(EventKind, mpsc::Sender<Delivery>)>>,
    /// Kinds whose events are never emitted.
    pub silenced: Mutex<Vec<EventKind>>,
}

impl MockEscrow {
    pub fn new(account: Address, head: u64) -> Self {
        Self {
            account,
            ledger: Mutex::new(Ledger {
                head,
                token_balance: U256::MAX,
                ..Default::default()
            }),
            subscribers: Mutex::new(Vec::new()),
            silenced: Mutex::new(Vec::new()),
        }
    }

    pub fn with_balance(self, balance: u64) -> Self {
        self.ledger.lock().unwrap().balance = U256::from(balance);
        self
    }

    pub fn with_token_balance(self, balance: u64) -> Self {
        self.ledger.lock().unwrap().token_balance = U256::from(balance);
        self
    }

    pub fn with_allowance(self, allowance: U256) -> Self {
        self.ledger.lock().unwrap().allowance = allowance;
        self
    }

    /// Add an open channel owned by `account` under the next free id.
    pub fn with_channel(self, value: u64, expiration: u64, nonce: u64) -> Self {
        {
            let mut ledger = self.ledger.lock().unwrap();
            let id = ledger.channels.len() as u64;
            ledger.channels.insert(
                id,
                ChannelSnapshot {
                    sender: self.account,
                    signer: self.account,
                    recipient: RECIPIENT,
                    group_id: GROUP,
                    value: U256::from(value),
                    nonce: U256::from(nonce),
                    expiration: U256::from(expiration),
                },
            );
        }
        self
    }

    pub fn silence(&self, kind: EventKind) {
        self.silenced.lock().unwrap().push(kind);
    }

    pub fn submitted(&self) -> Vec<&'static str> {
        self.ledger.lock().unwrap().submitted.clone()
    }

    pub fn snapshot(&self, id: u64) -> ChannelSnapshot {
        self.ledger.lock().unwrap().channels[&id].clone()
    }

    pub fn lookups(&self) -> usize {
        self.ledger.lock().unwrap().lookups
    }

    pub fn balance(&self) -> U256 {
        self.ledger.lock().unwrap().balance
    }

    fn emit(&self, event: EscrowEvent) {
        if self.silenced.lock().unwrap().contains(&event.kind()) {
            return;
        }
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|(_, tx)| !tx.is_closed());
        for (kind, tx) in subs.iter() {
            if *kind == event.kind() {
                let _ = tx.try_send(Ok(event.clone()));
            }
        }
    }

    fn record(&self, ledger: &mut Ledger, call: &'static str) -> TxHash {
        ledger.submitted.push(call);
        B256::with_last_byte(ledger.submitted.len() as u8)
    }

    fn open(&self, ledger: &mut Ledger, recipient: Address, group_id: B256, value: U256, expiration: U256) -> EscrowEvent {
        let id = ledger.channels.len() as u64;
        ledger.balance -= value;
        ledger.channels.insert(
            id,
            ChannelSnapshot {
                sender: self.account,
                signer: self.account,
                recipient,
                group_id,
                value,
                nonce: U256::ZERO,
                expiration,
            },
        );
        EscrowEvent::ChannelOpen {
            channel_id: U256::from(id),
            nonce: U256::ZERO,
            sender: self.account,
            signer: self.account,
            recipient,
            group_id,
            amount: value,
            expiration,
        }
    }
}

fn insufficient(what: &str) -> SdkError {
    SdkError::ChainSubmit(format!("{what}: execution reverted: insufficient escrow balance"))
}

fn id_of(channel_id: U256) -> u64 {
    u64::try_from(channel_id).unwrap()
}

#[async_trait]
impl BlockSource for MockEscrow {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.ledger.lock().unwrap().head)
    }
}

#[async_trait]
impl EscrowBackend for MockEscrow {
    fn mpe_address(&self) -> Address {
        MPE
    }

    async fn find_channel(&self, sender: Address, recipient: Address, group_id: B256) -> Result<Option<OpenChannel>> {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.lookups += 1;
        Ok(ledger
            .channels
            .iter()
            .filter(|(_, c)| c.sender == sender && c.signer == sender && c.recipient == recipient && c.group_id == group_id)
            .last()
            .map(|(id, c)| OpenChannel {
                channel_id: U256::from(*id),
                snapshot: c.clone(),
            }))
    }

    async fn channel(&self, channel_id: U256) -> Result<ChannelSnapshot> {
        self.ledger
            .lock()
            .unwrap()
            .channels
            .get(&id_of(channel_id))
            .cloned()
            .ok_or_else(|| SdkError::ChainRead(format!("no channel {channel_id}")))
    }

    async fn escrow_balance(&self, _owner: Address) -> Result<U256> {
        Ok(self.ledger.lock().unwrap().balance)
    }

    async fn token_balance(&self, _owner: Address) -> Result<U256> {
        Ok(self.ledger.lock().unwrap().token_balance)
    }

    async fn allowance(&self, _owner: Address) -> Result<U256> {
        Ok(self.ledger.lock().unwrap().allowance)
    }

    async fn approve_max(&self) -> Result<TxHash> {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.allowance = U256::MAX;
        Ok(self.record(&mut ledger, "approve"))
    }

    async fn subscribe(&self, kind: EventKind) -> Result<EventSubscription> {
        let (tx, sub) = EventSubscription::channel(kind, 16);
        self.subscribers.lock().unwrap().push((kind, tx));
        Ok(sub)
    }

    async fn open_channel(
        &self,
        _signer: Address,
        recipient: Address,
        group_id: B256,
        value: U256,
        expiration: U256,
    ) -> Result<TxHash> {
        let (hash, event) = {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.balance < value {
                return Err(insufficient("openChannel"));
            }
            let event = self.open(&mut ledger, recipient, group_id, value, expiration);
            (self.record(&mut ledger, "openChannel"), event)
        };
        self.emit(event);
        Ok(hash)
    }

    async fn deposit_and_open_channel(
        &self,
        _signer: Address,
        recipient: Address,
        group_id: B256,
        value: U256,
        expiration: U256,
    ) -> Result<TxHash> {
        let (hash, opened) = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.token_balance = ledger.token_balance.saturating_sub(value);
            ledger.balance += value;
            let event = self.open(&mut ledger, recipient, group_id, value, expiration);
            (self.record(&mut ledger, "depositAndOpenChannel"), event)
        };
        self.emit(EscrowEvent::DepositFunds {
            sender: self.account,
            amount: value,
        });
        self.emit(opened);
        Ok(hash)
    }

    async fn deposit(&self, amount: U256) -> Result<TxHash> {
        let hash = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.token_balance = ledger.token_balance.saturating_sub(amount);
            ledger.balance += amount;
            self.record(&mut ledger, "deposit")
        };
        self.emit(EscrowEvent::DepositFunds {
            sender: self.account,
            amount,
        });
        Ok(hash)
    }

    async fn channel_add_funds(&self, channel_id: U256, amount: U256) -> Result<TxHash> {
        let hash = {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.balance < amount {
                return Err(insufficient("channelAddFunds"));
            }
            ledger.balance -= amount;
            if let Some(c) = ledger.channels.get_mut(&id_of(channel_id)) {
                c.value += amount;
            }
            self.record(&mut ledger, "channelAddFunds")
        };
        self.emit(EscrowEvent::ChannelAddFunds {
            channel_id,
            additional_funds: amount,
        });
        Ok(hash)
    }

    async fn channel_extend(&self, channel_id: U256, new_expiration: U256) -> Result<TxHash> {
        let hash = {
            let mut ledger = self.ledger.lock().unwrap();
            if let Some(c) = ledger.channels.get_mut(&id_of(channel_id)) {
                c.expiration = new_expiration;
            }
            self.record(&mut ledger, "channelExtend")
        };
        self.emit(EscrowEvent::ChannelExtend {
            channel_id,
            new_expiration,
        });
        Ok(hash)
    }

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: U256,
        new_expiration: U256,
        amount: U256,
    ) -> Result<TxHash> {
        let hash = {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.balance < amount {
                return Err(insufficient("channelExtendAndAddFunds"));
            }
            ledger.balance -= amount;
            if let Some(c) = ledger.channels.get_mut(&id_of(channel_id)) {
                c.expiration = new_expiration;
                c.value += amount;
            }
            self.record(&mut ledger, "channelExtendAndAddFunds")
        };
        self.emit(EscrowEvent::ChannelExtend {
            channel_id,
            new_expiration,
        });
        self.emit(EscrowEvent::ChannelAddFunds {
            channel_id,
            additional_funds: amount,
        });
        Ok(hash)
    }
}

/// A daemon that remembers what it was asked.
#[derive(Default)]
pub struct MockDaemon {
    /// Channels absent here are reported as not found.
    pub channels: Mutex<HashMap<U256, ChannelState>>,
    pub free_token: Mutex<FreeCallToken>,
    pub free_calls: AtomicU64,
    pub token_requests: Mutex<Vec<GetFreeCallTokenRequest>>,
    pub free_call_checks: Mutex<Vec<FreeCallStateRequest>>,
    pub prepaid_requests: Mutex<Vec<TokenRequest>>,
}

impl MockDaemon {
    pub fn with_channel(self, channel_id: u64, nonce: u64, signed_amount: u64) -> Self {
        self.channels.lock().unwrap().insert(
            U256::from(channel_id),
            ChannelState {
                nonce: U256::from(nonce),
                signed_amount: U256::from(signed_amount),
            },
        );
        self
    }

    pub fn with_free_token(self, token: &[u8], expiration_block: u64, calls: u64) -> Self {
        *self.free_token.lock().unwrap() = FreeCallToken {
            token: token.to_vec(),
            token_expiration_block: expiration_block,
        };
        self.free_calls.store(calls, Ordering::SeqCst);
        self
    }

    pub fn set_channel(&self, channel_id: u64, nonce: u64, signed_amount: u64) {
        self.channels.lock().unwrap().insert(
            U256::from(channel_id),
            ChannelState {
                nonce: U256::from(nonce),
                signed_amount: U256::from(signed_amount),
            },
        );
    }
}

#[async_trait]
impl PaymentStateService for MockDaemon {
    async fn channel_state(
        &self,
        _signer: &PrivateKeySigner,
        _mpe: Address,
        channel_id: U256,
        _block: u64,
    ) -> Result<ChannelState> {
        self.channels
            .lock()
            .unwrap()
            .get(&channel_id)
            .copied()
            .ok_or_else(|| {
                SdkError::from_status(tonic::Status::not_found(
                    "payment channel error: channel is not found",
                ))
            })
    }

    async fn free_call_token(&self, request: GetFreeCallTokenRequest) -> Result<FreeCallToken> {
        self.token_requests.lock().unwrap().push(request);
        Ok(self.free_token.lock().unwrap().clone())
    }

    async fn free_calls_available(&self, request: FreeCallStateRequest) -> Result<u64> {
        self.free_call_checks.lock().unwrap().push(request);
        Ok(self.free_calls.load(Ordering::SeqCst))
    }

    async fn prepaid_token(&self, request: TokenRequest) -> Result<TokenReply> {
        let reply = TokenReply {
            channel_id: request.channel_id,
            token: format!("prepaid-{}", request.signed_amount),
            planned_amount: request.signed_amount,
            used_amount: 0,
        };
        self.prepaid_requests.lock().unwrap().push(request);
        Ok(reply)
    }
}

/// A chain head that only moves when told to.
pub struct FixedBlocks(pub AtomicU64);

impl FixedBlocks {
    pub fn at(block: u64) -> Self {
        Self(AtomicU64::new(block))
    }

    pub fn advance_to(&self, block: u64) {
        self.0.store(block, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockSource for FixedBlocks {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}
