//! Escrow contract events and bounded waits on them.

use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use tokio::sync::mpsc;

use crate::MultiPartyEscrow::{ChannelAddFunds, ChannelExtend, ChannelOpen, DepositFunds};
use crate::{Result, SdkError};

/// Upper bound on any single event wait.
pub const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelOpen,
    DepositFunds,
    ChannelAddFunds,
    ChannelExtend,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ChannelOpen => "ChannelOpen",
            EventKind::DepositFunds => "DepositFunds",
            EventKind::ChannelAddFunds => "ChannelAddFunds",
            EventKind::ChannelExtend => "ChannelExtend",
        }
    }

    /// topic0 of the event.
    pub fn signature_hash(&self) -> B256 {
        match self {
            EventKind::ChannelOpen => ChannelOpen::SIGNATURE_HASH,
            EventKind::DepositFunds => DepositFunds::SIGNATURE_HASH,
            EventKind::ChannelAddFunds => ChannelAddFunds::SIGNATURE_HASH,
            EventKind::ChannelExtend => ChannelExtend::SIGNATURE_HASH,
        }
    }
}

/// A decoded escrow event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowEvent {
    ChannelOpen {
        channel_id: U256,
        nonce: U256,
        sender: Address,
        signer: Address,
        recipient: Address,
        group_id: B256,
        amount: U256,
        expiration: U256,
    },
    DepositFunds {
        sender: Address,
        amount: U256,
    },
    ChannelAddFunds {
        channel_id: U256,
        additional_funds: U256,
    },
    ChannelExtend {
        channel_id: U256,
        new_expiration: U256,
    },
}

impl EscrowEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EscrowEvent::ChannelOpen { .. } => EventKind::ChannelOpen,
            EscrowEvent::DepositFunds { .. } => EventKind::DepositFunds,
            EscrowEvent::ChannelAddFunds { .. } => EventKind::ChannelAddFunds,
            EscrowEvent::ChannelExtend { .. } => EventKind::ChannelExtend,
        }
    }

    /// Decode a log as an event of `kind`.
    pub fn decode(kind: EventKind, log: &Log) -> Result<Self> {
        let fail = |e: alloy::sol_types::Error| SdkError::Subscription {
            event: kind.name(),
            reason: format!("undecodable log: {e}"),
        };
        let event = match kind {
            EventKind::ChannelOpen => {
                let ev = log.log_decode::<ChannelOpen>().map_err(fail)?.inner.data;
                EscrowEvent::ChannelOpen {
                    channel_id: ev.channelId,
                    nonce: ev.nonce,
                    sender: ev.sender,
                    signer: ev.signer,
                    recipient: ev.recipient,
                    group_id: ev.groupId,
                    amount: ev.amount,
                    expiration: ev.expiration,
                }
            }
            EventKind::DepositFunds => {
                let ev = log.log_decode::<DepositFunds>().map_err(fail)?.inner.data;
                EscrowEvent::DepositFunds {
                    sender: ev.sender,
                    amount: ev.amount,
                }
            }
            EventKind::ChannelAddFunds => {
                let ev = log.log_decode::<ChannelAddFunds>().map_err(fail)?.inner.data;
                EscrowEvent::ChannelAddFunds {
                    channel_id: ev.channelId,
                    additional_funds: ev.additionalFunds,
                }
            }
            EventKind::ChannelExtend => {
                let ev = log.log_decode::<ChannelExtend>().map_err(fail)?.inner.data;
                EscrowEvent::ChannelExtend {
                    channel_id: ev.channelId,
                    new_expiration: ev.newExpiration,
                }
            }
        };
        Ok(event)
    }
}

/// Item delivered by a subscription: an event, or the reason delivery failed.
pub type Delivery = std::result::Result<EscrowEvent, String>;

/// Live subscription to one event kind.
///
/// The producer side unsubscribes from the node once this handle is
/// dropped, so every exit path of a waiter releases the subscription.
#[derive(Debug)]
pub struct EventSubscription {
    kind: EventKind,
    rx: mpsc::Receiver<Delivery>,
}

impl EventSubscription {
    pub fn new(kind: EventKind, rx: mpsc::Receiver<Delivery>) -> Self {
        Self { kind, rx }
    }

    /// A subscription fed by the returned sender.
    pub fn channel(kind: EventKind, capacity: usize) -> (mpsc::Sender<Delivery>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(kind, rx))
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Wait for the first event accepted by `select`, bounded by `timeout`.
    ///
    /// Events of other kinds and events `select` rejects are skipped.
    pub async fn wait_for<T>(
        &mut self,
        timeout: Duration,
        mut select: impl FnMut(&EscrowEvent) -> Option<T>,
    ) -> Result<T> {
        let kind = self.kind;
        let event = kind.name();
        let rx = &mut self.rx;
        let wait = async {
            loop {
                match rx.recv().await {
                    Some(Ok(ev)) => {
                        if ev.kind() != kind {
                            continue;
                        }
                        if let Some(found) = select(&ev) {
                            return Ok(found);
                        }
                        tracing::debug!(event, ?ev, "ignoring unrelated event");
                    }
                    Some(Err(reason)) => return Err(SdkError::Subscription { event, reason }),
                    None => {
                        return Err(SdkError::Subscription {
                            event,
                            reason: "subscription closed".to_string(),
                        })
                    }
                }
            }
        };
        tokio::time::timeout(timeout.min(EVENT_WAIT_TIMEOUT), wait)
            .await
            .map_err(|_| SdkError::WaitTimeout { event })?
    }
}

/// Channel id of the `ChannelOpen` for `(sender, recipient, group_id)`.
pub async fn wait_channel_open(
    sub: &mut EventSubscription,
    timeout: Duration,
    sender: Address,
    recipient: Address,
    group_id: B256,
) -> Result<U256> {
    sub.wait_for(timeout, |ev| match ev {
        EscrowEvent::ChannelOpen {
            channel_id,
            sender: s,
            recipient: r,
            group_id: g,
            ..
        } if *s == sender && *r == recipient && *g == group_id => Some(*channel_id),
        _ => None,
    })
    .await
}

/// Amount of the next `DepositFunds` by `sender`.
pub async fn wait_deposit(sub: &mut EventSubscription, timeout: Duration, sender: Address) -> Result<U256> {
    sub.wait_for(timeout, |ev| match ev {
        EscrowEvent::DepositFunds { sender: s, amount } if *s == sender => Some(*amount),
        _ => None,
    })
    .await
}

/// Added amount of the next `ChannelAddFunds` on `channel_id`.
pub async fn wait_add_funds(sub: &mut EventSubscription, timeout: Duration, channel_id: U256) -> Result<U256> {
    sub.wait_for(timeout, |ev| match ev {
        EscrowEvent::ChannelAddFunds {
            channel_id: id,
            additional_funds,
        } if *id == channel_id => Some(*additional_funds),
        _ => None,
    })
    .await
}

/// New expiration of the next `ChannelExtend` on `channel_id`.
pub async fn wait_extend(sub: &mut EventSubscription, timeout: Duration, channel_id: U256) -> Result<U256> {
    sub.wait_for(timeout, |ev| match ev {
        EscrowEvent::ChannelExtend {
            channel_id: id,
            new_expiration,
        } if *id == channel_id => Some(*new_expiration),
        _ => None,
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_event(channel_id: u64, sender: Address, recipient: Address, group_id: B256) -> EscrowEvent {
        EscrowEvent::ChannelOpen {
            channel_id: U256::from(channel_id),
            nonce: U256::ZERO,
            sender,
            signer: sender,
            recipient,
            group_id,
            amount: U256::from(10u64),
            expiration: U256::from(1000u64),
        }
    }

    #[tokio::test]
    async fn test_channel_open_waiter_returns_channel_id() {
        let (sender, recipient, group) = (Address::repeat_byte(1), Address::repeat_byte(2), B256::repeat_byte(3));
        let (tx, mut sub) = EventSubscription::channel(EventKind::ChannelOpen, 4);
        tx.send(Ok(open_event(42, sender, recipient, group))).await.unwrap();

        let id = wait_channel_open(&mut sub, Duration::from_secs(1), sender, recipient, group)
            .await
            .unwrap();
        assert_eq!(id, U256::from(42u64));
    }

    #[tokio::test]
    async fn test_waiter_times_out_without_events() {
        let (_tx, mut sub) = EventSubscription::channel(EventKind::ChannelOpen, 4);
        let err = wait_channel_open(
            &mut sub,
            Duration::from_millis(20),
            Address::ZERO,
            Address::ZERO,
            B256::ZERO,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SdkError::WaitTimeout { event: "ChannelOpen" }));
    }

    #[tokio::test]
    async fn test_upstream_error_is_subscription_error() {
        let (tx, mut sub) = EventSubscription::channel(EventKind::ChannelOpen, 4);
        tx.send(Err("connection reset".to_string())).await.unwrap();
        let err = wait_channel_open(&mut sub, Duration::from_secs(1), Address::ZERO, Address::ZERO, B256::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SdkError::Subscription { event: "ChannelOpen", ref reason } if reason == "connection reset"
        ));
    }

    #[tokio::test]
    async fn test_unrelated_events_are_skipped() {
        let me = Address::repeat_byte(9);
        let (tx, mut sub) = EventSubscription::channel(EventKind::DepositFunds, 4);
        tx.send(Ok(EscrowEvent::DepositFunds {
            sender: Address::repeat_byte(1),
            amount: U256::from(5u64),
        }))
        .await
        .unwrap();
        tx.send(Ok(EscrowEvent::DepositFunds {
            sender: me,
            amount: U256::from(7u64),
        }))
        .await
        .unwrap();
        let amount = wait_deposit(&mut sub, Duration::from_secs(1), me).await.unwrap();
        assert_eq!(amount, U256::from(7u64));
    }

    #[tokio::test]
    async fn test_closed_subscription() {
        let (tx, mut sub) = EventSubscription::channel(EventKind::ChannelExtend, 1);
        drop(tx);
        let err = wait_extend(&mut sub, Duration::from_secs(1), U256::from(1u64))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Subscription { .. }));
    }

    #[test]
    fn test_signature_hashes_are_distinct() {
        let kinds = [
            EventKind::ChannelOpen,
            EventKind::DepositFunds,
            EventKind::ChannelAddFunds,
            EventKind::ChannelExtend,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.signature_hash(), b.signature_hash());
            }
        }
    }
}
