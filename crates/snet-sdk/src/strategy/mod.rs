//! Payment strategies: how each call to a service is paid for.
//!
//! - [`FreeCallStrategy`](free_call::FreeCallStrategy): daemon-issued free-call token
//! - [`EscrowStrategy`](escrow::EscrowStrategy): signed claim per call against a channel
//! - [`PrepaidStrategy`](prepaid::PrepaidStrategy): daemon token covering a batch of calls

pub mod escrow;
pub mod free_call;
pub mod prepaid;

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tonic::metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue};

use crate::channel::{new_expiration, ChannelManager, EnsureRequest, OpenChannel};
use crate::constants::HEADER_PAYMENT_TYPE;
use crate::daemon::PaymentStateService;
use crate::{Result, SdkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    FreeCall,
    Escrow,
    Prepaid,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::FreeCall => "free-call",
            StrategyKind::Escrow => "escrow",
            StrategyKind::Prepaid => "prepaid",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" | "free-call" | "freecall" => Ok(StrategyKind::FreeCall),
            "escrow" | "paid" => Ok(StrategyKind::Escrow),
            "prepaid" | "prepaid-call" => Ok(StrategyKind::Prepaid),
            other => Err(SdkError::Config(format!("unknown payment strategy {other:?}"))),
        }
    }
}

/// A single outgoing metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Ascii(String),
    /// Sent under a `-bin` key.
    Binary(Vec<u8>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Ascii(s) => Some(s),
            HeaderValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HeaderValue::Ascii(s) => s.as_bytes(),
            HeaderValue::Binary(b) => b,
        }
    }
}

/// Metadata a strategy attaches to one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentHeaders {
    entries: Vec<(&'static str, HeaderValue)>,
    claimed_amount: Option<U256>,
}

impl PaymentHeaders {
    /// Headers starting with `snet-payment-type: <payment_type>`.
    pub fn new(payment_type: &str) -> Self {
        Self::default().ascii(HEADER_PAYMENT_TYPE, payment_type)
    }

    pub fn ascii(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.entries.push((name, HeaderValue::Ascii(value.into())));
        self
    }

    pub fn binary(mut self, name: &'static str, value: impl Into<Vec<u8>>) -> Self {
        self.entries.push((name, HeaderValue::Binary(value.into())));
        self
    }

    /// Record the cumulative amount these headers authorize.
    pub fn with_claim(mut self, amount: U256) -> Self {
        self.claimed_amount = Some(amount);
        self
    }

    pub fn claimed_amount(&self) -> Option<U256> {
        self.claimed_amount
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (*n, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert every entry into gRPC request metadata.
    pub fn apply(&self, metadata: &mut MetadataMap) -> Result<()> {
        for (name, value) in &self.entries {
            match value {
                HeaderValue::Ascii(v) => {
                    let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
                        .map_err(|e| SdkError::Marshal(format!("header name {name}: {e}")))?;
                    let val = MetadataValue::<Ascii>::try_from(v.as_str())
                        .map_err(|e| SdkError::Marshal(format!("header {name}: {e}")))?;
                    metadata.insert(key, val);
                }
                HeaderValue::Binary(b) => {
                    let key = MetadataKey::<Binary>::from_bytes(name.as_bytes())
                        .map_err(|e| SdkError::Marshal(format!("header name {name}: {e}")))?;
                    metadata.insert_bin(key, MetadataValue::<Binary>::from_bytes(b));
                }
            }
        }
        Ok(())
    }
}

/// Produces the payment metadata for service calls.
#[async_trait]
pub trait PaymentStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Bring tokens and channel state up to date. Cheap when nothing changed.
    async fn refresh(&self) -> Result<()>;

    /// Metadata for the next call.
    async fn headers_for(&self) -> Result<PaymentHeaders>;

    /// Called after the daemon accepted a call made with `headers`.
    async fn call_succeeded(&self, _headers: &PaymentHeaders) {}

    /// Called when a call made with `headers` returned an error.
    async fn call_failed(&self, _headers: &PaymentHeaders) {}

    /// Remaining free calls. Only the free-call strategy supports this.
    async fn free_calls_available(&self) -> Result<u64> {
        Err(SdkError::WrongStrategy(format!(
            "free_calls_available needs the free-call strategy, active strategy is {}",
            self.kind()
        )))
    }
}

/// Where and how much to pay, resolved from service and organization metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSetup {
    pub mpe: Address,
    pub recipient: Address,
    pub group_id: B256,
    pub price_per_call: U256,
    pub expiration_threshold: U256,
}

/// Channel position a channel-backed strategy starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPosition {
    pub channel_id: U256,
    pub nonce: U256,
    /// Amount the daemon has already accepted claims for.
    pub signed_amount: U256,
    /// Channel value on chain once it was ensured.
    pub value: U256,
}

/// Find or create a channel able to cover `amount` more than the daemon's
/// signed amount.
///
/// A daemon that does not know the channel yet reports it as not found;
/// that is treated as a fresh channel and its on-chain nonce is used.
pub(crate) async fn prepare_channel(
    manager: &ChannelManager,
    daemon: &dyn PaymentStateService,
    signer: &PrivateKeySigner,
    setup: &ChannelSetup,
    amount: U256,
) -> Result<ChannelPosition> {
    let sender = signer.address();
    let backend = manager.backend();
    let block = backend.head_block().await?;

    let existing = manager
        .find_channel(sender, setup.recipient, setup.group_id)
        .await?;
    let mut daemon_state = None;
    if let Some(channel) = &existing {
        match daemon
            .channel_state(signer, setup.mpe, channel.channel_id, block)
            .await
        {
            Ok(state) => daemon_state = Some(state),
            Err(e) if e.is_channel_not_found() => {
                tracing::info!(channel_id = %channel.channel_id, "daemon has no state for channel yet");
            }
            Err(e) => return Err(e),
        }
    }

    let signed_amount = daemon_state.map(|s| s.signed_amount).unwrap_or(U256::ZERO);
    let request = EnsureRequest {
        sender,
        recipient: setup.recipient,
        group_id: setup.group_id,
        price: amount,
        desired_expiration: new_expiration(block, setup.expiration_threshold),
        signed_amount,
    };
    let channel_id = manager.ensure_channel_with(&request, existing).await?;

    let snapshot = backend.channel(channel_id).await?;
    Ok(ChannelPosition {
        channel_id,
        nonce: daemon_state.map_or(snapshot.nonce, |state| state.nonce),
        signed_amount,
        value: snapshot.value,
    })
}

/// Fund or extend `channel_id` so it covers `amount` beyond `signed_amount`.
/// Returns the channel value afterwards.
pub(crate) async fn top_up_channel(
    manager: &ChannelManager,
    sender: Address,
    setup: &ChannelSetup,
    channel_id: U256,
    signed_amount: U256,
    amount: U256,
) -> Result<U256> {
    let backend = manager.backend();
    let block = backend.head_block().await?;
    let snapshot = backend.channel(channel_id).await?;
    let request = EnsureRequest {
        sender,
        recipient: setup.recipient,
        group_id: setup.group_id,
        price: amount,
        desired_expiration: new_expiration(block, setup.expiration_threshold),
        signed_amount,
    };
    manager
        .ensure_channel_with(&request, Some(OpenChannel { channel_id, snapshot }))
        .await?;
    Ok(backend.channel(channel_id).await?.value)
}

pub(crate) fn require_signer(signer: Option<&PrivateKeySigner>) -> Result<PrivateKeySigner> {
    signer
        .cloned()
        .ok_or_else(|| SdkError::Sign("payment strategies need a private key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{HEADER_CHANNEL_ID, HEADER_CHANNEL_SIGNATURE};

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!("free".parse::<StrategyKind>().unwrap(), StrategyKind::FreeCall);
        assert_eq!("Escrow".parse::<StrategyKind>().unwrap(), StrategyKind::Escrow);
        assert_eq!("prepaid".parse::<StrategyKind>().unwrap(), StrategyKind::Prepaid);
        assert!("card".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_headers_apply_to_metadata() {
        let headers = PaymentHeaders::new("escrow")
            .ascii(HEADER_CHANNEL_ID, "123")
            .binary(HEADER_CHANNEL_SIGNATURE, vec![7u8; 65]);
        let mut request = tonic::Request::new(());
        headers.apply(request.metadata_mut()).unwrap();

        let md = request.metadata();
        assert_eq!(md.get(HEADER_PAYMENT_TYPE).unwrap(), "escrow");
        assert_eq!(md.get(HEADER_CHANNEL_ID).unwrap(), "123");
        let sig = md.get_bin(HEADER_CHANNEL_SIGNATURE).unwrap().to_bytes().unwrap();
        assert_eq!(sig.as_ref(), &[7u8; 65]);
    }

    #[test]
    fn test_binary_header_needs_bin_suffix() {
        let headers = PaymentHeaders::default().binary("snet-not-binary", vec![1u8]);
        let mut md = MetadataMap::new();
        assert!(matches!(headers.apply(&mut md), Err(SdkError::Marshal(_))));
    }

    #[test]
    fn test_require_signer() {
        assert!(matches!(require_signer(None), Err(SdkError::Sign(_))));
        let key = PrivateKeySigner::random();
        assert_eq!(require_signer(Some(&key)).unwrap().address(), key.address());
    }
}
