//! Payment-related daemon services.
//!
//! Messages are declared by hand with `prost` derives; the daemon's wire
//! contract is small and stable enough that build-time codegen is not used.

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;

use crate::rpc::RpcClient;
use crate::signing::{channel_state_message, sign_payload, u256_be, u256_from_be};
use crate::{Result, SdkError};

pub const GET_CHANNEL_STATE: &str = "/escrow.PaymentChannelStateService/GetChannelState";
pub const GET_FREE_CALL_TOKEN: &str = "/escrow.FreeCallStateService/GetFreeCallToken";
pub const GET_FREE_CALLS_AVAILABLE: &str = "/escrow.FreeCallStateService/GetFreeCallsAvailable";
pub const GET_PREPAID_TOKEN: &str = "/escrow.TokenService/GetToken";
pub const HEALTH_CHECK: &str = "/grpc.health.v1.Health/Check";

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelStateRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub current_block: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelStateReply {
    #[prost(bytes = "vec", tag = "1")]
    pub current_nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub current_signed_amount: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub current_signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetFreeCallTokenRequest {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub current_block: u64,
    #[prost(uint64, optional, tag = "4")]
    pub token_lifetime_in_blocks: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FreeCallToken {
    #[prost(bytes = "vec", tag = "1")]
    pub token: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub token_expiration_block: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FreeCallStateRequest {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(bytes = "vec", tag = "2")]
    pub token_for_free_call: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub token_expiry_date_block: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub signature: Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub current_block: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FreeCallStateReply {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(uint64, tag = "2")]
    pub free_calls_available: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TokenRequest {
    #[prost(uint64, tag = "1")]
    pub channel_id: u64,
    #[prost(uint64, tag = "2")]
    pub current_nonce: u64,
    #[prost(uint64, tag = "3")]
    pub signed_amount: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub signature: Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub current_block: u64,
    #[prost(bytes = "vec", tag = "6")]
    pub claim_signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TokenReply {
    #[prost(uint64, tag = "1")]
    pub channel_id: u64,
    #[prost(string, tag = "2")]
    pub token: String,
    #[prost(uint64, tag = "3")]
    pub planned_amount: u64,
    #[prost(uint64, tag = "4")]
    pub used_amount: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    ServiceUnknown = 3,
}

/// Nonce and cumulative signed amount the daemon holds for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelState {
    pub nonce: U256,
    pub signed_amount: U256,
}

impl TryFrom<ChannelStateReply> for ChannelState {
    type Error = SdkError;

    fn try_from(reply: ChannelStateReply) -> Result<Self> {
        Ok(Self {
            nonce: u256_from_be(&reply.current_nonce)?,
            signed_amount: u256_from_be(&reply.current_signed_amount)?,
        })
    }
}

/// The daemon's payment bookkeeping services.
#[async_trait]
pub trait PaymentStateService: Send + Sync {
    /// Signed `GetChannelState` for `channel_id` at `block`.
    async fn channel_state(
        &self,
        signer: &PrivateKeySigner,
        mpe: Address,
        channel_id: U256,
        block: u64,
    ) -> Result<ChannelState>;

    async fn free_call_token(&self, request: GetFreeCallTokenRequest) -> Result<FreeCallToken>;

    async fn free_calls_available(&self, request: FreeCallStateRequest) -> Result<u64>;

    async fn prepaid_token(&self, request: TokenRequest) -> Result<TokenReply>;
}

/// [`PaymentStateService`] over a daemon connection.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    rpc: RpcClient,
}

impl DaemonClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// `grpc.health.v1.Health/Check` for `service` (empty for the whole server).
    pub async fn health(&self, service: &str) -> Result<ServingStatus> {
        let reply: HealthCheckResponse = self
            .rpc
            .call_typed(
                HEALTH_CHECK,
                HealthCheckRequest {
                    service: service.to_string(),
                },
                None,
            )
            .await?;
        Ok(ServingStatus::try_from(reply.status).unwrap_or(ServingStatus::Unknown))
    }
}

#[async_trait]
impl PaymentStateService for DaemonClient {
    async fn channel_state(
        &self,
        signer: &PrivateKeySigner,
        mpe: Address,
        channel_id: U256,
        block: u64,
    ) -> Result<ChannelState> {
        let signature = sign_payload(signer, &channel_state_message(mpe, channel_id, block))?;
        let request = ChannelStateRequest {
            channel_id: u256_be(channel_id).to_vec(),
            signature: signature.to_vec(),
            current_block: block,
        };
        let reply: ChannelStateReply = self.rpc.call_typed(GET_CHANNEL_STATE, request, None).await?;
        let state = ChannelState::try_from(reply)?;
        tracing::debug!(%channel_id, nonce = %state.nonce, signed = %state.signed_amount, "daemon channel state");
        Ok(state)
    }

    async fn free_call_token(&self, request: GetFreeCallTokenRequest) -> Result<FreeCallToken> {
        self.rpc.call_typed(GET_FREE_CALL_TOKEN, request, None).await
    }

    async fn free_calls_available(&self, request: FreeCallStateRequest) -> Result<u64> {
        let reply: FreeCallStateReply = self
            .rpc
            .call_typed(GET_FREE_CALLS_AVAILABLE, request, None)
            .await?;
        Ok(reply.free_calls_available)
    }

    async fn prepaid_token(&self, request: TokenRequest) -> Result<TokenReply> {
        self.rpc.call_typed(GET_PREPAID_TOKEN, request, None).await
    }
}
