//! Per-service facade: dynamic calls paid for by the active strategy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::TxHash;
use alloy::signers::local::PrivateKeySigner;
use prost_reflect::DynamicMessage;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tonic::transport::Channel;

use crate::bundle::ProtoBundle;
use crate::chain::{BlockSource, Chain};
use crate::channel::{AlloyEscrowBackend, ChannelManager};
use crate::config::{require_websocket, Timeouts};
use crate::daemon::{DaemonClient, PaymentStateService};
use crate::health::HealthProbe;
use crate::metadata::{OrganizationGroup, ServiceGroup, ServiceMetadata};
use crate::registry::RegistryClient;
use crate::rpc::{json_to_message, message_to_json, RpcClient};
use crate::schema::{MethodInfo, Schema};
use crate::strategy::escrow::EscrowStrategy;
use crate::strategy::free_call::{FreeCallScope, FreeCallStrategy};
use crate::strategy::prepaid::PrepaidStrategy;
use crate::strategy::{require_signer, ChannelSetup, PaymentStrategy, StrategyKind};
use crate::training::{TrainingClient, TrainingScope};
use crate::{Result, SdkError};

/// Everything a [`ServiceClient`] is assembled from.
pub(crate) struct ServiceParts {
    pub org_id: String,
    pub service_id: String,
    pub rpc_endpoint: String,
    pub timeouts: Timeouts,
    pub signer: Option<PrivateKeySigner>,
    pub chain: Chain,
    pub registry: RegistryClient,
    pub metadata: ServiceMetadata,
    pub org_group: OrganizationGroup,
    pub service_group: ServiceGroup,
    pub bundle: ProtoBundle,
    pub schema: Schema,
    pub rpc: RpcClient,
}

/// A connected service group.
///
/// Strategy switches are atomic: a call in flight keeps the strategy it
/// started with.
pub struct ServiceClient {
    org_id: String,
    service_id: String,
    rpc_endpoint: String,
    timeouts: Timeouts,
    signer: Option<PrivateKeySigner>,
    chain: Chain,
    registry: RegistryClient,
    metadata: ServiceMetadata,
    service_group: ServiceGroup,
    setup: ChannelSetup,
    free_scope: FreeCallScope,
    bundle: ProtoBundle,
    schema: Arc<Schema>,
    rpc: RpcClient,
    daemon: Arc<DaemonClient>,
    strategy: RwLock<Option<Arc<dyn PaymentStrategy>>>,
    closed: AtomicBool,
}

impl ServiceClient {
    pub(crate) fn from_parts(parts: ServiceParts) -> Result<Self> {
        let setup = ChannelSetup {
            mpe: parts.metadata.mpe_address,
            recipient: parts.org_group.payment.payment_address,
            group_id: parts.org_group.group_id_bytes()?,
            price_per_call: parts.service_group.price_per_call()?,
            expiration_threshold: parts.org_group.payment.expiration_threshold(),
        };
        let free_scope = FreeCallScope {
            org_id: parts.org_id.clone(),
            service_id: parts.service_id.clone(),
            group_id: parts.org_group.group_id.clone(),
        };
        let daemon = Arc::new(DaemonClient::new(parts.rpc.clone()));
        Ok(Self {
            org_id: parts.org_id,
            service_id: parts.service_id,
            rpc_endpoint: parts.rpc_endpoint,
            timeouts: parts.timeouts,
            signer: parts.signer,
            chain: parts.chain,
            registry: parts.registry,
            metadata: parts.metadata,
            service_group: parts.service_group,
            setup,
            free_scope,
            bundle: parts.bundle,
            schema: Arc::new(parts.schema),
            rpc: parts.rpc,
            daemon,
            strategy: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn group_name(&self) -> &str {
        &self.service_group.group_name
    }

    pub fn metadata(&self) -> &ServiceMetadata {
        &self.metadata
    }

    pub fn channel_setup(&self) -> &ChannelSetup {
        &self.setup
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn endpoint(&self) -> &str {
        self.rpc.endpoint()
    }

    /// The bundled schema sources.
    pub fn proto_files(&self) -> &ProtoBundle {
        &self.bundle
    }

    /// The daemon transport, for callers with generated stubs.
    pub fn raw_transport(&self) -> Channel {
        self.rpc.channel()
    }

    /// Kind of the active strategy, if one has been chosen.
    pub async fn strategy_kind(&self) -> Option<StrategyKind> {
        self.strategy.read().await.as_ref().map(|s| s.kind())
    }

    // --- Calls ---

    /// JSON request in, JSON reply out. Field names follow the proto
    /// definitions and unset fields are emitted with their defaults.
    pub async fn call_with_json(&self, method: &str, json: &[u8]) -> Result<Vec<u8>> {
        let info = self.schema.find_method(method)?;
        let request = json_to_message(info.input.clone(), json)?;
        let reply = self.invoke(&info, request).await?;
        message_to_json(&reply)
    }

    /// Same as [`ServiceClient::call_with_json`] over a JSON object.
    pub async fn call_with_map(&self, method: &str, params: Map<String, Value>) -> Result<Map<String, Value>> {
        let request = serde_json::to_vec(&Value::Object(params))?;
        let reply = self.call_with_json(method, &request).await?;
        match serde_json::from_slice(&reply)? {
            Value::Object(map) => Ok(map),
            other => Err(SdkError::Marshal(format!("reply is not an object: {other}"))),
        }
    }

    /// Call with a message built against [`ServiceClient::schema`].
    pub async fn call_with_typed(&self, method: &str, request: DynamicMessage) -> Result<DynamicMessage> {
        let info = self.schema.find_method(method)?;
        self.invoke(&info, request).await
    }

    async fn invoke(&self, method: &MethodInfo, request: DynamicMessage) -> Result<DynamicMessage> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdkError::Transport("service client is closed".to_string()));
        }
        let strategy = self.active_strategy().await?;
        let headers = strategy.headers_for().await?;
        tracing::debug!(method = %method.path(), strategy = %strategy.kind(), "calling service");
        match self.rpc.call_dynamic(method, request, Some(&headers)).await {
            Ok(reply) => {
                strategy.call_succeeded(&headers).await;
                Ok(reply)
            }
            Err(e) => {
                strategy.call_failed(&headers).await;
                Err(e)
            }
        }
    }

    // --- Strategies ---

    async fn active_strategy(&self) -> Result<Arc<dyn PaymentStrategy>> {
        if let Some(strategy) = self.strategy.read().await.as_ref() {
            return Ok(Arc::clone(strategy));
        }
        let mut slot = self.strategy.write().await;
        if let Some(strategy) = slot.as_ref() {
            return Ok(Arc::clone(strategy));
        }
        let chosen = self.default_strategy().await?;
        tracing::info!(strategy = %chosen.kind(), service = %self.service_id, "payment strategy selected");
        *slot = Some(Arc::clone(&chosen));
        Ok(chosen)
    }

    /// Free calls when the group offers them and some remain, escrow otherwise.
    async fn default_strategy(&self) -> Result<Arc<dyn PaymentStrategy>> {
        if self.service_group.free_calls > 0 {
            match self.free_strategy().await {
                Ok(strategy) => match strategy.free_calls_available().await {
                    Ok(n) if n > 0 => return Ok(strategy),
                    Ok(_) => tracing::info!("no free calls left, using escrow"),
                    Err(e) => tracing::warn!(error = %e, "free-call check failed, using escrow"),
                },
                Err(e) => tracing::warn!(error = %e, "free-call strategy unavailable, using escrow"),
            }
        }
        Ok(Arc::new(self.escrow_strategy().await?))
    }

    async fn free_strategy(&self) -> Result<Arc<dyn PaymentStrategy>> {
        let signer = require_signer(self.signer.as_ref())?;
        let blocks: Arc<dyn BlockSource> = Arc::new(self.chain.clone());
        let strategy = FreeCallStrategy::new(self.free_scope.clone(), signer, blocks, self.payment_state());
        tokio::time::timeout(self.timeouts.strategy_refresh, strategy.refresh())
            .await
            .map_err(|_| SdkError::WaitTimeout {
                event: "free-call token",
            })??;
        Ok(Arc::new(strategy))
    }

    async fn escrow_strategy(&self) -> Result<EscrowStrategy> {
        require_websocket(&self.rpc_endpoint)?;
        let signer = require_signer(self.signer.as_ref())?;
        EscrowStrategy::new(
            self.setup.clone(),
            signer,
            self.channel_manager(),
            self.payment_state(),
            self.timeouts,
        )
        .await
    }

    fn channel_manager(&self) -> ChannelManager {
        let backend = AlloyEscrowBackend::new(
            self.chain.provider().clone(),
            self.setup.mpe,
            self.timeouts,
        );
        ChannelManager::new(Arc::new(backend)).with_wait_timeout(self.timeouts.payment_operation)
    }

    fn payment_state(&self) -> Arc<dyn PaymentStateService> {
        self.daemon.clone()
    }

    async fn install(&self, strategy: Arc<dyn PaymentStrategy>) {
        tracing::info!(strategy = %strategy.kind(), service = %self.service_id, "payment strategy set");
        *self.strategy.write().await = Some(strategy);
    }

    pub async fn set_free_strategy(&self) -> Result<()> {
        let strategy = self.free_strategy().await?;
        self.install(strategy).await;
        Ok(())
    }

    pub async fn set_escrow_strategy(&self) -> Result<()> {
        let strategy = self.escrow_strategy().await?;
        self.install(Arc::new(strategy)).await;
        Ok(())
    }

    /// Pay for `count` calls up front.
    pub async fn set_prepaid_strategy(&self, count: u64) -> Result<()> {
        require_websocket(&self.rpc_endpoint)?;
        let signer = require_signer(self.signer.as_ref())?;
        let strategy = PrepaidStrategy::new(
            self.setup.clone(),
            signer,
            self.channel_manager(),
            self.payment_state(),
            self.timeouts,
            count,
        )
        .await?;
        self.install(Arc::new(strategy)).await;
        Ok(())
    }

    /// Remaining free calls. Fails unless the free-call strategy is active.
    pub async fn free_calls_available(&self) -> Result<u64> {
        let strategy = self
            .strategy
            .read()
            .await
            .clone()
            .ok_or_else(|| SdkError::WrongStrategy("no payment strategy is active".to_string()))?;
        strategy.free_calls_available().await
    }

    // --- Auxiliary clients ---

    /// Health probes for the daemon serving this group.
    pub fn healthcheck(&self) -> HealthProbe {
        HealthProbe::new(self.rpc.endpoint(), self.timeouts.rpc_unary)
            .with_daemon(self.daemon.as_ref().clone())
    }

    pub fn training(&self) -> TrainingClient {
        TrainingClient::new(
            self.rpc.clone(),
            Arc::clone(&self.schema),
            self.signer.clone(),
            Arc::new(self.chain.clone()),
            TrainingScope {
                org_id: self.org_id.clone(),
                service_id: self.service_id.clone(),
                group_id: self.free_scope.group_id.clone(),
            },
        )
    }

    // --- Registry administration ---

    /// Point the service's registry entry at `metadata_uri`.
    pub async fn update_service_metadata(&self, metadata_uri: &str) -> Result<TxHash> {
        self.registry
            .update_service_registration(&self.org_id, &self.service_id, metadata_uri)
            .await
            .map_err(|e| admin_error("updating service metadata", e))
    }

    pub async fn delete_service(&self) -> Result<TxHash> {
        self.registry
            .delete_service_registration(&self.org_id, &self.service_id)
            .await
            .map_err(|e| admin_error("deleting service", e))
    }

    /// Drop the active strategy and refuse further calls.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.strategy.write().await.take();
        tracing::debug!(service = %self.service_id, "service client closed");
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("org_id", &self.org_id)
            .field("service_id", &self.service_id)
            .field("group", &self.service_group.group_name)
            .field("endpoint", &self.rpc.endpoint())
            .finish()
    }
}

fn admin_error(action: &str, e: SdkError) -> SdkError {
    match e {
        SdkError::ChainSubmit(msg) => SdkError::ChainSubmit(format!("{action}: {msg}")),
        SdkError::Receipt(msg) => SdkError::Receipt(format!("{action}: {msg}")),
        other => other,
    }
}
