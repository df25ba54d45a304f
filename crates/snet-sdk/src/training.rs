//! Model training through the daemon's `training.Daemon` service.
//!
//! Requests carry an `AuthorizationDetails` message in their body, signed
//! over `method_name ∥ signer ∥ block`.

use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::chain::BlockSource;
use crate::constants::{DEFAULT_PAGE, DEFAULT_PAGE_SIZE};
use crate::rpc::RpcClient;
use crate::schema::{Schema, TRAINING_SERVICE};
use crate::signing::{sign_payload, training_message};
use crate::{Result, SdkError};

pub const CREATE_MODEL: &str = "create_model";
pub const GET_ALL_MODELS: &str = "get_all_models";
pub const GET_MODEL: &str = "get_model";

/// Filters for [`TrainingClient::get_all_models`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelFilter {
    /// Status names, e.g. `READY_TO_USE`.
    pub statuses: Vec<String>,
    pub is_public: Option<bool>,
    pub grpc_method_name: String,
    pub grpc_service_name: String,
    pub name: String,
    pub created_by_address: String,
    pub page_size: Option<u64>,
    pub page: Option<u64>,
}

/// A model to create for one of the service's methods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewModel {
    pub name: String,
    pub description: String,
    pub grpc_method_name: String,
    pub grpc_service_name: String,
    pub address_list: Vec<String>,
    pub is_public: bool,
}

/// Service the training requests are scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingScope {
    pub org_id: String,
    pub service_id: String,
    pub group_id: String,
}

/// Signed `AuthorizationDetails` as proto3 JSON.
pub fn authorization_details(signer: &PrivateKeySigner, method: &str, block: u64) -> Result<Value> {
    let signature = sign_payload(signer, &training_message(method, signer.address(), block))?;
    Ok(json!({
        "current_block": block,
        "method_name": method,
        "signature": base64::engine::general_purpose::STANDARD.encode(signature),
        "signer_address": signer.address().to_checksum(None),
    }))
}

/// `AllModelsRequest` body; pagination defaults to 100 per page from page 0.
pub fn all_models_request(filter: &ModelFilter, authorization: Value) -> Value {
    let mut body = json!({
        "authorization": authorization,
        "statuses": filter.statuses,
        "grpc_method_name": filter.grpc_method_name,
        "grpc_service_name": filter.grpc_service_name,
        "name": filter.name,
        "created_by_address": filter.created_by_address,
        "page_size": filter.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        "page": filter.page.unwrap_or(DEFAULT_PAGE),
    });
    if let Some(is_public) = filter.is_public {
        body["is_public"] = json!(is_public);
    }
    body
}

/// Client for the daemon training API.
pub struct TrainingClient {
    rpc: RpcClient,
    schema: Arc<Schema>,
    signer: Option<PrivateKeySigner>,
    blocks: Arc<dyn BlockSource>,
    scope: TrainingScope,
}

impl TrainingClient {
    pub fn new(
        rpc: RpcClient,
        schema: Arc<Schema>,
        signer: Option<PrivateKeySigner>,
        blocks: Arc<dyn BlockSource>,
        scope: TrainingScope,
    ) -> Self {
        Self {
            rpc,
            schema,
            signer,
            blocks,
            scope,
        }
    }

    async fn authorization(&self, method: &str) -> Result<Value> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SdkError::Sign("training requests need a private key".to_string()))?;
        let block = self.blocks.head_block().await?;
        authorization_details(signer, method, block)
    }

    async fn invoke(&self, rpc_method: &str, body: &Value) -> Result<Value> {
        let method = self.schema.method(TRAINING_SERVICE, rpc_method)?;
        let request = serde_json::to_vec(body)?;
        let reply = self.rpc.call_json(&method, &request, None).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Which methods of the service support training.
    pub async fn get_metadata(&self) -> Result<Value> {
        self.invoke("GetTrainingMetadata", &json!({})).await
    }

    pub async fn get_all_models(&self, filter: &ModelFilter) -> Result<Value> {
        let auth = self.authorization(GET_ALL_MODELS).await?;
        self.invoke("GetAllModels", &all_models_request(filter, auth)).await
    }

    pub async fn get_model(&self, model_id: &str) -> Result<Value> {
        let auth = self.authorization(GET_MODEL).await?;
        self.invoke(
            "GetModel",
            &json!({ "authorization": auth, "model_id": model_id }),
        )
        .await
    }

    pub async fn create_model(&self, model: &NewModel) -> Result<Value> {
        let auth = self.authorization(CREATE_MODEL).await?;
        let mut model = serde_json::to_value(model)?;
        model["organization_id"] = json!(self.scope.org_id);
        model["service_id"] = json!(self.scope.service_id);
        model["group_id"] = json!(self.scope.group_id);
        let model_id = self
            .invoke("CreateModel", &json!({ "authorization": auth, "model": model }))
            .await?;
        tracing::info!(model = ?model_id.get("model_id"), "training model created");
        Ok(model_id)
    }
}
