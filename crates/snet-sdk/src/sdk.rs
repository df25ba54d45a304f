//! Engine entry point: chain connection, registry and storage.

use alloy::signers::local::PrivateKeySigner;

use crate::bundle::ProtoBundle;
use crate::chain::{self, Chain};
use crate::config::{Config, Timeouts};
use crate::constants::Network;
use crate::metadata::{OrganizationMetadata, ServiceMetadata};
use crate::registry::RegistryClient;
use crate::rpc::RpcClient;
use crate::schema::Schema;
use crate::service::{ServiceClient, ServiceParts};
use crate::storage::StorageClient;
use crate::{Result, SdkError};

/// A connected engine. Cheap to share behind an `Arc`; every
/// [`ServiceClient`] it creates owns its own daemon connection.
pub struct Sdk {
    config: Config,
    timeouts: Timeouts,
    signer: Option<PrivateKeySigner>,
    chain: Chain,
    network: Network,
    registry: RegistryClient,
    storage: StorageClient,
}

impl Sdk {
    /// Validate `config`, connect to the chain and resolve the Registry.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let timeouts = config.timeouts();
        let signer = config.signer()?;

        let provider = chain::connect(&config.rpc_endpoint, signer.clone()).await?;
        let chain = Chain::new(provider, timeouts);
        let network = Network::from_chain_id(chain.chain_id().await?);

        let registry_address = config
            .registry_address
            .or_else(|| network.default_registry())
            .ok_or_else(|| {
                SdkError::Config(format!(
                    "no registry known for chain {}; set registry_address",
                    network.chain_id
                ))
            })?;
        let registry = RegistryClient::new(chain.provider().clone(), registry_address, timeouts);
        let storage = StorageClient::new(&config.ipfs_url, &config.lighthouse_url, timeouts.dial);

        tracing::info!(
            network = %network.name,
            chain_id = %network.chain_id,
            registry = %registry_address,
            signer = ?signer.as_ref().map(|s| s.address()),
            "sdk connected"
        );

        Ok(Self {
            config,
            timeouts,
            signer,
            chain,
            network,
            registry,
            storage,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn storage(&self) -> &StorageClient {
        &self.storage
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub async fn organization_metadata(&self, org_id: &str) -> Result<OrganizationMetadata> {
        let record = self.registry.get_organization(org_id).await?;
        let bytes = self.storage.fetch(&record.metadata_uri).await?;
        OrganizationMetadata::from_json(&bytes)
    }

    pub async fn service_metadata(&self, org_id: &str, service_id: &str) -> Result<ServiceMetadata> {
        let uri = self.registry.get_service_metadata_uri(org_id, service_id).await?;
        let bytes = self.storage.fetch(&uri).await?;
        ServiceMetadata::from_json(&bytes)
    }

    /// Discover `org_id/service_id`, compile its schema and dial the
    /// daemon serving `group_name`.
    pub async fn service_client(
        &self,
        org_id: &str,
        service_id: &str,
        group_name: &str,
    ) -> Result<ServiceClient> {
        let (org, metadata) = tokio::try_join!(
            self.organization_metadata(org_id),
            self.service_metadata(org_id, service_id),
        )?;
        let org_group = org.group(group_name)?.clone();
        let service_group = metadata.group(group_name)?.clone();

        let archive = self.storage.fetch(metadata.api_source_uri()).await?;
        let bundle = ProtoBundle::from_archive(&archive)?;
        if bundle.is_empty() {
            return Err(SdkError::Archive(format!(
                "schema archive for {org_id}/{service_id} has no .proto files"
            )));
        }
        let schema = Schema::compile(bundle.get())?;

        let endpoint = service_group.endpoint()?.to_string();
        let rpc = RpcClient::connect(&endpoint, &self.timeouts).await?;
        tracing::info!(org_id, service_id, group = group_name, %endpoint, "service client ready");

        ServiceClient::from_parts(ServiceParts {
            org_id: org_id.to_string(),
            service_id: service_id.to_string(),
            rpc_endpoint: self.config.rpc_endpoint.clone(),
            timeouts: self.timeouts,
            signer: self.signer.clone(),
            chain: self.chain.clone(),
            registry: self.registry.clone(),
            metadata,
            org_group,
            service_group,
            bundle,
            schema,
            rpc,
        })
    }
}

impl std::fmt::Debug for Sdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sdk")
            .field("network", &self.network)
            .field("registry", &self.registry.address())
            .finish()
    }
}
