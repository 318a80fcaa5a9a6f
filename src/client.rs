use crate::config::DriverConfig;
use crate::durability::{DurabilityPoller, DurabilityRequest, PollSettings};
use crate::error::{ConfigurationError, DurabilityError, NoRouteAvailable, ReplicaReadError};
use crate::http::HttpConfigTransport;
use crate::network::{BinaryConfigTransport, TcpNodeClient};
use crate::provider::ConfigurationProvider;
use crate::replica::ReplicaReadCoordinator;
use crate::router::{OperationRouter, Route};
use crate::topology::TopologyTable;
use crate::transport::{ConfigTransport, NodeClient};
use crate::types::{ConnectionKind, GetReply, ObserveOutcome, PersistTo, ReplicateTo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Entry point tying configuration, routing, durability polling and replica
/// reads together for one bucket.
pub struct Driver {
    kind: ConnectionKind,
    provider: Arc<ConfigurationProvider>,
    router: OperationRouter,
    poller: DurabilityPoller,
    replicas: ReplicaReadCoordinator,
}

impl Driver {
    /// Connect over the binary protocol and HTTP using the seeds in `config`.
    pub async fn connect(config: DriverConfig) -> Result<Self, ConfigurationError> {
        let binary = Arc::new(BinaryConfigTransport::new(
            config.binary_seeds(),
            config.config_timeout,
        ));
        let http = Arc::new(HttpConfigTransport::new(
            config.http_seeds(),
            config.bucket.clone(),
            config.password.clone(),
            config.config_timeout,
        ));
        let nodes = Arc::new(TcpNodeClient::new(config.operation_timeout));
        Self::connect_with(config, binary, http, nodes).await
    }

    /// Connect with caller-supplied transports.
    pub async fn connect_with(
        config: DriverConfig,
        binary: Arc<dyn ConfigTransport>,
        http: Arc<dyn ConfigTransport>,
        nodes: Arc<dyn NodeClient>,
    ) -> Result<Self, ConfigurationError> {
        let settings = PollSettings::from_config(&config);
        let operation_timeout = config.operation_timeout;

        let provider = Arc::new(ConfigurationProvider::new(config, binary, http));
        let topology = provider.bootstrap().await?;
        let kind = topology.kind();

        let router = OperationRouter::new(Arc::clone(&provider));
        let poller = DurabilityPoller::new(router.clone(), Arc::clone(&nodes), settings);
        let replicas = ReplicaReadCoordinator::new(router.clone(), nodes, operation_timeout);

        tracing::info!(
            bucket = %topology.name(),
            kind = ?kind,
            "driver connected"
        );

        Ok(Self {
            kind,
            provider,
            router,
            poller,
            replicas,
        })
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn provider(&self) -> &Arc<ConfigurationProvider> {
        &self.provider
    }

    pub fn current_topology(&self) -> Option<Arc<TopologyTable>> {
        self.provider.current_topology()
    }

    pub fn signal_outdated(&self) -> Option<JoinHandle<()>> {
        self.provider.signal_outdated()
    }

    pub fn reconfigure(&self, descriptor: &str) -> Result<Arc<TopologyTable>, ConfigurationError> {
        self.provider.reconfigure(descriptor)
    }

    pub fn route(&self, key: &str) -> Result<Route, NoRouteAvailable> {
        self.router.route(key)
    }

    /// Name of a design document under the configured view mode.
    pub fn design_doc_name(&self, name: &str) -> String {
        self.provider.config().view_mode.design_doc_name(name)
    }

    pub async fn observe(
        &self,
        key: &str,
        cas: u64,
    ) -> Result<HashMap<String, ObserveOutcome>, NoRouteAvailable> {
        self.poller.observe(key, cas).await
    }

    /// Wait until a mutation with version token `cas` meets the requested
    /// persistence and replication.
    pub async fn confirm_durability(
        &self,
        key: &str,
        cas: u64,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
        is_delete: bool,
        timeout: Option<Duration>,
    ) -> Result<(), DurabilityError> {
        let request = self.durability_request(key, cas, persist_to, replicate_to, is_delete);
        self.poller.confirm_durability(&request, timeout).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn confirm_durability_cancellable(
        &self,
        key: &str,
        cas: u64,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
        is_delete: bool,
        timeout: Option<Duration>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), DurabilityError> {
        let request = self.durability_request(key, cas, persist_to, replicate_to, is_delete);
        self.poller
            .confirm_durability_cancellable(&request, timeout, cancel)
            .await
    }

    /// Read from the primary or any replica, whichever succeeds first.
    /// Simple buckets have no replicas, so this is a primary get.
    pub async fn get_from_replica(&self, key: &str) -> Result<GetReply, ReplicaReadError> {
        self.replicas.get_from_replica(key).await
    }

    fn durability_request(
        &self,
        key: &str,
        cas: u64,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
        is_delete: bool,
    ) -> DurabilityRequest {
        let request = DurabilityRequest::new(key, cas)
            .persist_to(persist_to)
            .replicate_to(replicate_to);
        if is_delete {
            request.delete()
        } else {
            request
        }
    }
}
