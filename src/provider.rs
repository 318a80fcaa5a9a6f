//! Configuration bootstrap and reconfiguration.
//!
//! The provider owns the current `TopologyTable` behind a watch channel.
//! Readers clone the published `Arc` and keep using it for as long as they
//! like; publishing a new table is one reference replace, so nobody ever
//! sees a half-built table.
//!
//! Acquisition tries the binary transport first and falls back to HTTP.
//! Refreshes start with whichever transport last succeeded and try the
//! other before giving up. A failed refresh keeps the previous table.

use crate::config::DriverConfig;
use crate::error::{ConfigurationError, MalformedTopologyError, TransportError};
use crate::topology::TopologyTable;
use crate::transport::{ConfigTransport, RawDescriptor};
use crate::types::{NodeState, TransportKind};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Uninitialized,
    Bootstrapping,
    Ready,
    Refreshing,
    /// Bootstrap exhausted both transports.
    Failed,
}

/// A descriptor captured from one transport, kept only until parsed.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub raw: String,
    pub source: TransportKind,
}

impl ConfigSnapshot {
    fn capture(descriptor: RawDescriptor, source: TransportKind) -> Self {
        // Binary configs refer to the answering node as $HOST
        let raw = match source {
            TransportKind::Binary => descriptor.text.replace("$HOST", &descriptor.origin),
            TransportKind::Http => descriptor.text,
        };
        Self { raw, source }
    }
}

#[derive(Debug, thiserror::Error)]
enum AcquireError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Malformed(#[from] MalformedTopologyError),
}

const SOURCE_NONE: u8 = 0;
const SOURCE_BINARY: u8 = 1;
const SOURCE_HTTP: u8 = 2;

pub struct ConfigurationProvider {
    config: DriverConfig,
    binary: Arc<dyn ConfigTransport>,
    http: Arc<dyn ConfigTransport>,
    topology: watch::Sender<Option<Arc<TopologyTable>>>,
    state: watch::Sender<ProviderState>,
    last_source: AtomicU8,
    refreshing: AtomicBool,
    refresh_pending: AtomicBool,
}

impl ConfigurationProvider {
    pub fn new(
        config: DriverConfig,
        binary: Arc<dyn ConfigTransport>,
        http: Arc<dyn ConfigTransport>,
    ) -> Self {
        let (topology, _) = watch::channel(None);
        let (state, _) = watch::channel(ProviderState::Uninitialized);
        Self {
            config,
            binary,
            http,
            topology,
            state,
            last_source: AtomicU8::new(SOURCE_NONE),
            refreshing: AtomicBool::new(false),
            refresh_pending: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Acquire the first topology. Failure here means the driver cannot start.
    pub async fn bootstrap(&self) -> Result<Arc<TopologyTable>, ConfigurationError> {
        self.state.send_replace(ProviderState::Bootstrapping);

        match self
            .acquire([TransportKind::Binary, TransportKind::Http])
            .await
        {
            Ok((table, source)) => {
                let table = self.publish(table, source);
                self.state.send_replace(ProviderState::Ready);
                Ok(table)
            }
            Err(failures) => {
                tracing::error!(
                    bucket = %self.config.bucket,
                    failures = ?failures,
                    "could not fetch a valid bucket configuration"
                );
                self.state.send_replace(ProviderState::Failed);
                Err(ConfigurationError::NoValidConfiguration { failures })
            }
        }
    }

    /// The most recently published table, if any.
    pub fn current_topology(&self) -> Option<Arc<TopologyTable>> {
        self.topology.borrow().clone()
    }

    /// Receiver that wakes whenever a new table is published.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<TopologyTable>>> {
        self.topology.subscribe()
    }

    pub fn state(&self) -> ProviderState {
        *self.state.borrow()
    }

    /// Transport that produced the published table.
    pub fn last_source(&self) -> Option<TransportKind> {
        match self.last_source.load(Ordering::Acquire) {
            SOURCE_BINARY => Some(TransportKind::Binary),
            SOURCE_HTTP => Some(TransportKind::Http),
            _ => None,
        }
    }

    /// Ask for a topology refresh in the background.
    ///
    /// At most one refresh runs per provider. A signal that arrives while one
    /// is running is folded into a single extra pass and returns `None`.
    pub fn signal_outdated(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            self.refresh_pending.store(true, Ordering::Release);
            tracing::debug!("refresh already in flight, coalescing");
            return None;
        }

        let provider = Arc::clone(self);
        Some(tokio::spawn(async move { provider.run_refreshes().await }))
    }

    async fn run_refreshes(&self) {
        loop {
            self.refresh_pending.store(false, Ordering::Release);
            if let Err(e) = self.refresh().await {
                tracing::warn!(error = %e, "topology refresh failed, keeping previous configuration");
            }

            if self.refresh_pending.load(Ordering::Acquire) {
                continue;
            }
            self.refreshing.store(false, Ordering::Release);

            // A signal may have landed between the check and the release.
            if !self.refresh_pending.load(Ordering::Acquire)
                || self.refreshing.swap(true, Ordering::AcqRel)
            {
                break;
            }
        }
    }

    async fn refresh(&self) -> Result<(), ConfigurationError> {
        let had_table = self.current_topology().is_some();
        self.state.send_replace(ProviderState::Refreshing);

        let first = self.last_source().unwrap_or(TransportKind::Binary);
        let outcome = self.acquire([first, first.other()]).await;

        let next_state = if had_table || outcome.is_ok() {
            ProviderState::Ready
        } else {
            ProviderState::Failed
        };

        let result = match outcome {
            Ok((table, source)) => match self.publish_if_newer(table, source) {
                Err(ConfigurationError::StaleRevision { offered, current }) => {
                    tracing::debug!(offered, current, "refresh returned an older revision");
                    Ok(())
                }
                other => other.map(|_| ()),
            },
            Err(failures) => Err(ConfigurationError::NoValidConfiguration { failures }),
        };

        self.state.send_replace(next_state);
        result
    }

    /// Replace the topology with a descriptor pushed by the cluster.
    ///
    /// A malformed or older descriptor leaves the current table in effect.
    pub fn reconfigure(&self, descriptor: &str) -> Result<Arc<TopologyTable>, ConfigurationError> {
        let table = TopologyTable::parse(descriptor, self.config.max_replicas).map_err(|e| {
            tracing::warn!(error = %e, "failed to reconfigure, staying with previous configuration");
            ConfigurationError::from(e)
        })?;
        let source = self.last_source().unwrap_or(TransportKind::Binary);
        self.publish_if_newer(table, source)
    }

    /// Publish a copy of the current table with one node's state changed.
    /// Returns false if there is no table or the node is unknown.
    pub fn mark_node(&self, address: &str, state: NodeState) -> bool {
        let changed = self.topology.send_if_modified(|current| {
            let updated = current
                .as_ref()
                .and_then(|table| table.with_node_state(address, state));
            match updated {
                Some(table) => {
                    *current = Some(Arc::new(table));
                    true
                }
                None => false,
            }
        });
        if changed {
            tracing::info!(node = %address, state = ?state, "node state changed");
        }
        changed
    }

    fn transport(&self, kind: TransportKind) -> &Arc<dyn ConfigTransport> {
        match kind {
            TransportKind::Binary => &self.binary,
            TransportKind::Http => &self.http,
        }
    }

    /// Try each transport in order; the first parsable descriptor wins.
    async fn acquire(
        &self,
        order: [TransportKind; 2],
    ) -> Result<(TopologyTable, TransportKind), Vec<String>> {
        let mut failures = Vec::new();

        for kind in order {
            let transport = self.transport(kind);
            match self.acquire_from(transport.as_ref()).await {
                Ok(table) => return Ok((table, transport.kind())),
                Err(e) => {
                    tracing::warn!(source = ?kind, error = %e, "could not fetch config, trying next transport");
                    failures.push(format!("{:?}: {}", kind, e));
                }
            }
        }
        Err(failures)
    }

    async fn acquire_from(
        &self,
        transport: &dyn ConfigTransport,
    ) -> Result<TopologyTable, AcquireError> {
        let timeout = self.config.config_timeout;

        let descriptors = tokio::time::timeout(timeout, transport.fetch())
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        let first = descriptors
            .into_iter()
            .find(|descriptor| !descriptor.text.trim().is_empty())
            .ok_or(TransportError::NoResponse)?;

        let snapshot = ConfigSnapshot::capture(first, transport.kind());
        tracing::debug!(
            source = ?snapshot.source,
            bytes = snapshot.raw.len(),
            "parsing captured configuration"
        );
        Ok(TopologyTable::parse(&snapshot.raw, self.config.max_replicas)?)
    }

    fn publish(&self, table: TopologyTable, source: TransportKind) -> Arc<TopologyTable> {
        let table = Arc::new(table);
        self.topology.send_replace(Some(Arc::clone(&table)));
        self.record_source(source);
        tracing::info!(
            source = ?source,
            rev = table.rev(),
            partitions = table.partition_count(),
            nodes = table.nodes().len(),
            "published topology"
        );
        table
    }

    fn publish_if_newer(
        &self,
        table: TopologyTable,
        source: TransportKind,
    ) -> Result<Arc<TopologyTable>, ConfigurationError> {
        let table = Arc::new(table);
        let mut stale = None;

        self.topology.send_if_modified(|current| {
            if let Some(existing) = current.as_ref() {
                if table.rev() < existing.rev() {
                    stale = Some(existing.rev());
                    return false;
                }
            }
            *current = Some(Arc::clone(&table));
            true
        });

        if let Some(current) = stale {
            return Err(ConfigurationError::StaleRevision {
                offered: table.rev(),
                current,
            });
        }

        self.record_source(source);
        tracing::info!(
            source = ?source,
            rev = table.rev(),
            partitions = table.partition_count(),
            "published topology"
        );
        Ok(table)
    }

    fn record_source(&self, source: TransportKind) {
        let encoded = match source {
            TransportKind::Binary => SOURCE_BINARY,
            TransportKind::Http => SOURCE_HTTP,
        };
        self.last_source.store(encoded, Ordering::Release);
    }
}
