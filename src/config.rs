//! Driver configuration.
//!
//! Centralized settings with defaults that match a stock cluster.

use std::time::Duration;

/// Main configuration for a driver instance
#[derive(Debug, Clone)]
pub struct DriverConfig {
    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------
    /// Hosts used only for the first topology acquisition. After that the
    /// node list comes from the published topology.
    pub seed_nodes: Vec<String>,

    /// Bucket to connect to
    pub bucket: String,

    pub password: String,

    /// Port of the binary protocol on every node
    pub binary_port: u16,

    /// Port of the HTTP management interface on every node
    pub http_port: u16,

    /// Budget for one transport's acquisition attempt before falling back
    pub config_timeout: Duration,

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------
    /// Bound on a single observe round and on a replica read
    pub operation_timeout: Duration,

    /// Sleep between observe rounds
    pub obs_poll_interval: Duration,

    /// Maximum observe rounds before giving up
    pub obs_poll_max: u32,

    /// Upper bound on replicas a descriptor may declare
    pub max_replicas: usize,

    /// Design document naming for view requests
    pub view_mode: ViewMode,
}

/// Whether design documents are addressed in production or development form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    #[default]
    Production,
    Development,
}

impl ViewMode {
    pub fn prefix(self) -> &'static str {
        match self {
            ViewMode::Production => "",
            ViewMode::Development => "dev_",
        }
    }

    /// Apply the mode prefix to a design document name.
    pub fn design_doc_name(self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }

    /// Parse a mode setting; anything unrecognized falls back to production.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "development" => ViewMode::Development,
            "production" => ViewMode::Production,
            other => {
                tracing::warn!(value = other, "unknown view mode, using production");
                ViewMode::Production
            }
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            seed_nodes: vec!["127.0.0.1".to_string()],
            bucket: "default".to_string(),
            password: String::new(),
            binary_port: 11210,
            http_port: 8091,
            config_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_millis(2500),
            obs_poll_interval: Duration::from_millis(10),
            obs_poll_max: 500,
            max_replicas: 3,
            view_mode: ViewMode::Production,
        }
    }
}

impl DriverConfig {
    /// Create a new config builder
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    /// Binary protocol address of every seed node.
    pub fn binary_seeds(&self) -> Vec<String> {
        self.seed_nodes
            .iter()
            .map(|host| format!("{}:{}", host, self.binary_port))
            .collect()
    }

    /// HTTP bucket configuration URL of every seed node.
    pub fn http_seeds(&self) -> Vec<String> {
        self.seed_nodes
            .iter()
            .map(|host| {
                format!(
                    "http://{}:{}/pools/default/buckets/{}",
                    host, self.http_port, self.bucket
                )
            })
            .collect()
    }
}

/// Builder for DriverConfig
#[derive(Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    pub fn seed_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.seed_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.bucket = bucket.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn binary_port(mut self, port: u16) -> Self {
        self.config.binary_port = port;
        self
    }

    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    pub fn config_timeout(mut self, timeout: Duration) -> Self {
        self.config.config_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Set the sleep between observe rounds
    pub fn obs_poll_interval(mut self, interval: Duration) -> Self {
        self.config.obs_poll_interval = interval;
        self
    }

    /// Set the maximum number of observe rounds
    pub fn obs_poll_max(mut self, max: u32) -> Self {
        self.config.obs_poll_max = max;
        self
    }

    pub fn max_replicas(mut self, max: usize) -> Self {
        self.config.max_replicas = max;
        self
    }

    pub fn view_mode(mut self, mode: ViewMode) -> Self {
        self.config.view_mode = mode;
        self
    }

    pub fn build(self) -> DriverConfig {
        self.config
    }
}
