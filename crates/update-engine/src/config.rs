//! Engine configuration value types.

use std::time::Duration;

/// Knobs consumed by the update engine. The daemon binary fills this in
/// from its environment surface; defaults match the documented ones.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Substrings matched against both the image reference and the
    /// container name; a hit excludes the item from updates.
    pub exclude_patterns: Vec<String>,
    /// How long backup tags are kept before the prune phase may delete
    /// them.
    pub backup_retention: Duration,
    /// How long a freshly started container is observed before the update
    /// is committed.
    pub health_window: Duration,
    /// Ask the registry for the remote digest before pulling. Advisory
    /// only; a pull still happens on update.
    pub registry_check: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            backup_retention: Duration::from_secs(5 * 24 * 60 * 60),
            health_window: Duration::from_secs(10),
            registry_check: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortainerConfig {
    pub url: String,
    pub auth: PortainerAuth,
    /// Accept self-signed certificates. Off unless the operator opts in.
    pub insecure_tls: bool,
}

#[derive(Debug, Clone)]
pub enum PortainerAuth {
    ApiKey(String),
    Credentials { username: String, password: String },
}
