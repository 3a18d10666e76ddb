use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Conexión a un nodo Lavalink
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
}

impl NodeConfig {
    /// Identidad del nodo: `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}/v4", scheme, self.address())
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}/v4/websocket", scheme, self.address())
    }
}

/// Opciones de comportamiento compartidas por todos los nodos y players
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    pub client_name: String,
    /// Espera fija entre intentos de reconexión
    pub reconnect_interval: Duration,
    /// Ventana durante la que el nodo conserva la sesión tras una caída
    pub resume_timeout: Duration,
    /// Espera antes de reintentar un track sin conexión de voz
    pub deferred_update_delay: Duration,
    pub default_search_source: String,
    pub default_volume: f32,
    pub auto_leave: bool,
    pub auto_leave_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            client_name: format!("open-music-link/{}", env!("CARGO_PKG_VERSION")),
            reconnect_interval: Duration::from_secs(60),
            resume_timeout: Duration::from_secs(60),
            deferred_update_delay: Duration::from_secs(5),
            default_search_source: "ytsearch".to_string(),
            default_volume: 1.0,
            auto_leave: true,
            auto_leave_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // Discord
    pub application_id: u64,

    // Lavalink
    pub nodes: Vec<NodeConfig>,
    pub options: ManagerOptions,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = ManagerOptions::default();

        let nodes = match std::env::var("LAVALINK_NODES") {
            Ok(list) if !list.trim().is_empty() => parse_nodes(&list)?,
            _ => vec![NodeConfig {
                name: "main".to_string(),
                host: std::env::var("LAVALINK_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: std::env::var("LAVALINK_PORT")
                    .unwrap_or_else(|_| "2333".to_string())
                    .parse()?,
                password: std::env::var("LAVALINK_PASSWORD")
                    .unwrap_or_else(|_| "youshallnotpass".to_string()),
                secure: std::env::var("LAVALINK_SECURE")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()?,
            }],
        };

        let config = Self {
            application_id: std::env::var("APPLICATION_ID")
                .context("APPLICATION_ID no definido")?
                .parse()?,

            nodes,
            options: ManagerOptions {
                client_name: std::env::var("CLIENT_NAME").unwrap_or(defaults.client_name),
                reconnect_interval: duration_var("RECONNECT_INTERVAL", defaults.reconnect_interval)?,
                resume_timeout: Duration::from_secs(
                    std::env::var("RESUME_TIMEOUT")
                        .unwrap_or_else(|_| "60".to_string())
                        .parse()?,
                ),
                deferred_update_delay: duration_var(
                    "DEFERRED_UPDATE_DELAY",
                    defaults.deferred_update_delay,
                )?,
                default_search_source: std::env::var("DEFAULT_SEARCH_SOURCE")
                    .unwrap_or(defaults.default_search_source),
                default_volume: std::env::var("DEFAULT_VOLUME")
                    .unwrap_or_else(|_| "1.0".to_string())
                    .parse()?,
                auto_leave: std::env::var("AUTO_LEAVE")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()?,
                auto_leave_timeout: duration_var("AUTO_LEAVE_TIMEOUT", defaults.auto_leave_timeout)?,
            },

            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/app/data".to_string())
                .into(),
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - At least one node, with unique addresses and a non-empty password
    /// - Volume must be between 0.0 and 5.0 (node filter range)
    /// - Reconnect interval must be greater than zero
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("At least one Lavalink node must be configured");
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.address()) {
                anyhow::bail!("Duplicated node address: {}", node.address());
            }
            if node.password.is_empty() {
                anyhow::bail!("Node {} has an empty password", node.name);
            }
        }

        let volume = self.options.default_volume;
        if !(0.0..=5.0).contains(&volume) {
            anyhow::bail!("Default volume must be between 0.0 and 5.0, got: {}", volume);
        }

        if self.options.reconnect_interval.is_zero() {
            anyhow::bail!("Reconnect interval must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Node passwords are never included.
    pub fn summary(&self) -> String {
        let nodes = self
            .nodes
            .iter()
            .map(|n| format!("{}@{}", n.name, n.address()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Config Summary:\n  \
            Discord: App ID {}\n  \
            Nodes: {}\n  \
            Reconnect: every {}, resume window {}s\n  \
            Search: {} (volume {:.0}%)\n  \
            Auto-leave: {} after {}",
            self.application_id,
            nodes,
            humantime::format_duration(self.options.reconnect_interval),
            self.options.resume_timeout.as_secs(),
            self.options.default_search_source,
            self.options.default_volume * 100.0,
            self.options.auto_leave,
            humantime::format_duration(self.options.auto_leave_timeout),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (sin valor por defecto real)
            application_id: 0,

            nodes: vec![NodeConfig {
                name: "main".to_string(),
                host: "localhost".to_string(),
                port: 2333,
                password: "youshallnotpass".to_string(),
                secure: false,
            }],
            options: ManagerOptions::default(),

            data_dir: "/app/data".into(),
        }
    }
}

/// Parsea `name=host:port:password[:secure]`, separados por comas
pub fn parse_nodes(list: &str) -> Result<Vec<NodeConfig>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| -> Result<NodeConfig> {
            let (name, rest) = match entry.split_once('=') {
                Some((name, rest)) => (name.to_string(), rest),
                None => (format!("node-{}", i + 1), entry),
            };
            let parts: Vec<&str> = rest.split(':').collect();
            if !(3..=4).contains(&parts.len()) {
                anyhow::bail!("Formato de nodo inválido '{}', use 'name=host:port:password[:secure]'", entry);
            }
            Ok(NodeConfig {
                name,
                host: parts[0].to_string(),
                port: parts[1]
                    .parse()
                    .with_context(|| format!("Puerto inválido en '{}'", entry))?,
                password: parts[2].to_string(),
                secure: parts.get(3).map_or(Ok(false), |s| s.parse())?,
            })
        })
        .collect()
}

fn duration_var(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => humantime::parse_duration(value.trim())
            .with_context(|| format!("{} inválido: {}", name, value)),
        _ => Ok(default),
    }
}
