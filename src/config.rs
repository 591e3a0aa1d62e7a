//! Configuration management
//!
//! The persisted document is a single JSON file. Unknown fields are rejected
//! at load so typos never silently disable a backend. Saves are atomic: the
//! new document is written to a temp file, the previous file is copied to a
//! `.backup` sibling, and the temp file is renamed into place.

use std::{collections::HashMap, fs, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Json},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    /// Backend server configurations
    pub servers: Vec<BackendConfig>,
    /// Frontend gateway configuration
    pub gateway: GatewayConfig,
    /// Streamable HTTP session configuration
    pub streamable_http: StreamableHttpConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Request policies
    pub policies: PoliciesConfig,
    /// Circuit breaker configuration
    pub failsafe: FailsafeConfig,
    /// Subscription limits
    pub subscriptions: SubscriptionsConfig,
}

impl Config {
    /// Load configuration from a JSON file plus `GOBLIN_`-prefixed
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Json::file(p));
        }

        // CLI-owned variables (config path, log settings) are not part of
        // the document schema and would trip deny_unknown_fields.
        figment = figment.merge(
            Env::prefixed("GOBLIN_")
                .ignore(&["config", "log_level", "log_format"])
                .split("__"),
        );

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration atomically.
    ///
    /// Writes to `<path>.tmp`, copies any existing file to `<path>.backup`,
    /// then renames the temp file over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &body)?;

        if path.exists() {
            let backup = path.with_extension("backup");
            fs::copy(path, &backup)?;
        }

        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Validate cross-field constraints not expressible in serde.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(Error::Config("Backend name must be non-empty".to_string()));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate backend name: {}",
                    server.name
                )));
            }
            server.validate()?;
        }

        if self.auth.mode == AuthMode::ApiKey
            && self.auth.api_key.as_deref().unwrap_or("").is_empty()
        {
            return Err(Error::Config(
                "auth.apiKey is required when auth.mode is \"apikey\"".to_string(),
            ));
        }

        Ok(())
    }

    /// Enabled backends only.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &BackendConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Look up a backend by name.
    #[must_use]
    pub fn server(&self, name: &str) -> Option<&BackendConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Backend server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BackendConfig {
    /// Unique backend name
    pub name: String,
    /// Transport kind
    pub transport: TransportKind,
    /// Command to spawn (stdio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments (stdio)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables for the child process (stdio)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint URL (http variants)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Static HTTP headers (http variants)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Whether the backend participates in aggregation
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Session mode for HTTP backends
    #[serde(default)]
    pub mode: BackendMode,
    /// Per-backend request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl BackendConfig {
    /// Validate transport-specific required fields.
    pub fn validate(&self) -> Result<()> {
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Config(format!(
                        "Backend '{}': stdio transport requires a command",
                        self.name
                    )));
                }
            }
            TransportKind::Http | TransportKind::StreamableHttp => {
                let url = self.url.as_deref().unwrap_or("");
                if url.is_empty() {
                    return Err(Error::Config(format!(
                        "Backend '{}': http transport requires a url",
                        self.name
                    )));
                }
                url::Url::parse(url).map_err(|e| {
                    Error::Config(format!("Backend '{}': invalid url: {e}", self.name))
                })?;
            }
        }
        Ok(())
    }

    /// Per-backend timeout, if configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Backend transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Child process with line-delimited JSON over stdio
    Stdio,
    /// Plain HTTP POST with SSE notification channel
    Http,
    /// Streamable HTTP (POST + session-keyed SSE)
    StreamableHttp,
}

impl TransportKind {
    /// Wire label for status output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

/// HTTP backend session mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Session id captured at initialize and echoed on every request
    #[default]
    Stateful,
    /// No session id; every request is self-contained
    Stateless,
}

/// Frontend gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Host to bind HTTP listeners to
    pub host: String,
    /// Port for the frontend MCP endpoint
    pub port: u16,
    /// Which frontend channels to serve
    pub transport: FrontendTransport,
    /// Loopback lock/control port for the CLI
    pub lock_port: u16,
    /// Graceful shutdown grace period in milliseconds
    pub shutdown_grace_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39400,
            transport: FrontendTransport::Stdio,
            lock_port: 39401,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl GatewayConfig {
    /// Shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Which frontend channels the daemon serves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendTransport {
    /// Line-delimited JSON over stdin/stdout
    #[default]
    Stdio,
    /// HTTP endpoint only
    Http,
    /// Both channels simultaneously
    Both,
}

/// Streamable HTTP session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct StreamableHttpConfig {
    /// Whether GET /mcp serves an SSE notification stream
    pub sse_enabled: bool,
    /// Session idle expiry in milliseconds
    pub session_timeout_ms: u64,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
}

impl Default for StreamableHttpConfig {
    fn default() -> Self {
        Self {
            sse_enabled: true,
            session_timeout_ms: 300_000,
            max_sessions: 64,
        }
    }
}

impl StreamableHttpConfig {
    /// Session idle expiry.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct AuthConfig {
    /// Authentication mode
    pub mode: AuthMode,
    /// API key value (required for `apikey` mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Authentication mode for administrative HTTP endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication
    #[default]
    Dev,
    /// `X-API-Key` header check
    ApiKey,
}

/// Request policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct PoliciesConfig {
    /// Serialized tool-result size budget in bytes
    pub output_size_limit_bytes: usize,
    /// Default per-request deadline in milliseconds
    pub default_timeout_ms: u64,
    /// Whether catalogs keep listing entries of circuit-open backends
    pub list_open_circuits: bool,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            output_size_limit_bytes: 1024 * 1024,
            default_timeout_ms: 30_000,
            list_open_circuits: true,
        }
    }
}

impl PoliciesConfig {
    /// Default request deadline.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct FailsafeConfig {
    /// Consecutive infrastructural failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Cooldown before admitting a half-open probe, in milliseconds
    pub open_cooldown_ms: u64,
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_cooldown_ms: 30_000,
        }
    }
}

impl FailsafeConfig {
    /// Cooldown before a half-open probe is admitted.
    #[must_use]
    pub fn open_cooldown(&self) -> Duration {
        Duration::from_millis(self.open_cooldown_ms)
    }
}

/// Subscription limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct SubscriptionsConfig {
    /// Maximum concurrent subscriptions per client
    pub max_per_client: usize,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self { max_per_client: 256 }
    }
}

fn default_true() -> bool {
    true
}
