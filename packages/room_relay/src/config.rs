use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Unified config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   relay.toml:      [broker]
//                    mode = "remote"
//
//   env var:         RELAY_BROKER__MODE=remote   (double underscore = nesting)
//
//   (single underscore stays within field names: RELAY_AUTH__TOKEN_TTL_MINS)

pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Where room traffic is brokered.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// In-process broker; single node.
    #[default]
    Local,
    /// Hub node reached over WebSocket at `broker.url`.
    Remote,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub broker: BrokerFileConfig,
    #[serde(default)]
    pub gateway: GatewayFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub history: HistoryFileConfig,
    #[serde(default)]
    pub shutdown: ShutdownFileConfig,
}

/// Listener settings (lives under `[server]` in relay.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Broker settings (lives under `[broker]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerFileConfig {
    #[serde(default)]
    pub mode: BrokerMode,
    /// Hub endpoint, e.g. `ws://hub:8090/broker`. Required in remote mode.
    #[serde(default)]
    pub url: Option<String>,
    /// Expose this node's local broker at `/broker`.
    #[serde(default)]
    pub serve_hub: bool,
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for BrokerFileConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Local,
            url: None,
            serve_hub: false,
            subscription_buffer: default_subscription_buffer(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Client-facing socket settings (lives under `[gateway]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayFileConfig {
    /// Frames queued per connection before it is dropped as too slow.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for GatewayFileConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Credential settings (lives under `[auth]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// Require a verified identity before `join` and `message`.
    #[serde(default)]
    pub required: bool,
    /// HS256 signing secret. A random one is generated when unset, which
    /// invalidates every token on restart.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_token_ttl_mins")]
    pub token_ttl_mins: u64,
    #[serde(default = "default_allow_registration")]
    pub allow_registration: bool,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            required: false,
            jwt_secret: None,
            token_ttl_mins: default_token_ttl_mins(),
            allow_registration: default_allow_registration(),
        }
    }
}

/// Message history settings (lives under `[history]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryFileConfig {
    #[serde(default = "default_history_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_messages_per_room")]
    pub max_messages_per_room: usize,
}

impl Default for HistoryFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_history_enabled(),
            max_messages_per_room: default_max_messages_per_room(),
        }
    }
}

/// Graceful shutdown settings (lives under `[shutdown]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShutdownFileConfig {
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownFileConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_subscription_buffer() -> usize {
    256
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_outbound_queue() -> usize {
    128
}
fn default_token_ttl_mins() -> u64 {
    60
}
fn default_allow_registration() -> bool {
    true
}
fn default_history_enabled() -> bool {
    true
}
fn default_max_messages_per_room() -> usize {
    500
}
fn default_drain_timeout_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → relay.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_AUTH__REQUIRED=true`  →  `auth.required = true`
///   `RELAY_GATEWAY__OUTBOUND_QUEUE=64`  →  `gateway.outbound_queue = 64`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Listener configuration (runtime view). CLI flags win over the file.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig, host: Option<String>, port: Option<u16>) -> Self {
        Self {
            host: host
                .or_else(|| fc.host.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: port.or(fc.port).unwrap_or(8090),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

/// Broker configuration (runtime view).
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub mode: BrokerMode,
    pub url: Option<String>,
    pub serve_hub: bool,
    pub subscription_buffer: usize,
    pub connect_timeout: Duration,
}

impl BrokerConfig {
    pub fn from_file(fc: &BrokerFileConfig) -> Self {
        Self {
            mode: fc.mode,
            url: fc.url.clone().filter(|u| !u.trim().is_empty()),
            serve_hub: fc.serve_hub,
            subscription_buffer: fc.subscription_buffer.max(1),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs.max(1)),
        }
    }
}

/// Gateway configuration (runtime view).
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub outbound_queue: usize,
}

impl GatewayConfig {
    pub fn from_file(fc: &GatewayFileConfig) -> Self {
        Self {
            outbound_queue: fc.outbound_queue.max(1),
        }
    }
}

/// Authentication configuration (runtime view).
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub required: bool,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub allow_registration: bool,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        let jwt_secret = match fc.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => secret.to_string(),
            None => {
                warn!("auth.jwt_secret not set, generating an ephemeral signing secret");
                format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
            }
        };
        Self {
            required: fc.required,
            jwt_secret,
            token_ttl: Duration::from_secs(fc.token_ttl_mins * 60),
            allow_registration: fc.allow_registration,
        }
    }
}

/// History configuration (runtime view). `None` capacity means disabled.
#[derive(Clone, Debug)]
pub struct HistoryConfig {
    pub max_messages_per_room: Option<usize>,
}

impl HistoryConfig {
    pub fn from_file(fc: &HistoryFileConfig) -> Self {
        Self {
            max_messages_per_room: (fc.enabled && fc.max_messages_per_room > 0)
                .then_some(fc.max_messages_per_room),
        }
    }
}

pub fn drain_timeout(fc: &ShutdownFileConfig) -> Duration {
    Duration::from_secs(fc.drain_timeout_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.broker.mode, BrokerMode::Local);
        assert!(fc.broker.url.is_none());
        assert!(!fc.broker.serve_hub);
        assert_eq!(fc.broker.subscription_buffer, 256);
        assert_eq!(fc.gateway.outbound_queue, 128);
        assert!(!fc.auth.required);
        assert_eq!(fc.auth.token_ttl_mins, 60);
        assert!(fc.auth.allow_registration);
        assert!(fc.history.enabled);
        assert_eq!(fc.history.max_messages_per_room, 500);
        assert_eq!(fc.shutdown.drain_timeout_secs, 10);
    }

    // ── runtime views ───────────────────────────────────────────────────

    #[test]
    fn test_server_config_cli_wins() {
        let fc = ServerFileConfig {
            host: Some("0.0.0.0".into()),
            port: Some(9000),
        };
        let sc = ServerConfig::from_file(&fc, None, Some(7000));
        assert_eq!(sc.host, "0.0.0.0");
        assert_eq!(sc.port, 7000);

        let sc = ServerConfig::from_file(&ServerFileConfig::default(), None, None);
        assert_eq!(sc.socket_addr().unwrap(), "127.0.0.1:8090".parse().unwrap());
    }

    #[test]
    fn test_broker_config_blank_url_is_none() {
        let fc = BrokerFileConfig {
            mode: BrokerMode::Remote,
            url: Some("  ".into()),
            ..Default::default()
        };
        let bc = BrokerConfig::from_file(&fc);
        assert_eq!(bc.mode, BrokerMode::Remote);
        assert!(bc.url.is_none());
        assert_eq!(bc.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_auth_config_from_file() {
        let fc = AuthFileConfig {
            required: true,
            jwt_secret: Some("s3cret".into()),
            token_ttl_mins: 15,
            allow_registration: false,
        };
        let ac = AuthConfig::from_file(&fc);
        assert!(ac.required);
        assert_eq!(ac.jwt_secret, "s3cret");
        assert_eq!(ac.token_ttl, Duration::from_secs(15 * 60));
        assert!(!ac.allow_registration);
    }

    #[test]
    fn test_auth_config_generates_secret() {
        let a = AuthConfig::from_file(&AuthFileConfig::default());
        let b = AuthConfig::from_file(&AuthFileConfig::default());
        assert_eq!(a.jwt_secret.len(), 64);
        assert_ne!(a.jwt_secret, b.jwt_secret);
    }

    #[test]
    fn test_history_disabled() {
        let hc = HistoryConfig::from_file(&HistoryFileConfig {
            enabled: false,
            max_messages_per_room: 500,
        });
        assert!(hc.max_messages_per_room.is_none());

        let hc = HistoryConfig::from_file(&HistoryFileConfig::default());
        assert_eq!(hc.max_messages_per_room, Some(500));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.broker.mode, BrokerMode::Local);
        assert!(fc.server.host.is_none());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[broker]\nmode = \"remote\"\nurl = \"ws://hub:8090/broker\"\n\n[history]\nmax_messages_per_room = 20\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.server.port, Some(9100));
        assert_eq!(fc.broker.mode, BrokerMode::Remote);
        assert_eq!(fc.broker.url.as_deref(), Some("ws://hub:8090/broker"));
        assert_eq!(fc.history.max_messages_per_room, 20);
        assert_eq!(fc.gateway.outbound_queue, 128);
    }

    #[test]
    fn test_load_config_rejects_unknown_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        std::fs::write(&path, "[broker]\nmode = \"carrier-pigeon\"\n").unwrap();
        let result: Result<FileConfig, _> = load_config(Some(&path)).extract();
        assert!(result.is_err());
    }
}
