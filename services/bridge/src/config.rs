//! Bridge configuration loading.
//!
//! YAML is the sole config source.  Default config path:
//! `/etc/acs-bridge/config.yaml`.
//!
//! # Required fields
//! - At least one entry under `tenants`
//! - Every `objects[].terminals[].tenant` must name a configured tenant
//!
//! Everything else has a default; see the individual types.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub isapi: IsapiConfig,
    pub features: FeaturesConfig,
    pub tenants: Vec<TenantConfig>,
    pub terminals: Vec<TerminalConfig>,
    pub hikvision: HikvisionConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// ISUP TCP listener bind host.
    pub host: String,
    /// ISUP TCP listener port.
    pub port: u16,
    pub health_check_port: u16,
    pub log_level: String,
    /// Directory for pending-event files; created at startup.
    pub storage_path: PathBuf,
    pub max_pending_days: u32,
    /// Frames with `28 + data_length` above this close the connection.
    pub max_frame_len: usize,
    pub idle_timeout_secs: u64,
    pub retry_interval_secs: u64,
    /// Per-attempt upstream dispatch timeout.
    pub dispatch_timeout_secs: u64,
    /// Reject frames with a bad CRC (close the connection) instead of
    /// logging and proceeding.
    pub strict_crc: bool,
}

#[derive(Debug, Clone)]
pub struct IsapiConfig {
    /// Webhook HTTP listener bind host.
    pub host: String,
    pub port: u16,
    pub webhook_path: String,
    pub webhook_secret: Option<String>,
    /// Externally reachable base URL advertised to devices at provisioning.
    pub webhook_base_url: Option<String>,
    /// Event types enabled during provisioning.
    pub event_types: Vec<String>,
    /// Default ISAPI credentials for terminals without their own.
    pub username: String,
    pub password: String,
    /// Odd readerID means entry (site wiring convention); false inverts.
    pub odd_reader_in: bool,
    /// minorEventType values that count as a granted access.
    pub success_minor_types: Vec<String>,
    pub correlation_ttl_secs: u64,
    pub alert_stream_reconnect_secs: u64,
    pub alert_stream_heartbeat_secs: u64,
}

#[derive(Debug, Clone)]
pub struct FeaturesConfig {
    pub auto_configure_terminals: bool,
}

/// Upstream credentials for one tenant.
#[derive(Debug, Clone)]
pub enum UpstreamAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub name: String,
    pub upstream_url: String,
    pub auth: UpstreamAuth,
    pub object_id: Option<String>,
}

/// One access terminal bound to a tenant by MAC.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub ip: String,
    pub port: u16,
    pub mac: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMode {
    AlertStream,
    Callback,
}

#[derive(Debug, Clone)]
pub struct HikvisionDevice {
    pub ip: String,
    pub username: String,
    pub password: String,
    pub mode: DeviceMode,
}

#[derive(Debug, Clone)]
pub struct HikvisionConfig {
    pub devices: Vec<HikvisionDevice>,
    /// Externally reachable address devices should post callbacks to.
    /// Overrides `isapi.webhook_base_url` at provisioning time; the route
    /// itself is served by the one webhook listener either way.
    pub callback_host: Option<String>,
    /// Port advertised with `callback_host`; defaults to `isapi.port`.
    pub callback_port: Option<u16>,
    /// Extra webhook route used by cameras configured via the device
    /// manager; served by the same listener as `isapi.webhook_path`.
    pub callback_path: String,
    pub callback_secret: Option<String>,
    pub allowed_device_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Raw YAML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    isapi: Option<RawIsapiConfig>,
    features: Option<RawFeaturesConfig>,
    tenants: Option<BTreeMap<String, RawTenantConfig>>,
    objects: Option<Vec<RawObjectConfig>>,
    hikvision: Option<RawHikvisionConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServerConfig {
    host: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    log_level: Option<String>,
    storage_path: Option<String>,
    max_pending_days: Option<u32>,
    max_frame_len: Option<usize>,
    idle_timeout_secs: Option<u64>,
    retry_interval_secs: Option<u64>,
    dispatch_timeout_secs: Option<u64>,
    strict_crc: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIsapiConfig {
    host: Option<String>,
    port: Option<u16>,
    webhook_path: Option<String>,
    webhook_secret: Option<String>,
    webhook_base_url: Option<String>,
    event_types: Option<Vec<String>>,
    username: Option<String>,
    password: Option<String>,
    odd_reader_in: Option<bool>,
    success_minor_types: Option<Vec<String>>,
    correlation_ttl_secs: Option<u64>,
    alert_stream_reconnect_secs: Option<u64>,
    alert_stream_heartbeat_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFeaturesConfig {
    auto_configure_terminals: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawTenantConfig {
    upstream_url: Option<String>,
    auth: Option<RawAuthConfig>,
    object_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    #[serde(rename = "type")]
    kind: Option<String>,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawObjectConfig {
    object_id: Option<String>,
    terminals: Option<Vec<RawTerminalConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawTerminalConfig {
    ip: Option<String>,
    port: Option<u16>,
    mac: Option<String>,
    username: Option<String>,
    password: Option<String>,
    tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHikvisionConfig {
    devices: Option<Vec<RawHikvisionDevice>>,
    callback: Option<RawCallbackConfig>,
    allowed_device_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawHikvisionDevice {
    ip: Option<String>,
    username: Option<String>,
    password: Option<String>,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCallbackConfig {
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load bridge config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    load_config_from_str(&yaml)
}

/// Load bridge config from a YAML string.
pub fn load_config_from_str(yaml: &str) -> Result<BridgeConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml)?;

    let server = build_server(raw.server);
    let isapi = build_isapi(raw.isapi);
    let features = FeaturesConfig {
        auto_configure_terminals: raw
            .features
            .and_then(|f| f.auto_configure_terminals)
            .unwrap_or(false),
    };

    // Tenants
    let raw_tenants = raw
        .tenants
        .ok_or_else(|| ConfigError::missing("tenants"))?;
    if raw_tenants.is_empty() {
        return Err(ConfigError::bad_value(
            "tenants",
            "at least one tenant is required",
        ));
    }
    let mut tenants = Vec::with_capacity(raw_tenants.len());
    for (name, t) in raw_tenants {
        let upstream_url = t
            .upstream_url
            .ok_or_else(|| ConfigError::missing(format!("tenants.{}.upstream_url", name)))?;
        let auth = build_auth(&name, t.auth)?;
        tenants.push(TenantConfig {
            name,
            upstream_url,
            auth,
            object_id: t.object_id,
        });
    }

    // Terminals
    let mut terminals = Vec::new();
    for (oi, obj) in raw.objects.unwrap_or_default().into_iter().enumerate() {
        for (ti, term) in obj.terminals.unwrap_or_default().into_iter().enumerate() {
            let label = format!("objects[{}].terminals[{}]", oi, ti);
            let ip = term
                .ip
                .ok_or_else(|| ConfigError::missing(format!("{}.ip", label)))?;
            let mac = term
                .mac
                .ok_or_else(|| ConfigError::missing(format!("{}.mac", label)))?;
            let tenant = term
                .tenant
                .ok_or_else(|| ConfigError::missing(format!("{}.tenant", label)))?;
            if !tenants.iter().any(|t| t.name == tenant) {
                return Err(ConfigError::bad_value(
                    format!("{}.tenant", label),
                    format!("unknown tenant '{}'", tenant),
                ));
            }
            terminals.push(TerminalConfig {
                ip,
                port: term.port.unwrap_or(80),
                mac,
                username: term.username,
                password: term.password,
                tenant,
            });
        }
    }

    // Hikvision devices + callback
    let raw_hik = raw.hikvision;
    let hikvision = match raw_hik {
        Some(h) => {
            let mut devices = Vec::new();
            for (i, d) in h.devices.unwrap_or_default().into_iter().enumerate() {
                let label = format!("hikvision.devices[{}]", i);
                let ip = d
                    .ip
                    .ok_or_else(|| ConfigError::missing(format!("{}.ip", label)))?;
                let mode = match d.mode.as_deref() {
                    None | Some("alert_stream") => DeviceMode::AlertStream,
                    Some("callback") => DeviceMode::Callback,
                    Some(other) => {
                        return Err(ConfigError::bad_value(
                            format!("{}.mode", label),
                            format!("expected alert_stream or callback, got '{}'", other),
                        ));
                    }
                };
                devices.push(HikvisionDevice {
                    ip,
                    username: d.username.unwrap_or_else(|| isapi.username.clone()),
                    password: d.password.unwrap_or_else(|| isapi.password.clone()),
                    mode,
                });
            }
            let callback = h.callback;
            HikvisionConfig {
                devices,
                callback_host: callback.as_ref().and_then(|c| c.host.clone()),
                callback_port: callback.as_ref().and_then(|c| c.port),
                callback_path: callback
                    .as_ref()
                    .and_then(|c| c.path.clone())
                    .unwrap_or_else(|| "/hikvision/callback".to_owned()),
                callback_secret: callback.and_then(|c| c.secret),
                allowed_device_ids: h.allowed_device_ids.unwrap_or_default(),
            }
        }
        None => HikvisionConfig {
            devices: Vec::new(),
            callback_host: None,
            callback_port: None,
            callback_path: "/hikvision/callback".to_owned(),
            callback_secret: None,
            allowed_device_ids: Vec::new(),
        },
    };

    Ok(BridgeConfig {
        server,
        isapi,
        features,
        tenants,
        terminals,
        hikvision,
    })
}

// ---------------------------------------------------------------------------
// Section builders
// ---------------------------------------------------------------------------

fn build_server(raw: Option<RawServerConfig>) -> ServerConfig {
    let raw = raw.unwrap_or_default();
    ServerConfig {
        host: raw.host.unwrap_or_else(|| "0.0.0.0".to_owned()),
        port: raw.port.unwrap_or(8001),
        health_check_port: raw.health_check_port.unwrap_or(8081),
        log_level: raw.log_level.unwrap_or_else(|| "info".to_owned()),
        storage_path: PathBuf::from(
            raw.storage_path.unwrap_or_else(|| "./data/pending".to_owned()),
        ),
        max_pending_days: raw.max_pending_days.unwrap_or(30),
        max_frame_len: raw.max_frame_len.unwrap_or(8192),
        idle_timeout_secs: raw.idle_timeout_secs.unwrap_or(30),
        retry_interval_secs: raw.retry_interval_secs.unwrap_or(10),
        dispatch_timeout_secs: raw.dispatch_timeout_secs.unwrap_or(5),
        strict_crc: raw.strict_crc.unwrap_or(true),
    }
}

fn build_isapi(raw: Option<RawIsapiConfig>) -> IsapiConfig {
    let raw = raw.unwrap_or_default();
    IsapiConfig {
        host: raw.host.unwrap_or_else(|| "0.0.0.0".to_owned()),
        port: raw.port.unwrap_or(8002),
        webhook_path: raw
            .webhook_path
            .unwrap_or_else(|| "/ISAPI/Event/notification/alert".to_owned()),
        webhook_secret: raw.webhook_secret,
        webhook_base_url: raw.webhook_base_url,
        event_types: raw.event_types.unwrap_or_else(default_event_types),
        username: raw.username.unwrap_or_default(),
        password: raw.password.unwrap_or_default(),
        odd_reader_in: raw.odd_reader_in.unwrap_or(true),
        success_minor_types: raw
            .success_minor_types
            .unwrap_or_else(|| vec!["1".to_owned()]),
        correlation_ttl_secs: raw.correlation_ttl_secs.unwrap_or(30),
        alert_stream_reconnect_secs: raw.alert_stream_reconnect_secs.unwrap_or(5),
        alert_stream_heartbeat_secs: raw.alert_stream_heartbeat_secs.unwrap_or(60),
    }
}

fn default_event_types() -> Vec<String> {
    [
        "faceMatch",
        "cardSwipe",
        "qrCode",
        "AccessGranted",
        "AccessDenied",
        "MinorEvent",
        "CaptureUpload",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect()
}

fn build_auth(tenant: &str, raw: Option<RawAuthConfig>) -> Result<UpstreamAuth, ConfigError> {
    let raw = raw.ok_or_else(|| ConfigError::missing(format!("tenants.{}.auth", tenant)))?;
    match raw.kind.as_deref() {
        Some("basic") => Ok(UpstreamAuth::Basic {
            username: raw.username.ok_or_else(|| {
                ConfigError::missing(format!("tenants.{}.auth.username", tenant))
            })?,
            password: raw.password.unwrap_or_default(),
        }),
        Some("bearer") => Ok(UpstreamAuth::Bearer {
            token: raw
                .token
                .ok_or_else(|| ConfigError::missing(format!("tenants.{}.auth.token", tenant)))?,
        }),
        Some(other) => Err(ConfigError::bad_value(
            format!("tenants.{}.auth.type", tenant),
            format!("expected basic or bearer, got '{}'", other),
        )),
        None => Err(ConfigError::missing(format!("tenants.{}.auth.type", tenant))),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Config load failure; `key` always names the offending YAML entry so the
/// operator can fix it without reading source.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("config is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config key '{0}' is required but missing")]
    MissingKey(String),
    #[error("config key '{key}': {reason}")]
    BadValue { key: String, reason: String },
}

impl ConfigError {
    fn missing(key: impl Into<String>) -> ConfigError {
        ConfigError::MissingKey(key.into())
    }

    fn bad_value(key: impl Into<String>, reason: impl Into<String>) -> ConfigError {
        ConfigError::BadValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
