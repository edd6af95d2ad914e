use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BIND_DEFAULT: &str = "0.0.0.0:10001";
const WEBSOCKET_PATH_DEFAULT: &str = "/websocket";

/// Top-level configuration for the delivery core.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub groups: GroupConfig,
    #[serde(default)]
    pub ids: IdConfig,
    #[serde(default)]
    pub withdraw: WithdrawConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address the WebSocket listener binds.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Address other servers use to reach this one; published in presence records.
    /// Falls back to `bind` when unset.
    #[serde(default)]
    pub advertise: Option<String>,
    #[serde(default = "default_websocket_path")]
    pub websocket_path: String,
    /// Binary frames above this size close the connection.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Silence after which the server sends a heartbeat probe.
    #[serde(default = "default_idle_probe_seconds")]
    pub idle_probe_seconds: u64,
    /// Silence after which the peer is considered dead.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// Capacity of the bounded dispatch queue between sockets and handlers.
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    /// Per-connection outbound frame buffer.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Capacity of the pool used for connect/teardown side effects and offline replay.
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,
    #[serde(default = "default_session_workers")]
    pub session_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            advertise: None,
            websocket_path: default_websocket_path(),
            max_frame_bytes: default_max_frame_bytes(),
            idle_probe_seconds: default_idle_probe_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            dispatch_queue: default_dispatch_queue(),
            dispatch_workers: default_dispatch_workers(),
            outbound_buffer: default_outbound_buffer(),
            session_queue: default_session_queue(),
            session_workers: default_session_workers(),
        }
    }
}

impl ServerConfig {
    pub fn advertise_or_bind(&self) -> String {
        self.advertise.clone().unwrap_or_else(|| self.bind.clone())
    }

    pub fn idle_probe(&self) -> Duration {
        Duration::from_secs(self.idle_probe_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub connections: ConnectionLimitConfig,
    #[serde(default)]
    pub flow: FlowControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: i64,
    #[serde(default = "default_max_total")]
    pub max_total: i64,
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: i64,
    /// Expiry of the per-IP live-connection counter.
    #[serde(default = "default_ip_ttl_seconds")]
    pub ip_ttl_seconds: u64,
    /// Window of the per-IP connect-rate counter.
    #[serde(default = "default_rate_ttl_seconds")]
    pub rate_ttl_seconds: u64,
}

impl Default for ConnectionLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_per_ip: default_max_per_ip(),
            max_total: default_max_total(),
            max_per_minute: default_max_per_minute(),
            ip_ttl_seconds: default_ip_ttl_seconds(),
            rate_ttl_seconds: default_rate_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowControlConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: i64,
    #[serde(default = "default_max_messages_per_second")]
    pub max_messages_per_second: i64,
    #[serde(default = "default_max_bytes_per_second")]
    pub max_bytes_per_second: i64,
    #[serde(default = "default_throttle_seconds")]
    pub throttle_seconds: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_message_bytes: default_max_message_bytes(),
            max_messages_per_second: default_max_messages_per_second(),
            max_bytes_per_second: default_max_bytes_per_second(),
            throttle_seconds: default_throttle_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Escalating delay ladder; index `min(retry_count, len - 1)`.
    #[serde(default = "default_delays_seconds")]
    pub delays_seconds: Vec<u64>,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a claimed schedule entry stays invisible to other scanners.
    #[serde(default = "default_claim_lease_seconds")]
    pub claim_lease_seconds: u64,
    #[serde(default = "default_retry_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_queue")]
    pub queue: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_retries: default_max_retries(),
            delays_seconds: default_delays_seconds(),
            scan_interval_ms: default_scan_interval_ms(),
            batch_size: default_batch_size(),
            claim_lease_seconds: default_claim_lease_seconds(),
            workers: default_retry_workers(),
            queue: default_retry_queue(),
        }
    }
}

impl RetryConfig {
    pub fn ladder(&self) -> Vec<Duration> {
        self.delays_seconds
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_shard_ttl_seconds")]
    pub shard_ttl_seconds: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            shard_ttl_seconds: default_shard_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdConfig {
    #[serde(default = "default_worker_bits_value")]
    pub datacenter_id: u64,
    #[serde(default = "default_worker_bits_value")]
    pub machine_id: u64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            datacenter_id: default_worker_bits_value(),
            machine_id: default_worker_bits_value(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawConfig {
    #[serde(default = "default_withdraw_window_seconds")]
    pub window_seconds: u64,
}

impl Default for WithdrawConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_withdraw_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    /// HTTP bind for metrics, health and admin endpoints. Disabled when unset.
    #[serde(default)]
    pub metrics_bind: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Shared state backend. Without `redis_url` every collaborator is in-process and the
/// server runs alone.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Namespace for the cluster pub/sub channels.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel_prefix: default_channel_prefix(),
        }
    }
}

impl Config {
    /// Load configuration from a path resolved via IMCORE_CONFIG or defaults to `config/imcore.toml`.
    /// Applies IMCORE_BIND, IMCORE_ADVERTISE, IMCORE_LOG_LEVEL and IMCORE_REDIS_URL after
    /// parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.max_frame_bytes == 0 {
            bail!("server.max_frame_bytes must be > 0");
        }
        if server.dispatch_queue == 0 || server.dispatch_workers == 0 {
            bail!("server dispatch queue and workers must be > 0");
        }
        if server.session_queue == 0 || server.session_workers == 0 {
            bail!("server session queue and workers must be > 0");
        }
        if server.outbound_buffer == 0 {
            bail!("server.outbound_buffer must be > 0");
        }
        if server.idle_probe_seconds == 0 || server.idle_probe_seconds >= server.idle_timeout_seconds
        {
            bail!("server.idle_probe_seconds must be > 0 and below idle_timeout_seconds");
        }
        if !server.websocket_path.starts_with('/') {
            bail!("server.websocket_path must start with '/'");
        }

        let conns = &self.admission.connections;
        if conns.enabled && (conns.max_per_ip <= 0 || conns.max_total <= 0 || conns.max_per_minute <= 0)
        {
            bail!("admission.connections ceilings must be > 0 when enabled");
        }
        let flow = &self.admission.flow;
        if flow.enabled
            && (flow.max_message_bytes <= 0
                || flow.max_messages_per_second <= 0
                || flow.max_bytes_per_second <= 0)
        {
            bail!("admission.flow ceilings must be > 0 when enabled");
        }

        let retry = &self.retry;
        if retry.delays_seconds.is_empty() {
            bail!("retry.delays_seconds must not be empty");
        }
        if retry.delays_seconds.iter().any(|d| *d == 0) {
            bail!("retry.delays_seconds entries must be > 0");
        }
        if retry.max_retries == 0 {
            bail!("retry.max_retries must be > 0");
        }
        if retry.scan_interval_ms == 0 || retry.batch_size == 0 {
            bail!("retry.scan_interval_ms and retry.batch_size must be > 0");
        }
        if retry.workers == 0 || retry.queue == 0 {
            bail!("retry.workers and retry.queue must be > 0");
        }

        if self.groups.shard_ttl_seconds == 0 {
            bail!("groups.shard_ttl_seconds must be > 0");
        }
        if self.ids.datacenter_id > 31 || self.ids.machine_id > 31 {
            bail!("ids.datacenter_id and ids.machine_id must be <= 31");
        }

        let store = &self.store;
        if let Some(url) = &store.redis_url {
            if !["redis://", "rediss://", "unix://"]
                .iter()
                .any(|scheme| url.starts_with(scheme))
            {
                bail!("store.redis_url must use redis://, rediss:// or unix://");
            }
        }
        if store.channel_prefix.is_empty() {
            bail!("store.channel_prefix must not be empty");
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("IMCORE_BIND") {
            self.server.bind = bind;
        }
        if let Ok(advertise) = std::env::var("IMCORE_ADVERTISE") {
            self.server.advertise = Some(advertise);
        }
        if let Ok(level) = std::env::var("IMCORE_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
        if let Ok(url) = std::env::var("IMCORE_REDIS_URL") {
            self.store.redis_url = Some(url);
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("IMCORE_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/imcore.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_channel_prefix() -> String {
    crate::net::redis_cluster::DEFAULT_CHANNEL_PREFIX.to_string()
}

fn default_bind() -> String {
    BIND_DEFAULT.to_string()
}

fn default_websocket_path() -> String {
    WEBSOCKET_PATH_DEFAULT.to_string()
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_idle_probe_seconds() -> u64 {
    25
}

fn default_idle_timeout_seconds() -> u64 {
    45
}

fn default_dispatch_queue() -> usize {
    10_000
}

fn default_dispatch_workers() -> usize {
    16
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_session_queue() -> usize {
    4_096
}

fn default_session_workers() -> usize {
    4
}

fn default_enabled() -> bool {
    true
}

fn default_max_per_ip() -> i64 {
    1_000
}

fn default_max_total() -> i64 {
    100_000
}

fn default_max_per_minute() -> i64 {
    6_000
}

fn default_ip_ttl_seconds() -> u64 {
    3_600
}

fn default_rate_ttl_seconds() -> u64 {
    60
}

fn default_max_message_bytes() -> i64 {
    8_192
}

fn default_max_messages_per_second() -> i64 {
    10_000
}

fn default_max_bytes_per_second() -> i64 {
    102_400
}

fn default_throttle_seconds() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_delays_seconds() -> Vec<u64> {
    vec![5, 30, 300]
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    10_000
}

fn default_claim_lease_seconds() -> u64 {
    30
}

fn default_retry_workers() -> usize {
    8
}

fn default_retry_queue() -> usize {
    1_024
}

fn default_shard_ttl_seconds() -> u64 {
    3_600
}

fn default_worker_bits_value() -> u64 {
    1
}

fn default_withdraw_window_seconds() -> u64 {
    120
}
