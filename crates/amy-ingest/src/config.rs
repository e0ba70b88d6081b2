//! Ingest service configuration, loadable from TOML or environment.

use serde::Deserialize;

use amy_mqtt_channel::MqttConfig;

use crate::writer::WriterSettings;

/// Top-level configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// MQTT broker settings.
    pub mqtt: MqttConfig,
    /// Document store settings.
    #[serde(default)]
    pub db: DbConfig,
    /// Data-flow emitter settings.
    #[serde(default)]
    pub dataflow: DataflowConfig,
    /// Dual-write protocol settings.
    #[serde(default)]
    pub writer: WriterConfig,
    /// Resolver cache settings.
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Listener worker pool settings.
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Shutdown drain settings.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_uri")]
    pub uri: String,
    /// Primary database (patients, mappings, histories).
    #[serde(default = "default_db_name")]
    pub name: String,
    /// Audit database (TTL'd provenance records).
    #[serde(default = "default_audit_name")]
    pub audit_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataflowConfig {
    #[serde(default = "default_collector_url")]
    pub collector_url: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_protocol_timeout")]
    pub protocol_timeout_s: u64,
    #[serde(default = "default_stripes")]
    pub per_patient_stripes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Lookup cache TTL; 0 disables the cache.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Handler pool size; defaults to 4 × CPU cores.
    #[serde(default)]
    pub worker_pool: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_drain")]
    pub drain_s: u64,
}

fn default_db_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_db_name() -> String {
    "AMY".to_string()
}

fn default_audit_name() -> String {
    "AMY_audit".to_string()
}

fn default_collector_url() -> String {
    "http://127.0.0.1:8600/data-flow/emit".to_string()
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_protocol_timeout() -> u64 {
    15
}

fn default_stripes() -> usize {
    1024
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_drain() -> u64 {
    10
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            uri: default_db_uri(),
            name: default_db_name(),
            audit_name: default_audit_name(),
        }
    }
}

impl Default for DataflowConfig {
    fn default() -> Self {
        Self {
            collector_url: default_collector_url(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            protocol_timeout_s: default_protocol_timeout(),
            per_patient_stripes: default_stripes(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl_s: default_cache_ttl(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { worker_pool: None }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_s: default_drain(),
        }
    }
}

impl WriterConfig {
    pub fn settings(&self) -> WriterSettings {
        WriterSettings {
            max_retries: self.max_retries,
            protocol_timeout: std::time::Duration::from_secs(self.protocol_timeout_s),
            per_patient_stripes: self.per_patient_stripes,
        }
    }
}

impl ListenerConfig {
    pub fn effective_worker_pool(&self) -> usize {
        self.worker_pool.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            4 * cores
        })
    }
}

impl IngestConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Build from `AMY_*` environment variables (container deployments).
    pub fn from_env() -> Self {
        Self {
            mqtt: MqttConfig::from_env(),
            db: DbConfig {
                uri: std::env::var("AMY_DB_URI").unwrap_or_else(|_| default_db_uri()),
                name: std::env::var("AMY_DB_NAME").unwrap_or_else(|_| default_db_name()),
                audit_name: std::env::var("AMY_DB_AUDIT_NAME")
                    .unwrap_or_else(|_| default_audit_name()),
            },
            dataflow: DataflowConfig {
                collector_url: std::env::var("AMY_COLLECTOR_URL")
                    .unwrap_or_else(|_| default_collector_url()),
                channel_capacity: env_parse("AMY_DATAFLOW_CHANNEL_CAPACITY")
                    .unwrap_or_else(default_channel_capacity),
            },
            writer: WriterConfig {
                max_retries: env_parse("AMY_WRITER_MAX_RETRIES").unwrap_or_else(default_max_retries),
                protocol_timeout_s: env_parse("AMY_WRITER_PROTOCOL_TIMEOUT_S")
                    .unwrap_or_else(default_protocol_timeout),
                per_patient_stripes: env_parse("AMY_WRITER_STRIPES").unwrap_or_else(default_stripes),
            },
            resolver: ResolverConfig {
                cache_ttl_s: env_parse("AMY_RESOLVER_CACHE_TTL_S").unwrap_or_else(default_cache_ttl),
            },
            listener: ListenerConfig {
                worker_pool: env_parse("AMY_LISTENER_WORKER_POOL"),
            },
            shutdown: ShutdownConfig {
                drain_s: env_parse("AMY_SHUTDOWN_DRAIN_S").unwrap_or_else(default_drain),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
