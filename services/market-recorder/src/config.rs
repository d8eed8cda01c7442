//! Configuration
//!
//! One TOML file describes every mode the recorder can run in. A mode is
//! a named list of symbols plus a run duration; everything else (network,
//! book, transport, writer, supervisor, storage, status, logging) is
//! shared between modes and fully defaulted.
//!
//! `Config::load` parses, `Config::resolve` validates and turns the file
//! into a `ResolvedConfig` holding the typed per-unit configs that the
//! supervisor and workers take by value.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::ids::Symbol;
use types::market::StreamKind;

use crate::backpressure::{DropPolicy, PublisherConfig};
use crate::engine::{EngineConfig, SequencePolicy};
use crate::metrics::AlertThresholds;
use crate::supervisor::{RestartPolicy, RestartPolicyTable, SupervisorConfig};
use crate::worker::WorkerConfig;
use crate::writer::WriterConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown mode {0:?}")]
    UnknownMode(String),

    #[error("Invalid symbol {symbol:?}: {reason}")]
    InvalidSymbol { symbol: String, reason: String },

    #[error("Symbol {0} has no streams enabled")]
    EmptyStreams(Symbol),

    #[error("Symbol {symbol} lists unknown stream {stream:?}")]
    UnknownStream { symbol: Symbol, stream: String },

    #[error("Symbol {0} is configured more than once")]
    DuplicateSymbol(Symbol),

    #[error("Mode {0:?} has no enabled symbols")]
    NoEnabledSymbols(String),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn default_true() -> bool {
    true
}

fn default_streams() -> Vec<String> {
    StreamKind::SUBSCRIBABLE
        .iter()
        .map(|k| k.as_str().to_string())
        .collect()
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the active entry in `modes`.
    pub mode: String,
    #[serde(default)]
    pub modes: BTreeMap<String, ModeConfig>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub orderbook: OrderBookConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub writer: WriterSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Zero runs until signalled.
    #[serde(default)]
    pub run_duration_secs: u64,
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Publish merged depth snapshots as records.
    #[serde(default = "default_true")]
    pub depth_snapshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub rest_base_url: String,
    pub stream_base_url: String,
    pub request_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub ping_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://fapi.binance.com".to_string(),
            stream_base_url: "wss://fstream.binance.com".to_string(),
            request_timeout_secs: 30,
            reconnect_delay_secs: 5,
            ping_interval_secs: 20,
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBookConfig {
    /// Levels requested from the REST snapshot endpoint.
    pub depth_limit: u32,
    pub buffer_capacity: usize,
    /// Levels kept per side. Zero disables trimming.
    pub max_depth: usize,
    pub resync_threshold: u32,
    pub resync_window_secs: u64,
    pub resync_cooldown_secs: u64,
    pub sequence_policy: SequencePolicy,
    pub summary_interval_secs: u64,
    pub summary_levels: usize,
    /// Persist each summary as a `book_summary` record.
    pub persist_summaries: bool,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            depth_limit: 1000,
            buffer_capacity: 1000,
            max_depth: 1000,
            resync_threshold: 5,
            resync_window_secs: 60,
            resync_cooldown_secs: 5,
            sequence_policy: SequencePolicy::Strict,
            summary_interval_secs: 10,
            summary_levels: 5,
            persist_summaries: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub channel_capacity: usize,
    pub publish_timeout_ms: u64,
    pub outbox_capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
            publish_timeout_ms: 500,
            outbox_capacity: 1000,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSection {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub retry_backoff_ms: u64,
    pub escalate_after_failures: u32,
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval_ms: 1000,
            retry_backoff_ms: 500,
            escalate_after_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub poll_interval_ms: u64,
    pub liveness_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub status_interval_secs: u64,
    pub worker_max_restarts: u32,
    pub worker_restart_backoff_ms: u64,
    /// Unset restarts the writer forever.
    pub writer_max_restarts: Option<u32>,
    pub writer_restart_backoff_ms: u64,
    pub max_records_dropped: u64,
    pub max_sink_failures: u64,
    pub max_resyncs: u64,
    pub max_persist_latency_p99_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let alerts = AlertThresholds::default();
        Self {
            poll_interval_ms: 1000,
            liveness_timeout_secs: 30,
            shutdown_grace_secs: 10,
            status_interval_secs: 10,
            worker_max_restarts: 3,
            worker_restart_backoff_ms: 1000,
            writer_max_restarts: None,
            writer_restart_backoff_ms: 1000,
            max_records_dropped: alerts.max_records_dropped,
            max_sink_failures: alerts.max_sink_failures,
            max_resyncs: alerts.max_resyncs,
            max_persist_latency_p99_ms: alerts.max_persist_latency_p99_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Jsonl,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output: OutputKind,
    pub output_directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output: OutputKind::Jsonl,
            output_directory: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Enables the HTTP status endpoint when set.
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives. Unset defers to the CLI verbosity.
    pub level: Option<String>,
    pub json: bool,
}

/// Validated configuration for one mode.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub mode: String,
    /// `None` runs until signalled.
    pub run_duration: Option<Duration>,
    /// Every configured symbol of the mode, enabled or not.
    pub symbols: Vec<SymbolConfig>,
    /// One entry per enabled symbol.
    pub workers: Vec<WorkerConfig>,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub status_addr: Option<SocketAddr>,
    pub logging: LoggingConfig,
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the active mode and build the per-unit configs.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let mode = self
            .modes
            .get(&self.mode)
            .ok_or_else(|| ConfigError::UnknownMode(self.mode.clone()))?;
        self.validate_numbers()?;

        let mut seen = BTreeSet::new();
        let mut workers = Vec::new();
        for entry in &mode.symbols {
            let symbol = Symbol::try_new(&entry.symbol).map_err(|e| ConfigError::InvalidSymbol {
                symbol: entry.symbol.clone(),
                reason: e.to_string(),
            })?;
            if !seen.insert(symbol.clone()) {
                return Err(ConfigError::DuplicateSymbol(symbol));
            }
            let streams = parse_streams(&symbol, &entry.streams)?;
            if !entry.enabled {
                continue;
            }
            if streams.is_empty() {
                return Err(ConfigError::EmptyStreams(symbol));
            }
            workers.push(self.worker_config(symbol, streams, entry.depth_snapshot));
        }
        if workers.is_empty() {
            return Err(ConfigError::NoEnabledSymbols(self.mode.clone()));
        }

        let status_addr = match &self.status.listen_addr {
            Some(addr) => Some(SocketAddr::from_str(addr).map_err(|e| ConfigError::Invalid {
                field: "status.listen_addr",
                reason: e.to_string(),
            })?),
            None => None,
        };

        Ok(ResolvedConfig {
            mode: self.mode.clone(),
            run_duration: (mode.run_duration_secs > 0)
                .then(|| Duration::from_secs(mode.run_duration_secs)),
            symbols: mode.symbols.clone(),
            workers,
            network: self.network.clone(),
            storage: self.storage.clone(),
            status_addr,
            logging: self.logging.clone(),
            supervisor: self.supervisor_config(),
        })
    }

    fn validate_numbers(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 8] = [
            ("transport.channel_capacity", self.transport.channel_capacity == 0),
            ("transport.outbox_capacity", self.transport.outbox_capacity == 0),
            ("orderbook.buffer_capacity", self.orderbook.buffer_capacity == 0),
            ("orderbook.depth_limit", self.orderbook.depth_limit == 0),
            ("writer.batch_size", self.writer.batch_size == 0),
            ("writer.flush_interval_ms", self.writer.flush_interval_ms == 0),
            ("supervisor.poll_interval_ms", self.supervisor.poll_interval_ms == 0),
            ("network.reconnect_delay_secs", self.network.reconnect_delay_secs == 0),
        ];
        for (field, is_zero) in checks {
            if is_zero {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer_capacity: self.orderbook.buffer_capacity,
            max_depth: self.orderbook.max_depth,
            sequence_policy: self.orderbook.sequence_policy,
            resync_threshold: self.orderbook.resync_threshold,
            resync_window: Duration::from_secs(self.orderbook.resync_window_secs),
        }
    }

    fn worker_config(&self, symbol: Symbol, streams: Vec<StreamKind>, depth_snapshot: bool) -> WorkerConfig {
        let book = &self.orderbook;
        WorkerConfig {
            publish_snapshots: depth_snapshot,
            publish_summaries: book.persist_summaries,
            depth_limit: book.depth_limit,
            reconnect_delay: Duration::from_secs(self.network.reconnect_delay_secs),
            resync_cooldown: Duration::from_secs(book.resync_cooldown_secs),
            summary_interval: Duration::from_secs(book.summary_interval_secs.max(1)),
            summary_levels: book.summary_levels,
            engine: self.engine_config(),
            ..WorkerConfig::new(symbol, streams)
        }
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        let sup = &self.supervisor;
        SupervisorConfig {
            mode: self.mode.clone(),
            poll_interval: Duration::from_millis(sup.poll_interval_ms),
            liveness_timeout: Duration::from_secs(sup.liveness_timeout_secs),
            shutdown_grace: Duration::from_secs(sup.shutdown_grace_secs),
            status_interval: Duration::from_secs(sup.status_interval_secs.max(1)),
            channel_capacity: self.transport.channel_capacity,
            writer: WriterConfig {
                batch_size: self.writer.batch_size,
                flush_interval: Duration::from_millis(self.writer.flush_interval_ms),
                retry_backoff: Duration::from_millis(self.writer.retry_backoff_ms),
                escalate_after_failures: self.writer.escalate_after_failures.max(1),
            },
            publisher: PublisherConfig {
                publish_timeout: Duration::from_millis(self.transport.publish_timeout_ms),
                outbox_capacity: self.transport.outbox_capacity,
                drop_policy: self.transport.drop_policy,
            },
            policies: RestartPolicyTable::new(
                RestartPolicy {
                    max_restarts: sup.writer_max_restarts,
                    backoff: Duration::from_millis(sup.writer_restart_backoff_ms),
                },
                RestartPolicy::bounded(
                    sup.worker_max_restarts,
                    Duration::from_millis(sup.worker_restart_backoff_ms),
                ),
            ),
            alert_thresholds: AlertThresholds {
                max_records_dropped: sup.max_records_dropped,
                max_sink_failures: sup.max_sink_failures,
                max_resyncs: sup.max_resyncs,
                max_persist_latency_p99_ms: sup.max_persist_latency_p99_ms,
            },
        }
    }
}

/// Parse and dedupe a stream list, keeping only subscribable kinds.
fn parse_streams(symbol: &Symbol, names: &[String]) -> Result<Vec<StreamKind>, ConfigError> {
    let mut streams = Vec::new();
    for name in names {
        let kind = StreamKind::from_str(name)
            .ok()
            .filter(|k| StreamKind::SUBSCRIBABLE.contains(k))
            .ok_or_else(|| ConfigError::UnknownStream {
                symbol: symbol.clone(),
                stream: name.clone(),
            })?;
        if !streams.contains(&kind) {
            streams.push(kind);
        }
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode = "live"

[modes.live]
run_duration_secs = 0
symbols = [
    { symbol = "BTCUSDT", streams = ["trade", "depth"] },
    { symbol = "ethusdt", streams = ["depth", "candle"], depth_snapshot = false },
    { symbol = "SOLUSDT", enabled = false },
]

[modes.smoke]
run_duration_secs = 30
symbols = [{ symbol = "BTCUSDT" }]

[orderbook]
sequence_policy = "previous_final"
max_depth = 50

[transport]
channel_capacity = 256

[status]
listen_addr = "127.0.0.1:9100"
"#;

    fn make_config() -> Config {
        Config::parse(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config = make_config();
        assert_eq!(config.network.reconnect_delay_secs, 5);
        assert_eq!(config.writer.batch_size, 500);
        assert_eq!(config.supervisor.worker_max_restarts, 3);
        assert_eq!(config.storage.output, OutputKind::Jsonl);
        assert_eq!(config.transport.channel_capacity, 256);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_resolve_builds_enabled_workers() {
        let resolved = make_config().resolve().unwrap();

        assert_eq!(resolved.mode, "live");
        assert_eq!(resolved.run_duration, None);
        assert_eq!(resolved.symbols.len(), 3);
        assert_eq!(resolved.workers.len(), 2);

        let eth = &resolved.workers[1];
        assert_eq!(eth.symbol.as_str(), "ETHUSDT");
        assert_eq!(eth.streams, vec![StreamKind::Depth, StreamKind::Candle]);
        assert!(!eth.publish_snapshots);
        assert_eq!(eth.engine.max_depth, 50);
        assert_eq!(eth.engine.sequence_policy, SequencePolicy::PreviousFinal);

        assert_eq!(resolved.supervisor.channel_capacity, 256);
        assert_eq!(
            resolved.supervisor.policies.get(crate::supervisor::UnitRole::Worker).max_restarts,
            Some(3)
        );
        assert_eq!(
            resolved.supervisor.policies.get(crate::supervisor::UnitRole::Writer).max_restarts,
            None
        );
        assert_eq!(resolved.status_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_writer_restart_limit_is_optional() {
        let text = format!("{SAMPLE}\n[supervisor]\nwriter_max_restarts = 2\n");
        let resolved = Config::parse(&text).unwrap().resolve().unwrap();
        let writer = resolved.supervisor.policies.get(crate::supervisor::UnitRole::Writer);
        assert_eq!(writer.max_restarts, Some(2));
        assert_eq!(writer.backoff, Duration::from_millis(1000));
    }

    #[test]
    fn test_default_streams_cover_subscribable_kinds() {
        let mut config = make_config();
        config.mode = "smoke".to_string();
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.run_duration, Some(Duration::from_secs(30)));
        assert_eq!(resolved.workers[0].streams, StreamKind::SUBSCRIBABLE.to_vec());
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let mut config = make_config();
        config.mode = "paper".to_string();
        assert!(matches!(config.resolve(), Err(ConfigError::UnknownMode(m)) if m == "paper"));
    }

    #[test]
    fn test_rejects_duplicate_symbol() {
        let mut config = make_config();
        let mode = config.modes.get_mut("live").unwrap();
        mode.symbols.push(SymbolConfig {
            symbol: "btcusdt".to_string(),
            streams: vec!["trade".to_string()],
            enabled: true,
            depth_snapshot: true,
        });
        assert!(matches!(config.resolve(), Err(ConfigError::DuplicateSymbol(_))));
    }

    #[test]
    fn test_rejects_empty_streams_and_unknown_stream() {
        let mut config = make_config();
        config.modes.get_mut("smoke").unwrap().symbols[0].streams.clear();
        config.mode = "smoke".to_string();
        assert!(matches!(config.resolve(), Err(ConfigError::EmptyStreams(_))));

        config.modes.get_mut("smoke").unwrap().symbols[0].streams = vec!["bookTicker".to_string()];
        assert!(matches!(config.resolve(), Err(ConfigError::UnknownStream { .. })));
    }

    #[test]
    fn test_rejects_invalid_symbol() {
        let mut config = make_config();
        config.modes.get_mut("smoke").unwrap().symbols[0].symbol = "BTC USDT".to_string();
        config.mode = "smoke".to_string();
        assert!(matches!(config.resolve(), Err(ConfigError::InvalidSymbol { .. })));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut config = make_config();
        config.transport.channel_capacity = 0;
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::Invalid { field: "transport.channel_capacity", .. })
        ));

        let mut config = make_config();
        config.writer.batch_size = 0;
        assert!(matches!(config.resolve(), Err(ConfigError::Invalid { field: "writer.batch_size", .. })));
    }

    #[test]
    fn test_rejects_mode_without_enabled_symbols() {
        let mut config = make_config();
        config.modes.get_mut("smoke").unwrap().symbols[0].enabled = false;
        config.mode = "smoke".to_string();
        assert!(matches!(config.resolve(), Err(ConfigError::NoEnabledSymbols(_))));
    }

    #[test]
    fn test_shipped_config_resolves() {
        let config = Config::parse(include_str!("../config/default.toml")).unwrap();
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.mode, "live");
        assert_eq!(resolved.workers.len(), 2);
        assert_eq!(resolved.workers[0].engine.sequence_policy, SequencePolicy::PreviousFinal);
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
