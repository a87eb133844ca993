use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Groups the broker endpoint, the publisher and dispatcher tuning knobs,
/// the worker connection timings, storage and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub publisher: PublisherSettings,
    pub dispatcher: DispatcherSettings,
    pub connection: ConnectionSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the broker endpoint.
///
/// Defines the host and port the websocket broker binds to and workers dial.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr())
    }
}

/// Ordered publisher tuning.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PublisherSettings {
    pub ack_wait_ms: u64,
    pub max_pending: usize,
}

/// Dispatcher loop intervals and recovery backoff.
///
/// A `checkpoint_interval_ms` of zero disables checkpointing.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub checkpoint_interval_ms: u64,
    pub checkpoint_timeout_ms: u64,
    pub stall_timeout_ms: u64,
    pub stall_check_interval_ms: u64,
    pub process_interval_ms: u64,
    pub base_retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
}

/// Worker to orchestrator connection timings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_miss_factor: u32,
    pub node_info_update_interval_ms: u64,
    pub checkpoint_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_max_ms: u64,
}

/// Where durable state (events, checkpoints) lives.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub dispatcher: Option<PartialDispatcherSettings>,
    pub connection: Option<PartialConnectionSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPublisherSettings {
    pub ack_wait_ms: Option<u64>,
    pub max_pending: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDispatcherSettings {
    pub checkpoint_interval_ms: Option<u64>,
    pub checkpoint_timeout_ms: Option<u64>,
    pub stall_timeout_ms: Option<u64>,
    pub stall_check_interval_ms: Option<u64>,
    pub process_interval_ms: Option<u64>,
    pub base_retry_interval_ms: Option<u64>,
    pub max_retry_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConnectionSettings {
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_miss_factor: Option<u32>,
    pub node_info_update_interval_ms: Option<u64>,
    pub checkpoint_interval_ms: Option<u64>,
    pub reconnect_interval_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub reconnect_backoff_base_ms: Option<u64>,
    pub reconnect_backoff_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 4222,
            },
            publisher: PublisherSettings {
                ack_wait_ms: 5_000,
                max_pending: 10_000,
            },
            dispatcher: DispatcherSettings {
                checkpoint_interval_ms: 5_000,
                checkpoint_timeout_ms: 5_000,
                stall_timeout_ms: 5 * 60_000,
                stall_check_interval_ms: 30_000,
                process_interval_ms: 100,
                base_retry_interval_ms: 5_000,
                max_retry_interval_ms: 5 * 60_000,
            },
            connection: ConnectionSettings {
                heartbeat_interval_ms: 15_000,
                heartbeat_miss_factor: 3,
                node_info_update_interval_ms: 60_000,
                checkpoint_interval_ms: 30_000,
                reconnect_interval_ms: 10_000,
                request_timeout_ms: 10_000,
                reconnect_backoff_base_ms: 10_000,
                reconnect_backoff_max_ms: 2 * 60_000,
            },
            storage: StorageSettings {
                path: "fleetlink_db".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `Settings::default()`.
    pub fn merge_with_defaults(self) -> Settings {
        let d = Settings::default();
        let server = self.server.unwrap_or_default();
        let publisher = self.publisher.unwrap_or_default();
        let dispatcher = self.dispatcher.unwrap_or_default();
        let connection = self.connection.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(d.server.host),
                port: server.port.unwrap_or(d.server.port),
            },
            publisher: PublisherSettings {
                ack_wait_ms: publisher.ack_wait_ms.unwrap_or(d.publisher.ack_wait_ms),
                max_pending: publisher.max_pending.unwrap_or(d.publisher.max_pending),
            },
            dispatcher: DispatcherSettings {
                checkpoint_interval_ms: dispatcher
                    .checkpoint_interval_ms
                    .unwrap_or(d.dispatcher.checkpoint_interval_ms),
                checkpoint_timeout_ms: dispatcher
                    .checkpoint_timeout_ms
                    .unwrap_or(d.dispatcher.checkpoint_timeout_ms),
                stall_timeout_ms: dispatcher
                    .stall_timeout_ms
                    .unwrap_or(d.dispatcher.stall_timeout_ms),
                stall_check_interval_ms: dispatcher
                    .stall_check_interval_ms
                    .unwrap_or(d.dispatcher.stall_check_interval_ms),
                process_interval_ms: dispatcher
                    .process_interval_ms
                    .unwrap_or(d.dispatcher.process_interval_ms),
                base_retry_interval_ms: dispatcher
                    .base_retry_interval_ms
                    .unwrap_or(d.dispatcher.base_retry_interval_ms),
                max_retry_interval_ms: dispatcher
                    .max_retry_interval_ms
                    .unwrap_or(d.dispatcher.max_retry_interval_ms),
            },
            connection: ConnectionSettings {
                heartbeat_interval_ms: connection
                    .heartbeat_interval_ms
                    .unwrap_or(d.connection.heartbeat_interval_ms),
                heartbeat_miss_factor: connection
                    .heartbeat_miss_factor
                    .unwrap_or(d.connection.heartbeat_miss_factor),
                node_info_update_interval_ms: connection
                    .node_info_update_interval_ms
                    .unwrap_or(d.connection.node_info_update_interval_ms),
                checkpoint_interval_ms: connection
                    .checkpoint_interval_ms
                    .unwrap_or(d.connection.checkpoint_interval_ms),
                reconnect_interval_ms: connection
                    .reconnect_interval_ms
                    .unwrap_or(d.connection.reconnect_interval_ms),
                request_timeout_ms: connection
                    .request_timeout_ms
                    .unwrap_or(d.connection.request_timeout_ms),
                reconnect_backoff_base_ms: connection
                    .reconnect_backoff_base_ms
                    .unwrap_or(d.connection.reconnect_backoff_base_ms),
                reconnect_backoff_max_ms: connection
                    .reconnect_backoff_max_ms
                    .unwrap_or(d.connection.reconnect_backoff_max_ms),
            },
            storage: StorageSettings {
                path: storage.path.unwrap_or(d.storage.path),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(d.logging.level),
            },
        }
    }
}
