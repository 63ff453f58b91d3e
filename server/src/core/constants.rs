// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "carrier";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "carrier.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "CARRIER_CONFIG";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for the TCP listen address
pub const ENV_TCP_ADDRESS: &str = "CARRIER_TCP_ADDRESS";

/// Environment variable for the TCP listen port
pub const ENV_TCP_PORT: &str = "CARRIER_TCP_PORT";

/// Environment variable for the HTTP listen address
pub const ENV_HTTP_ADDRESS: &str = "CARRIER_HTTP_ADDRESS";

/// Environment variable for the HTTP listen port
pub const ENV_HTTP_PORT: &str = "CARRIER_HTTP_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "CARRIER_LOG";

// =============================================================================
// Environment Variables - Broker
// =============================================================================

/// Environment variable for the per-topic/per-channel buffer bound
pub const ENV_MEM_QUEUE_SIZE: &str = "CARRIER_MEM_QUEUE_SIZE";

/// Environment variable for the ack timeout in seconds
pub const ENV_MSG_TIMEOUT: &str = "CARRIER_MSG_TIMEOUT";

/// Environment variable for enabling the disk spill queue
pub const ENV_SPILL: &str = "CARRIER_SPILL";

/// Environment variable to override the data directory
pub const ENV_DATA_DIR: &str = "CARRIER_DATA_DIR";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default listen host for both transports
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default TCP port for the line protocol
pub const DEFAULT_TCP_PORT: u16 = 5150;

/// Default HTTP port for the ingestion surface
pub const DEFAULT_HTTP_PORT: u16 = 5151;

// =============================================================================
// Shutdown
// =============================================================================

/// How long shutdown waits for registered background tasks
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Grace period for in-flight HTTP handlers after shutdown is triggered
pub const HTTP_SHUTDOWN_GRACE_SECS: u64 = 10;
