//! Server configuration, read from `GRAPHPAD_*` environment variables.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen address.
    pub bind_addr: String,
    /// Clients must report exactly this version on create/join and in
    /// uploaded documents.
    pub protocol_version: u32,
    /// Room-side command buffer interval (ms).
    pub buffer_ms: u64,
    /// Room heartbeat broadcast period (ms).
    pub heartbeat_interval_ms: u64,
    /// Per-client heartbeat watchdog period (ms).
    pub heartbeat_timeout_ms: u64,
    /// Watchdog firings without a heartbeat before disconnect.
    pub max_missed_heartbeats: u32,
    /// Snapshot pump period (ms).
    pub snapshot_interval_ms: u64,
    /// Cap on concurrent rooms.
    pub max_rooms: usize,
    /// Cap on clients per room.
    pub max_clients_per_room: usize,
    /// Command buffer size-based flush threshold.
    pub max_command_batch: usize,
    /// Encoded documents below this many bytes are stored uncompressed.
    pub compression_threshold: usize,
    /// SQLite file path; `:memory:` is allowed for tests.
    pub db_path: String,
    /// Append flushed command batches to the durable command log.
    pub command_log: bool,
    /// Database maintenance sweep period (ms).
    pub db_cleanup_interval_ms: u64,
    /// Command log rows older than this are pruned by the sweep (ms).
    pub command_max_age_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9040".into(),
            protocol_version: 1,
            buffer_ms: 50,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 5_000,
            max_missed_heartbeats: 3,
            snapshot_interval_ms: 30_000,
            max_rooms: 1_000,
            max_clients_per_room: 10,
            max_command_batch: 100,
            compression_threshold: 500,
            db_path: "graphpad.db".into(),
            command_log: false,
            db_cleanup_interval_ms: 3_600_000,
            command_max_age_ms: 86_400_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            bind_addr: env::var("GRAPHPAD_BIND_ADDR").unwrap_or(defaults.bind_addr),
            protocol_version: env_parse("GRAPHPAD_PROTOCOL_VERSION", defaults.protocol_version),
            buffer_ms: env_parse("GRAPHPAD_BUFFER_MS", defaults.buffer_ms),
            heartbeat_interval_ms: env_parse(
                "GRAPHPAD_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            heartbeat_timeout_ms: env_parse(
                "GRAPHPAD_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout_ms,
            ),
            max_missed_heartbeats: env_parse(
                "GRAPHPAD_MAX_MISSED_HEARTBEATS",
                defaults.max_missed_heartbeats,
            ),
            snapshot_interval_ms: env_parse(
                "GRAPHPAD_SNAPSHOT_INTERVAL_MS",
                defaults.snapshot_interval_ms,
            ),
            max_rooms: env_parse("GRAPHPAD_MAX_ROOMS", defaults.max_rooms),
            max_clients_per_room: env_parse(
                "GRAPHPAD_MAX_CLIENTS_PER_ROOM",
                defaults.max_clients_per_room,
            ),
            max_command_batch: env_parse("GRAPHPAD_MAX_COMMAND_BATCH", defaults.max_command_batch),
            compression_threshold: env_parse(
                "GRAPHPAD_COMPRESSION_THRESHOLD",
                defaults.compression_threshold,
            ),
            db_path: env::var("GRAPHPAD_DB_PATH").unwrap_or(defaults.db_path),
            command_log: env_parse("GRAPHPAD_COMMAND_LOG", defaults.command_log),
            db_cleanup_interval_ms: env_parse(
                "GRAPHPAD_DB_CLEANUP_INTERVAL_MS",
                defaults.db_cleanup_interval_ms,
            ),
            command_max_age_ms: env_parse(
                "GRAPHPAD_COMMAND_MAX_AGE_MS",
                defaults.command_max_age_ms,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        // SAFETY: Tests run single-threaded, no concurrent access to env vars
        unsafe {
            env::remove_var("GRAPHPAD_BIND_ADDR");
            env::remove_var("GRAPHPAD_BUFFER_MS");
            env::remove_var("GRAPHPAD_MAX_CLIENTS_PER_ROOM");
            env::remove_var("GRAPHPAD_COMPRESSION_THRESHOLD");
        }

        let config = Config::from_env();
        assert_eq!(config.buffer_ms, 50);
        assert_eq!(config.heartbeat_interval_ms, 1_000);
        assert_eq!(config.heartbeat_timeout_ms, 5_000);
        assert_eq!(config.max_missed_heartbeats, 3);
        assert_eq!(config.snapshot_interval_ms, 30_000);
        assert_eq!(config.max_clients_per_room, 10);
        assert_eq!(config.max_command_batch, 100);
        assert_eq!(config.compression_threshold, 500);
        assert!(!config.command_log);
    }

    #[test]
    fn test_env_override() {
        // SAFETY: see above; uses keys the defaults test does not assert on
        unsafe {
            env::set_var("GRAPHPAD_BIND_ADDR", "0.0.0.0:7777");
            env::set_var("GRAPHPAD_MAX_ROOMS", "5");
        }
        let config = Config::from_env();
        assert_eq!(config.bind_addr, "0.0.0.0:7777");
        assert_eq!(config.max_rooms, 5);
        unsafe {
            env::remove_var("GRAPHPAD_BIND_ADDR");
            env::remove_var("GRAPHPAD_MAX_ROOMS");
        }
    }
}
