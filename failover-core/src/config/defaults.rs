//! Default configuration values
//!
//! The timing values are the empirically tuned constants of the two-node
//! failback protocol. They are kept as named defaults so deployments can
//! override them without touching the engine.

use std::time::Duration;

// Script locations
pub const DEFAULT_RESOURCE_MANAGER: &str = "/usr/share/heartbeat/ResourceManager";
pub const DEFAULT_NOTIFY_SCRIPT: &str = "/etc/ha.d/harc";
pub const DEFAULT_NOTIFY_DIR: &str = "/etc/ha.d/rc.d";

// Failback defaults
pub const DEFAULT_NICE_FAILBACK: bool = true;
pub const DEFAULT_AUTO_FAILBACK: bool = false;
pub const DEFAULT_MANAGE_RESOURCES: bool = true;

// Standby negotiation
pub const DEFAULT_STANDBY_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STANDBY_RESOURCE_TIMEOUT_SECS: u64 = 60 * 60;

// Startup
pub const DEFAULT_LOCAL_TAKEOVER_DELAY_SECS: u64 = 10;

// Fencing
pub const DEFAULT_FENCE_RETRY_DELAY_SECS: u64 = 5;
pub const DEFAULT_FENCE_STATUS_INTERVAL_SECS: u64 = 60 * 60;
pub const FENCE_BAD_HOST_EXIT_CODE: i32 = 100;

// Event loop
pub const DEFAULT_FAILBACK_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_FINAL_SHUTDOWN_DELAY_MS: u64 = 1_000;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 200;

// Logging
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const fn duration_ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub const fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
