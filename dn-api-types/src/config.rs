use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::JobResources;

fn default_true() -> bool {
    true
}

const fn gib(n: u64) -> u64 {
    n * 1024 * 1024 * 1024
}

const fn mib(n: u64) -> u64 {
    n * 1024 * 1024
}

fn default_low_watermark() -> u64 {
    gib(20)
}

fn default_high_watermark() -> u64 {
    gib(10)
}

fn default_trash_cleanup_watermark() -> u64 {
    gib(40)
}

fn default_max_trash_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_trash_check_period() -> Duration {
    Duration::from_secs(10)
}

fn default_read_thread_count() -> usize {
    1
}

fn default_write_thread_count() -> usize {
    1
}

/// Configuration of a single store location (one mount point).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreLocationConfig {
    pub path: PathBuf,

    /// Maximum space chunks may occupy; unlimited when absent.
    #[serde(default)]
    pub quota: Option<u64>,

    /// Below this amount of available space the location reports itself
    /// full and stops accepting new sessions.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: u64,

    /// Writes are rejected unless they leave at least this much space.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: u64,

    /// Trash cleanup starts once available space (net of trash) drops
    /// below this mark.
    #[serde(default = "default_trash_cleanup_watermark")]
    pub trash_cleanup_watermark: u64,

    /// Trashed chunk files older than this are removed unconditionally.
    #[serde(default = "default_max_trash_ttl", with = "serde_duration_secs")]
    pub max_trash_ttl: Duration,

    #[serde(default = "default_trash_check_period", with = "serde_duration_secs")]
    pub trash_check_period: Duration,

    #[serde(default = "default_true")]
    pub enable_blobs: bool,

    #[serde(default = "default_true")]
    pub enable_journals: bool,

    #[serde(default = "default_read_thread_count")]
    pub read_thread_count: usize,

    #[serde(default = "default_write_thread_count")]
    pub write_thread_count: usize,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl StoreLocationConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path: PathBuf = path.into();
        serde_json::from_value(serde_json::json!({ "path": path }))
            .expect("default store location config")
    }
}

/// Configuration of a cache location. Cache chunks are always removed
/// permanently, so there is no trash section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheLocationConfig {
    pub path: PathBuf,

    #[serde(default)]
    pub quota: Option<u64>,

    #[serde(default = "default_low_watermark")]
    pub low_watermark: u64,

    #[serde(default = "default_read_thread_count")]
    pub read_thread_count: usize,

    #[serde(default = "default_write_thread_count")]
    pub write_thread_count: usize,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

fn default_health_check_period() -> Duration {
    Duration::from_secs(60)
}

fn default_health_check_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_health_check_test_size() -> usize {
    mib(1) as usize
}

/// Disk health checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_check_period", with = "serde_duration_secs")]
    pub check_period: Duration,

    #[serde(default = "default_health_check_timeout", with = "serde_duration_secs")]
    pub timeout: Duration,

    /// Number of random bytes written and read back by each probe.
    #[serde(default = "default_health_check_test_size")]
    pub test_size: usize,

    /// Probe with `O_DIRECT | O_SYNC` so the device itself is exercised.
    /// Filesystems without direct I/O support (tmpfs) need this off.
    #[serde(default = "default_true")]
    pub use_direct_io: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_period: default_health_check_period(),
            timeout: default_health_check_timeout(),
            test_size: default_health_check_test_size(),
            use_direct_io: true,
        }
    }
}

fn default_block_cache_capacity() -> u64 {
    gib(1)
}

fn default_younger_size_fraction() -> f64 {
    0.25
}

/// Block cache (SLRU) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockCacheConfig {
    #[serde(default = "default_block_cache_capacity")]
    pub capacity: u64,

    /// Share of the capacity reserved for the probationary segment.
    #[serde(default = "default_younger_size_fraction")]
    pub younger_size_fraction: f64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_block_cache_capacity(),
            younger_size_fraction: default_younger_size_fraction(),
        }
    }
}

fn default_max_peers_per_block() -> usize {
    64
}

fn default_peer_ttl() -> Duration {
    Duration::from_secs(600)
}

/// Peer block directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerTableConfig {
    #[serde(default = "default_max_peers_per_block")]
    pub max_peers_per_block: usize,

    #[serde(default = "default_peer_ttl", with = "serde_duration_secs")]
    pub default_peer_ttl: Duration,
}

impl Default for PeerTableConfig {
    fn default() -> Self {
        Self {
            max_peers_per_block: default_max_peers_per_block(),
            default_peer_ttl: default_peer_ttl(),
        }
    }
}

fn default_max_blocks_per_read() -> u32 {
    100_000
}

fn default_max_bytes_per_read() -> u64 {
    mib(64)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_reader_cache_capacity() -> usize {
    256
}

fn default_bus_out_throttling_limit() -> u64 {
    mib(512)
}

fn default_disk_read_throttling_limit() -> u64 {
    gib(1)
}

fn default_bus_in_throttling_limit() -> u64 {
    mib(512)
}

/// Top level data node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataNodeConfig {
    #[serde(default)]
    pub store_locations: Vec<StoreLocationConfig>,

    #[serde(default)]
    pub cache_locations: Vec<CacheLocationConfig>,

    #[serde(default)]
    pub block_cache: BlockCacheConfig,

    #[serde(default)]
    pub peer_table: PeerTableConfig,

    /// Upper bound on blocks served by a single range read.
    #[serde(default = "default_max_blocks_per_read")]
    pub max_blocks_per_read: u32,

    /// A range read stops adding blocks once this many payload bytes are
    /// accumulated.
    #[serde(default = "default_max_bytes_per_read")]
    pub max_bytes_per_read: u64,

    /// Write sessions without a keepalive for this long are cancelled.
    #[serde(default = "default_session_timeout", with = "serde_duration_secs")]
    pub session_timeout: Duration,

    /// Capacity of the per-node cache of open blob readers.
    #[serde(default = "default_reader_cache_capacity")]
    pub reader_cache_capacity: usize,

    /// Pending outgoing bus bytes above this limit switch read responses
    /// into throttling mode.
    #[serde(default = "default_bus_out_throttling_limit")]
    pub bus_out_throttling_limit: u64,

    #[serde(default = "default_bus_in_throttling_limit")]
    pub bus_in_throttling_limit: u64,

    /// Pending disk read bytes above this limit also trigger throttling.
    #[serde(default = "default_disk_read_throttling_limit")]
    pub disk_read_throttling_limit: u64,

    /// Egress rate limit in bytes per second; unlimited when absent.
    #[serde(default)]
    pub out_throttler_rate: Option<u64>,

    #[serde(default)]
    pub master_connector: MasterConnectorConfig,

    #[serde(default)]
    pub job_controller: JobControllerConfig,
}

impl Default for DataNodeConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("default data node config")
    }
}

fn default_incremental_heartbeat_period() -> Duration {
    Duration::from_secs(5)
}

fn default_register_retry_period() -> Duration {
    Duration::from_secs(3)
}

fn default_lease_ping_period() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_backoff_start() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat_backoff_multiplier() -> f64 {
    2.0
}

/// Master connector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MasterConnectorConfig {
    #[serde(
        default = "default_incremental_heartbeat_period",
        with = "serde_duration_secs"
    )]
    pub incremental_heartbeat_period: Duration,

    /// Delay before a registration retry after a failure or reset.
    #[serde(default = "default_register_retry_period", with = "serde_duration_secs")]
    pub register_retry_period: Duration,

    #[serde(default = "default_lease_ping_period", with = "serde_duration_secs")]
    pub lease_ping_period: Duration,

    #[serde(
        default = "default_heartbeat_backoff_start",
        with = "serde_duration_secs"
    )]
    pub heartbeat_backoff_start: Duration,

    #[serde(default = "default_heartbeat_backoff_max", with = "serde_duration_secs")]
    pub heartbeat_backoff_max: Duration,

    #[serde(default = "default_heartbeat_backoff_multiplier")]
    pub heartbeat_backoff_multiplier: f64,

    /// Node tags sent along with registration.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for MasterConnectorConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("default master connector config")
    }
}

fn default_waiting_jobs_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_overdraft_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_overdraft_check_period() -> Duration {
    Duration::from_secs(1)
}

fn default_job_resources() -> JobResources {
    JobResources {
        replication_slots: 16,
        repair_slots: 4,
        removal_slots: 64,
        seal_slots: 16,
        replication_data_size: gib(10),
        repair_data_size: gib(4),
        memory: gib(4),
        cpu: 1.0,
    }
}

/// Job controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobControllerConfig {
    #[serde(default = "default_job_resources")]
    pub resource_limits: JobResources,

    /// Jobs stuck in the waiting state longer than this are aborted.
    #[serde(default = "default_waiting_jobs_timeout", with = "serde_duration_secs")]
    pub waiting_jobs_timeout: Duration,

    /// How long memory or cpu usage may stay above the limits before the
    /// newest jobs are aborted.
    #[serde(default = "default_overdraft_timeout", with = "serde_duration_secs")]
    pub overdraft_timeout: Duration,

    #[serde(
        default = "default_overdraft_check_period",
        with = "serde_duration_secs"
    )]
    pub overdraft_check_period: Duration,

    /// Mapped memory reserved for the node itself; jobs are aborted when
    /// the mapped total observed by the collector exceeds it.
    #[serde(default)]
    pub reserved_mapped_memory: Option<u64>,

    /// First TCP port handed out to jobs that request ports.
    #[serde(default)]
    pub job_port_base: Option<u16>,

    /// Per-heartbeat budget for terminal job statistics payloads.
    #[serde(default)]
    pub statistics_throttler_rate: Option<u64>,
}

impl Default for JobControllerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("default job controller config")
    }
}

fn default_max_hunk_count_per_read() -> usize {
    1024
}

fn default_max_total_hunk_length_per_read() -> u64 {
    mib(16)
}

/// Limits for one batch of out-of-line hunk fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchHunkReaderConfig {
    #[serde(default = "default_max_hunk_count_per_read")]
    pub max_hunk_count_per_read: usize,

    #[serde(default = "default_max_total_hunk_length_per_read")]
    pub max_total_hunk_length_per_read: u64,
}

impl Default for BatchHunkReaderConfig {
    fn default() -> Self {
        Self {
            max_hunk_count_per_read: default_max_hunk_count_per_read(),
            max_total_hunk_length_per_read: default_max_total_hunk_length_per_read(),
        }
    }
}

/// Durations are stored as integral seconds in config files.
pub mod serde_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: DataNodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_blocks_per_read, 100_000);
        assert_eq!(config.max_bytes_per_read, 64 * 1024 * 1024);
        assert_eq!(config.session_timeout, Duration::from_secs(120));
        assert_eq!(
            config.master_connector.register_retry_period,
            Duration::from_secs(3)
        );

        let location: StoreLocationConfig =
            serde_json::from_str(r#"{ "path": "/mnt/disk0", "max-trash-ttl": 1 }"#).unwrap();
        assert_eq!(location.max_trash_ttl, Duration::from_secs(1));
        assert!(location.enable_blobs);
        assert!(location.high_watermark <= location.low_watermark);
        assert!(location.low_watermark <= location.trash_cleanup_watermark);
    }
}
