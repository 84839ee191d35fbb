/// Prefix of locally issued message identifiers
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Replays allowed for a sync queue item before it is left alone
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Minimum gap between two sends (double-tap guard)
pub const SEND_DEBOUNCE_MS: u64 = 300;

/// Pull triggers closer together than this collapse into one request
pub const PULL_DEBOUNCE_SECS: u64 = 10;

/// Periodic sync interval in seconds
pub const SYNC_INTERVAL_SECS: u64 = 60;

/// Timeout for small JSON requests
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Timeout for audio uploads
pub const UPLOAD_TIMEOUT_SECS: u64 = 60;

/// Real-time channel reconnection policy
pub const RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY_MS: u64 = 2_000;

/// Page size of a pull when no marker exists yet
pub const DEFAULT_PULL_LIMIT: u32 = 100;

/// Local retention window in days (0 keeps everything)
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Connectivity probe cadence and timeout
pub const CONNECTIVITY_POLL_SECS: u64 = 5;
pub const PROBE_TIMEOUT_MS: u64 = 3_000;
