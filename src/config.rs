//! Compile-time-overridable configuration (spec.md §6).
//!
//! The teacher hard-coded these as local constants scattered across
//! `tcb.rs`; here they are collected into one `Config` struct so a stack can
//! carry its own tuning without ambient globals (see the "Global mutable
//! state" re-architecture note).

/// Per-call mailbox capacity. Rounded up to a power of two by [`Config::new`].
pub const DEFAULT_MSG_QUEUE_SIZE: usize = 8;

/// Idle-connection abort, in milliseconds.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 120_000;

/// Maximum segment lifetime, in milliseconds. TIME_WAIT = 2 * MSL.
pub const DEFAULT_MSL_MS: u64 = 30_000;

/// Initial retransmit timeout, in milliseconds.
pub const DEFAULT_RTO_INITIAL_MS: u64 = 3_000;

/// Lower clamp for RTO, in milliseconds.
pub const DEFAULT_RTO_MIN_MS: u64 = 1_000;

/// Upper clamp for RTO, in milliseconds.
pub const DEFAULT_RTO_MAX_MS: u64 = 120_000;

/// Lower clamp for zero-window probe backoff, in milliseconds.
pub const DEFAULT_PROBE_LOWER_BOUND_MS: u64 = 1_000;

/// Upper clamp for zero-window probe backoff, in milliseconds.
pub const DEFAULT_PROBE_UPPER_BOUND_MS: u64 = 60_000;

/// Retransmit attempts before the connection is aborted.
pub const DEFAULT_RETRIES_MAX: u32 = 5;

/// MSS assumed when the peer didn't negotiate one.
pub const DEFAULT_MSS: u16 = 1220;

/// Number of receive-buffer-pool slots (the pool's compile-time capacity C).
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 16;

/// Bytes per receive-buffer-pool slot.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Tunable parameters for a [`crate::TcpStack`].
///
/// All fields default to the values in spec.md §6. Construct with
/// [`Config::default`] and override individual fields, or use
/// [`Config::new`] for the defaults with a validated queue size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub msg_queue_size: usize,
    pub connection_timeout_ms: u64,
    pub msl_ms: u64,
    pub rto_initial_ms: u64,
    pub rto_min_ms: u64,
    pub rto_max_ms: u64,
    pub probe_lower_bound_ms: u64,
    pub probe_upper_bound_ms: u64,
    pub retries_max: u32,
    pub mss_default: u16,
    pub buffer_pool_size: usize,
    pub buffer_size: usize,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// TIME_WAIT duration: 2 * MSL.
    pub fn time_wait_ms(&self) -> u64 {
        2 * self.msl_ms
    }

    /// Rounds `msg_queue_size` up to the next power of two, as spec.md
    /// requires for the mailbox.
    pub fn rounded_queue_size(&self) -> usize {
        self.msg_queue_size.next_power_of_two().max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            msg_queue_size: DEFAULT_MSG_QUEUE_SIZE,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            msl_ms: DEFAULT_MSL_MS,
            rto_initial_ms: DEFAULT_RTO_INITIAL_MS,
            rto_min_ms: DEFAULT_RTO_MIN_MS,
            rto_max_ms: DEFAULT_RTO_MAX_MS,
            probe_lower_bound_ms: DEFAULT_PROBE_LOWER_BOUND_MS,
            probe_upper_bound_ms: DEFAULT_PROBE_UPPER_BOUND_MS,
            retries_max: DEFAULT_RETRIES_MAX,
            mss_default: DEFAULT_MSS,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}
