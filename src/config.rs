//! Protocol constants and timing defaults for Legacy DFU over BLE.

use std::num::NonZeroU16;
use std::time::Duration;

// ============================================================================
// Wire constants
// ============================================================================

/// Every packet characteristic write carries at most this many bytes.
pub const CHUNK_SIZE: usize = 20;

/// Substring of an advertised name that marks a Nordic bootloader
/// (`DfuTarg`, `AdaDFU`, ...). Compared case-insensitively.
pub const BOOTLOADER_NAME_MARKER: &str = "DFU";

// ============================================================================
// Control point timeouts
// ============================================================================

/// Applies to every control point response wait.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Single connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Single GATT read/write/subscribe.
pub const GATT_OP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Pauses inside the command sequence
// ============================================================================

/// Pause between init packet chunks so small write queues do not overflow.
pub const INIT_CHUNK_PAUSE: Duration = Duration::from_millis(20);

/// Pause around the init packet stream.
pub const INIT_SETTLE: Duration = Duration::from_millis(50);

/// How long to keep the link after Activate and Reset.
pub const ACTIVATE_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Discovery
// ============================================================================

/// Scans used to check whether a peripheral already runs its bootloader.
pub const DETECT_SCAN_ATTEMPTS: usize = 3;
pub const DETECT_SCAN_DURATION: Duration = Duration::from_secs(2);
pub const DETECT_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Wait after a reboot trigger before looking for the bootloader.
pub const REBOOT_SETTLE: Duration = Duration::from_millis(1500);

/// Overall budget for finding the rebooted peripheral.
pub const REBOOT_SEARCH_DEADLINE: Duration = Duration::from_secs(30);
pub const REBOOT_SCAN_DURATION: Duration = Duration::from_secs(2);
pub const REBOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Resolving a bare address string to a live advertisement.
pub const RESOLVE_ATTEMPTS: usize = 5;
pub const RESOLVE_SCAN_DURATION: Duration = Duration::from_secs(3);
pub const RESOLVE_RETRY_PAUSE: Duration = Duration::from_secs(1);

// ============================================================================
// Connection supervision
// ============================================================================

pub const CONNECT_ATTEMPTS: usize = 5;

/// Multiplied by the attempt number before each retry.
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(1500);

/// Extra pause after the transport refused a connection.
pub const CONNECT_ERROR_PAUSE: Duration = Duration::from_secs(3);

/// Scans per attempt while looking for a fresh advertisement.
pub const FRESH_SCAN_TRIES: usize = 10;
pub const FRESH_SCAN_DURATION: Duration = Duration::from_secs(2);
pub const FRESH_SCAN_PAUSE: Duration = Duration::from_millis(500);

/// Connection attempts spent on the short-lived reboot trigger link.
pub const TRIGGER_CONNECT_ATTEMPTS: usize = 2;

/// PRN suggested by the CLI. CoreBluetooth rejects transfers (status 0x06)
/// at PRN >= 10, so macOS gets a lower value.
pub fn suggested_prn() -> NonZeroU16 {
    let prn = if cfg!(target_os = "macos") { 8 } else { 10 };
    NonZeroU16::new(prn).unwrap_or(NonZeroU16::MIN)
}

/// Every duration and retry bound the session uses.
#[derive(Debug, Clone)]
pub struct Timings {
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    pub init_chunk_pause: Duration,
    pub init_settle: Duration,
    pub activate_grace: Duration,
    pub detect_scan_attempts: usize,
    pub detect_scan_duration: Duration,
    pub detect_retry_pause: Duration,
    pub reboot_settle: Duration,
    pub reboot_search_deadline: Duration,
    pub reboot_scan_duration: Duration,
    pub reboot_poll_interval: Duration,
    pub resolve_attempts: usize,
    pub resolve_scan_duration: Duration,
    pub resolve_retry_pause: Duration,
    pub connect_attempts: usize,
    pub connect_backoff: Duration,
    pub connect_error_pause: Duration,
    pub fresh_scan_tries: usize,
    pub fresh_scan_duration: Duration,
    pub fresh_scan_pause: Duration,
    pub trigger_connect_attempts: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            response_timeout: RESPONSE_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            init_chunk_pause: INIT_CHUNK_PAUSE,
            init_settle: INIT_SETTLE,
            activate_grace: ACTIVATE_GRACE,
            detect_scan_attempts: DETECT_SCAN_ATTEMPTS,
            detect_scan_duration: DETECT_SCAN_DURATION,
            detect_retry_pause: DETECT_RETRY_PAUSE,
            reboot_settle: REBOOT_SETTLE,
            reboot_search_deadline: REBOOT_SEARCH_DEADLINE,
            reboot_scan_duration: REBOOT_SCAN_DURATION,
            reboot_poll_interval: REBOOT_POLL_INTERVAL,
            resolve_attempts: RESOLVE_ATTEMPTS,
            resolve_scan_duration: RESOLVE_SCAN_DURATION,
            resolve_retry_pause: RESOLVE_RETRY_PAUSE,
            connect_attempts: CONNECT_ATTEMPTS,
            connect_backoff: CONNECT_BACKOFF,
            connect_error_pause: CONNECT_ERROR_PAUSE,
            fresh_scan_tries: FRESH_SCAN_TRIES,
            fresh_scan_duration: FRESH_SCAN_DURATION,
            fresh_scan_pause: FRESH_SCAN_PAUSE,
            trigger_connect_attempts: TRIGGER_CONNECT_ATTEMPTS,
        }
    }
}

/// Caller-tunable session options.
#[derive(Debug, Clone)]
pub struct DfuOptions {
    /// Data chunks sent between packet receipt notifications.
    pub prn: NonZeroU16,
    pub timings: Timings,
}

impl DfuOptions {
    pub fn with_prn(prn: NonZeroU16) -> Self {
        DfuOptions {
            prn,
            timings: Timings::default(),
        }
    }
}
