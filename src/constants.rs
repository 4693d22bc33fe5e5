//! Default values for the broker core.
//!
//! # Categories
//!
//! - **Queues**: actor and subscriber capacities
//! - **Timing**: debounce window, idle polling, acknowledgement deadline
//! - **Paths**: IPC socket name and limits

use std::time::Duration;

// ============================================================================
// Queues
// ============================================================================

/// Actor task queue length. Producers block when it is full.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Per-subscriber broadcast queue length. A full queue misses updates.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

// ============================================================================
// Timing
// ============================================================================

/// Minimum gap between two broadcasts of the same store.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// How long an idle worker waits for a task before draining compositor
/// events.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(20);

/// Deadline for compositor acknowledgements (roundtrips, configuration
/// results).
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Paths
// ============================================================================

/// IPC socket file name inside `XDG_RUNTIME_DIR`.
pub const SOCKET_NAME: &str = "wlbroker.sock";

/// `sun_path` is 108 bytes on Linux and 104 on macOS; stay under both.
pub const MAX_SOCKET_PATH: usize = 104;

/// Configuration file name inside the config directory.
pub const CONFIG_FILE: &str = "config.json";
