// Centralized constants for codecell to avoid magic numbers

/// Default number of sandboxes allowed to run at the same time
pub const DEFAULT_MAX_SESSIONS: usize = 4;

/// Default time a request may wait for a free slot before `Overloaded` (30 seconds)
pub const DEFAULT_QUEUE_WAIT_MS: u64 = 30_000;

/// Default number of callers allowed to wait for a slot at once
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 64;

/// Default wall-clock budget for a whole session (30 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Ceiling for caller-supplied timeout overrides (60 seconds)
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Default memory ceiling per session (256 MiB)
pub const DEFAULT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Default relative CPU weight per session
pub const DEFAULT_CPU_SHARES: u64 = 512;

/// Default CPU quota in cores
pub const DEFAULT_CPUS: f64 = 1.0;

/// Default disk quota for the session working directory (64 MiB)
pub const DEFAULT_DISK_BYTES: u64 = 64 * 1024 * 1024;

/// Default process/thread count limit inside a sandbox
pub const DEFAULT_MAX_PROCESSES: u64 = 64;

/// Default capture cap per output stream (64 KiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Largest accepted source text (256 KiB)
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 256 * 1024;

/// Largest accepted input artifact (8 MiB)
pub const DEFAULT_MAX_INPUT_BYTES: usize = 8 * 1024 * 1024;

/// Interval between resource usage probes of a running session
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 100;

/// Size of the scratch `/tmp` tmpfs mounted into container sandboxes
pub const SANDBOX_TMPFS_SIZE: &str = "16m";

/// Appended to a stream whose captured output hit the cap
pub const TRUNCATION_MARKER: &str = "\n[... output truncated ...]\n";

/// Synthetic exit status reported for wall-clock timeouts (matches coreutils `timeout`)
pub const TIMEOUT_EXIT_STATUS: i32 = 124;

/// Synthetic exit status reported when a resource ceiling was hit (128 + SIGKILL)
pub const LIMIT_EXIT_STATUS: i32 = 137;

/// Exit status of a process ended by SIGXCPU at its CPU time rlimit
pub const CPU_RLIMIT_EXIT_STATUS: i32 = 128 + 24;

/// Synthetic exit status reported for sandbox faults
pub const INTERNAL_ERROR_EXIT_STATUS: i32 = 125;

/// Prefix of per-session working directories under the work root
pub const SESSION_DIR_PREFIX: &str = "session-";

/// Label key carrying the owning instance on container sandboxes
pub const INSTANCE_LABEL_KEY: &str = "codecell.instance";

/// Label key carrying the session id on container sandboxes
pub const SESSION_LABEL_KEY: &str = "codecell.session";

/// Default HTTP port for `codecell serve`
pub const DEFAULT_SERVER_PORT: u16 = 8080;
