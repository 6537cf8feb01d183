use std::path::{Path, PathBuf};

/// Outcome of asking the OS to terminate a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalResult {
    Delivered,
    /// The process no longer exists (it exited on its own first).
    NoSuchProcess,
    PermissionDenied,
    Failed(String),
}

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Send a termination signal to the process identified by `pid`.
    fn terminate_process(pid: u32) -> SignalResult;

    /// Spawn a child that tails / follows a log file.
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory for herald.
    /// Unix: `~/.herald`, Windows: `%APPDATA%\herald`.
    fn data_dir() -> PathBuf;
}

/// `HERALD_DATA_DIR` wins over the platform default so tests and side-by-side
/// deployments can point at their own state directory.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var("HERALD_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

/// Classify the stderr of a failed `kill`/`taskkill` invocation.
pub(crate) fn classify_kill_failure(stderr: &str) -> SignalResult {
    let lower = stderr.to_lowercase();
    if lower.contains("no such process") || lower.contains("not found") {
        SignalResult::NoSuchProcess
    } else if lower.contains("not permitted") || lower.contains("access is denied") {
        SignalResult::PermissionDenied
    } else {
        SignalResult::Failed(stderr.trim().to_string())
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
