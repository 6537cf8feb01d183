use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{Platform, SignalResult, classify_kill_failure, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn terminate_process(pid: u32) -> SignalResult {
        match std::process::Command::new("kill")
            .arg("-15")
            .arg(pid.to_string())
            .output()
        {
            Ok(output) if output.status.success() => SignalResult::Delivered,
            Ok(output) => classify_kill_failure(&String::from_utf8_lossy(&output.stderr)),
            Err(e) => SignalResult::Failed(e.to_string()),
        }
    }

    fn tail_file(path: &Path) -> std::io::Result<std::process::Child> {
        std::process::Command::new("tail")
            .arg("-n")
            .arg("200")
            .arg("-f")
            .arg(path)
            .spawn()
    }

    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }

    fn restrict_file_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".herald"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminating_a_missing_pid_reports_no_such_process() {
        // PIDs near the top of the default pid_max are effectively never allocated.
        let result = NativePlatform::terminate_process(4_194_000);
        assert_eq!(result, SignalResult::NoSuchProcess);
    }

    #[tokio::test]
    async fn terminating_a_live_child_delivers() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert_eq!(NativePlatform::terminate_process(pid), SignalResult::Delivered);
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
