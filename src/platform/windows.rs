use std::path::{Path, PathBuf};

use super::{Platform, SignalResult, classify_kill_failure, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn terminate_process(pid: u32) -> SignalResult {
        match std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output()
        {
            Ok(output) if output.status.success() => SignalResult::Delivered,
            Ok(output) => classify_kill_failure(&String::from_utf8_lossy(&output.stderr)),
            Err(e) => SignalResult::Failed(e.to_string()),
        }
    }

    fn tail_file(path: &Path) -> std::io::Result<std::process::Child> {
        std::process::Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                &format!("Get-Content -Path '{}' -Tail 200 -Wait", path.display()),
            ])
            .spawn()
    }

    fn restrict_dir_permissions(_path: &Path) {}

    fn restrict_file_permissions(_path: &Path) {}

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("herald"),
        )
    }
}
