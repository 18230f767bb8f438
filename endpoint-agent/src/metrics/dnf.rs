//! Pending package update count from dnf or yum

use crate::errors::AgentError;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const CANDIDATES: [&str; 2] = ["/usr/bin/dnf", "/usr/bin/yum"];

/// Exit code of `check-update` when updates are available
const UPDATES_AVAILABLE: i32 = 100;

pub fn package_manager() -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
}

/// Count package lines, stopping at the obsoletes section
pub fn count_updates(output: &str) -> u32 {
    let mut count = 0;
    for line in output.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if line.contains("Obsoleting Packages") {
            break;
        }
        count += 1;
    }
    count
}

pub async fn check_update(path: &Path) -> Result<u32, AgentError> {
    let output = Command::new(path)
        .args(["check-update", "-q"])
        .output()
        .await
        .map_err(|e| AgentError::exec_with("dnf: Failed to run check update", e))?;

    match output.status.code() {
        Some(0) => Ok(0),
        Some(UPDATES_AVAILABLE) => Ok(count_updates(&String::from_utf8_lossy(&output.stdout))),
        code => Err(AgentError::exec(format!(
            "dnf: Bad exit code {:?} from dnf check update",
            code
        ))),
    }
}
