use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

/// Age past which a leftover runner script is fair game.
pub const TEMP_FILE_LIFETIME: Duration = Duration::from_secs(60 * 60 * 3);

/// Time between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 10);

/// Periodically removes runner scripts that a crashed or killed step left
/// behind. Sweeps the top level of the working directory and the scratch
/// directory. Runs until the owning task is cancelled.
pub async fn run(work_dir: PathBuf, scratch_dir: PathBuf, lifetime: Duration) {
    loop {
        sweep(&work_dir, lifetime).await;
        sweep(&scratch_dir, lifetime).await;
        tokio::time::sleep(SWEEP_INTERVAL).await;
    }
}

/// Removes stale `temp_*.sh` files directly under `dir`.
pub async fn sweep(dir: &Path, lifetime: Duration) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if is_stale_script(&path, lifetime) {
            debug!(path = %path.display(), "removing stale script");
            if let Err(error) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), %error, "failed to remove");
            }
        }
    }
}

/// A hanging runner script: `temp_` prefix, the runner extension, and a
/// modification time older than `lifetime`.
fn is_stale_script(path: &Path, lifetime: Duration) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if !name.starts_with("temp_") || !name.ends_with(".sh") {
        return false;
    }

    let Ok(modified) = path.metadata().and_then(|m| m.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > lifetime)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_removes_only_stale_scripts() {
        let dir = tempfile::tempdir().unwrap();

        for name in ["temp_a.sh", "temp_b.txt", "keeper.sh", "output.json"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        // everything is brand new, so a long lifetime removes nothing
        sweep(dir.path(), TEMP_FILE_LIFETIME).await;
        assert!(dir.path().join("temp_a.sh").exists());

        // with a zero lifetime, only the temp_*.sh file qualifies
        tokio::time::sleep(Duration::from_millis(20)).await;
        sweep(dir.path(), Duration::ZERO).await;

        assert!(!dir.path().join("temp_a.sh").exists());
        assert!(dir.path().join("temp_b.txt").exists());
        assert!(dir.path().join("keeper.sh").exists());
        assert!(dir.path().join("output.json").exists());
    }

    #[tokio::test]
    async fn test_sweep_ignores_missing_directory() {
        // must not error or panic
        sweep(Path::new("/definitely/not/here"), Duration::ZERO).await;
    }
}
