//! Environment-driven configuration for the three process modes.
//!
//! Every recognized variable has a default matching the deployed system, so
//! a bare `eflow worker` against local servers needs no environment at all.
//! `POSTGRES_*` credentials belong to user step bodies, not the engine;
//! subprocess-mode children inherit the whole environment, so they pass
//! through untouched.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Scope priority list used when `PIPE_WORKER_SCOPES` is unset.
pub const DEFAULT_SCOPES: &str = "production-heavy,production-medium,production-small,testing-heavy,testing-medium,testing-small,default";

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_bool(key: &str) -> bool {
    env::var(key).map(|v| v == "true").unwrap_or(false)
}

/// `STOP_WORKER` is re-read at every loop boundary so an operator can stop a
/// running worker without signalling it.
pub fn stop_worker_requested() -> bool {
    env_bool("STOP_WORKER")
}

#[derive(Clone, Debug)]
pub struct BucketServerConfig {
    pub host: String,
    pub port: u16,
    pub dir: PathBuf,
    pub max_memory: usize,
}

impl BucketServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_str("BUCKET_SERVER_HOST", "0.0.0.0"),
            port: env_parse("BUCKET_SERVER_PORT", 61535),
            dir: PathBuf::from(env_str("BUCKET_SAVE_PATH", ".bucket")),
            max_memory: env_parse("BUCKET_MAX_MEMORY", 50 * 1024 * 1024),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BucketClientConfig {
    pub host: String,
    pub port: u16,
}

impl BucketClientConfig {
    pub fn from_env() -> Self {
        // Redis is a recognized but unsupported alternate backend.
        if env_str("REDIS_HOST", "null") != "null" {
            warn!("REDIS_HOST is set but the redis bucket backend is not supported; using the bucket server");
        }

        Self {
            host: env_str("BUCKET_CLIENT_HOST", "localhost"),
            port: env_parse("BUCKET_CLIENT_PORT", 61535),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Ready steps leased per `get_steps` call.
    pub batch_size: usize,
    /// How long a `pending` step waits before re-entering `queued`.
    pub pending_delay: Duration,
    /// Lease floor: deadline is `now + max(step.timeout, default_lease)`.
    pub default_lease: Duration,
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_str("PIPE_HUB_HOST", "0.0.0.0"),
            port: env_parse("PIPE_WORKER_PORT", 65432),
            db_path: PathBuf::from(env_str("HUB_DB_PATH", ".bue/hub.redb")),
            batch_size: env_parse("HUB_BATCH_SIZE", 50),
            pending_delay: Duration::from_secs(env_parse(
                "HUB_PENDING_DELAY",
                60,
            )),
            default_lease: Duration::from_secs(env_parse(
                "WORKER_JOB_TIMEOUT",
                60 * 60 * 2,
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HubClientConfig {
    pub host: String,
    pub port: u16,
}

impl HubClientConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_str("PIPE_WORKER_HOST", "localhost"),
            port: env_parse("PIPE_WORKER_PORT", 65432),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub scopes: Vec<String>,
    /// Maximum concurrently executing steps.
    pub n_workers: usize,
    pub reverse_priority: bool,
    /// Each step runs in a freshly spawned child process when set.
    pub subprocess_jobs: bool,
    /// Command line used to spawn subprocess-mode children.
    pub job_cmd: String,
    pub restart_interval: Duration,
    pub job_timeout: Duration,
    /// Exit once the queue drains (test toggle).
    pub one_shot: bool,
    /// Exit after a single batch (test toggle).
    pub once: bool,
    pub queue_path: PathBuf,
    pub scratch_dir: PathBuf,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let job_cmd = env::var("WORKER_JOB_CMD").unwrap_or_else(|_| {
            let exe = env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "eflow".to_string());
            format!("{exe} job")
        });

        Self {
            scopes: env_str("PIPE_WORKER_SCOPES", DEFAULT_SCOPES)
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            n_workers: env_parse("N_WORKER_PROCESSES", 15),
            reverse_priority: env_bool("REVERSE_PRIORITY"),
            subprocess_jobs: env_bool("PIPE_WORKER_SUBPROCESS_JOBS"),
            job_cmd,
            restart_interval: Duration::from_secs(env_parse(
                "WORKER_RESTART_INTERVAL",
                60 * 60 * 2,
            )),
            job_timeout: Duration::from_secs(env_parse(
                "WORKER_JOB_TIMEOUT",
                60 * 60 * 2,
            )),
            one_shot: env_bool("WORKER_ONE_SHOT"),
            once: env_bool("WORKER_ONCE"),
            queue_path: PathBuf::from(".bue/worker_queue.queue"),
            scratch_dir: PathBuf::from(".bue/scratch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scope_order() {
        let scopes: Vec<&str> = DEFAULT_SCOPES.split(',').collect();
        assert_eq!(scopes.first(), Some(&"production-heavy"));
        assert_eq!(scopes.last(), Some(&"default"));
        assert_eq!(scopes.len(), 7);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        env::set_var("STEPFLOW_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("STEPFLOW_TEST_PARSE", 15usize), 15);
        env::remove_var("STEPFLOW_TEST_PARSE");
    }
}
