use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::types::status::ResultStatus;
use crate::types::step::{Step, StepResult};

/// The seam to the external step interpreter. Given the step and its parent
/// outputs in declared order (`None` where a parent produced nothing), a
/// runner executes the opaque body and returns its result. The engine never
/// looks inside `code`.
pub trait Runner: Send + Sync {
    fn run(
        &self,
        step: Step,
        inputs: Vec<Option<Vec<u8>>>,
    ) -> BoxFuture<'_, Result<StepResult>>;
}

impl<F, Fut> Runner for F
where
    F: Fn(Step, Vec<Option<Vec<u8>>>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<StepResult>> + Send + 'static,
{
    fn run(
        &self,
        step: Step,
        inputs: Vec<Option<Vec<u8>>>,
    ) -> BoxFuture<'_, Result<StepResult>> {
        Box::pin(self(step, inputs))
    }
}

/// Wraps an async closure as a shared [Runner]. This pins down the
/// closure's return type, which bare coercion to `Arc<dyn Runner>` cannot
/// infer.
pub fn runner_fn<F, Fut>(f: F) -> std::sync::Arc<dyn Runner>
where
    F: Fn(Step, Vec<Option<Vec<u8>>>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<StepResult>> + Send + 'static,
{
    std::sync::Arc::new(f)
}

/// Exit code by which a script defers itself (EX_TEMPFAIL).
pub const EXIT_PENDING: i32 = 75;
/// Exit code by which a script asks to be re-queued fresh.
pub const EXIT_RESET: i32 = 76;
/// Exit code by which a script cancels itself and its descendants.
pub const EXIT_CANCEL: i32 = 77;

/// Runs step bodies as shell scripts. The body is materialized as a
/// `temp_<id>.sh` script in the scratch directory, parent outputs are fed on
/// stdin (a decimal length line then that many raw bytes per parent, `-` for
/// an absent parent), stdout becomes the result data, and the exit code
/// selects the result status.
pub struct ShellRunner {
    scratch_dir: PathBuf,
}

impl ShellRunner {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    async fn run_script(
        &self,
        step: &Step,
        inputs: &[Option<Vec<u8>>],
    ) -> Result<StepResult> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| {
                format!("creating {}", self.scratch_dir.display())
            })?;

        let script = self.scratch_dir.join(format!("temp_{}.sh", step.id));
        tokio::fs::write(&script, &step.code)
            .await
            .with_context(|| format!("writing {}", script.display()))?;

        let mut child = Command::new("sh")
            .arg(&script)
            .env("STEP_ID", &step.id)
            .env("STEP_NAME", &step.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning body of {}", step.id))?;

        {
            let mut stdin = child.stdin.take().context("taking stdin")?;
            let mut feed = Vec::new();
            for input in inputs {
                match input {
                    Some(data) => {
                        feed.extend_from_slice(
                            format!("{}\n", data.len()).as_bytes(),
                        );
                        feed.extend_from_slice(data);
                    },
                    None => feed.extend_from_slice(b"-\n"),
                }
            }
            stdin.write_all(&feed).await.context("feeding inputs")?;
            // dropping stdin closes it so the script sees EOF
        }

        let output =
            child.wait_with_output().await.context("awaiting body")?;

        // best-effort; the cleaner reaps anything left behind
        let _ = tokio::fs::remove_file(&script).await;

        let status = match output.status.code() {
            Some(0) => ResultStatus::Success,
            Some(EXIT_PENDING) => ResultStatus::Pending,
            Some(EXIT_RESET) => ResultStatus::Reset,
            Some(EXIT_CANCEL) => ResultStatus::Cancel,
            code => bail!(
                "step body exited with {:?}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        };

        Ok(StepResult {
            status,
            data: output.stdout,
        })
    }
}

impl Runner for ShellRunner {
    fn run(
        &self,
        step: Step,
        inputs: Vec<Option<Vec<u8>>>,
    ) -> BoxFuture<'_, Result<StepResult>> {
        Box::pin(async move { self.run_script(&step, &inputs).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_with(code: &str) -> Step {
        Step {
            id: "s1".into(),
            name: "s1".into(),
            scope: "default".into(),
            priority: 0,
            timeout: None,
            parents: vec![],
            code: code.into(),
        }
    }

    #[tokio::test]
    async fn test_stdout_becomes_data() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        let result = runner
            .run(step_with("printf hello"), vec![])
            .await
            .unwrap();
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.data, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_exit_codes_select_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        for (code, expect) in [
            (EXIT_PENDING, ResultStatus::Pending),
            (EXIT_RESET, ResultStatus::Reset),
            (EXIT_CANCEL, ResultStatus::Cancel),
        ] {
            let result = runner
                .run(step_with(&format!("exit {code}")), vec![])
                .await
                .unwrap();
            assert_eq!(result.status, expect);
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        let err = runner
            .run(step_with("echo broken >&2; exit 1"), vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_inputs_arrive_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        // first line is the length of the sole parent's output
        let result = runner
            .run(
                step_with("read len; head -c \"$len\""),
                vec![Some(b"parent-bytes".to_vec())],
            )
            .await
            .unwrap();
        assert_eq!(result.data, b"parent-bytes".to_vec());
    }

    #[tokio::test]
    async fn test_script_is_removed_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(dir.path());

        runner.run(step_with("true"), vec![]).await.unwrap();
        assert!(!dir.path().join("temp_s1.sh").exists());
    }
}
