use super::command::ToolCommand;
use super::process::{spawn_in_group, terminate_group};
use super::stderr::{drain_stderr, StderrCapture};
use crate::runtime::{CancelScope, Interruption};
use crate::utils::errors::{EngineError, Result};
use futures_util::future::join_all;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Upper bound on the stdout of catalog queries
const MAX_QUERY_OUTPUT: u64 = 16 * 1024 * 1024;

/// One spawned tool with its stderr drain
struct Running {
    tool: String,
    child: Child,
    stderr: Option<JoinHandle<StderrCapture>>,
}

impl Running {
    async fn spawn(command: &ToolCommand, cmd: &mut tokio::process::Command) -> Result<Self> {
        let tool = command.name();
        let mut child = spawn_in_group(cmd, &tool).await?;
        let stderr = child.stderr.take().map(|s| tokio::spawn(drain_stderr(s)));
        Ok(Self { tool, child, stderr })
    }

    async fn take_stderr(&mut self) -> StderrCapture {
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => StderrCapture::default(),
        }
    }
}

enum Outcome {
    Exited(Vec<std::io::Result<ExitStatus>>),
    Interrupted(Interruption),
}

/// Runs external tools under a cancellation scope.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    grace: Duration,
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl PipelineExecutor {
    /// `grace` is the pause between SIGTERM and SIGKILL on cancellation
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Run a tool that writes `output_path` itself (`pg_dump -f`).
    pub async fn run_single(&self, scope: &CancelScope, command: &ToolCommand, output_path: &Path) -> Result<()> {
        scope.check()?;
        debug!(command = %command, "Running tool");
        let mut cmd = command.to_command();
        let mut procs = vec![Running::spawn(command, &mut cmd).await?];
        self.supervise(scope, &mut procs).await?;
        verify_output(&command.name(), output_path)
    }

    /// `producer | consumer > output_path`. The consumer is started first so
    /// the producer never writes into an unconnected pipe.
    pub async fn run_pipeline(
        &self,
        scope: &CancelScope,
        producer: &ToolCommand,
        consumer: &ToolCommand,
        output_path: &Path,
    ) -> Result<()> {
        scope.check()?;
        debug!(producer = %producer, consumer = %consumer, output = %output_path.display(), "Running pipeline");

        let output = std::fs::File::create(output_path)?;
        let mut consumer_cmd = consumer.to_command();
        consumer_cmd.stdin(Stdio::piped()).stdout(Stdio::from(output));
        let mut consumer_proc = Running::spawn(consumer, &mut consumer_cmd).await?;

        let mut producer_cmd = producer.to_command();
        producer_cmd.stdout(Stdio::piped());
        let mut producer_proc = match Running::spawn(producer, &mut producer_cmd).await {
            Ok(p) => p,
            Err(e) => {
                terminate_group(&mut consumer_proc.child, self.grace).await;
                return Err(e);
            }
        };

        let relay = match (producer_proc.child.stdout.take(), consumer_proc.child.stdin.take()) {
            (Some(mut from), Some(mut to)) => Some(tokio::spawn(async move {
                // dropping `to` closes the consumer's stdin
                tokio::io::copy(&mut from, &mut to).await
            })),
            _ => None,
        };

        let mut procs = vec![producer_proc, consumer_proc];
        self.supervise(scope, &mut procs).await?;
        if let Some(relay) = relay {
            match relay.await {
                Ok(Ok(bytes)) => debug!(bytes, "Pipeline relay finished"),
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(EngineError::Io(std::io::Error::other(e))),
            }
        }
        verify_output(&consumer.name(), output_path)
    }

    /// Feed `input` into the tool's stdin (`gunzip`ped SQL into psql).
    pub async fn run_with_stdin<R>(&self, scope: &CancelScope, command: &ToolCommand, input: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        scope.check()?;
        debug!(command = %command, "Running tool with streamed stdin");
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::piped());
        let mut proc = Running::spawn(command, &mut cmd).await?;

        let feeder = proc.child.stdin.take().map(|mut stdin| {
            let mut input = input;
            tokio::spawn(async move { tokio::io::copy(&mut input, &mut stdin).await })
        });

        let mut procs = vec![proc];
        self.supervise(scope, &mut procs).await?;
        if let Some(feeder) = feeder {
            if let Ok(Err(e)) = feeder.await {
                // the tool exited 0, so it stopped reading on purpose
                debug!(error = %e, "Stdin feed ended early");
            }
        }
        Ok(())
    }

    /// Redirect the tool's stdout into `output_path`, appending when asked.
    pub async fn run_to_file(
        &self,
        scope: &CancelScope,
        command: &ToolCommand,
        output_path: &Path,
        append: bool,
    ) -> Result<()> {
        scope.check()?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(output_path)?;
        let mut cmd = command.to_command();
        cmd.stdout(Stdio::from(file));
        let mut procs = vec![Running::spawn(command, &mut cmd).await?];
        self.supervise(scope, &mut procs).await
    }

    /// Run a tool for its side effect only.
    pub async fn run_status(&self, scope: &CancelScope, command: &ToolCommand) -> Result<()> {
        scope.check()?;
        debug!(command = %command, "Running tool");
        let mut cmd = command.to_command();
        let mut procs = vec![Running::spawn(command, &mut cmd).await?];
        self.supervise(scope, &mut procs).await
    }

    /// Run a short query tool and return its non-empty stdout lines.
    pub async fn run_lines(&self, scope: &CancelScope, command: &ToolCommand) -> Result<Vec<String>> {
        scope.check()?;
        let mut cmd = command.to_command();
        cmd.stdout(Stdio::piped());
        let mut proc = Running::spawn(command, &mut cmd).await?;

        let reader = proc.child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut out = String::new();
                stdout.take(MAX_QUERY_OUTPUT).read_to_string(&mut out).await.map(|_| out)
            })
        });

        let mut procs = vec![proc];
        self.supervise(scope, &mut procs).await?;
        let output = match reader {
            Some(handle) => handle
                .await
                .map_err(|e| EngineError::Io(std::io::Error::other(e)))??,
            None => String::new(),
        };
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Wait for every process; on interruption terminate all process groups.
    /// The first process (in pipeline order) that failed is reported.
    async fn supervise(&self, scope: &CancelScope, procs: &mut [Running]) -> Result<()> {
        let outcome = {
            let waits = join_all(procs.iter_mut().map(|p| p.child.wait()));
            tokio::select! {
                statuses = waits => Outcome::Exited(statuses),
                reason = scope.done() => Outcome::Interrupted(reason),
            }
        };

        let statuses = match outcome {
            Outcome::Exited(statuses) => statuses,
            Outcome::Interrupted(reason) => {
                for p in procs.iter_mut() {
                    info!(tool = %p.tool, ?reason, "Terminating process group");
                    terminate_group(&mut p.child, self.grace).await;
                }
                return Err(reason.into());
            }
        };

        let mut failure = None;
        for (p, status) in procs.iter_mut().zip(statuses) {
            let status = status?;
            let capture = p.take_stderr().await;
            if !status.success() && failure.is_none() {
                failure = Some(EngineError::ToolFailure {
                    tool: p.tool.clone(),
                    exit_code: status.code(),
                    stderr: capture.last_line().unwrap_or_default().to_string(),
                });
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A successful run must leave a non-empty output file behind
fn verify_output(tool: &str, output_path: &Path) -> Result<()> {
    match std::fs::metadata(output_path) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(EngineError::ToolFailure {
            tool: tool.to_string(),
            exit_code: Some(0),
            stderr: format!("{} is empty", output_path.display()),
        }),
        Err(_) => Err(EngineError::ToolFailure {
            tool: tool.to_string(),
            exit_code: Some(0),
            stderr: format!("{} was not created", output_path.display()),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::write_script;
    use tempfile::TempDir;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_pipeline_streams_into_output() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.gz");
        let executor = PipelineExecutor::default();
        executor
            .run_pipeline(&CancelScope::root(), &sh("printf 'hello\\nworld\\n'"), &ToolCommand::new("gzip").arg("-c"), &out)
            .await?;
        let data = crate::compress::gunzip_bytes(&std::fs::read(&out)?)?;
        assert_eq!(data, b"hello\nworld\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_producer_failure_reports_producer_stderr() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.gz");
        let producer = write_script(dir.path(), "pg_dump", "echo 'pg_dump: error: database \"nope\" does not exist' >&2\nexit 1\n")?;
        let executor = PipelineExecutor::default();
        let err = executor
            .run_pipeline(&CancelScope::root(), &ToolCommand::new(producer), &ToolCommand::new("gzip").arg("-c"), &out)
            .await
            .unwrap_err();
        match err {
            EngineError::ToolFailure { tool, exit_code, stderr } => {
                assert_eq!(tool, "pg_dump");
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("does not exist"));
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_run_single_requires_nonempty_output() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("empty.dump");
        let cmd = sh(&format!("touch '{}'", out.display()));
        let err = PipelineExecutor::default()
            .run_single(&CancelScope::root(), &cmd, &out)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolFailure { exit_code: Some(0), .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_terminates_tool() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("never.dump");
        let scope = CancelScope::root().with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = PipelineExecutor::new(Duration::from_secs(1))
            .run_single(&scope, &sh("sleep 30"), &out)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_terminates_pipeline() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.gz");
        let scope = CancelScope::root();
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let err = PipelineExecutor::new(Duration::from_secs(1))
            .run_pipeline(&scope, &sh("sleep 30"), &ToolCommand::new("gzip").arg("-c"), &out)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_with_stdin_and_lines() -> Result<()> {
        let dir = TempDir::new()?;
        let sink = dir.path().join("sink.txt");
        let executor = PipelineExecutor::default();
        executor
            .run_with_stdin(&CancelScope::root(), &sh(&format!("cat > '{}'", sink.display())), &b"SELECT 1;\n"[..])
            .await?;
        assert_eq!(std::fs::read_to_string(&sink)?, "SELECT 1;\n");

        let lines = executor
            .run_lines(&CancelScope::root(), &sh("printf 'alpha\\n\\n beta \\n'"))
            .await?;
        assert_eq!(lines, vec!["alpha", "beta"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_to_file_appends() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("sample.sql");
        let executor = PipelineExecutor::default();
        executor.run_to_file(&CancelScope::root(), &sh("echo one"), &out, false).await?;
        executor.run_to_file(&CancelScope::root(), &sh("echo two"), &out, true).await?;
        assert_eq!(std::fs::read_to_string(&out)?, "one\ntwo\n");
        Ok(())
    }
}
