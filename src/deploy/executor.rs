use crate::deploy::host::Host;
use crate::error::{IsRetryable, StorefrontError};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// ssh reserves exit status 255 for its own connection errors.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs rendered shell lines on a host.
///
/// A non-zero exit is reported through [`CommandOutput::status`], not as an
/// error; errors mean the command could not be run at all.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, host: &Host, line: &str) -> Result<CommandOutput, StorefrontError>;
}

pub struct SshExecutor {
    retry_policy: ExponentialBuilder,
}

impl SshExecutor {
    pub fn new(connect_retries: usize) -> Self {
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(connect_retries)
            .with_jitter();
        Self { retry_policy }
    }

    async fn execute_once(
        &self,
        host: &Host,
        line: &str,
    ) -> Result<CommandOutput, StorefrontError> {
        let output: CommandOutput = Command::new("ssh")
            .args(["-o", "BatchMode=yes", "-p"])
            .arg(host.port.to_string())
            .arg(host.destination())
            .arg("--")
            .arg(line)
            .kill_on_drop(true)
            .output()
            .await?
            .into();

        if output.status == SSH_CONNECTION_FAILURE {
            return Err(StorefrontError::Unreachable {
                host: host.destination(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn execute(&self, host: &Host, line: &str) -> Result<CommandOutput, StorefrontError> {
        debug!(host = %host, command = %line, "ssh");
        (|| async { self.execute_once(host, line).await })
            .retry(self.retry_policy.clone())
            .when(|e: &StorefrontError| e.is_retryable())
            .notify(|err, dur: Duration| {
                warn!(host = %host, "ssh connection failed ({}), retrying in {:?}", err, dur);
            })
            .await
    }
}

/// Runs everything through `sh -c` on this machine, ignoring the host address.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExecutor;

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, host: &Host, line: &str) -> Result<CommandOutput, StorefrontError> {
        debug!(host = %host, command = %line, "local");
        let output = Command::new("sh")
            .arg("-c")
            .arg(line)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output.into())
    }
}
