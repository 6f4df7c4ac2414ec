//! Ordered, role-scoped deployment stages.
//!
//! Stages run strictly one after another. Inside a stage every selected
//! host runs concurrently and the first failing host aborts the stage for
//! all of them. On failure the rollback actions of the failed stage and of
//! every completed stage run in reverse order; `ensure` actions run for
//! every attempted stage no matter how the pipeline ended. Stages marked
//! non-fatal only log their failures.

use crate::config::DeploySettings;
use crate::deploy::command::{CommandMap, RemoteCommand};
use crate::deploy::executor::{CommandOutput, Executor};
use crate::deploy::host::{DeployTarget, Host, RoleFilter};
use crate::deploy::layout::DeployLayout;
use crate::error::StorefrontError;
use crate::supervisor::RestartPlan;
use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Everything a stage action may need, fixed for one pipeline run.
pub struct DeployContext {
    pub target: DeployTarget,
    pub layout: DeployLayout,
    pub settings: DeploySettings,
    /// Release this run publishes.
    pub release_name: String,
    /// Written into the lock owner file; unique per process and run.
    pub lock_token: String,
    /// Live release per host address, captured before the run.
    pub previous: HashMap<String, Option<String>>,
    /// Release a rollback abandons.
    pub abandoned: Option<String>,
    pub restart: RestartPlan,
    pub deployer: String,
    executor: Arc<dyn Executor>,
    commands: CommandMap,
}

impl DeployContext {
    pub fn new(
        target: DeployTarget,
        settings: DeploySettings,
        release_name: String,
        restart: RestartPlan,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let layout = DeployLayout::new(settings.deploy_to.clone());
        let commands = CommandMap::new(settings.command_map.clone());
        let deployer = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        let lock_token = format!(
            "{release_name}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        Self {
            target,
            layout,
            settings,
            release_name,
            lock_token,
            previous: HashMap::new(),
            abandoned: None,
            restart,
            deployer,
            executor,
            commands,
        }
    }

    pub fn release_path(&self) -> std::path::PathBuf {
        self.layout.release(&self.release_name)
    }

    /// Application directory inside the release being published.
    pub fn release_app_path(&self) -> std::path::PathBuf {
        self.release_path().join(&self.settings.app_path)
    }

    pub fn previous_release(&self, host: &Host) -> Option<&str> {
        self.previous.get(&host.address).and_then(|p| p.as_deref())
    }

    pub fn render(&self, cmd: &RemoteCommand) -> String {
        cmd.render(&self.commands)
    }

    /// Run a command; a non-zero exit becomes [`StorefrontError::CommandFailed`].
    pub async fn execute(
        &self,
        host: &Host,
        cmd: RemoteCommand,
    ) -> Result<CommandOutput, StorefrontError> {
        let line = self.render(&cmd);
        let output = self.executor.execute(host, &line).await?;
        if !output.success() {
            return Err(StorefrontError::CommandFailed {
                host: host.destination(),
                command: line,
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Run a command and report whether it exited 0.
    pub async fn test(
        &self,
        host: &Host,
        cmd: RemoteCommand,
    ) -> Result<bool, StorefrontError> {
        let line = self.render(&cmd);
        Ok(self.executor.execute(host, &line).await?.success())
    }

    pub async fn capture(
        &self,
        host: &Host,
        cmd: RemoteCommand,
    ) -> Result<String, StorefrontError> {
        Ok(self.execute(host, cmd).await?.stdout.trim().to_string())
    }
}

#[async_trait]
pub trait StageAction: Send + Sync {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError>;
}

#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub roles: RoleFilter,
    pub timeout: Option<Duration>,
    action: Arc<dyn StageAction>,
    /// A failing non-fatal stage is logged and the pipeline goes on.
    pub fatal: bool,
    rollback: Option<Arc<dyn StageAction>>,
    ensure: Option<Arc<dyn StageAction>>,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        roles: RoleFilter,
        action: impl StageAction + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            roles,
            timeout: None,
            fatal: true,
            action: Arc::new(action),
            rollback: None,
            ensure: None,
        }
    }

    /// Undo step, run when a later stage fails.
    pub fn with_rollback(mut self, action: impl StageAction + 'static) -> Self {
        self.rollback = Some(Arc::new(action));
        self
    }

    /// Cleanup run once the pipeline ends, whatever the outcome.
    pub fn with_ensure(mut self, action: impl StageAction + 'static) -> Self {
        self.ensure = Some(Arc::new(action));
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.fatal = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn before(mut self, anchor: &str, stage: Stage) -> Result<Self, StorefrontError> {
        let idx = self.position(anchor)?;
        self.stages.insert(idx, stage);
        Ok(self)
    }

    pub fn after(mut self, anchor: &str, stage: Stage) -> Result<Self, StorefrontError> {
        let idx = self.position(anchor)?;
        self.stages.insert(idx + 1, stage);
        Ok(self)
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn position(&self, anchor: &str) -> Result<usize, StorefrontError> {
        self.stages
            .iter()
            .position(|s| s.name == anchor)
            .ok_or_else(|| StorefrontError::UnknownAnchor(anchor.to_string()))
    }
}

pub struct PipelineRunner {
    pipeline: Pipeline,
    default_timeout: Duration,
}

impl PipelineRunner {
    pub fn new(pipeline: Pipeline, default_timeout: Duration) -> Self {
        Self {
            pipeline,
            default_timeout,
        }
    }

    /// Run every stage in order, halting at the first fatal failure.
    ///
    /// On a fatal failure the failed stage is rolled back on all of its
    /// hosts (some may have succeeded), then every completed stage in
    /// reverse order.
    pub async fn run(&self, ctx: &DeployContext) -> Result<(), StorefrontError> {
        let mut attempted: Vec<&Stage> = Vec::new();
        let mut outcome = Ok(());

        for stage in self.pipeline.stages() {
            attempted.push(stage);
            match self.run_stage(stage, stage.action.as_ref(), ctx).await {
                Ok(()) => {}
                Err(e) if !stage.fatal => {
                    warn!(stage = %stage.name, error = %e, "non-fatal stage failed; continuing");
                }
                Err(e) => {
                    error!(stage = %stage.name, error = %e, "stage failed; halting deployment");
                    outcome = Err(e);
                    break;
                }
            }
        }

        if outcome.is_err() {
            for stage in attempted.iter().rev() {
                let Some(rollback) = stage.rollback.as_ref() else {
                    continue;
                };
                warn!(stage = %stage.name, "rolling back");
                self.run_rollback(stage, rollback.as_ref(), ctx).await;
            }
        }

        for stage in attempted.iter().rev() {
            let Some(ensure) = stage.ensure.as_ref() else {
                continue;
            };
            if let Err(e) = self.run_stage(stage, ensure.as_ref(), ctx).await {
                error!(stage = %stage.name, error = %e, "cleanup failed");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        outcome
    }

    /// Every host is rolled back independently; failures are only logged.
    async fn run_rollback(&self, stage: &Stage, action: &dyn StageAction, ctx: &DeployContext) {
        let timeout = stage.timeout.unwrap_or(self.default_timeout);
        let hosts = ctx.target.hosts_matching(&stage.roles);
        let work = join_all(hosts.map(|host| async move {
            if let Err(e) = action.run(ctx, host).await {
                error!(stage = %stage.name, host = %host, error = %e, "rollback failed");
            }
        }));
        if tokio::time::timeout(timeout, work).await.is_err() {
            error!(stage = %stage.name, ?timeout, "rollback timed out");
        }
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        action: &dyn StageAction,
        ctx: &DeployContext,
    ) -> Result<(), StorefrontError> {
        let hosts: Vec<&Host> = ctx.target.hosts_matching(&stage.roles).collect();
        if hosts.is_empty() {
            debug!(stage = %stage.name, roles = %stage.roles, "no matching hosts; skipping");
            return Ok(());
        }

        info!(stage = %stage.name, roles = %stage.roles, hosts = hosts.len(), "running");
        let timeout = stage.timeout.unwrap_or(self.default_timeout);
        let work = try_join_all(hosts.into_iter().map(|host| action.run(ctx, host)));

        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(source)) => Err(StorefrontError::StageFailed {
                stage: stage.name.clone(),
                source: Box::new(source),
            }),
            Err(_) => Err(StorefrontError::StageTimeout {
                stage: stage.name.clone(),
                timeout,
            }),
        }
    }
}
