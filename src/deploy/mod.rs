//! Release management: deploy, rollback and inspection of release trees.
//!
//! Layout:
//! - `host.rs`: roles, hosts and resolved targets
//! - `command.rs`: symbolic remote commands and their shell rendering
//! - `executor.rs`: how rendered commands reach a host (ssh or local shell)
//! - `layout.rs`: the `releases/ shared/ current` tree and retention rules
//! - `pipeline.rs`: ordered stages, runner, rollback
//! - `tasks.rs`: the concrete stages of the storefront recipe

pub mod command;
pub mod executor;
pub mod host;
pub mod layout;
pub mod pipeline;
pub mod tasks;

use crate::config::DeploySettings;
use crate::deploy::command::RemoteCommand;
use crate::deploy::executor::Executor;
use crate::deploy::host::{DeployTarget, Host};
use crate::deploy::layout::{DeployLayout, parse_release_listing, release_before, release_name_at};
use crate::deploy::pipeline::{DeployContext, Pipeline, PipelineRunner};
use crate::error::StorefrontError;
use crate::supervisor::RestartPlan;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use executor::{LocalExecutor, SshExecutor};
pub use host::Role;

/// Releases present on one host.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HostReleases {
    pub host: String,
    pub releases: Vec<String>,
    pub current: Option<String>,
}

pub struct Deployer {
    settings: DeploySettings,
    restart: RestartPlan,
    executor: Arc<dyn Executor>,
}

impl Deployer {
    pub fn new(
        settings: DeploySettings,
        restart: RestartPlan,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            settings,
            restart,
            executor,
        }
    }

    fn layout(&self) -> DeployLayout {
        DeployLayout::new(self.settings.deploy_to.clone())
    }

    fn runner(&self, pipeline: Pipeline) -> PipelineRunner {
        PipelineRunner::new(pipeline, Duration::from_secs(self.settings.stage_timeout_secs))
    }

    fn context(&self, target: &DeployTarget, release_name: String) -> DeployContext {
        DeployContext::new(
            target.clone(),
            self.settings.clone(),
            release_name,
            self.restart.clone(),
            self.executor.clone(),
        )
    }

    /// Deploy under a release name taken from the current time.
    pub async fn deploy(&self, target: &DeployTarget) -> Result<String, StorefrontError> {
        let name = release_name_at(Utc::now());
        self.deploy_release(target, &name).await?;
        Ok(name)
    }

    pub async fn deploy_release(
        &self,
        target: &DeployTarget,
        release_name: &str,
    ) -> Result<(), StorefrontError> {
        info!(
            stage = %target.name,
            release = %release_name,
            branch = %target.branch,
            "deploying"
        );
        let mut ctx = self.context(target, release_name.to_string());
        ctx.previous = self.live_releases(target).await?;
        self.runner(tasks::deploy_pipeline()?).run(&ctx).await?;
        info!(stage = %target.name, release = %release_name, "deploy finished");
        Ok(())
    }

    /// Point `current` back at the release before it; returns that release.
    pub async fn rollback(&self, target: &DeployTarget) -> Result<String, StorefrontError> {
        let first = target
            .hosts
            .first()
            .ok_or_else(|| {
                StorefrontError::InvalidConfig(format!("stage {} has no hosts", target.name))
            })?;
        let state = self.host_releases(first).await?;
        let live = state.current.ok_or(StorefrontError::NoPreviousRelease)?;
        let previous = release_before(&state.releases, &live)
            .cloned()
            .ok_or(StorefrontError::NoPreviousRelease)?;

        info!(stage = %target.name, from = %live, to = %previous, "rolling back");
        let mut ctx = self.context(target, previous.clone());
        ctx.previous = self.live_releases(target).await?;
        ctx.abandoned = Some(live);
        self.runner(tasks::rollback_pipeline()?).run(&ctx).await?;
        Ok(previous)
    }

    /// Reachability and linked-file checks only.
    pub async fn check(&self, target: &DeployTarget) -> Result<(), StorefrontError> {
        let ctx = self.context(target, release_name_at(Utc::now()));
        self.runner(tasks::check_pipeline()).run(&ctx).await
    }

    pub async fn releases(
        &self,
        target: &DeployTarget,
    ) -> Result<Vec<HostReleases>, StorefrontError> {
        let mut out = Vec::with_capacity(target.hosts.len());
        for host in &target.hosts {
            out.push(self.host_releases(host).await?);
        }
        Ok(out)
    }

    async fn live_releases(
        &self,
        target: &DeployTarget,
    ) -> Result<HashMap<String, Option<String>>, StorefrontError> {
        let mut live = HashMap::new();
        for host in &target.hosts {
            live.insert(host.address.clone(), self.current_release(host).await?);
        }
        Ok(live)
    }

    async fn current_release(&self, host: &Host) -> Result<Option<String>, StorefrontError> {
        let ctx = self.context(&single_host_target(host), String::new());
        let current = self.layout().current();
        let linked = ctx
            .test(host, RemoteCommand::new("test").arg("-L").path_arg(&current))
            .await?;
        if !linked {
            return Ok(None);
        }
        let target = ctx
            .capture(host, RemoteCommand::new("readlink").path_arg(&current))
            .await?;
        Ok(target
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string))
    }

    async fn host_releases(&self, host: &Host) -> Result<HostReleases, StorefrontError> {
        let ctx = self.context(&single_host_target(host), String::new());
        let releases_dir = self.layout().releases();
        let exists = ctx
            .test(host, RemoteCommand::new("test").arg("-d").path_arg(&releases_dir))
            .await?;
        let releases = if exists {
            let listing = ctx
                .capture(host, RemoteCommand::new("ls").arg("-1").path_arg(&releases_dir))
                .await?;
            parse_release_listing(&listing)
        } else {
            Vec::new()
        };
        Ok(HostReleases {
            host: host.destination(),
            releases,
            current: self.current_release(host).await?,
        })
    }
}

fn single_host_target(host: &Host) -> DeployTarget {
    DeployTarget {
        name: host.address.clone(),
        hosts: vec![host.clone()],
        branch: String::new(),
    }
}
