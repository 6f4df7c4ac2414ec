//! Stage actions making up the deploy and rollback pipelines.

use crate::config::SourceSettings;
use crate::deploy::command::RemoteCommand;
use crate::deploy::host::{Host, Role, RoleFilter};
use crate::deploy::layout::{parse_release_listing, releases_to_prune};
use crate::deploy::pipeline::{DeployContext, Pipeline, Stage, StageAction};
use crate::error::StorefrontError;
use crate::supervisor::RestartStrategy;
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

/// Verifies the host answers and every linked file is in place.
pub struct Check;

#[async_trait]
impl StageAction for Check {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        ctx.execute(
            host,
            RemoteCommand::new("mkdir")
                .arg("-p")
                .path_arg(ctx.layout.releases())
                .path_arg(ctx.layout.shared()),
        )
        .await?;

        if ctx.settings.source == SourceSettings::Git {
            ctx.execute(
                host,
                RemoteCommand::new("git")
                    .args(["ls-remote", "--heads"])
                    .arg(&ctx.settings.repo_url)
                    .arg(&ctx.target.branch),
            )
            .await?;
        }

        ensure_linked_files(ctx, host).await
    }
}

async fn ensure_linked_files(ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
    let shared = ctx.layout.shared();
    for file in &ctx.settings.linked_files {
        let source = shared.join(file);
        let present = ctx
            .test(host, RemoteCommand::new("test").arg("-f").path_arg(&source))
            .await?;
        if !present {
            return Err(StorefrontError::MissingLinkedFile {
                host: host.destination(),
                path: source.display().to_string(),
            });
        }
    }
    Ok(())
}

pub struct AcquireLock;

#[async_trait]
impl StageAction for AcquireLock {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        let lock = ctx.layout.lock();
        let acquired = ctx
            .test(host, RemoteCommand::new("mkdir").path_arg(&lock))
            .await?;
        if !acquired {
            return Err(StorefrontError::DeployLocked {
                host: host.destination(),
                lock: lock.display().to_string(),
            });
        }
        ctx.execute(
            host,
            RemoteCommand::new("echo")
                .arg(&ctx.lock_token)
                .append_to(lock.join("owner")),
        )
        .await?;
        debug!(host = %host, "deploy lock acquired");
        Ok(())
    }
}

/// Removes the lock, but only if this run owns it.
pub struct ReleaseLock;

#[async_trait]
impl StageAction for ReleaseLock {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        let lock = ctx.layout.lock();
        let owned = ctx
            .test(
                host,
                RemoteCommand::new("grep")
                    .args(["-qx", "--"])
                    .arg(&ctx.lock_token)
                    .path_arg(lock.join("owner")),
            )
            .await?;
        if owned {
            ctx.execute(host, RemoteCommand::new("rm").arg("-rf").path_arg(&lock))
                .await?;
            debug!(host = %host, "deploy lock released");
        }
        Ok(())
    }
}

/// Materializes the branch into a fresh release directory.
pub struct UpdateCode;

#[async_trait]
impl StageAction for UpdateCode {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        let release = ctx.release_path();
        let exists = ctx
            .test(host, RemoteCommand::new("test").arg("-e").path_arg(&release))
            .await?;
        if exists {
            return Err(StorefrontError::InvalidConfig(format!(
                "release {} already exists",
                release.display()
            )));
        }
        ctx.execute(host, RemoteCommand::new("mkdir").arg("-p").path_arg(&release))
            .await?;

        let revision = match &ctx.settings.source {
            SourceSettings::Git => git_update(ctx, host, &release).await?,
            SourceSettings::Copy { path } => {
                ctx.execute(
                    host,
                    RemoteCommand::new("cp")
                        .arg("-R")
                        .arg(format!("{}/.", path.display()))
                        .path_arg(&release),
                )
                .await?;
                format!("copy of {}", path.display())
            }
        };

        ctx.execute(
            host,
            RemoteCommand::new("echo")
                .arg(&revision)
                .append_to(release.join("REVISION")),
        )
        .await?;
        info!(
            host = %host,
            release = %ctx.release_name,
            revision = %revision,
            "release created"
        );
        Ok(())
    }
}

async fn git_update(
    ctx: &DeployContext,
    host: &Host,
    release: &Path,
) -> Result<String, StorefrontError> {
    let repo = ctx.layout.repo();
    let mirrored = ctx
        .test(host, RemoteCommand::new("test").arg("-f").path_arg(repo.join("HEAD")))
        .await?;
    if !mirrored {
        ctx.execute(
            host,
            RemoteCommand::new("git")
                .args(["clone", "--mirror"])
                .arg(&ctx.settings.repo_url)
                .path_arg(&repo),
        )
        .await?;
    }
    ctx.execute(
        host,
        RemoteCommand::new("git")
            .args(["remote", "update", "--prune"])
            .within(&repo),
    )
    .await?;
    ctx.execute(
        host,
        RemoteCommand::new("git")
            .arg("archive")
            .arg(&ctx.target.branch)
            .pipe(
                RemoteCommand::new("tar")
                    .args(["-x", "-f", "-", "-C"])
                    .path_arg(release),
            )
            .within(&repo),
    )
    .await?;
    ctx.capture(
        host,
        RemoteCommand::new("git")
            .args(["rev-list", "--max-count=1"])
            .arg(&ctx.target.branch)
            .within(&repo),
    )
    .await
}

pub struct LinkDirs;

#[async_trait]
impl StageAction for LinkDirs {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        let shared = ctx.layout.shared();
        let release = ctx.release_path();
        for dir in &ctx.settings.linked_dirs {
            let source = shared.join(dir);
            let target = release.join(dir);
            ctx.execute(host, RemoteCommand::new("mkdir").arg("-p").path_arg(&source))
                .await?;
            if let Some(parent) = target.parent() {
                ctx.execute(host, RemoteCommand::new("mkdir").arg("-p").path_arg(parent))
                    .await?;
            }
            ctx.execute(host, RemoteCommand::new("rm").arg("-rf").path_arg(&target))
                .await?;
            ctx.execute(
                host,
                RemoteCommand::new("ln").arg("-s").path_arg(&source).path_arg(&target),
            )
            .await?;
        }
        Ok(())
    }
}

pub struct LinkFiles;

#[async_trait]
impl StageAction for LinkFiles {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        ensure_linked_files(ctx, host).await?;
        let shared = ctx.layout.shared();
        let release = ctx.release_path();
        for file in &ctx.settings.linked_files {
            let source = shared.join(file);
            let target = release.join(file);
            if let Some(parent) = target.parent() {
                ctx.execute(host, RemoteCommand::new("mkdir").arg("-p").path_arg(parent))
                    .await?;
            }
            ctx.execute(host, RemoteCommand::new("rm").arg("-f").path_arg(&target))
                .await?;
            ctx.execute(
                host,
                RemoteCommand::new("ln").arg("-s").path_arg(&source).path_arg(&target),
            )
            .await?;
        }
        Ok(())
    }
}

/// Production-only dependency install.
pub struct BundleInstall;

#[async_trait]
impl StageAction for BundleInstall {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        ctx.execute(
            host,
            RemoteCommand::new("bundle")
                .args(["install", "--without", "development test", "--deployment", "--quiet"])
                .within(ctx.release_app_path()),
        )
        .await?;
        Ok(())
    }
}

/// A rake task run from the release's app directory.
pub struct Rake(pub &'static str);

#[async_trait]
impl StageAction for Rake {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        ctx.execute(
            host,
            RemoteCommand::new("rake")
                .arg(self.0)
                .within(ctx.release_app_path())
                .env("RAILS_ENV", ctx.settings.rails_env.clone()),
        )
        .await?;
        Ok(())
    }
}

/// Runtime scratch directories the web workers expect under shared.
pub struct CreateSharedDirs;

#[async_trait]
impl StageAction for CreateSharedDirs {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        let shared = ctx.layout.shared();
        ctx.execute(
            host,
            RemoteCommand::new("mkdir")
                .arg("-p")
                .path_arg(shared.join("tmp/sockets"))
                .path_arg(shared.join("tmp/pids"))
                .path_arg(shared.join("log"))
                .path_arg(shared.join(&ctx.settings.app_path).join("log")),
        )
        .await?;
        Ok(())
    }
}

/// Atomically points `current` at `release`.
async fn switch_current(
    ctx: &DeployContext,
    host: &Host,
    release: &Path,
) -> Result<(), StorefrontError> {
    let tmp = ctx.layout.current_tmp();
    ctx.execute(host, RemoteCommand::new("rm").arg("-rf").path_arg(&tmp))
        .await?;
    ctx.execute(
        host,
        RemoteCommand::new("ln").arg("-s").path_arg(release).path_arg(&tmp),
    )
    .await?;
    ctx.execute(
        host,
        RemoteCommand::new("mv")
            .arg("-T")
            .path_arg(&tmp)
            .path_arg(ctx.layout.current()),
    )
    .await?;
    Ok(())
}

pub struct Publish;

#[async_trait]
impl StageAction for Publish {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        switch_current(ctx, host, &ctx.release_path()).await?;
        info!(host = %host, release = %ctx.release_name, "current switched");
        Ok(())
    }
}

/// Puts `current` back where it pointed before this run.
pub struct RestorePrevious;

#[async_trait]
impl StageAction for RestorePrevious {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        match ctx.previous_release(host) {
            Some(previous) => {
                switch_current(ctx, host, &ctx.layout.release(previous)).await?;
                info!(host = %host, release = %previous, "current restored");
                if host.has_role(Role::App) {
                    signal_restart(ctx, host).await?;
                }
            }
            None => {
                ctx.execute(
                    host,
                    RemoteCommand::new("rm").arg("-f").path_arg(ctx.layout.current()),
                )
                .await?;
                info!(host = %host, "current removed; there was no earlier release");
            }
        }
        Ok(())
    }
}

pub struct Restart;

#[async_trait]
impl StageAction for Restart {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        signal_restart(ctx, host).await
    }
}

/// Tells the workers to reload whatever `current` points at.
async fn signal_restart(ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
    let app = ctx.layout.current().join(&ctx.settings.app_path);
    match ctx.restart.strategy {
        RestartStrategy::TmpRestart => {
            let tmp = app.join("tmp");
            ctx.execute(host, RemoteCommand::new("mkdir").arg("-p").path_arg(&tmp))
                .await?;
            ctx.execute(
                host,
                RemoteCommand::new("touch").path_arg(tmp.join("restart.txt")),
            )
            .await?;
        }
        RestartStrategy::PhasedRestart => {
            ctx.execute(
                host,
                RemoteCommand::new("pumactl")
                    .arg("-S")
                    .path_arg(&ctx.restart.state_path)
                    .arg("phased-restart")
                    .within(&app),
            )
            .await?;
        }
        RestartStrategy::None => {
            debug!(host = %host, "restart disabled");
            return Ok(());
        }
    }
    info!(host = %host, "restart signalled");
    Ok(())
}

/// Keeps the newest `keep_releases` release directories.
pub struct Cleanup;

#[async_trait]
impl StageAction for Cleanup {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        let releases = ctx.layout.releases();
        let listing = ctx
            .capture(host, RemoteCommand::new("ls").arg("-1").path_arg(&releases))
            .await?;
        let sorted = parse_release_listing(&listing);
        let doomed =
            releases_to_prune(&sorted, ctx.settings.keep_releases, Some(&ctx.release_name));
        if doomed.is_empty() {
            return Ok(());
        }
        let mut cmd = RemoteCommand::new("rm").arg("-rf");
        for name in &doomed {
            cmd = cmd.path_arg(releases.join(name));
        }
        ctx.execute(host, cmd).await?;
        info!(
            host = %host,
            pruned = doomed.len(),
            kept = ctx.settings.keep_releases,
            "old releases removed"
        );
        Ok(())
    }
}

/// Deletes the release a rollback moved away from.
pub struct RemoveAbandoned;

#[async_trait]
impl StageAction for RemoveAbandoned {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        let Some(abandoned) = ctx.abandoned.as_deref() else {
            return Ok(());
        };
        ctx.execute(
            host,
            RemoteCommand::new("rm")
                .arg("-rf")
                .path_arg(ctx.layout.release(abandoned)),
        )
        .await?;
        Ok(())
    }
}

pub struct LogRevision;

#[async_trait]
impl StageAction for LogRevision {
    async fn run(&self, ctx: &DeployContext, host: &Host) -> Result<(), StorefrontError> {
        let line = match &ctx.abandoned {
            Some(abandoned) => format!(
                "{} rolled back to release {} (abandoned {})",
                ctx.deployer, ctx.release_name, abandoned
            ),
            None => format!(
                "Branch {} deployed as release {} by {}",
                ctx.target.branch, ctx.release_name, ctx.deployer
            ),
        };
        ctx.execute(
            host,
            RemoteCommand::new("echo")
                .arg(line)
                .append_to(ctx.layout.revision_log()),
        )
        .await?;
        Ok(())
    }
}

fn lock_stage() -> Stage {
    Stage::new("deploy:lock", RoleFilter::All, AcquireLock).with_ensure(ReleaseLock)
}

fn publishing_stage() -> Stage {
    Stage::new("deploy:publishing", RoleFilter::All, Publish).with_rollback(RestorePrevious)
}

/// Runs after the cutover, so a failure here must not un-publish the release.
fn log_revision_stage() -> Stage {
    Stage::new("deploy:log_revision", RoleFilter::All, LogRevision).non_fatal()
}

/// The full deploy flow, including the `after` hooks of the storefront recipe.
pub fn deploy_pipeline() -> Result<Pipeline, StorefrontError> {
    Pipeline::new()
        .push(Stage::new("deploy:check", RoleFilter::All, Check))
        .push(lock_stage())
        .push(Stage::new("deploy:updating", RoleFilter::All, UpdateCode))
        .push(Stage::new("deploy:symlink:linked_dirs", RoleFilter::All, LinkDirs))
        .push(Stage::new(
            "deploy:symlink:linked_files",
            RoleFilter::All,
            LinkFiles,
        ))
        .push(Stage::new("bundler:install", RoleFilter::All, BundleInstall))
        .push(Stage::new(
            "deploy:migrate",
            RoleFilter::only(Role::Db),
            Rake("db:migrate"),
        ))
        .push(Stage::new(
            "deploy:assets:precompile",
            RoleFilter::only(Role::App),
            Rake("assets:precompile"),
        ))
        .push(publishing_stage())
        .push(Stage::new("deploy:cleanup", RoleFilter::All, Cleanup).non_fatal())
        .push(log_revision_stage())
        .after(
            "deploy:migrate",
            Stage::new(
                "deploy:create_shared_dirs",
                RoleFilter::only(Role::App),
                CreateSharedDirs,
            ),
        )?
        .after(
            "deploy:publishing",
            Stage::new("deploy:restart", RoleFilter::only(Role::App), Restart),
        )
}

pub fn rollback_pipeline() -> Result<Pipeline, StorefrontError> {
    Pipeline::new()
        .push(lock_stage())
        .push(publishing_stage())
        .push(
            Stage::new("deploy:cleanup_rollback", RoleFilter::All, RemoveAbandoned).non_fatal(),
        )
        .push(log_revision_stage())
        .after(
            "deploy:publishing",
            Stage::new("deploy:restart", RoleFilter::only(Role::App), Restart),
        )
}

pub fn check_pipeline() -> Pipeline {
    Pipeline::new().push(Stage::new("deploy:check", RoleFilter::All, Check))
}
