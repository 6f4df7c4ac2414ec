//! Puma process supervisor configuration.
//!
//! Resolved once from [`SupervisorSettings`] (which already carries the
//! `WEB_CONCURRENCY` and `SPREE_SHARED_PATH` overrides) and rendered as a
//! `puma.rb` for the web workers.

use crate::config::SupervisorSettings;
use crate::error::StorefrontError;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// How a deploy tells the worker pool to pick up the new release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// `plugin :tmp_restart`; touching `tmp/restart.txt` restarts the pool.
    TmpRestart,
    /// Rolling worker restart through `pumactl phased-restart`.
    PhasedRestart,
    None,
}

/// What `deploy:restart` needs to signal the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPlan {
    pub strategy: RestartStrategy,
    pub state_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub environment: String,
    pub directory: Option<PathBuf>,
    pub workers: usize,
    pub threads: (usize, usize),
    pub socket: PathBuf,
    pub pidfile: PathBuf,
    pub state_path: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub append_logs: bool,
    pub preload_app: bool,
    pub control_app: bool,
    pub restart: RestartStrategy,
}

impl SupervisorConfig {
    pub fn resolve(settings: &SupervisorSettings) -> Result<Self, StorefrontError> {
        if settings.workers == 0 {
            return Err(StorefrontError::InvalidConfig(
                "supervisor.workers must be at least 1".to_string(),
            ));
        }
        if settings.min_threads == 0 || settings.min_threads > settings.max_threads {
            return Err(StorefrontError::InvalidConfig(format!(
                "supervisor threads must satisfy 1 <= min <= max, got {}..{}",
                settings.min_threads, settings.max_threads
            )));
        }

        let shared = settings.shared_path.as_path();
        Ok(Self {
            environment: settings.environment.clone(),
            directory: settings.directory.clone(),
            workers: settings.workers,
            threads: (settings.min_threads, settings.max_threads),
            socket: shared.join("tmp/sockets/puma.sock"),
            pidfile: shared.join("tmp/pids/puma.pid"),
            state_path: shared.join("tmp/pids/puma.state"),
            stdout_log: shared.join("log/puma_stdout.log"),
            stderr_log: shared.join("log/puma_stderr.log"),
            append_logs: settings.append_logs,
            preload_app: settings.preload_app,
            control_app: settings.control_app,
            restart: settings.restart,
        })
    }

    pub fn bind_uri(&self) -> String {
        format!("unix://{}", self.socket.display())
    }

    pub fn restart_plan(&self) -> RestartPlan {
        RestartPlan {
            strategy: self.restart,
            state_path: self.state_path.clone(),
        }
    }

    /// Render as a `puma.rb`.
    pub fn render(&self) -> String {
        let mut out = String::from("# Generated by storefront; edit storefront.toml instead.\n\n");
        let _ = writeln!(out, "workers {}", self.workers);
        let _ = writeln!(out, "threads {}, {}", self.threads.0, self.threads.1);
        let _ = writeln!(out, "environment {}", ruby_str(&self.environment));
        if self.preload_app {
            out.push_str("preload_app!\n");
        }
        if let Some(dir) = &self.directory {
            let _ = writeln!(out, "directory {}", ruby_path(dir));
        }
        out.push('\n');
        let _ = writeln!(out, "bind {}", ruby_str(&self.bind_uri()));
        let _ = writeln!(out, "pidfile {}", ruby_path(&self.pidfile));
        let _ = writeln!(out, "state_path {}", ruby_path(&self.state_path));
        let _ = writeln!(
            out,
            "stdout_redirect {}, {}, {}",
            ruby_path(&self.stdout_log),
            ruby_path(&self.stderr_log),
            self.append_logs
        );
        if self.control_app {
            out.push_str("\nactivate_control_app\n");
        }
        if self.restart == RestartStrategy::TmpRestart {
            out.push_str("\nplugin :tmp_restart\n");
        }
        out
    }
}

fn ruby_path(path: &Path) -> String {
    ruby_str(&path.display().to_string())
}

fn ruby_str(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
