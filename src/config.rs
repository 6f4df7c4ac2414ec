//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, `storefront.toml`,
//! `STOREFRONT_*` variables (`__` nests), then the well-known raw variables
//! `SERVER_IP`, `WEB_CONCURRENCY`, `SPREE_SHARED_PATH` and `APP_HOST`.

use crate::app::extensions::ReloadMode;
use crate::deploy::host::{DeployTarget, Host, Role};
use crate::error::StorefrontError;
use crate::supervisor::RestartStrategy;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "storefront.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Overrides the address of the first server of whichever stage is deployed.
    pub server_ip: Option<String>,
    pub deploy: DeploySettings,
    pub stages: BTreeMap<String, StageSettings>,
    pub supervisor: SupervisorSettings,
    pub app: AppSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    pub application: String,
    pub repo_url: String,
    pub branch: String,
    pub deploy_to: PathBuf,
    pub keep_releases: usize,
    /// Subdirectory of the checkout holding the Rails application.
    pub app_path: String,
    pub rails_env: String,
    pub linked_dirs: Vec<String>,
    pub linked_files: Vec<String>,
    pub command_map: BTreeMap<String, String>,
    pub source: SourceSettings,
    pub stage_timeout_secs: u64,
    pub ssh_connect_retries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum SourceSettings {
    Git,
    Copy { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    pub servers: Vec<ServerSettings>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub address: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub roles: Vec<Role>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub environment: String,
    pub directory: Option<PathBuf>,
    pub workers: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    pub shared_path: PathBuf,
    pub append_logs: bool,
    pub preload_app: bool,
    pub control_app: bool,
    pub restart: RestartStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub environment: String,
    pub root: PathBuf,
    /// Host used for links generated in mail.
    pub app_host: String,
    pub engine_url: Url,
    pub upstream_timeout_secs: u64,
    pub mailer_sender: String,
    pub disable_migration_check: bool,
    /// Unset means "derive from `environment`".
    pub reload_mode: Option<ReloadMode>,
}

impl Default for Config {
    fn default() -> Self {
        let mut stages = BTreeMap::new();
        stages.insert(
            "production".to_string(),
            StageSettings {
                servers: vec![ServerSettings {
                    address: "127.0.0.1".to_string(),
                    user: "deploy".to_string(),
                    port: default_ssh_port(),
                    roles: vec![Role::App, Role::Db, Role::Web],
                }],
                branch: None,
            },
        );
        Self {
            log_level: "info".to_string(),
            server_ip: None,
            deploy: DeploySettings::default(),
            stages,
            supervisor: SupervisorSettings::default(),
            app: AppSettings::default(),
        }
    }
}

impl Default for DeploySettings {
    fn default() -> Self {
        let command_map = [
            ("rake", "bundle exec rake"),
            ("rails", "bundle exec rails"),
            ("pumactl", "bundle exec pumactl"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            application: "spree".to_string(),
            repo_url: "https://github.com/spree/spree.git".to_string(),
            branch: "main".to_string(),
            deploy_to: PathBuf::from("/var/www/spree"),
            keep_releases: 5,
            app_path: "server".to_string(),
            rails_env: "production".to_string(),
            linked_dirs: vec!["server/log".to_string(), "server/public/system".to_string()],
            linked_files: vec![
                "server/config/database.yml".to_string(),
                "server/config/master.key".to_string(),
            ],
            command_map,
            source: SourceSettings::Git,
            stage_timeout_secs: 600,
            ssh_connect_retries: 3,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            directory: Some(PathBuf::from("/var/www/spree/current/server")),
            workers: 2,
            min_threads: 5,
            max_threads: 5,
            shared_path: PathBuf::from("/var/www/spree/shared"),
            append_logs: true,
            preload_app: true,
            control_app: false,
            restart: RestartStrategy::TmpRestart,
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            root: PathBuf::from("."),
            app_host: "localhost".to_string(),
            engine_url: Url::parse("http://127.0.0.1:3000").expect("static engine url is valid"),
            upstream_timeout_secs: 30,
            mailer_sender: "please-change-me-at-config-initializers-devise@example.com"
                .to_string(),
            disable_migration_check: true,
            reload_mode: None,
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `storefront.toml`) plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, StorefrontError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Self::from_figment(Self::figment(path))
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("STOREFRONT_").split("__"))
            .merge(Env::raw().filter_map(|key| {
                match key.as_str().to_ascii_lowercase().as_str() {
                    "server_ip" => Some("server_ip".into()),
                    "web_concurrency" => Some("supervisor.workers".into()),
                    "spree_shared_path" => Some("supervisor.shared_path".into()),
                    "app_host" => Some("app.app_host".into()),
                    _ => None,
                }
            }))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, StorefrontError> {
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), StorefrontError> {
        if self.deploy.keep_releases == 0 {
            return Err(StorefrontError::InvalidConfig(
                "deploy.keep_releases must be at least 1".to_string(),
            ));
        }
        if !self.deploy.deploy_to.is_absolute() {
            return Err(StorefrontError::InvalidConfig(format!(
                "deploy.deploy_to must be absolute, got {}",
                self.deploy.deploy_to.display()
            )));
        }
        for (name, stage) in &self.stages {
            if stage.servers.is_empty() {
                return Err(StorefrontError::InvalidConfig(format!(
                    "stage {name} declares no servers"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a named environment into concrete hosts.
    pub fn stage(&self, name: &str) -> Result<DeployTarget, StorefrontError> {
        let stage = self
            .stages
            .get(name)
            .ok_or_else(|| StorefrontError::UnknownStage(name.to_string()))?;

        let hosts = stage
            .servers
            .iter()
            .enumerate()
            .map(|(idx, server)| {
                let address = match (&self.server_ip, idx) {
                    (Some(ip), 0) => ip.clone(),
                    _ => server.address.clone(),
                };
                Host::new(address, server.user.clone(), server.port, server.roles.clone())
            })
            .collect();

        Ok(DeployTarget {
            name: name.to_string(),
            hosts,
            branch: stage.branch.clone().unwrap_or_else(|| self.deploy.branch.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn figment_from(toml: &str) -> Figment {
        Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml))
    }

    #[test]
    fn defaults_match_production_recipe() {
        let cfg = Config::from_figment(figment_from("")).expect("defaults are valid");
        assert_eq!(cfg.deploy.keep_releases, 5);
        assert_eq!(cfg.deploy.app_path, "server");
        assert_eq!(cfg.deploy.command_map["rake"], "bundle exec rake");

        let target = cfg.stage("production").expect("production stage exists");
        assert_eq!(target.hosts.len(), 1);
        assert_eq!(target.hosts[0].address, "127.0.0.1");
        assert_eq!(target.hosts[0].user, "deploy");
        assert!(target.hosts[0].has_role(Role::Db));
        assert_eq!(target.branch, "main");
    }

    #[test]
    fn server_ip_overrides_first_server_only() {
        let cfg = Config::from_figment(figment_from(
            r#"
            server_ip = "10.1.2.3"

            [stages.staging]
            branch = "develop"

            [[stages.staging.servers]]
            address = "app1.internal"
            user = "deploy"
            roles = ["app", "web"]

            [[stages.staging.servers]]
            address = "db1.internal"
            user = "deploy"
            port = 2222
            roles = ["db"]
            "#,
        ))
        .expect("valid config");

        let target = cfg.stage("staging").expect("staging exists");
        assert_eq!(target.hosts[0].address, "10.1.2.3");
        assert_eq!(target.hosts[1].address, "db1.internal");
        assert_eq!(target.hosts[1].port, 2222);
        assert_eq!(target.branch, "develop");
    }

    #[test]
    fn unknown_stage_is_reported() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.stage("qa"),
            Err(StorefrontError::UnknownStage(name)) if name == "qa"
        ));
    }

    #[test]
    fn zero_release_bound_is_rejected() {
        let err = Config::from_figment(figment_from("[deploy]\nkeep_releases = 0"))
            .expect_err("keep_releases = 0 must be rejected");
        assert!(matches!(err, StorefrontError::InvalidConfig(_)));
    }

    #[test]
    fn copy_source_is_parsed() {
        let cfg = Config::from_figment(figment_from(
            "[deploy.source]\nstrategy = \"copy\"\npath = \"/srv/build\"",
        ))
        .expect("valid config");
        assert_eq!(
            cfg.deploy.source,
            SourceSettings::Copy {
                path: PathBuf::from("/srv/build")
            }
        );
    }
}
