use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storefront::StorefrontError;
use storefront::config::DeploySettings;
use storefront::deploy::executor::{CommandOutput, Executor};
use storefront::deploy::host::{DeployTarget, Host};
use storefront::deploy::{Deployer, Role};
use storefront::supervisor::{RestartPlan, RestartStrategy};

const LIVE: &str = "20250101000000";
const NEW: &str = "20260101000000";

/// Canned reply for every line containing `needle`, optionally on one host only.
struct Rule {
    host: Option<&'static str>,
    needle: &'static str,
    status: i32,
    stdout: &'static str,
    delay: Option<Duration>,
}

impl Rule {
    fn new(needle: &'static str, status: i32) -> Self {
        Self {
            host: None,
            needle,
            status,
            stdout: "",
            delay: None,
        }
    }

    fn on(mut self, host: &'static str) -> Self {
        self.host = Some(host);
        self
    }

    fn stdout(mut self, stdout: &'static str) -> Self {
        self.stdout = stdout;
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn matches(&self, host: &Host, line: &str) -> bool {
        self.host.is_none_or(|h| h == host.address) && line.contains(self.needle)
    }
}

/// Fake fleet: records every line per host and answers from a rule list.
struct ScriptedExecutor {
    rules: Vec<Rule>,
    journal: Mutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    fn new(extra: Vec<Rule>) -> Self {
        let mut rules = extra;
        rules.extend([
            Rule::new("test -e ", 1),
            Rule::new("readlink ", 0).stdout("/srv/spree/releases/20250101000000\n"),
        ]);
        Self {
            rules,
            journal: Mutex::default(),
        }
    }

    fn lines(&self, host: &str) -> Vec<String> {
        self.journal
            .lock()
            .expect("journal lock")
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, line)| line.clone())
            .collect()
    }

    fn position(&self, host: &str, needle: &str) -> Option<usize> {
        self.lines(host).iter().position(|line| line.contains(needle))
    }

    fn ran(&self, needle: &str) -> bool {
        self.journal
            .lock()
            .expect("journal lock")
            .iter()
            .any(|(_, line)| line.contains(needle))
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, host: &Host, line: &str) -> Result<CommandOutput, StorefrontError> {
        self.journal
            .lock()
            .expect("journal lock")
            .push((host.address.clone(), line.to_string()));
        let Some(rule) = self.rules.iter().find(|rule| rule.matches(host, line)) else {
            return Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        };
        if let Some(delay) = rule.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(CommandOutput {
            status: rule.status,
            stdout: rule.stdout.to_string(),
            stderr: String::new(),
        })
    }
}

fn target() -> DeployTarget {
    DeployTarget {
        name: "production".to_string(),
        hosts: vec![
            Host::new("a", "deploy", 22, [Role::App, Role::Db, Role::Web]),
            Host::new("b", "deploy", 22, [Role::App, Role::Web]),
        ],
        branch: "main".to_string(),
    }
}

fn deployer(executor: Arc<ScriptedExecutor>, stage_timeout_secs: u64) -> Deployer {
    let settings = DeploySettings {
        deploy_to: PathBuf::from("/srv/spree"),
        stage_timeout_secs,
        ..DeploySettings::default()
    };
    let restart = RestartPlan {
        strategy: RestartStrategy::TmpRestart,
        state_path: PathBuf::from("/srv/spree/shared/tmp/pids/puma.state"),
    };
    Deployer::new(settings, restart, executor)
}

#[tokio::test]
async fn cutover_failure_on_one_host_restores_and_restarts_the_others() {
    let fleet = Arc::new(ScriptedExecutor::new(vec![Rule::new("mv -T", 1).on("b")]));

    let err = deployer(fleet.clone(), 30)
        .deploy_release(&target(), NEW)
        .await
        .expect_err("publishing fails on b");
    assert_eq!(err.failed_stage(), Some("deploy:publishing"));

    let published = fleet.position("a", "mv -T").expect("a switched current");
    let lines = fleet.lines("a");
    let after = &lines[published + 1..];
    let restore = after
        .iter()
        .position(|line| line.contains(&format!("ln -s /srv/spree/releases/{LIVE} ")))
        .expect("a points current back at the live release");
    assert!(after[restore..].iter().any(|line| line.contains("mv -T")));
    assert!(
        after[restore..]
            .iter()
            .any(|line| line.contains("touch /srv/spree/current/server/tmp/restart.txt")),
        "a restarts onto the restored release"
    );

    for host in ["a", "b"] {
        assert!(fleet.position(host, "rm -rf /srv/spree/.deploy.lock").is_some());
    }
}

#[tokio::test]
async fn one_failing_host_stops_the_fleet_before_cutover() {
    let fleet = Arc::new(ScriptedExecutor::new(vec![
        Rule::new("bundle install", 1).on("b"),
    ]));

    let err = deployer(fleet.clone(), 30)
        .deploy_release(&target(), NEW)
        .await
        .expect_err("bundle fails on b");

    assert_eq!(err.failed_stage(), Some("bundler:install"));
    assert!(!fleet.ran("mv -T"), "no host may switch current");
    assert!(!fleet.ran("db:migrate"));
    assert!(!fleet.ran("restart.txt"));
}

#[tokio::test]
async fn stalled_stage_times_out_and_still_releases_the_lock() {
    let fleet = Arc::new(ScriptedExecutor::new(vec![
        Rule::new("bundle install", 0).delay(Duration::from_secs(30)),
    ]));

    let err = deployer(fleet.clone(), 1)
        .deploy_release(&target(), NEW)
        .await
        .expect_err("bundle stalls");

    match err {
        StorefrontError::StageTimeout { stage, timeout } => {
            assert_eq!(stage, "bundler:install");
            assert_eq!(timeout, Duration::from_secs(1));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fleet.ran("mv -T"));
    for host in ["a", "b"] {
        assert!(fleet.position(host, "rm -rf /srv/spree/.deploy.lock").is_some());
    }
}
