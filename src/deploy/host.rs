use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Role tag selecting which hosts a stage targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    App,
    Db,
    Web,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::App => "app",
            Role::Db => "db",
            Role::Web => "web",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub address: String,
    pub user: String,
    pub port: u16,
    roles: BTreeSet<Role>,
}

impl Host {
    pub fn new(
        address: impl Into<String>,
        user: impl Into<String>,
        port: u16,
        roles: impl IntoIterator<Item = Role>,
    ) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            port,
            roles: roles.into_iter().collect(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.roles.iter().copied()
    }

    /// `user@address`, as handed to ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleFilter {
    All,
    Any(Vec<Role>),
}

impl RoleFilter {
    pub fn only(role: Role) -> Self {
        RoleFilter::Any(vec![role])
    }

    pub fn matches(&self, host: &Host) -> bool {
        match self {
            RoleFilter::All => true,
            RoleFilter::Any(roles) => roles.iter().any(|r| host.has_role(*r)),
        }
    }
}

impl fmt::Display for RoleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleFilter::All => f.write_str("all"),
            RoleFilter::Any(roles) => {
                let names: Vec<String> = roles.iter().map(Role::to_string).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}

/// A named environment resolved into hosts.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub name: String,
    pub hosts: Vec<Host>,
    pub branch: String,
}

impl DeployTarget {
    pub fn hosts_matching<'a, 'f>(&'a self, filter: &'f RoleFilter) -> impl Iterator<Item = &'a Host> + use<'a, 'f> {
        self.hosts.iter().filter(move |h| filter.matches(h))
    }
}
