//! Static URL table: liveness check, the two authentication route
//! families, and the engine mount that receives everything else.

use crate::app::identity::{Capabilities, IdentityKind, IdentityRegistry};
use crate::error::StorefrontError;
use axum::http::Method;

pub const HEALTH_PATH: &str = "/up";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAction {
    Sessions,
    Passwords,
    Registrations,
}

impl AuthAction {
    pub fn capability(self) -> Capabilities {
        match self {
            AuthAction::Sessions => Capabilities::DATABASE_AUTHENTICATABLE,
            AuthAction::Passwords => Capabilities::RECOVERABLE,
            AuthAction::Registrations => Capabilities::REGISTERABLE,
        }
    }

    /// `(method, suffix)` pairs relative to the family prefix.
    fn endpoints(self) -> Vec<(Method, &'static str)> {
        match self {
            AuthAction::Sessions => vec![
                (Method::GET, "/sign_in"),
                (Method::POST, "/sign_in"),
                (Method::DELETE, "/sign_out"),
            ],
            AuthAction::Passwords => vec![
                (Method::GET, "/password/new"),
                (Method::GET, "/password/edit"),
                (Method::PATCH, "/password"),
                (Method::PUT, "/password"),
                (Method::POST, "/password"),
            ],
            AuthAction::Registrations => vec![
                (Method::GET, "/cancel"),
                (Method::GET, "/sign_up"),
                (Method::GET, "/edit"),
                (Method::PATCH, ""),
                (Method::PUT, ""),
                (Method::DELETE, ""),
                (Method::POST, ""),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Health,
    Auth {
        kind: IdentityKind,
        action: AuthAction,
        /// Engine controller that serves the route.
        handler: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub method: Method,
    pub path: String,
    pub target: RouteTarget,
}

/// One identity's authentication routes.
#[derive(Debug, Clone)]
pub struct AuthFamily {
    pub kind: IdentityKind,
    pub prefix: String,
    pub sessions: String,
    pub passwords: String,
    pub registrations: String,
    pub skip: Vec<AuthAction>,
}

impl AuthFamily {
    pub fn customer() -> Self {
        Self {
            kind: IdentityKind::Customer,
            prefix: "/users".to_string(),
            sessions: "spree/user_sessions".to_string(),
            passwords: "spree/user_passwords".to_string(),
            registrations: "spree/user_registrations".to_string(),
            skip: Vec::new(),
        }
    }

    pub fn admin() -> Self {
        Self {
            kind: IdentityKind::Admin,
            prefix: "/admin_user".to_string(),
            sessions: "spree/admin/user_sessions".to_string(),
            passwords: "spree/admin/user_passwords".to_string(),
            registrations: "spree/admin/user_registrations".to_string(),
            skip: vec![AuthAction::Registrations],
        }
    }

    fn handler(&self, action: AuthAction) -> &str {
        match action {
            AuthAction::Sessions => &self.sessions,
            AuthAction::Passwords => &self.passwords,
            AuthAction::Registrations => &self.registrations,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn draw(
        identities: &IdentityRegistry,
        families: &[AuthFamily],
    ) -> Result<Self, StorefrontError> {
        validate_families(families)?;

        let mut entries = vec![RouteEntry {
            method: Method::GET,
            path: HEALTH_PATH.to_string(),
            target: RouteTarget::Health,
        }];

        for family in families {
            let identity = identities.get(family.kind);
            for action in [AuthAction::Sessions, AuthAction::Passwords, AuthAction::Registrations] {
                if family.skip.contains(&action)
                    || !identity.capabilities.contains(action.capability())
                {
                    continue;
                }
                for (method, suffix) in action.endpoints() {
                    entries.push(RouteEntry {
                        method,
                        path: format!("{}{}", family.prefix, suffix),
                        target: RouteTarget::Auth {
                            kind: family.kind,
                            action,
                            handler: family.handler(action).to_string(),
                        },
                    });
                }
            }
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Target for `method path`; `None` means the engine mount handles it.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&RouteTarget> {
        self.entries
            .iter()
            .find(|e| e.method == *method && e.path == path)
            .map(|e| &e.target)
    }
}

fn validate_families(families: &[AuthFamily]) -> Result<(), StorefrontError> {
    for (idx, family) in families.iter().enumerate() {
        let prefix = family.prefix.as_str();
        if !prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/') {
            return Err(StorefrontError::InvalidConfig(format!(
                "auth prefix `{prefix}` must look like `/segment`"
            )));
        }
        if overlaps(prefix, HEALTH_PATH) {
            return Err(StorefrontError::InvalidConfig(format!(
                "auth prefix `{prefix}` shadows the health check"
            )));
        }
        for other in &families[idx + 1..] {
            if other.kind == family.kind {
                return Err(StorefrontError::InvalidConfig(format!(
                    "two route families for {:?}",
                    family.kind
                )));
            }
            if overlaps(prefix, &other.prefix) {
                return Err(StorefrontError::InvalidConfig(format!(
                    "auth prefixes `{prefix}` and `{}` overlap",
                    other.prefix
                )));
            }
        }
    }
    Ok(())
}

/// Whether one path is the other or nested under it.
fn overlaps(a: &str, b: &str) -> bool {
    let nested = |outer: &str, inner: &str| {
        inner == outer || inner.strip_prefix(outer).is_some_and(|rest| rest.starts_with('/'))
    };
    nested(a, b) || nested(b, a)
}
