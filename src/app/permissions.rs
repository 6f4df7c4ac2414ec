use crate::app::identity::IdentityKind;
use serde::Serialize;
use std::collections::BTreeMap;

/// Permission bundles defined by the commerce engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionSet {
    DefaultCustomer,
    SuperUser,
}

impl PermissionSet {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionSet::DefaultCustomer => "default_customer",
            PermissionSet::SuperUser => "super_user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionRole {
    Default,
    Admin,
}

impl From<IdentityKind> for PermissionRole {
    fn from(kind: IdentityKind) -> Self {
        match kind {
            IdentityKind::Customer => PermissionRole::Default,
            IdentityKind::Admin => PermissionRole::Admin,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PermissionRegistry {
    assignments: BTreeMap<PermissionRole, Vec<PermissionSet>>,
}

impl PermissionRegistry {
    /// Replace the sets assigned to `role`.
    pub fn assign(&mut self, role: PermissionRole, sets: Vec<PermissionSet>) {
        self.assignments.insert(role, sets);
    }

    pub fn sets_for(&self, role: PermissionRole) -> &[PermissionSet] {
        self.assignments.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Comma separated, as forwarded to the engine.
    pub fn header_value(&self, role: PermissionRole) -> String {
        self.sets_for(role)
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The storefront's assignments: customers get the default set, admins everything.
    pub fn storefront_defaults() -> Self {
        let mut registry = Self::default();
        registry.assign(PermissionRole::Default, vec![PermissionSet::DefaultCustomer]);
        registry.assign(PermissionRole::Admin, vec![PermissionSet::SuperUser]);
        registry
    }
}
