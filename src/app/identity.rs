//! Customer and admin identities as capability sets.

use crate::error::StorefrontError;
use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Authentication capabilities an identity type can enable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Password-based sign in.
        const DATABASE_AUTHENTICATABLE = 0b0_0001;
        /// Self-service sign up and account editing.
        const REGISTERABLE = 0b0_0010;
        /// Password reset flow.
        const RECOVERABLE = 0b0_0100;
        /// Persistent "remember me" sessions.
        const REMEMBERABLE = 0b0_1000;
        /// Email and password validation.
        const VALIDATABLE = 0b1_0000;
    }
}

impl Capabilities {
    pub fn label(self) -> String {
        let names: Vec<&str> = self
            .iter_names()
            .map(|(name, _)| name)
            .collect();
        names.join("|").to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Customer,
    Admin,
}

/// Record types the commerce engine authenticates.
pub trait IdentityModel {
    const CLASS_NAME: &'static str;
    /// Singular route key, e.g. `user` or `admin_user`.
    const ROUTE_KEY: &'static str;
    const KIND: IdentityKind;

    fn capabilities() -> Capabilities;

    fn descriptor() -> IdentityDescriptor {
        IdentityDescriptor {
            class_name: Self::CLASS_NAME,
            route_key: Self::ROUTE_KEY,
            kind: Self::KIND,
            capabilities: Self::capabilities(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityDescriptor {
    pub class_name: &'static str,
    pub route_key: &'static str,
    pub kind: IdentityKind,
    pub capabilities: Capabilities,
}

pub struct CustomerUser;

impl IdentityModel for CustomerUser {
    const CLASS_NAME: &'static str = "Spree::User";
    const ROUTE_KEY: &'static str = "user";
    const KIND: IdentityKind = IdentityKind::Customer;

    fn capabilities() -> Capabilities {
        Capabilities::all()
    }
}

pub struct AdminUser;

impl IdentityModel for AdminUser {
    const CLASS_NAME: &'static str = "Spree::AdminUser";
    const ROUTE_KEY: &'static str = "admin_user";
    const KIND: IdentityKind = IdentityKind::Admin;

    fn capabilities() -> Capabilities {
        Capabilities::all()
    }
}

/// The one customer and one admin identity known to the engine.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    customer: IdentityDescriptor,
    admin: IdentityDescriptor,
}

impl IdentityRegistry {
    pub fn new(descriptors: &[IdentityDescriptor]) -> Result<Self, StorefrontError> {
        let pick = |kind: IdentityKind| -> Result<IdentityDescriptor, StorefrontError> {
            let matching: Vec<&IdentityDescriptor> =
                descriptors.iter().filter(|d| d.kind == kind).collect();
            match matching.as_slice() {
                [one] => Ok(**one),
                [] => Err(StorefrontError::InvalidConfig(format!(
                    "no identity designated as {kind:?}"
                ))),
                many => Err(StorefrontError::InvalidConfig(format!(
                    "{} identities designated as {kind:?}: {}",
                    many.len(),
                    many.iter().map(|d| d.class_name).collect::<Vec<_>>().join(", ")
                ))),
            }
        };
        Ok(Self {
            customer: pick(IdentityKind::Customer)?,
            admin: pick(IdentityKind::Admin)?,
        })
    }

    pub fn get(&self, kind: IdentityKind) -> &IdentityDescriptor {
        match kind {
            IdentityKind::Customer => &self.customer,
            IdentityKind::Admin => &self.admin,
        }
    }

    pub fn customer(&self) -> &IdentityDescriptor {
        &self.customer
    }

    pub fn admin(&self) -> &IdentityDescriptor {
        &self.admin
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self {
            customer: CustomerUser::descriptor(),
            admin: AdminUser::descriptor(),
        }
    }
}

/// Capability checks for incoming authentication requests.
pub trait Authenticator: Send + Sync {
    fn require(
        &self,
        kind: IdentityKind,
        capability: Capabilities,
    ) -> Result<&IdentityDescriptor, StorefrontError>;
}

/// The single authentication service every auth route goes through.
#[derive(Debug, Clone)]
pub struct AuthService {
    identities: IdentityRegistry,
}

impl AuthService {
    pub fn new(identities: IdentityRegistry) -> Self {
        Self { identities }
    }

    pub fn identities(&self) -> &IdentityRegistry {
        &self.identities
    }

    pub fn supports(&self, kind: IdentityKind, capability: Capabilities) -> bool {
        self.identities.get(kind).capabilities.contains(capability)
    }
}

impl Authenticator for AuthService {
    fn require(
        &self,
        kind: IdentityKind,
        capability: Capabilities,
    ) -> Result<&IdentityDescriptor, StorefrontError> {
        let identity = self.identities.get(kind);
        if !identity.capabilities.contains(capability) {
            return Err(StorefrontError::CapabilityDisabled {
                model: identity.class_name,
                capability: capability.label(),
            });
        }
        Ok(identity)
    }
}
