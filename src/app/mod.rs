//! The booted storefront application.
//!
//! Layout:
//! - `bootstrap.rs`: one-time, ordered construction of [`Application`]
//! - `identity.rs`: customer/admin identities and the auth service
//! - `permissions.rs`: role to permission-set assignment
//! - `extensions.rs`: versioned extension registry with load-once/reload modes
//! - `decorators.rs`: the extensions this storefront ships
//! - `routes.rs`: the static route table

pub mod bootstrap;
pub mod decorators;
pub mod extensions;
pub mod identity;
pub mod permissions;
pub mod routes;

use crate::app::extensions::{ExtensionRegistry, ReloadMode};
use crate::app::identity::AuthService;
use crate::app::permissions::PermissionRegistry;
use crate::app::routes::RouteTable;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

pub use bootstrap::{Bootstrap, boot_once};

/// Framework subsystems, in the order the engine needs them registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Model,
    Jobs,
    Persistence,
    Storage,
    Requests,
    Mail,
    Views,
}

impl Subsystem {
    pub const BOOT_ORDER: [Subsystem; 7] = [
        Subsystem::Model,
        Subsystem::Jobs,
        Subsystem::Persistence,
        Subsystem::Storage,
        Subsystem::Requests,
        Subsystem::Mail,
        Subsystem::Views,
    ];
}

/// Steps recorded while booting, in the order they ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPhase {
    Environment { dotenv_loaded: bool },
    Subsystem(Subsystem),
    Initializers,
    AuthenticationGlue,
    Routes,
    AfterInitialize,
    Prepared { extensions: usize },
}

/// Engine-wide settings fixed by the initializers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub environment: String,
    pub disable_migration_check: bool,
    pub mailer_sender: String,
    /// Host for links in generated mail.
    pub default_url_host: String,
}

/// Per-request decoration of traffic forwarded to the engine; the thing
/// extensions patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineProfile {
    pub app_host: String,
    pub headers: BTreeMap<String, String>,
}

pub struct Application {
    engine: EngineSettings,
    auth: AuthService,
    routes: RouteTable,
    permissions: PermissionRegistry,
    extensions: ExtensionRegistry<EngineProfile>,
    base_profile: EngineProfile,
    profile: Mutex<EngineProfile>,
    boot_log: Vec<BootPhase>,
}

impl Application {
    pub fn engine(&self) -> &EngineSettings {
        &self.engine
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn permissions(&self) -> &PermissionRegistry {
        &self.permissions
    }

    pub fn extensions(&self) -> &ExtensionRegistry<EngineProfile> {
        &self.extensions
    }

    pub fn boot_log(&self) -> &[BootPhase] {
        &self.boot_log
    }

    pub fn reload_mode(&self) -> ReloadMode {
        self.extensions.mode()
    }

    /// Run the per-request prepare hook and return the profile to use.
    ///
    /// Load-once keeps patching one long-lived profile (a no-op after boot);
    /// reload starts each cycle from the undecorated profile.
    pub fn prepare(&self) -> EngineProfile {
        match self.extensions.mode() {
            ReloadMode::LoadOnce => {
                let mut profile = self.profile.lock().unwrap_or_else(PoisonError::into_inner);
                self.extensions.prepare(&mut profile);
                profile.clone()
            }
            ReloadMode::ReloadEachCycle => {
                let mut profile = self.base_profile.clone();
                self.extensions.prepare(&mut profile);
                profile
            }
        }
    }
}
