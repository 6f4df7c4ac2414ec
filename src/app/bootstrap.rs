//! One-time application boot.
//!
//! Order matters: environment, subsystems, engine initializers, auth glue
//! (routes reference it), routes, then the after-initialize permission
//! assignment, then the first prepare pass over the extensions.

use crate::app::decorators;
use crate::app::extensions::{Extension, ExtensionRegistry, ReloadMode};
use crate::app::identity::{
    AdminUser, AuthService, CustomerUser, IdentityDescriptor, IdentityModel, IdentityRegistry,
};
use crate::app::permissions::PermissionRegistry;
use crate::app::routes::{AuthFamily, RouteTable};
use crate::app::{Application, BootPhase, EngineProfile, EngineSettings, Subsystem};
use crate::config::AppSettings;
use crate::error::StorefrontError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

static APPLICATION: OnceLock<Arc<Application>> = OnceLock::new();

/// Boot the process-wide application, or return the one already booted.
pub fn boot_once(settings: &AppSettings) -> Result<Arc<Application>, StorefrontError> {
    if let Some(app) = APPLICATION.get() {
        return Ok(app.clone());
    }
    let app = Arc::new(Bootstrap::new(settings).boot()?);
    Ok(APPLICATION.get_or_init(|| app).clone())
}

pub struct Bootstrap<'a> {
    settings: &'a AppSettings,
    identities: Vec<IdentityDescriptor>,
    families: Vec<AuthFamily>,
    extensions: Vec<Extension<EngineProfile>>,
}

impl<'a> Bootstrap<'a> {
    pub fn new(settings: &'a AppSettings) -> Self {
        Self {
            settings,
            identities: vec![CustomerUser::descriptor(), AdminUser::descriptor()],
            families: vec![AuthFamily::customer(), AuthFamily::admin()],
            extensions: decorators::builtin(),
        }
    }

    pub fn with_identities(mut self, identities: Vec<IdentityDescriptor>) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_families(mut self, families: Vec<AuthFamily>) -> Self {
        self.families = families;
        self
    }

    pub fn with_extension(mut self, extension: Extension<EngineProfile>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn boot(self) -> Result<Application, StorefrontError> {
        let settings = self.settings;
        let mut log = Vec::new();

        let dotenv = load_dotenv(&settings.root)?;
        log.push(BootPhase::Environment {
            dotenv_loaded: dotenv.is_some(),
        });

        for subsystem in Subsystem::BOOT_ORDER {
            debug!(?subsystem, "registering subsystem");
            log.push(BootPhase::Subsystem(subsystem));
        }

        let default_url_host = dotenv
            .as_ref()
            .and_then(|vars| vars.get("APP_HOST"))
            .filter(|_| std::env::var_os("APP_HOST").is_none())
            .cloned()
            .unwrap_or_else(|| settings.app_host.clone());
        let engine = EngineSettings {
            environment: settings.environment.clone(),
            disable_migration_check: settings.disable_migration_check,
            mailer_sender: settings.mailer_sender.clone(),
            default_url_host,
        };
        log.push(BootPhase::Initializers);

        let auth = AuthService::new(IdentityRegistry::new(&self.identities)?);
        log.push(BootPhase::AuthenticationGlue);

        let routes = RouteTable::draw(auth.identities(), &self.families)?;
        log.push(BootPhase::Routes);

        let permissions = PermissionRegistry::storefront_defaults();
        log.push(BootPhase::AfterInitialize);

        let mode = settings
            .reload_mode
            .unwrap_or_else(|| ReloadMode::for_environment(&settings.environment));
        let mut extensions = ExtensionRegistry::new(mode);
        for ext in self.extensions {
            extensions.register(ext)?;
        }
        let base_profile = EngineProfile {
            app_host: engine.default_url_host.clone(),
            headers: Default::default(),
        };
        let mut profile = base_profile.clone();
        let applied = extensions.prepare(&mut profile);
        log.push(BootPhase::Prepared {
            extensions: applied,
        });

        info!(
            environment = %engine.environment,
            routes = routes.entries().len(),
            reload_mode = ?mode,
            extensions = ?extensions.manifest(),
            "application booted"
        );

        Ok(Application {
            engine,
            auth,
            routes,
            permissions,
            extensions,
            base_profile,
            profile: Mutex::new(profile),
            boot_log: log,
        })
    }
}

/// Variables from `<root>/.env`; a missing file is not an error.
///
/// The values are returned, never exported. Boot reads only `APP_HOST`
/// from them, and only when the process environment lacks it. Process-wide
/// variables come from the `.env` the binary loads at startup.
fn load_dotenv(root: &Path) -> Result<Option<HashMap<String, String>>, StorefrontError> {
    let path = root.join(".env");
    if !path.exists() {
        return Ok(None);
    }
    let iter = dotenvy::from_path_iter(&path).map_err(|e| {
        StorefrontError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
    })?;
    let mut vars = HashMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| {
            StorefrontError::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })?;
        vars.insert(key, value);
    }
    info!(path = %path.display(), count = vars.len(), "loaded .env");
    Ok(Some(vars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::identity::IdentityKind;
    use crate::app::permissions::{PermissionRole, PermissionSet};
    use std::path::PathBuf;

    fn settings(root: PathBuf) -> AppSettings {
        AppSettings {
            root,
            app_host: "shop.example.com".to_string(),
            ..AppSettings::default()
        }
    }

    #[test]
    fn phases_run_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = Bootstrap::new(&settings(dir.path().to_path_buf()))
            .boot()
            .expect("boots");

        let log = app.boot_log();
        assert_eq!(log[0], BootPhase::Environment { dotenv_loaded: false });
        let subsystems: Vec<Subsystem> = log
            .iter()
            .filter_map(|p| match p {
                BootPhase::Subsystem(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(subsystems, Subsystem::BOOT_ORDER);
        let tail = &log[log.len() - 5..];
        assert_eq!(
            tail,
            [
                BootPhase::Initializers,
                BootPhase::AuthenticationGlue,
                BootPhase::Routes,
                BootPhase::AfterInitialize,
                BootPhase::Prepared { extensions: 2 },
            ]
        );
    }

    #[test]
    fn permissions_are_assigned_after_initialize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = Bootstrap::new(&settings(dir.path().to_path_buf()))
            .boot()
            .expect("boots");
        assert_eq!(
            app.permissions().sets_for(PermissionRole::Default),
            [PermissionSet::DefaultCustomer]
        );
        assert_eq!(
            app.permissions().sets_for(IdentityKind::Admin.into()),
            [PermissionSet::SuperUser]
        );
        assert_eq!(app.engine().default_url_host, "shop.example.com");
        assert!(app.engine().disable_migration_check);
    }

    #[test]
    fn dotenv_in_app_root_supplies_app_host() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(".env"),
            "STOREFRONT_TEST_ONLY=1\nAPP_HOST=from-dotenv.example.com\n",
        )
        .expect("write .env");
        let app = Bootstrap::new(&settings(dir.path().to_path_buf()))
            .boot()
            .expect("boots");
        assert_eq!(app.boot_log()[0], BootPhase::Environment { dotenv_loaded: true });
        if std::env::var_os("APP_HOST").is_none() {
            assert_eq!(app.engine().default_url_host, "from-dotenv.example.com");
        }
        assert!(std::env::var_os("STOREFRONT_TEST_ONLY").is_none());
    }

    #[test]
    fn missing_admin_designation_fails_boot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Bootstrap::new(&settings(dir.path().to_path_buf()))
            .with_identities(vec![CustomerUser::descriptor()])
            .boot();
        assert!(matches!(result, Err(StorefrontError::InvalidConfig(_))));
    }

    #[test]
    fn load_once_profile_is_decorated_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = Bootstrap::new(&settings(dir.path().to_path_buf()))
            .boot()
            .expect("boots");
        assert_eq!(app.reload_mode(), ReloadMode::LoadOnce);

        let first = app.prepare();
        let second = app.prepare();
        assert_eq!(first, second);
        assert_eq!(
            first.headers.get(decorators::FORWARDED_HOST_HEADER).map(String::as_str),
            Some("shop.example.com")
        );
    }

    #[test]
    fn development_reapplies_extensions_each_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dev = AppSettings {
            environment: "development".to_string(),
            ..settings(dir.path().to_path_buf())
        };

        fn count_cycles(profile: &mut EngineProfile) {
            let n: usize = profile
                .headers
                .get("x-cycle")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            profile.headers.insert("x-cycle".to_string(), (n + 1).to_string());
        }

        let app = Bootstrap::new(&dev)
            .with_extension(Extension::new("count_cycles", 1, count_cycles))
            .boot()
            .expect("boots");
        assert_eq!(app.reload_mode(), ReloadMode::ReloadEachCycle);

        // Each cycle starts from the undecorated profile.
        for _ in 0..3 {
            let profile = app.prepare();
            assert_eq!(profile.headers.get("x-cycle").map(String::as_str), Some("1"));
        }
    }

    #[test]
    fn boot_once_returns_the_same_application() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path().to_path_buf());
        let first = boot_once(&settings).expect("boots");
        let second = boot_once(&settings).expect("boots");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
