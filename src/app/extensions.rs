//! Build-time extension points for engine-facing behaviour.
//!
//! Extensions are plain functions registered with a name and a version.
//! [`ExtensionRegistry::prepare`] is the per-cycle hook: in load-once mode
//! each extension is applied at most once for the lifetime of the
//! registry, in reload mode it is applied on every call.

use crate::error::StorefrontError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadMode {
    LoadOnce,
    ReloadEachCycle,
}

impl ReloadMode {
    /// Development reloads on every request; everything else loads once.
    pub fn for_environment(environment: &str) -> Self {
        match environment {
            "development" => ReloadMode::ReloadEachCycle,
            _ => ReloadMode::LoadOnce,
        }
    }
}

pub struct Extension<T> {
    pub name: &'static str,
    pub version: u32,
    apply: fn(&mut T),
}

impl<T> Extension<T> {
    pub const fn new(name: &'static str, version: u32, apply: fn(&mut T)) -> Self {
        Self { name, version, apply }
    }
}

pub struct ExtensionRegistry<T> {
    mode: ReloadMode,
    extensions: Vec<Extension<T>>,
    applied: Mutex<HashSet<&'static str>>,
}

impl<T> ExtensionRegistry<T> {
    pub fn new(mode: ReloadMode) -> Self {
        Self {
            mode,
            extensions: Vec::new(),
            applied: Mutex::new(HashSet::new()),
        }
    }

    pub fn mode(&self) -> ReloadMode {
        self.mode
    }

    pub fn register(&mut self, extension: Extension<T>) -> Result<(), StorefrontError> {
        if self.extensions.iter().any(|e| e.name == extension.name) {
            return Err(StorefrontError::DuplicateExtension(extension.name.to_string()));
        }
        self.extensions.push(extension);
        Ok(())
    }

    /// `(name, version)` of every registered extension, in registration order.
    pub fn manifest(&self) -> Vec<(&'static str, u32)> {
        self.extensions.iter().map(|e| (e.name, e.version)).collect()
    }

    /// Apply extensions to `target`; returns how many were applied this call.
    pub fn prepare(&self, target: &mut T) -> usize {
        let mut applied = self
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for ext in &self.extensions {
            if self.mode == ReloadMode::LoadOnce && !applied.insert(ext.name) {
                continue;
            }
            (ext.apply)(target);
            count += 1;
        }
        if count > 0 {
            debug!(mode = ?self.mode, count, "extensions applied");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        hits: usize,
    }

    fn bump(c: &mut Counter) {
        c.hits += 1;
    }

    #[test]
    fn load_once_applies_a_single_time() {
        let mut registry = ExtensionRegistry::new(ReloadMode::LoadOnce);
        registry.register(Extension::new("bump", 1, bump)).expect("unique");

        let mut target = Counter::default();
        assert_eq!(registry.prepare(&mut target), 1);
        assert_eq!(registry.prepare(&mut target), 0);
        assert_eq!(registry.prepare(&mut Counter::default()), 0);
        assert_eq!(target.hits, 1);
    }

    #[test]
    fn reload_reapplies_every_cycle() {
        let mut registry = ExtensionRegistry::new(ReloadMode::ReloadEachCycle);
        registry.register(Extension::new("bump", 1, bump)).expect("unique");

        let mut target = Counter::default();
        for _ in 0..3 {
            registry.prepare(&mut target);
        }
        assert_eq!(target.hits, 3);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ExtensionRegistry::new(ReloadMode::LoadOnce);
        registry.register(Extension::new("bump", 1, bump)).expect("unique");
        let err = registry
            .register(Extension::new("bump", 2, bump))
            .expect_err("same name twice");
        assert!(matches!(err, StorefrontError::DuplicateExtension(name) if name == "bump"));
        assert_eq!(registry.manifest(), [("bump", 1)]);
    }

    #[test]
    fn environment_picks_default_mode() {
        assert_eq!(ReloadMode::for_environment("development"), ReloadMode::ReloadEachCycle);
        assert_eq!(ReloadMode::for_environment("production"), ReloadMode::LoadOnce);
        assert_eq!(ReloadMode::for_environment("test"), ReloadMode::LoadOnce);
    }
}
