//! On-host directory layout of a deployment root.
//!
//! ```text
//! deploy_to/
//!   current -> releases/20260101120000
//!   releases/<timestamp>/
//!   shared/            linked dirs, linked files, sockets, pids
//!   repo/              git mirror
//!   revisions.log
//!   .deploy.lock/
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

pub const RELEASE_NAME_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployLayout {
    root: PathBuf,
}

impl DeployLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn releases(&self) -> PathBuf {
        self.root.join("releases")
    }

    pub fn release(&self, name: &str) -> PathBuf {
        self.releases().join(name)
    }

    pub fn shared(&self) -> PathBuf {
        self.root.join("shared")
    }

    pub fn current(&self) -> PathBuf {
        self.root.join("current")
    }

    /// Staging name for the atomic `current` swap.
    pub fn current_tmp(&self) -> PathBuf {
        self.root.join("current_tmp")
    }

    pub fn repo(&self) -> PathBuf {
        self.root.join("repo")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(".deploy.lock")
    }

    pub fn revision_log(&self) -> PathBuf {
        self.root.join("revisions.log")
    }
}

pub fn release_name_at(at: DateTime<Utc>) -> String {
    at.format(RELEASE_NAME_FORMAT).to_string()
}

pub fn is_release_name(name: &str) -> bool {
    name.len() == 14 && NaiveDateTime::parse_from_str(name, RELEASE_NAME_FORMAT).is_ok()
}

/// Sorted release names found in a `ls -1` listing; other entries are ignored.
pub fn parse_release_listing(listing: &str) -> Vec<String> {
    let mut names: Vec<String> = listing
        .lines()
        .map(str::trim)
        .filter(|name| is_release_name(name))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

/// Releases to delete so that at most `keep` remain; the live one is never chosen.
pub fn releases_to_prune(sorted: &[String], keep: usize, live: Option<&str>) -> Vec<String> {
    if sorted.len() <= keep {
        return Vec::new();
    }
    let excess = sorted.len() - keep;
    let mut doomed: Vec<String> = sorted
        .iter()
        .filter(|name| Some(name.as_str()) != live)
        .take(excess)
        .cloned()
        .collect();
    doomed.sort();
    doomed
}

/// Release immediately older than `live`.
pub fn release_before<'a>(sorted: &'a [String], live: &str) -> Option<&'a String> {
    let idx = sorted.iter().position(|name| name == live)?;
    idx.checked_sub(1).map(|prev| &sorted[prev])
}
