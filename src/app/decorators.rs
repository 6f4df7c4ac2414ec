//! Extensions shipped with the storefront.

use crate::app::EngineProfile;
use crate::app::extensions::Extension;

pub const STOREFRONT_HEADER: &str = "x-storefront-app";
pub const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

fn tag_storefront(profile: &mut EngineProfile) {
    profile
        .headers
        .insert(STOREFRONT_HEADER.to_string(), env!("CARGO_PKG_VERSION").to_string());
}

fn forward_app_host(profile: &mut EngineProfile) {
    let host = profile.app_host.clone();
    profile.headers.insert(FORWARDED_HOST_HEADER.to_string(), host);
}

pub fn builtin() -> Vec<Extension<EngineProfile>> {
    vec![
        Extension::new("tag_storefront", 1, tag_storefront),
        Extension::new("forward_app_host", 1, forward_app_host),
    ]
}
