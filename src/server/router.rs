use axum::{
    Json, Router,
    extract::{Request, State},
    http::Method,
    middleware,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter},
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::StorefrontError;
use crate::app::identity::{Authenticator, IdentityKind};
use crate::app::routes::{AuthAction, RouteTarget};
use crate::app::{Application, EngineProfile};
use crate::middleware::prepare::prepare_extensions;
use crate::server::engine::{EngineClient, Forwarding};

#[derive(Clone)]
pub struct StorefrontState {
    pub app: Arc<Application>,
    pub engine: EngineClient,
}

impl StorefrontState {
    pub fn new(app: Arc<Application>, engine: EngineClient) -> Self {
        Self { app, engine }
    }

    pub fn from_settings(
        app: Arc<Application>,
        settings: &crate::config::AppSettings,
    ) -> Result<Self, StorefrontError> {
        let engine = EngineClient::new(
            settings.engine_url.clone(),
            Duration::from_secs(settings.upstream_timeout_secs),
        )?;
        Ok(Self::new(app, engine))
    }
}

/// Build the router from the application's route table.
pub fn storefront_router(state: StorefrontState) -> Router {
    let mut by_path: BTreeMap<String, MethodRouter<StorefrontState>> = BTreeMap::new();

    for entry in state.app.routes().entries() {
        let filter = method_filter(&entry.method);
        let route = by_path
            .remove(&entry.path)
            .unwrap_or_else(MethodRouter::new);
        let route = match entry.target.clone() {
            RouteTarget::Health => route.get(health),
            RouteTarget::Auth {
                kind,
                action,
                handler,
            } => route.on(
                filter,
                move |State(state): State<StorefrontState>, req: Request| {
                    let handler = handler.clone();
                    async move { auth_handler(state, kind, action, &handler, req).await }
                },
            ),
        };
        by_path.insert(entry.path.clone(), route);
    }

    let mut router = Router::new();
    for (path, route) in by_path {
        router = router.route(&path, route.fallback(engine_mount));
    }

    router
        .fallback(engine_mount)
        .layer(middleware::from_fn_with_state(state.clone(), prepare_extensions))
        .with_state(state)
}

fn method_filter(method: &Method) -> MethodFilter {
    [
        (Method::POST, MethodFilter::POST),
        (Method::PUT, MethodFilter::PUT),
        (Method::PATCH, MethodFilter::PATCH),
        (Method::DELETE, MethodFilter::DELETE),
        (Method::HEAD, MethodFilter::HEAD),
        (Method::OPTIONS, MethodFilter::OPTIONS),
    ]
    .into_iter()
    .find_map(|(m, filter)| (m == *method).then_some(filter))
    .unwrap_or(MethodFilter::GET)
}

/// GET /up
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn auth_handler(
    state: StorefrontState,
    kind: IdentityKind,
    action: AuthAction,
    handler: &str,
    req: Request,
) -> Result<Response, StorefrontError> {
    state.app.auth().require(kind, action.capability())?;
    let profile = request_profile(&state, &req);
    let forwarding = Forwarding {
        handler: Some(handler),
        permissions: Some(state.app.permissions().header_value(kind.into())),
    };
    state.engine.forward(req, &profile, forwarding).await
}

/// Everything the route table does not claim goes to the engine mounted at `/`.
async fn engine_mount(
    State(state): State<StorefrontState>,
    req: Request,
) -> Result<Response, StorefrontError> {
    let profile = request_profile(&state, &req);
    state
        .engine
        .forward(req, &profile, Forwarding::default())
        .await
}

fn request_profile(state: &StorefrontState, req: &Request) -> EngineProfile {
    req.extensions()
        .get::<EngineProfile>()
        .cloned()
        .unwrap_or_else(|| state.app.prepare())
}
