use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::server::router::StorefrontState;

/// Per-request prepare hook: resolves the engine profile for this request.
///
/// Load-once applications get the profile decorated at boot; reload mode
/// re-runs every extension here.
pub async fn prepare_extensions(
    State(state): State<StorefrontState>,
    mut req: Request,
    next: Next,
) -> Response {
    let profile = state.app.prepare();
    req.extensions_mut().insert(profile);
    next.run(req).await
}
