use axum::{
    Json, Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Method, Request, StatusCode, Uri},
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use storefront::app::Bootstrap;
use storefront::config::AppSettings;
use storefront::server::engine::{EngineClient, HANDLER_HEADER, PERMISSIONS_HEADER};
use storefront::server::{StorefrontState, storefront_router};
use tower::ServiceExt;
use url::Url;

/// Stand-in engine that echoes what it received.
async fn spawn_engine() -> Url {
    async fn echo(method: Method, uri: Uri, headers: HeaderMap) -> Json<Value> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Json(json!({
            "server": "engine",
            "method": method.as_str(),
            "path": uri.path(),
            "handler": header(HANDLER_HEADER),
            "permissions": header(PERMISSIONS_HEADER),
            "forwarded_host": header("x-forwarded-host"),
        }))
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind engine");
    let addr = listener.local_addr().expect("engine addr");
    tokio::spawn(async move {
        axum::serve(listener, Router::new().fallback(echo))
            .await
            .expect("engine serves");
    });
    Url::parse(&format!("http://{addr}")).expect("engine url")
}

fn app(engine: Url) -> (Router, tempfile::TempDir) {
    let root = tempfile::tempdir().expect("tempdir");
    let settings = AppSettings {
        root: root.path().to_path_buf(),
        app_host: "shop.example.com".to_string(),
        engine_url: engine.clone(),
        ..AppSettings::default()
    };
    let application = Arc::new(Bootstrap::new(&settings).boot().expect("boots"));
    let client = EngineClient::new(engine, Duration::from_secs(5)).expect("client");
    (
        storefront_router(StorefrontState::new(application, client)),
        root,
    )
}

async fn call(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    call_with_headers(router, method, uri, &[]).await
}

async fn call_with_headers(
    router: &Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let resp = router
        .clone()
        .oneshot(builder.body(Body::empty()).expect("failed to build request"))
        .await
        .expect("request failed");
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_check_answers_without_the_engine() {
    let engine = Url::parse("http://127.0.0.1:9").expect("url");
    let (router, _root) = app(engine);

    let (status, body) = call(&router, Method::GET, "/up").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn customer_and_admin_sign_in_reach_their_own_handlers() {
    let (router, _root) = app(spawn_engine().await);

    let (status, body) = call(&router, Method::GET, "/users/sign_in").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["handler"], "spree/user_sessions");
    assert_eq!(body["permissions"], "default_customer");
    assert_eq!(body["forwarded_host"], "shop.example.com");

    let (status, body) = call(&router, Method::POST, "/admin_user/sign_in").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["handler"], "spree/admin/user_sessions");
    assert_eq!(body["permissions"], "super_user");
    assert_eq!(body["method"], "POST");
}

#[tokio::test]
async fn admin_registration_is_not_an_auth_route() {
    let (router, _root) = app(spawn_engine().await);

    let (status, body) = call(&router, Method::GET, "/admin_user/sign_up").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/admin_user/sign_up");
    assert!(body["handler"].is_null());

    let (_, body) = call(&router, Method::GET, "/users/sign_up").await;
    assert_eq!(body["handler"], "spree/user_registrations");
}

#[tokio::test]
async fn everything_else_is_mounted_engine_traffic() {
    let (router, _root) = app(spawn_engine().await);

    let (status, body) = call(&router, Method::GET, "/products/ruby-tote?color=red").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "/products/ruby-tote");
    assert!(body["handler"].is_null());
    assert!(body["permissions"].is_null());

    // Unclaimed methods on an auth path go to the engine too.
    let (_, body) = call(&router, Method::PUT, "/users/sign_in").await;
    assert!(body["handler"].is_null());
}

#[tokio::test]
async fn unreachable_engine_is_a_bad_gateway() {
    let engine = Url::parse("http://127.0.0.1:9").expect("url");
    let (router, _root) = app(engine);

    let (status, body) = call(&router, Method::GET, "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "BAD_GATEWAY");
}

#[tokio::test]
async fn scheme_relative_targets_stay_on_the_engine() {
    let (router, _root) = app(spawn_engine().await);

    let (status, body) = call(&router, Method::GET, "//127.0.0.1:9/steal?x=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server"], "engine");
    assert_eq!(body["path"], "//127.0.0.1:9/steal");
}

#[tokio::test]
async fn client_supplied_trust_headers_are_dropped() {
    let (router, _root) = app(spawn_engine().await);
    let spoofed = [
        (PERMISSIONS_HEADER, "super_user"),
        (HANDLER_HEADER, "spree/admin/orders"),
    ];

    let (status, body) =
        call_with_headers(&router, Method::GET, "/admin/orders", &spoofed).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["permissions"].is_null());
    assert!(body["handler"].is_null());

    let (_, body) = call_with_headers(&router, Method::GET, "/users/sign_in", &spoofed).await;
    assert_eq!(body["permissions"], "default_customer");
    assert_eq!(body["handler"], "spree/user_sessions");
}
