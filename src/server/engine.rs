use crate::app::EngineProfile;
use crate::error::StorefrontError;
use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri, header};
use axum::response::Response;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Largest request body forwarded to the engine.
pub const MAX_FORWARD_BODY: usize = 16 * 1024 * 1024;

pub const HANDLER_HEADER: &str = "x-storefront-handler";
pub const PERMISSIONS_HEADER: &str = "x-storefront-permissions";

/// Set only by the router; client-supplied copies are dropped.
const FORWARDING_HEADERS: [&str; 2] = [HANDLER_HEADER, PERMISSIONS_HEADER];

const HOP_BY_HOP: [HeaderName; 5] = [
    header::CONNECTION,
    header::HOST,
    header::TE,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// HTTP client for the mounted commerce engine.
#[derive(Clone)]
pub struct EngineClient {
    client: reqwest::Client,
    base: Url,
}

/// Extra headers for one forwarded request.
#[derive(Debug, Default)]
pub struct Forwarding<'a> {
    pub handler: Option<&'a str>,
    pub permissions: Option<String>,
}

impl EngineClient {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, StorefrontError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("storefront/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Engine URL for `uri`. Only the path and query are taken from the
    /// request; scheme and authority always come from the engine base.
    fn upstream_url(&self, uri: &Uri) -> Url {
        let mut url = self.base.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url
    }

    pub async fn forward(
        &self,
        req: Request,
        profile: &EngineProfile,
        forwarding: Forwarding<'_>,
    ) -> Result<Response, StorefrontError> {
        let (parts, body) = req.into_parts();
        let url = self.upstream_url(&parts.uri);

        let body = to_bytes(body, MAX_FORWARD_BODY)
            .await
            .map_err(|e| StorefrontError::InvalidRequest(format!("request body: {e}")))?;

        let mut headers = strip_hop_by_hop(parts.headers);
        for name in FORWARDING_HEADERS {
            headers.remove(name);
        }
        for (name, value) in &profile.headers {
            insert_header(&mut headers, name, value);
        }
        if let Some(handler) = forwarding.handler {
            insert_header(&mut headers, HANDLER_HEADER, handler);
        }
        if let Some(permissions) = forwarding.permissions.as_deref() {
            insert_header(&mut headers, PERMISSIONS_HEADER, permissions);
        }

        debug!(
            method = %parts.method,
            url = %url,
            handler = ?forwarding.handler,
            "forwarding to engine"
        );
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers().clone());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!(header = %name, "skipping header that is not valid HTTP"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("shop.example.com"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        let kept = strip_hop_by_hop(headers);
        assert!(kept.get(header::HOST).is_none());
        assert!(kept.get(header::CONNECTION).is_none());
        assert_eq!(kept.get(header::ACCEPT).and_then(|v| v.to_str().ok()), Some("text/html"));
    }

    #[test]
    fn request_target_cannot_replace_the_engine_authority() {
        let engine = EngineClient::new(
            Url::parse("http://127.0.0.1:3000").expect("url"),
            Duration::from_secs(1),
        )
        .expect("client");
        let uri: Uri = "//evil.example.com:8080/steal?x=1".parse().expect("uri");
        let url = engine.upstream_url(&uri);
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(3000));
        assert_eq!(url.path(), "//evil.example.com:8080/steal");
        assert_eq!(url.query(), Some("x=1"));
    }

    #[test]
    fn invalid_header_values_are_skipped() {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "x-ok", "yes");
        insert_header(&mut headers, "x-bad", "line\nbreak");
        assert!(headers.get("x-ok").is_some());
        assert!(headers.get("x-bad").is_none());
    }
}
