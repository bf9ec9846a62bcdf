//! Reverse proxy for dynamic provider paths that are not cached.

use axum::{
    body::{Body, to_bytes},
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::Response,
};
use tracing::{debug, warn};

use super::handlers::{ApiError, Reason};
use crate::providers::Provider;
use crate::upstream::INVENTORY_TIMEOUT;

/// Largest request body forwarded to a provider service.
const MAX_BODY: usize = 16 * 1024 * 1024;

const PROVIDER_NAME: &str = "x-forklift-provider-name";
const PROVIDER_NAMESPACE: &str = "x-forklift-provider-namespace";
const PROVIDER_UID: &str = "x-forklift-provider-uid";

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn forwarded_headers(incoming: &HeaderMap, provider: &Provider) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    for (name, value) in [
        (PROVIDER_NAME, &provider.name),
        (PROVIDER_NAMESPACE, &provider.namespace),
        (PROVIDER_UID, &provider.uid),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    headers
}

/// End-to-end response headers; the body is re-framed on the way out.
fn relayed_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Forward `request` to `{service_url}/{path}{?query}` and stream the
/// answer back with its status and end-to-end headers.
pub async fn forward(
    client: &reqwest::Client,
    provider: &Provider,
    service_url: &str,
    path: &str,
    request: Request,
) -> Result<Response, ApiError> {
    let mut url = format!(
        "{}/{}",
        service_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(query) = request.uri().query() {
        url.push('?');
        url.push_str(query);
    }
    let method = request.method().clone();
    let headers = forwarded_headers(request.headers(), provider);
    let body = to_bytes(request.into_body(), MAX_BODY)
        .await
        .map_err(|e| ApiError::bad_request(format!("request body: {}", e)))?;

    debug!(uid = %provider.uid, %method, url = %url, "Proxying request");
    let upstream = client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .timeout(INVENTORY_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            warn!(uid = %provider.uid, url = %url, "Proxy request failed: {}", e);
            ApiError::new(Reason::Upstream, format!("{}: {}", url, e))
        })?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(headers) = response.headers_mut() {
        *headers = relayed_headers(upstream.headers());
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ApiError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_headers() {
        let provider = Provider {
            uid: "u1".into(),
            name: "lab".into(),
            namespace: "mtv".into(),
            provider_type: "acme".into(),
            url: None,
            refresh_interval: None,
        };
        let mut incoming = HeaderMap::new();
        incoming.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        incoming.insert(header::CONNECTION, HeaderValue::from_static("close"));
        incoming.insert(header::HOST, HeaderValue::from_static("inventory:8080"));

        let headers = forwarded_headers(&incoming, &provider);
        assert_eq!(headers[header::ACCEPT], "application/json");
        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key(header::HOST));
        assert_eq!(headers[PROVIDER_NAME], "lab");
        assert_eq!(headers[PROVIDER_NAMESPACE], "mtv");
        assert_eq!(headers[PROVIDER_UID], "u1");
    }

    #[test]
    fn test_relayed_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        upstream.insert(header::ETAG, HeaderValue::from_static("\"r7\""));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("20"));

        let headers = relayed_headers(&upstream);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(headers[header::CONTENT_ENCODING], "gzip");
        assert_eq!(headers[header::ETAG], "\"r7\"");
        assert!(!headers.contains_key(header::TRANSFER_ENCODING));
        assert!(!headers.contains_key(header::CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn test_forward_keeps_content_encoding() {
        use axum::{Router, routing::get};

        // gzip magic plus a few payload bytes; passed through untouched.
        const GZIPPED: &[u8] = &[0x1f, 0x8b, 0x08, 0x00, 0x01, 0x02, 0x03];
        let router = Router::new().route(
            "/hosts",
            get(|| async {
                (
                    [
                        (header::CONTENT_TYPE, "application/json"),
                        (header::CONTENT_ENCODING, "gzip"),
                    ],
                    GZIPPED,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let provider = Provider {
            uid: "u1".into(),
            name: "lab".into(),
            namespace: "mtv".into(),
            provider_type: "acme".into(),
            url: None,
            refresh_interval: None,
        };
        let request = Request::builder()
            .uri("/providers/acme/u1/hosts")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap();
        let response = forward(
            &reqwest::Client::new(),
            &provider,
            &format!("http://{}", addr),
            "hosts",
            request,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let body = to_bytes(response.into_body(), MAX_BODY).await.unwrap();
        assert_eq!(&body[..], GZIPPED);
    }
}
