//! axum adapter
//!
//! Wraps a router so every request runs through the pipeline:
//!
//! ```rust,no_run
//! use appguard::adapter::axum::{protect, PeerAddrs};
//! use axum::{routing::get, Router};
//!
//! # async fn example(guard: appguard::AppGuard) -> std::io::Result<()> {
//! let app = protect(Router::new().route("/", get(|| async { "ok" })), guard.pipeline());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, app.into_make_service_with_connect_info::<PeerAddrs>()).await
//! # }
//! ```
//!
//! Without connect info the source address comes from `x-real-ip` or
//! `x-forwarded-for` only. axum hands the response back to the middleware
//! before anything is written, so a response-stage DENY always replaces
//! the response; `Outcome::Terminate` aborts the connection mid-body.

use super::{flatten_headers, HostResponse};
use crate::pipeline::{Outcome, Pipeline};
use crate::types::{InboundRequest, PeerInfo, Rejection, RejectionBody};
use axum::body::Body;
use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, OriginalUri, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::serve::IncomingStream;
use axum::{Json, Router};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Largest request body buffered for the request stage
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Socket addresses of an accepted connection
///
/// Use with `into_make_service_with_connect_info::<PeerAddrs>()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddrs {
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl Connected<IncomingStream<'_>> for PeerAddrs {
    fn connect_info(target: IncomingStream<'_>) -> Self {
        Self {
            remote: target.remote_addr(),
            local: target.local_addr().ok(),
        }
    }
}

/// Guard every route of `router`
pub fn protect<S>(router: Router<S>, pipeline: Arc<Pipeline>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum::middleware::from_fn_with_state(pipeline, middleware))
}

/// Middleware function, for use with `axum::middleware::from_fn_with_state`
pub async fn middleware(
    State(pipeline): State<Arc<Pipeline>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to buffer request body");
            return rejection_response(Rejection {
                status: StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
                body: RejectionBody {
                    success: false,
                    message: "Payload too large".to_string(),
                },
            });
        }
    };

    let inbound = inbound_request(&parts, &body);
    let request = Request::from_parts(parts, Body::from(body));

    match pipeline.handle(inbound, next.run(request)).await {
        Outcome::Forward(response) => response,
        Outcome::Deny(rejection) | Outcome::Fault(rejection) => rejection_response(rejection),
        Outcome::Terminate => terminate_response(),
    }
}

impl HostResponse for Response {
    fn status(&self) -> u16 {
        Response::status(self).as_u16()
    }

    fn headers(&self) -> HashMap<String, String> {
        header_map(Response::headers(self))
    }
}

/// Build the pipeline's view of a request from its parts and buffered body
pub fn inbound_request(parts: &Parts, body: &Bytes) -> InboundRequest {
    let uri = parts
        .extensions
        .get::<OriginalUri>()
        .map(|original| &original.0)
        .unwrap_or(&parts.uri);

    let headers = header_map(&parts.headers);
    let protocol = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .or_else(|| uri.scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string());

    let (remote, local) = match parts.extensions.get::<ConnectInfo<PeerAddrs>>() {
        Some(ConnectInfo(addrs)) => (Some(addrs.remote), addrs.local),
        None => (
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            None,
        ),
    };

    InboundRequest {
        peer: PeerInfo {
            remote_ip: remote.map(|a| a.ip().to_string()),
            remote_port: remote.map(|a| a.port()),
            local_ip: local.map(|a| a.ip().to_string()),
            local_port: local.map(|a| a.port()),
            protocol,
        },
        method: parts.method.to_string(),
        original_url: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers,
        query: Query::<HashMap<String, String>>::try_from_uri(uri)
            .map(|Query(query)| query)
            .unwrap_or_default(),
        body: text_body(body),
    }
}

/// Body as sent to the request stage; binary bodies are not forwarded
/// rather than rewritten
fn text_body(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    match std::str::from_utf8(body) {
        Ok(text) => Some(text.to_string()),
        Err(_) => {
            tracing::debug!(len = body.len(), "Request body is not UTF-8, omitting it");
            None
        }
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    flatten_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_bytes())))
}

fn rejection_response(rejection: Rejection) -> Response {
    let status =
        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(rejection.body)).into_response()
}

/// A response whose body fails immediately, so the server drops the
/// connection instead of completing it
fn terminate_response() -> Response {
    let aborted = futures::stream::once(async {
        Err::<Bytes, _>(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "connection terminated by appguard",
        ))
    });
    Response::new(Body::from_stream(aborted))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(request: axum::http::Request<()>) -> Parts {
        request.into_parts().0
    }

    #[test]
    fn test_inbound_request_from_parts() {
        let mut request = axum::http::Request::builder()
            .method("POST")
            .uri("/login?next=%2Fhome&lang=en")
            .header("x-forwarded-proto", "HTTPS")
            .header("content-type", "application/json")
            .body(())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(PeerAddrs {
            remote: "198.51.100.4:52000".parse().unwrap(),
            local: Some("10.0.0.1:443".parse().unwrap()),
        }));

        let inbound = inbound_request(&parts(request), &Bytes::from_static(b"{\"u\":1}"));

        assert_eq!(inbound.method, "POST");
        assert_eq!(inbound.original_url, "/login?next=%2Fhome&lang=en");
        assert_eq!(inbound.query["next"], "/home");
        assert_eq!(inbound.query["lang"], "en");
        assert_eq!(inbound.body.as_deref(), Some("{\"u\":1}"));
        assert_eq!(inbound.headers["content-type"], "application/json");

        let connection = inbound.connection_info();
        assert_eq!(connection.source_ip, "198.51.100.4");
        assert_eq!(connection.source_port, Some(52000));
        assert_eq!(connection.destination_port, Some(443));
        assert_eq!(connection.protocol, "https");
    }

    #[test]
    fn test_non_utf8_body_is_omitted() {
        let parts = parts(
            axum::http::Request::builder()
                .method("POST")
                .uri("/upload")
                .body(())
                .unwrap(),
        );

        let binary = Bytes::from_static(&[0x89, b'P', b'N', b'G', 0xff, 0xfe]);
        assert_eq!(inbound_request(&parts, &binary).body, None);

        let text = Bytes::from_static("naïve=1".as_bytes());
        assert_eq!(
            inbound_request(&parts, &text).body.as_deref(),
            Some("naïve=1")
        );
        assert_eq!(inbound_request(&parts, &Bytes::new()).body, None);
    }

    #[test]
    fn test_plain_socket_connect_info() {
        let mut request = axum::http::Request::builder()
            .uri("/")
            .body(())
            .unwrap();
        let addr: SocketAddr = "192.0.2.5:4000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        let inbound = inbound_request(&parts(request), &Bytes::new());
        assert_eq!(inbound.peer.remote_ip.as_deref(), Some("192.0.2.5"));
        assert_eq!(inbound.peer.protocol, "http");
        assert!(inbound.body.is_none());
    }

    #[tokio::test]
    async fn test_rejection_response_body() {
        let response = rejection_response(Rejection::unauthorized());
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "message": "Unauthorized"}));
    }

    #[tokio::test]
    async fn test_terminate_response_body_fails() {
        let response = terminate_response();
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .is_err());
    }
}
