//! HTTP response helpers shared by the proxy, the dashboard and the gate.

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use serde::Serialize;
use tracing::error;

use crate::error::ProxyError;

/// Body type used for every request and response inside the router.
///
/// Inbound bodies and backend responses are streamed through unchanged;
/// locally generated responses are wrapped full bodies.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Wrap bytes into a [`ProxyBody`].
pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Empty [`ProxyBody`].
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Build a response, falling back to a bare 500 if the parts are invalid.
fn build(status: StatusCode, content_type: Option<&'static str>, body: ProxyBody) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder.body(body).unwrap_or_else(|e| {
        error!(error = %e, "Failed to build response");
        let mut response = Response::new(empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    build(status, None, empty())
}

pub fn html_response(status: StatusCode, html: String) -> Response<ProxyBody> {
    build(status, Some("text/html; charset=utf-8"), full(html))
}

pub fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<ProxyBody> {
    build(status, Some("text/plain; charset=utf-8"), full(text))
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => build(status, Some("application/json"), full(body)),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error occurred: {e}"),
        ),
    }
}

/// Redirect with a `Location` header.
pub fn redirect(status: StatusCode, location: &str) -> Response<ProxyBody> {
    let mut response = empty_response(status);
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
        }
        Err(_) => *response.status_mut() = StatusCode::BAD_REQUEST,
    }
    response
}

/// Gateway response for a failed forward.
pub fn gateway_error_response(err: &ProxyError) -> Response<ProxyBody> {
    text_response(err.status(), err.status().canonical_reason().unwrap_or("Bad Gateway"))
}

/// The client asked for JSON via `Content-Type: application/json`.
pub fn wants_json<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

/// Value of a named cookie.
pub fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Headers that apply to a single transport hop.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
}

/// Protocol a request or response asks to switch to, if `Connection`
/// carries the `upgrade` token.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !requested {
        return None;
    }
    headers.get(header::UPGRADE).cloned()
}

/// Put back the upgrade pair after [`strip_hop_by_hop`].
pub fn restore_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, protocol);
}
