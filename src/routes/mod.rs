//! Response helpers shared by the tenant edge and the control plane
//!
//! Control-plane responses use the standard envelope {data, meta, error};
//! error bodies always carry a machine-readable code and a human message,
//! never stack traces or script sources.

pub mod admin;
pub mod edge;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::{json, Value};

use crate::types::FaztError;

pub type HttpResponse = Response<Full<Bytes>>;

/// Plain JSON body with a status
pub fn json_response(status: StatusCode, body: &Value) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Control-plane success envelope
pub fn envelope_ok(data: Value) -> HttpResponse {
    json_response(
        StatusCode::OK,
        &json!({ "data": data, "meta": Value::Null, "error": Value::Null }),
    )
}

/// Control-plane success envelope with meta
pub fn envelope_ok_meta(data: Value, meta: Value) -> HttpResponse {
    json_response(
        StatusCode::OK,
        &json!({ "data": data, "meta": meta, "error": Value::Null }),
    )
}

/// Control-plane error envelope
pub fn envelope_err(status: StatusCode, code: &str, message: &str) -> HttpResponse {
    json_response(
        status,
        &json!({
            "data": Value::Null,
            "meta": Value::Null,
            "error": { "code": code, "message": message },
        }),
    )
}

/// Map an error onto the wire: status from the taxonomy, sanitized message
pub fn error_response(err: &FaztError) -> HttpResponse {
    let message = match err {
        // Internal detail stays in the logs
        FaztError::Internal(_) | FaztError::Database(_) => "internal error".to_string(),
        FaztError::Script(_) => "handler failed".to_string(),
        other => other.to_string(),
    };
    let mut builder = Response::builder()
        .status(err.status())
        .header("Content-Type", "application/json");
    if matches!(err, FaztError::RateLimited) {
        builder = builder.header("Retry-After", "1");
    }
    if matches!(err, FaztError::AuthRequired) {
        builder = builder.header("WWW-Authenticate", "Session");
    }
    builder
        .body(Full::new(Bytes::from(
            json!({ "code": err.code(), "message": message }).to_string(),
        )))
        .unwrap()
}

pub fn text_response(status: StatusCode, body: &str) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

pub fn html_response(status: StatusCode, body: String) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

pub fn redirect_response(status: StatusCode, location: &str) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("Location", location)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub fn not_found_response() -> HttpResponse {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({ "code": "not_found", "message": "not found" }),
    )
}

pub fn method_not_allowed() -> HttpResponse {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &json!({ "code": "method_not_allowed", "message": "method not allowed" }),
    )
}

/// Security headers applied to every response on the way out. The CSP
/// whitelists a fixed CDN set plus the root domain's subdomains for
/// connect-src so app frontends can reach their own APIs and websockets.
pub fn apply_security_headers(response: &mut HttpResponse, root_domain: &str, over_tls: bool) {
    let headers = response.headers_mut();
    let csp = format!(
        "default-src 'self' 'unsafe-inline' https://cdn.jsdelivr.net https://unpkg.com \
         https://cdnjs.cloudflare.com; \
         connect-src 'self' https://*.{root_domain} wss://*.{root_domain}; \
         object-src 'none'; frame-ancestors 'none'"
    );
    headers.insert("Content-Security-Policy", csp.parse().unwrap());
    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    if over_tls {
        headers.insert(
            "Strict-Transport-Security",
            "max-age=63072000; includeSubDomains".parse().unwrap(),
        );
    }
}

/// Version payload for /version and the system info endpoint
pub fn version_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        "built_at": option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes() {
        let ok = envelope_ok(json!({"x": 1}));
        assert_eq!(ok.status(), StatusCode::OK);

        let err = envelope_err(StatusCode::BAD_REQUEST, "validation", "bad field");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_responses_carry_codes_and_hide_detail() {
        let resp = error_response(&FaztError::RateLimited);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("Retry-After"));

        let resp = error_response(&FaztError::Internal("secret path /x/y".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // Sanitized: inner detail must not leak
        let body = format!("{:?}", resp.body());
        assert!(!body.contains("secret path"));
    }

    #[test]
    fn security_headers_applied() {
        let mut resp = text_response(StatusCode::OK, "ok");
        apply_security_headers(&mut resp, "example.com", true);
        let csp = resp.headers()["Content-Security-Policy"].to_str().unwrap();
        assert!(csp.contains("https://*.example.com"));
        assert!(csp.contains("object-src 'none'"));
        assert!(csp.contains("frame-ancestors 'none'"));
        assert!(resp.headers().contains_key("Strict-Transport-Security"));

        let mut plain = text_response(StatusCode::OK, "ok");
        apply_security_headers(&mut plain, "example.com", false);
        assert!(!plain.headers().contains_key("Strict-Transport-Security"));
    }
}
