//! API Middleware
//!
//! Caller identity and request logging middleware.

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::domain::{OperationContext, Role};

// =========================================================================
// Caller identity middleware
// =========================================================================

/// Build the operation context from identity headers.
///
/// Identity is asserted by the gateway in front of this service: the
/// engine trusts `X-Caller-Id` and `X-Caller-Role` as handed to it. The
/// role defaults to `customer` when absent; an unknown role is rejected
/// rather than downgraded.
pub async fn identity_middleware(
    headers: HeaderMap,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let caller_id = match headers.get("X-Caller-Id").and_then(|v| v.to_str().ok()) {
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(id) => id,
            Err(_) => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "Invalid X-Caller-Id header format",
                        "error_code": "invalid_caller_id"
                    })),
                )
                    .into_response());
            }
        },
        None => {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "Missing X-Caller-Id header",
                    "error_code": "missing_caller_id"
                })),
            )
                .into_response());
        }
    };

    let role = match headers.get("X-Caller-Role").and_then(|v| v.to_str().ok()) {
        Some(raw) => match raw.parse::<Role>() {
            Ok(role) => role,
            Err(_) => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "Invalid X-Caller-Role header: expected customer or operator",
                        "error_code": "invalid_caller_role"
                    })),
                )
                    .into_response());
            }
        },
        None => Role::Customer,
    };

    // Extract correlation ID or generate a new one
    let correlation_id = headers
        .get("X-Correlation-Id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let context = OperationContext::new(caller_id, role).with_correlation_id(correlation_id);
    request.extensions_mut().insert(context);

    Ok(next.run(request).await)
}

// =========================================================================
// Header masking
// =========================================================================

/// Headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "idempotency-key",
];

/// Mask sensitive headers for logging
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_lowercase();
            let masked_value = if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[invalid utf8]").to_string()
            };
            (name.to_string(), masked_value)
        })
        .collect()
}

// =========================================================================
// Request logging middleware
// =========================================================================

/// Request logging middleware
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let version = request.version();

    // Mask sensitive headers
    let headers = mask_headers_for_logging(request.headers());

    // Extract correlation ID if available
    let correlation_id = request
        .extensions()
        .get::<OperationContext>()
        .map(|ctx| ctx.correlation_id);

    let start = std::time::Instant::now();

    // Log request
    tracing::info!(
        method = %method,
        uri = %uri,
        version = ?version,
        correlation_id = ?correlation_id,
        headers = ?headers,
        "Incoming request"
    );

    // Process request
    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    // Log response
    tracing::info!(
        method = %method,
        uri = %uri,
        status = %status,
        duration_ms = %duration.as_millis(),
        correlation_id = ?correlation_id,
        "Request completed"
    );

    response
}
