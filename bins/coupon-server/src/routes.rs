//! Axum router and HTTP handlers.
//!
//! Every response body has the shape `{success, message, ...}`, including
//! malformed requests, so bodies are parsed by hand rather than through the
//! `Json` extractor (whose rejections are plain text).

use std::net::{IpAddr, SocketAddr};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

use coupon_core::constants::{IDENTITY_COOKIE, IDENTITY_COOKIE_MAX_AGE_SECS};
use coupon_core::error::CouponError;
use coupon_core::identity::{Identity, RequestContext};

use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/api/claim", get(api_claim))
        .route("/api/claim-coupon", get(api_claim))
        .route("/api/codes", post(api_add_code))
        .route("/api/add-coupon", post(api_add_code))
        .route("/api/codes/bulk", post(api_add_codes))
        .route("/api/cooldowns", delete(api_clear_cooldowns))
        .route("/api/status", get(api_status))
        .with_state(state)
        .layer(cors)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Maps [`CouponError`] onto a status code and the structured body.
/// Storage details are logged here and never sent to the client.
struct ApiError(CouponError);

impl From<CouponError> for ApiError {
    fn from(e: CouponError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            CouponError::Blocked { remaining_secs } => {
                let unit = if remaining_secs == 1 { "second" } else { "seconds" };
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "success": false,
                        "message": format!("Please wait {remaining_secs} {unit} before claiming again"),
                        "remaining_seconds": remaining_secs,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(remaining_secs));
                response
            }
            CouponError::PoolExhausted => failure(StatusCode::NOT_FOUND, "No coupons available"),
            CouponError::DuplicateCode(_) => {
                failure(StatusCode::BAD_REQUEST, "Coupon code already exists")
            }
            CouponError::InvalidInput(msg) => failure(StatusCode::BAD_REQUEST, &msg),
            CouponError::Storage(detail) => {
                error!(error = %detail, "storage failure");
                failure(StatusCode::INTERNAL_SERVER_ERROR, "Server error occurred")
            }
        }
    }
}

fn failure(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"success": false, "message": message}))).into_response()
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, CouponError>
where
    F: FnOnce() -> Result<T, CouponError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CouponError::Storage(format!("blocking task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/claim`: allocate one code to the caller.
async fn api_claim(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let ctx = RequestContext {
        ip: extract_ip(&headers, peer.map(|ConnectInfo(addr)| addr.ip()), state.config.trust_proxy),
        cookie: cookie_value(&headers, IDENTITY_COOKIE),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    let identity = state.coordinator.resolve(&ctx);

    let coordinator = state.coordinator.clone();
    let claimant = identity.clone();
    let outcome = blocking(move || coordinator.claim(&claimant, Utc::now())).await;

    let mut response = match outcome {
        Ok(code) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "coupon": code.value,
                "message": format!("Coupon {} claimed successfully!", code.value),
            })),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    };

    if identity.cookie_issued {
        if let Some(cookie) = identity_cookie(&identity, state.config.secure_cookie) {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
    response
}

/// `POST /api/codes`: add one code. Body: `{"code": "..."}`.
async fn api_add_code(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let Some(value) = parse_body(&body)?
        .get("code")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return Err(CouponError::InvalidInput("Valid coupon code required".into()).into());
    };

    let coordinator = state.coordinator.clone();
    let code = blocking(move || coordinator.pool().add(&value, Utc::now())).await?;
    info!(code = %code.value, "admin: code added");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("Coupon {} added successfully", code.value),
            "coupon": code,
        })),
    )
        .into_response())
}

/// `POST /api/codes/bulk`: add many codes. Body: `{"codes": ["...", ...]}`.
async fn api_add_codes(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let values: Option<Vec<String>> = parse_body(&body)?
        .get("codes")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect()
        });
    let Some(values) = values else {
        return Err(CouponError::InvalidInput("codes must be an array of strings".into()).into());
    };

    let coordinator = state.coordinator.clone();
    let report = blocking(move || coordinator.pool().add_many(&values, Utc::now())).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("Added {} coupon(s), skipped {}", report.added.len(), report.skipped.len()),
            "added": report.added,
            "skipped": report.skipped,
        })),
    )
        .into_response())
}

/// `DELETE /api/cooldowns`: wipe the cooldown ledger. Test deployments only.
async fn api_clear_cooldowns(State(state): State<AppState>) -> Result<Response, ApiError> {
    if !state.config.test_routes {
        return Ok(failure(StatusCode::NOT_FOUND, "Not found"));
    }

    let coordinator = state.coordinator.clone();
    let cleared = blocking(move || coordinator.ledger().clear()).await?;
    warn!(cleared, "admin: cooldown ledger cleared");

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Cooldowns cleared",
            "cleared": cleared,
        })),
    )
        .into_response())
}

/// `GET /api/status`: pool occupancy and claim settings.
async fn api_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let coordinator = state.coordinator.clone();
    let stats = blocking(move || coordinator.pool().stats()).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "total": stats.total,
            "available": stats.available,
            "claimed": stats.claimed,
            "cooldown_secs": state.coordinator.ledger().window().as_secs(),
            "policy": state.coordinator.policy().as_str(),
        })),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_body(body: &[u8]) -> Result<Value, CouponError> {
    serde_json::from_slice(body).map_err(|_| CouponError::InvalidInput("Invalid JSON body".into()))
}

/// Client IP: proxy headers when trusted, otherwise the socket peer.
///
/// Only the rightmost `X-Forwarded-For` entry is used. It is the one the
/// trusted proxy appended; everything to its left is client supplied.
fn extract_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy: bool) -> Option<IpAddr> {
    if !trust_proxy {
        return peer;
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.rsplit(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
        .or(peer)
}

/// Value of cookie `name` from any `Cookie` header, with RFC 6265 quotes removed.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| {
            let v = v.trim();
            v.strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
                .unwrap_or(v)
                .to_string()
        })
}

fn identity_cookie(identity: &Identity, secure: bool) -> Option<HeaderValue> {
    let secure = if secure { "; Secure" } else { "" };
    HeaderValue::from_str(&format!(
        "{IDENTITY_COOKIE}={}; Max-Age={IDENTITY_COOKIE_MAX_AGE_SECS}; Path=/; HttpOnly; SameSite=Lax{secure}",
        identity.cookie_id
    ))
    .ok()
}
