use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{
        self, Request, StatusCode,
        header::{HeaderValue, IntoHeaderName},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const KEY_HEADER: &str = "X-Fleet-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, AuthContext>>,
    limiter: Arc<TokenBuckets>,
}

/// Authenticated caller. Every core operation is scoped to `owner`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub owner: String,
    pub api_key_id: String,
}

impl AuthState {
    /// `raw_keys` is `owner:key` pairs separated by commas.
    pub fn new(raw_keys: Option<&str>, rate_per_sec: f64, capacity: f64) -> Self {
        let records = Arc::new(parse_keys(raw_keys.unwrap_or("demo-owner:demo-key")));
        let limiter = Arc::new(TokenBuckets::new(rate_per_sec, capacity));
        Self { records, limiter }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(rejection(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Fleet-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(rejection(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.limiter.consume(&context.owner).await {
        Ok(bucket) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            bucket.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(bucket) => {
            let mut response =
                rejection(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many requests");
            bucket.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn rejection(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, AuthContext> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let owner = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (owner, key) {
            (Some(owner), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    AuthContext {
                        owner: owner.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "fleet.api",
                "ignored malformed FLEET_API_KEYS entry at position {}",
                idx + 1
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "fleet.api",
            "FLEET_API_KEYS produced no keys; falling back to demo credentials"
        );
        entries.insert(
            "demo-key".to_string(),
            AuthContext {
                owner: "demo-owner".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(target = "fleet.api", key_count = entries.len(), "loaded API keys");
    }

    entries
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl TokenBuckets {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec: if rate_per_sec > 0.0 { rate_per_sec } else { 5.0 },
            capacity: capacity.max(1.0),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token for `owner`. Both outcomes carry the bucket snapshot
    /// used for the rate-limit headers.
    async fn consume(&self, owner: &str) -> Result<BucketSnapshot, BucketSnapshot> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(owner.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        let allowed = state.tokens >= 1.0;
        if allowed {
            state.tokens -= 1.0;
        }
        let snapshot = BucketSnapshot {
            capacity: self.capacity,
            tokens: state.tokens,
            rate: self.rate_per_sec,
            exhausted: !allowed,
        };
        if allowed { Ok(snapshot) } else { Err(snapshot) }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
struct BucketSnapshot {
    capacity: f64,
    tokens: f64,
    rate: f64,
    exhausted: bool,
}

impl BucketSnapshot {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_number(headers, "X-RateLimit-Limit", self.capacity as u64);
        insert_number(headers, "X-RateLimit-Remaining", remaining);
        insert_number(headers, "X-RateLimit-Reset", reset);
        if self.exhausted {
            let retry_after = ((1.0 - self.tokens) / self.rate).ceil().max(1.0) as u64;
            insert_number(headers, http::header::RETRY_AFTER, retry_after);
        }
    }
}

fn insert_number(headers: &mut http::HeaderMap, name: impl IntoHeaderName, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}
