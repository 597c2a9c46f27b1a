//! HTTP ingestion API.
//!
//! `/stats/{id}?hash={proof}` accepts `POST` (submit a bundle) and `GET`
//! (read the caller's own stats). Every request is checked in this order:
//! user id, proof parameter, identity, method.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::auth::{authenticate_against, AuthError, IdentityProvider, UserInfo};
use crate::export::health::HealthMetrics;
use crate::hub::StatsHub;
use crate::stats::{StatsBundle, StatsSubmission};
use crate::store::{AggregationStore, StoreError};

/// Shared state for the ingestion handlers.
pub struct ApiState<S, P> {
    pub hub: StatsHub<S>,
    pub identity: Arc<P>,
    pub health: Option<Arc<HealthMetrics>>,
}

impl<S, P> Clone for ApiState<S, P> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            identity: Arc::clone(&self.identity),
            health: self.health.clone(),
        }
    }
}

/// Body of every ingestion response.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    #[serde(rename = "Succeeded")]
    pub succeeded: bool,
    #[serde(rename = "Error")]
    pub error: String,
}

/// Body of a successful GET. `Stats` is null when the user never submitted.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    #[serde(rename = "Succeeded")]
    pub succeeded: bool,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "Stats")]
    pub stats: Option<StatsBundle>,
}

/// Request failures, each mapped to one HTTP status.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Request URL is missing user id")]
    MissingUserId,

    #[error("Unable to convert userId {raw} to int: {reason}")]
    BadUserId { raw: String, reason: String },

    #[error("Unable to parse querystring: {0}")]
    BadQuery(String),

    #[error("No hash provided in querystring")]
    MissingHash,

    #[error("Wrong number of hashes provided in querystring")]
    DuplicateHash,

    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    #[error("Hash mismatch, authentication failure")]
    Forbidden,

    #[error("Unable to decode request: {0}")]
    BadBody(String),

    #[error("Unable to post stats: {0}")]
    Post(StoreError),

    #[error("Unable to query stats: {0}")]
    Query(StoreError),

    #[error("Method not allowed")]
    MethodNotAllowed,
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingUserId
            | Self::BadUserId { .. }
            | Self::BadQuery(_)
            | Self::MissingHash
            | Self::DuplicateHash
            | Self::BadBody(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Post(_) | Self::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl From<AuthError> for RequestError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthenticated { reason } => Self::Unauthenticated(reason),
            AuthError::Forbidden => Self::Forbidden,
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::MethodNotAllowed = self {
            return (
                status,
                [(header::ALLOW, HeaderValue::from_static("GET, POST"))],
            )
                .into_response();
        }

        let body = ApiResponse {
            succeeded: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the ingestion router.
pub fn router<S, P>(state: ApiState<S, P>) -> Router
where
    S: AggregationStore + 'static,
    P: IdentityProvider + 'static,
{
    Router::new()
        .route("/stats", any(missing_user_id))
        .route("/stats/", any(missing_user_id))
        .route("/stats/:user_id", any(stats_handler::<S, P>))
        .fallback(unmatched)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn missing_user_id() -> RequestError {
    RequestError::MissingUserId
}

/// Paths under `/stats/` that are not a single id segment, such as
/// `/stats/42/` or `/stats/1/2`, are malformed ids. Anything else is 404.
async fn unmatched(uri: Uri) -> Response {
    match uri.path().strip_prefix("/stats/") {
        Some(rest) => RequestError::BadUserId {
            raw: rest.to_string(),
            reason: "expected a single path segment".to_string(),
        }
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stats_handler<S, P>(
    State(state): State<ApiState<S, P>>,
    method: Method,
    uri: Uri,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    S: AggregationStore + 'static,
    P: IdentityProvider + 'static,
{
    let raw_id = match path {
        Ok(Path(raw_id)) => raw_id,
        Err(e) => {
            let raw = uri.path().strip_prefix("/stats/").unwrap_or_default();
            return RequestError::BadUserId {
                raw: raw.to_string(),
                reason: e.body_text(),
            }
            .into_response();
        }
    };

    let info = match user_info(&raw_id, query) {
        Ok(info) => info,
        Err(e) => return e.into_response(),
    };

    if let Err(e) = authenticate_against(state.identity.as_ref(), &headers, &info).await {
        warn!(user_id = info.user_id, reason = e.label(), "rejected stats request");
        if let Some(health) = &state.health {
            health
                .auth_failures_total
                .with_label_values(&[e.label()])
                .inc();
        }
        return RequestError::from(e).into_response();
    }

    let result = match method {
        Method::POST => post_stats(&state, info.user_id, &body).await,
        Method::GET => get_stats(&state, info.user_id).await,
        other => {
            debug!(method = %other, user_id = info.user_id, "unsupported method");
            Err(RequestError::MethodNotAllowed)
        }
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

fn user_info(
    raw_id: &str,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<UserInfo, RequestError> {
    if raw_id.is_empty() {
        return Err(RequestError::MissingUserId);
    }

    let user_id = raw_id
        .parse::<i64>()
        .map_err(|e| RequestError::BadUserId {
            raw: raw_id.to_string(),
            reason: e.to_string(),
        })?;

    let Query(pairs) = query.map_err(|e| RequestError::BadQuery(e.body_text()))?;
    let mut hashes = pairs
        .into_iter()
        .filter(|(key, _)| key == "hash")
        .map(|(_, value)| value);

    let hash = hashes.next().ok_or(RequestError::MissingHash)?;
    if hashes.next().is_some() {
        return Err(RequestError::DuplicateHash);
    }

    Ok(UserInfo { user_id, hash })
}

async fn post_stats<S, P>(
    state: &ApiState<S, P>,
    user_id: i64,
    body: &[u8],
) -> Result<Response, RequestError>
where
    S: AggregationStore,
{
    let submission: StatsSubmission = match serde_json::from_slice(body) {
        Ok(submission) => submission,
        Err(e) => {
            record(&state.health, Counter::Submissions, "bad_request");
            return Err(RequestError::BadBody(e.to_string()));
        }
    };

    if let Err(e) = state.hub.submit(user_id, &submission).await {
        error!(user_id, error = %e, "posting stats");
        record(&state.health, Counter::Submissions, "store_error");
        return Err(RequestError::Post(e));
    }

    record(&state.health, Counter::Submissions, "ok");

    Ok(Json(ApiResponse {
        succeeded: true,
        error: String::new(),
    })
    .into_response())
}

async fn get_stats<S, P>(state: &ApiState<S, P>, user_id: i64) -> Result<Response, RequestError>
where
    S: AggregationStore,
{
    match state.hub.query_user(user_id).await {
        Ok(stats) => {
            record(&state.health, Counter::Queries, "ok");
            Ok(Json(QueryResponse {
                succeeded: true,
                error: String::new(),
                stats,
            })
            .into_response())
        }
        Err(e) => {
            error!(user_id, error = %e, "querying stats");
            record(&state.health, Counter::Queries, "store_error");
            Err(RequestError::Query(e))
        }
    }
}

enum Counter {
    Submissions,
    Queries,
}

fn record(health: &Option<Arc<HealthMetrics>>, counter: Counter, outcome: &str) {
    let Some(health) = health else {
        return;
    };
    let vec = match counter {
        Counter::Submissions => &health.submissions_total,
        Counter::Queries => &health.queries_total,
    };
    vec.with_label_values(&[outcome]).inc();
}
