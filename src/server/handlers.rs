//! HTTP request handlers.

use crate::auth::generate_token;
use crate::db::{self, CollectionKind};
use crate::error::{AppError, Result};
use crate::server::AppState;
use crate::sync::{Dispatcher, Job, Priority};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, Response},
};
use serde::{Deserialize, Serialize};

/// OPDS content type.
const OPDS_MIME: &str = crate::opds::ACQUISITION_FEED_TYPE;

/// Build a response, returning 500 on error (which shouldn't happen).
fn build_response(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap_or_default()
        })
}

// ============================================================================
// WEB PAGES
// ============================================================================

/// Index page (simple HTML).
pub async fn index(State(state): State<AppState>) -> Html<String> {
    let feeds: String = CollectionKind::ALL
        .iter()
        .map(|kind| {
            format!(
                "        <li><code>/feed/{slug}</code> {title}</li>\n",
                slug = kind.slug(),
                title = kind.title()
            )
        })
        .collect();

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{title}</title>
    <style>
        body {{ font-family: system-ui, sans-serif; max-width: 600px; margin: 2rem auto; padding: 0 1rem; }}
        h1 {{ color: #333; }}
        code {{ background: #e8e8e8; padding: 0.2rem 0.4rem; border-radius: 4px; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    <p>OPDS feeds of your Archive of Our Own reading lists.</p>
    <h2>Feeds</h2>
    <p>Add one of these URLs to your e-reader, with <code>?username=...&amp;password=...</code>
    if it cannot send a bearer token:</p>
    <ul>
{feeds}    </ul>
    <h2>Setup</h2>
    <ul>
        <li><code>POST /api/auth/login</code> to get a token</li>
        <li><code>PUT /api/ao3</code> to store your AO3 credentials</li>
        <li><code>POST /api/share/{{kind}}</code> to publish a list</li>
    </ul>
</body>
</html>"#,
        title = state.config.server.title,
        feeds = feeds,
    );

    Html(html)
}

// ============================================================================
// FEEDS
// ============================================================================

/// Local credentials for readers that cannot send headers.
#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    username: Option<String>,
    password: Option<String>,
}

/// Feed of one reading list for the caller.
pub async fn user_feed(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<FeedQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let user = match (query.username, query.password) {
        (Some(username), Some(password)) => state.auth.verify_credentials(&username, &password)?,
        _ => get_authenticated_user(&state, &headers).await?,
    };
    let kind: CollectionKind = kind.parse()?;

    let xml = state.user_feed(&user, kind).await?;
    Ok(build_response(StatusCode::OK, OPDS_MIME, xml))
}

/// Public feed behind a share key.
pub async fn shared_feed(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response> {
    let xml = state.shared_feed(&key).await?;
    Ok(build_response(StatusCode::OK, OPDS_MIME, xml))
}

// ============================================================================
// AUTH API
// ============================================================================

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
    device_id: Option<String>,
}

/// Login response.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
    user_id: String,
    username: String,
    role: String,
}

/// Register request.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    username: String,
    password: String,
}

/// Auth login.
pub async fn auth_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let (user, token) = state
        .auth
        .login(&req.username, &req.password, req.device_id)?;

    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// Auth register.
pub async fn auth_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<LoginResponse>> {
    let _user = state.auth.register(&req.username, &req.password)?;
    let (user, token) = state.auth.login(&req.username, &req.password, None)?;

    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// Auth logout.
pub async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    if let Some(token) = extract_token(&headers) {
        state.auth.logout(&token)?;
    }
    Ok(StatusCode::OK)
}

/// Get current user info.
pub async fn auth_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<db::User>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(user))
}

// ============================================================================
// AO3 ACCOUNT API
// ============================================================================

/// AO3 credentials.
#[derive(Debug, Deserialize)]
pub struct AccountRequest {
    username: String,
    password: String,
}

/// Stored AO3 account, without the password.
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    username: String,
    synced: Option<i64>,
    collections: Vec<CollectionSummary>,
}

/// One reading list of an account.
#[derive(Debug, Serialize)]
pub struct CollectionSummary {
    kind: CollectionKind,
    feed: String,
    updated: Option<i64>,
    shared: bool,
    share_url: Option<String>,
}

fn account_response(state: &AppState, account: &db::RemoteAccount) -> Result<AccountResponse> {
    let collections = state
        .db
        .list_collections(account.id)?
        .into_iter()
        .map(|c| CollectionSummary {
            kind: c.kind,
            feed: format!("{}/feed/{}", base_url(state), c.kind.slug()),
            updated: (c.updated > 0).then_some(c.updated),
            shared: c.share_enabled,
            share_url: c
                .share_key
                .filter(|_| c.share_enabled)
                .map(|key| share_url(state, &key)),
        })
        .collect();

    Ok(AccountResponse {
        username: account.username.clone(),
        synced: (account.synced > 0).then_some(account.synced),
        collections,
    })
}

/// Show the caller's AO3 account.
pub async fn account_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AccountResponse>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let account = state.account_for(&user)?;
    Ok(Json(account_response(&state, &account)?))
}

/// Verify and store AO3 credentials, then queue a sync of every list.
pub async fn account_put(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AccountRequest>,
) -> Result<Json<AccountResponse>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let update = state
        .engine
        .credentials()
        .set_credentials(&user.id, &req.username, &req.password)
        .await?;

    let mut modes = state.engine.default_modes();
    if update.username_changed {
        modes = modes.escalate_for_identity_change();
    }
    state.queue.dispatch(
        Job::SyncAccount {
            user_id: user.id.clone(),
            modes,
        },
        Priority::High,
    )?;

    Ok(Json(account_response(&state, &update.account)?))
}

/// Remove the caller's AO3 account and its feeds.
pub async fn account_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;
    let account = state.account_for(&user)?;
    state.engine.credentials().delete_credentials(&account)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// SHARING API
// ============================================================================

/// Share toggle request.
#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    enabled: bool,
}

/// Share state of a list.
#[derive(Debug, Serialize)]
pub struct ShareResponse {
    enabled: bool,
    url: Option<String>,
}

/// Enable or disable the public link of one list. The key survives disabling
/// so re-enabling restores the same URL.
pub async fn share_set(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ShareRequest>,
) -> Result<Json<ShareResponse>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let kind: CollectionKind = kind.parse()?;
    let account = state.account_for(&user)?;
    let collection = state.db.get_or_create_collection(account.id, kind)?;

    let key = match (&collection.share_key, req.enabled) {
        (Some(key), _) => Some(key.clone()),
        (None, true) => Some(generate_token()),
        (None, false) => None,
    };
    state
        .db
        .set_collection_sharing(&collection, req.enabled, key.as_deref())?;
    tracing::info!(collection_id = collection.id, enabled = req.enabled, "Sharing updated");

    Ok(Json(ShareResponse {
        enabled: req.enabled,
        url: key
            .filter(|_| req.enabled)
            .map(|key| share_url(&state, &key)),
    }))
}

// ============================================================================
// HELPERS
// ============================================================================

fn base_url(state: &AppState) -> &str {
    state.config.server.base_url.trim_end_matches('/')
}

fn share_url(state: &AppState, key: &str) -> String {
    format!("{}/share/{}", base_url(state), key)
}

/// Extract bearer token from headers.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Get authenticated user from token.
async fn get_authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<db::User> {
    let token = extract_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    state
        .auth
        .validate_token(&token)?
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired token".to_string()))
}
