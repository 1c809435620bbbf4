//! HTTP request handlers.

use super::rate_limit::ClientIp;
use super::{ApiError, AppState};
use crate::db::{Branding, DbError, HealthStatus, Link, LinkFilter, MemberRole};
use crate::html::{css_color, escape_html};
use crate::redirect::{ClickContext, ExpiredReason, Resolution};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{
        header::{CONTENT_TYPE, LOCATION, REFERER, USER_AGENT},
        HeaderMap, StatusCode,
    },
    response::{Html, IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

// ============================================================================
// Templates (string replacement, as with the notification email)
// ============================================================================

const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");
const EXPIRED_TEMPLATE: &str = include_str!("templates/expired.html");
const PASSWORD_TEMPLATE: &str = include_str!("templates/password.html");

const DEFAULT_PRIMARY_COLOR: &str = "#3B82F6";
const DEFAULT_SECONDARY_COLOR: &str = "#8B5CF6";

const SHORT_CODE_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];
const SHORT_CODE_ATTEMPTS: usize = 5;
/// First path segments owned by service routes.
const RESERVED_SHORT_CODES: [&str; 3] = ["api", "health", "favicon"];

const MAX_TAGS: usize = 10;
const MAX_TAG_LENGTH: usize = 50;
const MAX_BULK_LINKS: usize = 100;

// ============================================================================
// Redirect
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RedirectQuery {
    pub password: Option<String>,
}

pub async fn handle_redirect(
    State(state): State<AppState>,
    Path(short_code): Path<String>,
    Query(query): Query<RedirectQuery>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = ClickContext {
        ip,
        user_agent: header_string(&headers, USER_AGENT),
        referer: header_string(&headers, REFERER),
    };

    let resolution = state
        .resolver
        .resolve(&short_code, query.password.as_deref(), &ctx)
        .await?;

    let response = match resolution {
        Resolution::NotFound => return Err(ApiError::NotFound("Link not found")),
        Resolution::Expired { link, reason } => {
            (StatusCode::GONE, Html(render_expired_page(&state, &link, reason))).into_response()
        }
        Resolution::PasswordRequired { link, error } => {
            (StatusCode::FORBIDDEN, Html(render_password_page(&state, &link, error))).into_response()
        }
        // Redirect::to answers 303; short links must answer 302.
        Resolution::Redirect { link } => {
            (StatusCode::FOUND, [(LOCATION, link.original_url)]).into_response()
        }
    };

    Ok(response)
}

fn header_string(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn branding_for(state: &AppState, link: &Link) -> Branding {
    let Some(organization_id) = link.organization_id else {
        return Branding::default();
    };
    match state.store.get_organization(organization_id) {
        Ok(org) => org.branding,
        Err(e) => {
            tracing::warn!("Branding lookup for organization {} failed: {}", organization_id, e);
            Branding::default()
        }
    }
}

fn render_page(state: &AppState, branding: &Branding, title: &str, icon: &str, content: &str) -> String {
    let logo = match branding.logo_url.as_deref() {
        Some(url) if url.starts_with("https://") || url.starts_with("http://") => {
            format!(r#"<img src="{}" alt="Logo">"#, escape_html(url))
        }
        _ => icon.to_string(),
    };

    LAYOUT_TEMPLATE
        .replace("{{primary_color}}", css_color(branding.primary_color.as_deref(), DEFAULT_PRIMARY_COLOR))
        .replace("{{secondary_color}}", css_color(branding.secondary_color.as_deref(), DEFAULT_SECONDARY_COLOR))
        .replace("{{app_name}}", &escape_html(&state.config.app_name))
        .replace("{{title}}", &escape_html(title))
        .replace("{{logo}}", &logo)
        .replace("{{content}}", content)
}

fn render_expired_page(state: &AppState, link: &Link, reason: ExpiredReason) -> String {
    let branding = branding_for(state, link);
    let heading = branding.redirect_title.as_deref().unwrap_or("Link Expired");
    let message = branding.redirect_message.as_deref().unwrap_or(reason.message());

    let content = EXPIRED_TEMPLATE
        .replace("{{app_url}}", &escape_html(&state.config.app_url))
        .replace("{{app_name}}", &escape_html(&state.config.app_name))
        .replace("{{heading}}", &escape_html(heading))
        .replace("{{message}}", &escape_html(message));

    render_page(state, &branding, heading, "&#128279;", &content)
}

fn render_password_page(state: &AppState, link: &Link, error: Option<&str>) -> String {
    let branding = branding_for(state, link);
    let error = error
        .map(|e| format!(r#"<div class="error">{}</div>"#, escape_html(e)))
        .unwrap_or_default();

    let content = PASSWORD_TEMPLATE
        .replace("{{short_code}}", &escape_html(&link.short_code))
        .replace("{{error}}", &error);

    render_page(state, &branding, "Password Required", "&#128274;", &content)
}

// ============================================================================
// Preview
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPreview {
    pub short_code: String,
    pub original_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub short_url: String,
    pub is_active: bool,
    pub has_password: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_clicks: Option<i64>,
    pub current_clicks: i64,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Link details without resolving it. Never counts as a click.
pub async fn handle_preview(
    State(state): State<AppState>,
    Path(short_code): Path<String>,
) -> Result<Json<LinkPreview>, ApiError> {
    let link = state
        .store
        .get_link_by_code(&short_code)?
        .ok_or(ApiError::NotFound("Link not found"))?;

    let created_by = match state.store.get_user(link.user_id) {
        Ok(user) => Some(user.name),
        Err(_) => link
            .organization_id
            .and_then(|id| state.store.get_organization(id).ok())
            .map(|org| org.name),
    };

    Ok(Json(LinkPreview {
        short_url: short_url(&state, &link.short_code),
        has_password: link.password_hash.is_some(),
        short_code: link.short_code,
        original_url: link.original_url,
        title: link.title,
        description: link.description,
        is_active: link.is_active,
        expires_at: link.expires_at,
        max_clicks: link.max_clicks,
        current_clicks: link.current_clicks,
        created_by,
        created_at: link.created_at,
    }))
}

fn short_url(state: &AppState, short_code: &str) -> String {
    format!("{}/{}", state.config.short_domain, short_code)
}

// ============================================================================
// API: Links
// ============================================================================

/// A link as returned by the API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkView {
    #[serde(flatten)]
    pub link: Link,
    pub short_url: String,
    pub has_password: bool,
}

impl LinkView {
    fn new(state: &AppState, link: Link) -> Self {
        Self {
            short_url: short_url(state, &link.short_code),
            has_password: link.password_hash.is_some(),
            link,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListLinksQuery {
    pub user_id: Option<i64>,
    pub organization_id: Option<i64>,
    pub health_status: Option<String>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn handle_list_links(
    State(state): State<AppState>,
    Query(query): Query<ListLinksQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let health_status = query
        .health_status
        .as_deref()
        .map(str::parse::<HealthStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1).saturating_mul(limit);

    let (links, total) = state.store.get_links(&LinkFilter {
        user_id: query.user_id,
        organization_id: query.organization_id,
        health_status,
        search: query.search.filter(|s| !s.is_empty()),
        limit,
        offset,
    })?;

    let links: Vec<LinkView> = links.into_iter().map(|l| LinkView::new(&state, l)).collect();

    Ok(Json(json!({
        "links": links,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
            "pages": (total + limit - 1) / limit,
        },
    })))
}

pub async fn handle_get_link(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<LinkView>, ApiError> {
    let link = state.store.get_link(id).map_err(not_found("Link not found"))?;
    Ok(Json(LinkView::new(&state, link)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkRequest {
    pub original_url: String,
    pub short_code: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_clicks: Option<i64>,
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub enable_tracking: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub user_id: i64,
    pub organization_id: Option<i64>,
}

fn default_true() -> bool {
    true
}

pub async fn handle_create_link(
    State(state): State<AppState>,
    payload: Result<Json<CreateLinkRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LinkView>), ApiError> {
    let req = json_body(payload)?;
    let link = create_link(&state, req).await?;
    Ok((StatusCode::CREATED, Json(LinkView::new(&state, link))))
}

/// Validate, persist and schedule the first health check for one link.
async fn create_link(state: &AppState, req: CreateLinkRequest) -> Result<Link, ApiError> {
    let original_url = normalize_url(&req.original_url)?;
    validate_text("Title", req.title.as_deref(), 200)?;
    validate_text("Description", req.description.as_deref(), 500)?;
    validate_expiry(state, req.expires_at)?;
    validate_max_clicks(req.max_clicks)?;
    validate_tags(&req.tags)?;

    state
        .store
        .get_user(req.user_id)
        .map_err(invalid_reference("User not found"))?;
    if let Some(organization_id) = req.organization_id {
        state
            .store
            .get_organization(organization_id)
            .map_err(invalid_reference("Organization not found"))?;
    }

    let short_code = match req.short_code.filter(|c| !c.is_empty()) {
        Some(code) => {
            validate_short_code(&code)?;
            if state.store.short_code_exists(&code)? {
                return Err(ApiError::Conflict("Short code already exists".to_string()));
            }
            code
        }
        None => generate_unique_short_code(state)?,
    };

    let password_hash = match req.password.filter(|p| !p.is_empty()) {
        Some(password) => Some(hash_password(state, password).await?),
        None => None,
    };

    let mut link = Link {
        short_code,
        original_url,
        title: req.title,
        description: req.description,
        expires_at: req.expires_at,
        max_clicks: req.max_clicks,
        password_hash,
        enable_tracking: req.enable_tracking,
        tags: req.tags,
        user_id: req.user_id,
        organization_id: req.organization_id,
        ..Default::default()
    };
    state.store.add_link(&mut link)?;
    tracing::info!("Created link {} -> {}", link.short_code, link.original_url);

    // Initial health check runs in the background.
    let checker = state.checker.clone();
    let (link_id, url) = (link.id, link.original_url.clone());
    tokio::spawn(async move {
        checker.check(link_id, &url).await;
    });

    Ok(link)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCreateRequest {
    pub user_id: i64,
    pub organization_id: Option<i64>,
    pub links: Vec<serde_json::Value>,
}

/// Create up to 100 links in one call. Items succeed or fail independently.
pub async fn handle_bulk_create_links(
    State(state): State<AppState>,
    payload: Result<Json<BulkCreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let req = json_body(payload)?;
    if req.links.is_empty() || req.links.len() > MAX_BULK_LINKS {
        return Err(ApiError::Validation(format!(
            "links must contain between 1 and {} items",
            MAX_BULK_LINKS
        )));
    }

    let total = req.links.len();
    let mut results = Vec::new();
    let mut errors = Vec::new();

    for (index, mut item) in req.links.into_iter().enumerate() {
        if let Some(fields) = item.as_object_mut() {
            fields.insert("userId".to_string(), json!(req.user_id));
            if let Some(organization_id) = req.organization_id {
                fields.insert("organizationId".to_string(), json!(organization_id));
            }
        }

        let outcome = match serde_json::from_value::<CreateLinkRequest>(item) {
            Ok(item) => create_link(&state, item).await,
            Err(e) => Err(ApiError::Validation(e.to_string())),
        };
        match outcome {
            Ok(link) => results.push(json!({
                "index": index,
                "success": true,
                "link": {
                    "id": link.id,
                    "shortCode": link.short_code,
                    "originalUrl": link.original_url,
                    "shortUrl": short_url(&state, &link.short_code),
                },
            })),
            Err(e) => {
                if let ApiError::Internal(detail) = &e {
                    tracing::error!("Bulk item {} failed: {}", index, detail);
                }
                errors.push(json!({ "index": index, "error": e.to_string() }));
            }
        }
    }

    tracing::info!(
        "Bulk create: {} of {} links created",
        results.len(),
        total
    );

    let summary = json!({
        "total": total,
        "successful": results.len(),
        "failed": errors.len(),
    });
    Ok((
        StatusCode::CREATED,
        Json(json!({ "results": results, "errors": errors, "summary": summary })),
    ))
}

/// Distinguishes an absent field from an explicit `null`.
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLinkRequest {
    pub original_url: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub title: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable")]
    pub max_clicks: Option<Option<i64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub password: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub enable_tracking: Option<bool>,
    pub tags: Option<Vec<String>>,
}

pub async fn handle_update_link(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<UpdateLinkRequest>, JsonRejection>,
) -> Result<Json<LinkView>, ApiError> {
    let req = json_body(payload)?;
    let mut link = state.store.get_link(id).map_err(not_found("Link not found"))?;

    if let Some(url) = &req.original_url {
        link.original_url = normalize_url(url)?;
    }
    if let Some(title) = req.title {
        validate_text("Title", title.as_deref(), 200)?;
        link.title = title;
    }
    if let Some(description) = req.description {
        validate_text("Description", description.as_deref(), 500)?;
        link.description = description;
    }
    if let Some(expires_at) = req.expires_at {
        validate_expiry(&state, expires_at)?;
        link.expires_at = expires_at;
    }
    if let Some(max_clicks) = req.max_clicks {
        validate_max_clicks(max_clicks)?;
        link.max_clicks = max_clicks;
    }
    if let Some(password) = req.password {
        link.password_hash = match password.filter(|p| !p.is_empty()) {
            Some(password) => Some(hash_password(&state, password).await?),
            None => None,
        };
    }
    if let Some(is_active) = req.is_active {
        link.is_active = is_active;
    }
    if let Some(enable_tracking) = req.enable_tracking {
        link.enable_tracking = enable_tracking;
    }
    if let Some(tags) = req.tags {
        validate_tags(&tags)?;
        link.tags = tags;
    }

    state.store.update_link(&link)?;
    let link = state.store.get_link(id)?;
    Ok(Json(LinkView::new(&state, link)))
}

pub async fn handle_delete_link(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_link(id).map_err(not_found("Link not found"))?;
    tracing::info!("Deleted link {}", id);
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// API: Link health
// ============================================================================

/// Probe a link's destination now and return the outcome.
pub async fn handle_check_link_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let link = state.store.get_link(id).map_err(not_found("Link not found"))?;
    let result = state.checker.check(link.id, &link.original_url).await;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

pub async fn handle_get_health_checks(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_link(id).map_err(not_found("Link not found"))?;
    let checks = state
        .store
        .get_health_checks(id, query.limit.unwrap_or(20).clamp(1, 100))?;
    Ok(Json(checks))
}

// ============================================================================
// API: Users & organizations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: String,
}

pub async fn handle_create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(payload)?;
    let email = req.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation("A valid email is required".to_string()));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::Validation("Name is required".to_string()));
    }

    let user = state.store.add_user(email, req.name.trim())?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
    #[serde(flatten)]
    pub branding: Branding,
}

pub async fn handle_create_organization(
    State(state): State<AppState>,
    payload: Result<Json<CreateOrganizationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(payload)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::Validation("Name is required".to_string()));
    }
    for color in [&req.branding.primary_color, &req.branding.secondary_color]
        .into_iter()
        .flatten()
    {
        if css_color(Some(color.as_str()), "").is_empty() {
            return Err(ApiError::Validation(format!(
                "Invalid color {:?}: expected #rgb or #rrggbb",
                color
            )));
        }
    }

    let org = state.store.add_organization(req.name.trim(), &req.branding)?;
    Ok((StatusCode::CREATED, Json(org)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: i64,
    pub role: MemberRole,
}

pub async fn handle_add_member(
    State(state): State<AppState>,
    Path(organization_id): Path<i64>,
    payload: Result<Json<AddMemberRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(payload)?;
    let member = state
        .store
        .add_member(organization_id, req.user_id, req.role)
        .map_err(not_found("Organization or user not found"))?;
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn handle_remove_member(
    State(state): State<AppState>,
    Path((organization_id, user_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .deactivate_member(organization_id, user_id)
        .map_err(not_found("Membership not found"))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_get_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_user(user_id).map_err(not_found("User not found"))?;
    let notifications = state
        .store
        .get_notifications(user_id, query.limit.unwrap_or(50).clamp(1, 200))?;
    Ok(Json(notifications))
}

// ============================================================================
// Service health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": state.config.app_name,
        "timestamp": Utc::now(),
    }))
}

pub async fn handle_live(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "timestamp": Utc::now(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

pub async fn handle_ready(State(state): State<AppState>) -> Response {
    match state.store.ping() {
        Ok(()) => Json(json!({ "status": "ready" })).into_response(),
        Err(e) => {
            tracing::error!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Static Assets
// ============================================================================

pub async fn handle_favicon() -> impl IntoResponse {
    let svg = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 100 100">
        <circle cx="50" cy="50" r="45" fill="#3B82F6"/>
        <path d="M40 60 L60 40 M35 50 L28 57 A10 10 0 0 0 43 72 L50 65 M65 50 L72 43 A10 10 0 0 0 57 28 L50 35"
              stroke="white" stroke-width="6" fill="none" stroke-linecap="round"/>
    </svg>"##;

    ([(CONTENT_TYPE, "image/svg+xml")], svg)
}

// ============================================================================
// Validation
// ============================================================================

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::Validation(rejection.body_text()))
}

fn not_found(message: &'static str) -> impl Fn(DbError) -> ApiError {
    move |e| match e {
        DbError::NotFound => ApiError::NotFound(message),
        other => other.into(),
    }
}

fn invalid_reference(message: &'static str) -> impl Fn(DbError) -> ApiError {
    move |e| match e {
        DbError::NotFound => ApiError::Validation(message.to_string()),
        other => other.into(),
    }
}

/// Only absolute http(s) URLs are accepted. The normalized form is stored so
/// it is always a valid `Location` header value.
fn normalize_url(raw: &str) -> Result<String, ApiError> {
    let invalid = || ApiError::Validation("Invalid URL format".to_string());
    let url = reqwest::Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url.to_string())
}

fn validate_short_code(code: &str) -> Result<(), ApiError> {
    let len = code.chars().count();
    if !(3..=20).contains(&len) || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ApiError::Validation(
            "Short code must be 3-20 alphanumeric characters".to_string(),
        ));
    }
    if is_reserved_short_code(code) {
        return Err(ApiError::Validation(format!("Short code {:?} is reserved", code)));
    }
    Ok(())
}

fn is_reserved_short_code(code: &str) -> bool {
    RESERVED_SHORT_CODES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(code))
}

fn validate_tags(tags: &[String]) -> Result<(), ApiError> {
    if tags.len() > MAX_TAGS {
        return Err(ApiError::Validation(format!(
            "At most {} tags are allowed",
            MAX_TAGS
        )));
    }
    if tags.iter().any(|t| t.chars().count() > MAX_TAG_LENGTH) {
        return Err(ApiError::Validation(format!(
            "Tags must be at most {} characters",
            MAX_TAG_LENGTH
        )));
    }
    Ok(())
}

fn validate_text(field: &str, value: Option<&str>, max: usize) -> Result<(), ApiError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ApiError::Validation(format!(
            "{} must be at most {} characters",
            field, max
        ))),
        _ => Ok(()),
    }
}

fn validate_expiry(state: &AppState, expires_at: Option<DateTime<Utc>>) -> Result<(), ApiError> {
    match expires_at {
        Some(at) if at <= state.clock.now() => Err(ApiError::Validation(
            "Expiration date must be in the future".to_string(),
        )),
        _ => Ok(()),
    }
}

fn validate_max_clicks(max_clicks: Option<i64>) -> Result<(), ApiError> {
    match max_clicks {
        Some(n) if n <= 0 => Err(ApiError::Validation(
            "maxClicks must be a positive integer".to_string(),
        )),
        _ => Ok(()),
    }
}

async fn hash_password(state: &AppState, password: String) -> Result<String, ApiError> {
    if password.chars().count() > 100 {
        return Err(ApiError::Validation(
            "Password must be at most 100 characters".to_string(),
        ));
    }
    let hasher = state.hasher.clone();
    let hash = tokio::task::spawn_blocking(move || hasher.hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("password hashing task failed: {}", e)))??;
    Ok(hash)
}

fn generate_unique_short_code(state: &AppState) -> Result<String, ApiError> {
    for _ in 0..SHORT_CODE_ATTEMPTS {
        let code = nanoid::nanoid!(6, &SHORT_CODE_ALPHABET);
        if !is_reserved_short_code(&code) && !state.store.short_code_exists(&code)? {
            return Ok(code);
        }
    }
    Err(ApiError::Internal(
        "could not generate a unique short code".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("https://example.com/a b").unwrap(),
            "https://example.com/a%20b"
        );
        assert_eq!(normalize_url(" http://Example.COM ").unwrap(), "http://example.com/");
        assert!(normalize_url("ftp://example.com").is_err());
        assert!(normalize_url("example.com").is_err());
        assert!(normalize_url("javascript:alert(1)").is_err());
    }

    #[test]
    fn test_validate_short_code() {
        assert!(validate_short_code("abc").is_ok());
        assert!(validate_short_code("Promo2024").is_ok());
        assert!(validate_short_code("ab").is_err());
        assert!(validate_short_code("has-dash").is_err());
        assert!(validate_short_code(&"x".repeat(21)).is_err());
        assert!(validate_short_code("health").is_err());
        assert!(validate_short_code("API").is_err());
        assert!(validate_short_code("Favicon").is_err());
        assert!(validate_short_code("healthy").is_ok());
    }

    #[test]
    fn test_validate_tags() {
        assert!(validate_tags(&[]).is_ok());
        assert!(validate_tags(&vec!["launch".to_string(); 10]).is_ok());
        assert!(validate_tags(&vec!["launch".to_string(); 11]).is_err());
        assert!(validate_tags(&["x".repeat(50)]).is_ok());
        assert!(validate_tags(&["x".repeat(51)]).is_err());
    }

    #[test]
    fn test_update_request_distinguishes_null_from_absent() {
        let req: UpdateLinkRequest =
            serde_json::from_str(r#"{"maxClicks": null, "title": "New"}"#).unwrap();
        assert_eq!(req.max_clicks, Some(None));
        assert_eq!(req.title, Some(Some("New".to_string())));
        assert_eq!(req.expires_at, None);
        assert_eq!(req.password, None);
    }
}
