use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        FromRequest, FromRequestParts, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::broadcast;

use super::auth::{
    AuthUser, can_edit_comment, can_edit_task, can_manage_project, can_view_project,
    hash_password, new_salt, new_session_token, normalize_email, verify_password,
};
use super::calendar::{month_bounds, month_view, week_range, year_summary};
use super::db::{BoardDb, DbHandle};
use super::kanban::KanbanBoard;
use super::models::*;
use super::ws::{WsMessage, broadcast_message};
use crate::config::AuthSection;
use crate::errors::BoardError;

/// Number of tasks in the dashboard's "recent" list.
const RECENT_TASKS: i64 = 10;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub auth: AuthSection,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub password: Option<String>,
    pub current_password: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Option<UserRole>,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub role: UserRole,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i64,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub assignee_id: Option<i64>,
    pub due_date: Option<NaiveDate>,
}

/// Absent fields are left alone; an explicit `null` clears `assignee_id`
/// or `due_date`.
#[derive(Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    #[serde(default, deserialize_with = "nullable")]
    pub assignee_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub due_date: Option<Option<NaiveDate>>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct CommentRequest {
    pub body: String,
}

#[derive(Deserialize)]
pub struct CalendarQuery {
    pub year: i32,
    pub month: u32,
    pub project_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct SummaryQuery {
    pub year: i32,
    pub project_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreatePatchNoteRequest {
    pub version: String,
    pub title: String,
    pub body: String,
}

#[derive(Deserialize)]
pub struct UpdatePatchNoteRequest {
    pub version: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub user: User,
    pub token: String,
}

fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<BoardError>() {
            Some(e) if e.is_not_found() => ApiError::NotFound(e.to_string()),
            Some(BoardError::Unauthenticated(msg)) => ApiError::Unauthorized(msg.clone()),
            Some(BoardError::Forbidden(msg)) => ApiError::Forbidden(msg.clone()),
            Some(BoardError::Conflict(msg)) => ApiError::Conflict(msg.clone()),
            Some(e @ (BoardError::InvalidStatus { .. } | BoardError::Validation(_))) => {
                ApiError::BadRequest(e.to_string())
            }
            _ => {
                tracing::error!(error = %format!("{:#}", err), "Request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<BoardError> for ApiError {
    fn from(err: BoardError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Extractors ────────────────────────────────────────────────────────
//
// axum's own extractors reject with plain text; these reject with the
// `{"error": msg}` body every other failure uses.

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(get_me).patch(update_me))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/{id}", patch(update_user).delete(delete_user))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route(
            "/api/projects/{id}/members",
            get(list_members).post(add_member),
        )
        .route(
            "/api/projects/{id}/members/{user_id}",
            axum::routing::delete(remove_member),
        )
        .route("/api/projects/{id}/board", get(get_board))
        .route(
            "/api/projects/{id}/tasks",
            get(list_tasks).post(create_task),
        )
        .route("/api/tasks/mine", get(my_tasks))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/status", patch(update_task_status))
        .route(
            "/api/tasks/{id}/comments",
            get(list_comments).post(create_comment),
        )
        .route(
            "/api/comments/{id}",
            patch(update_comment).delete(delete_comment),
        )
        .route("/api/calendar", get(calendar_month))
        .route("/api/calendar/summary", get(calendar_summary))
        .route("/api/dashboard", get(dashboard))
        .route(
            "/api/patch-notes",
            get(list_patch_notes).post(create_patch_note),
        )
        .route(
            "/api/patch-notes/{id}",
            get(get_patch_note)
                .patch(update_patch_note)
                .delete(delete_patch_note),
        )
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Trimmed, non-empty text field.
fn required(field: &str, value: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(value.to_string())
}

fn optional_required(field: &str, value: Option<String>) -> Result<Option<String>, ApiError> {
    value.map(|v| required(field, &v)).transpose()
}

fn check_password(password: &str, min_len: usize) -> Result<(), ApiError> {
    if password.chars().count() < min_len {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {} characters",
            min_len
        )));
    }
    Ok(())
}

/// Projects a non-admin sees are limited to the ones they belong to.
fn member_scope(user: &User) -> Option<i64> {
    if user.is_admin() { None } else { Some(user.id) }
}

fn visible_project(db: &BoardDb, user: &User, project_id: i64) -> anyhow::Result<Project> {
    let project = db.require_project(project_id)?;
    let is_member = db.is_member(project_id, user.id)?;
    if !can_view_project(user, &project, is_member) {
        return Err(BoardError::Forbidden(format!("Not a member of project {}", project_id)).into());
    }
    Ok(project)
}

fn managed_project(db: &BoardDb, user: &User, project_id: i64) -> anyhow::Result<Project> {
    let project = db.require_project(project_id)?;
    if !can_manage_project(user, &project) {
        return Err(BoardError::Forbidden(format!(
            "Only the owner can manage project {}",
            project_id
        ))
        .into());
    }
    Ok(project)
}

fn check_assignee(db: &BoardDb, project_id: i64, assignee_id: Option<i64>) -> anyhow::Result<()> {
    if let Some(user_id) = assignee_id
        && !db.is_member(project_id, user_id)?
    {
        return Err(BoardError::Validation(format!(
            "User {} is not a member of project {}",
            user_id, project_id
        ))
        .into());
    }
    Ok(())
}

/// Load a task the caller may edit, along with its project.
fn editable_task(db: &BoardDb, user: &User, task_id: i64) -> anyhow::Result<(Task, Project)> {
    let task = db.require_task(task_id)?;
    let project = visible_project(db, user, task.project_id)?;
    if !can_edit_task(user, &task, &project) {
        return Err(BoardError::Forbidden(format!("Cannot edit task {}", task_id)).into());
    }
    Ok((task, project))
}

fn build_dashboard(
    assigned: Vec<Task>,
    this_week: Vec<Task>,
    recent: Vec<Task>,
    today: NaiveDate,
) -> Dashboard {
    let counts = TaskCounts::from_tasks(&assigned);
    let overdue = assigned
        .into_iter()
        .filter(|t| !t.status.is_closed() && t.due_date.is_some_and(|d| d < today))
        .collect();
    let due_this_week = this_week
        .into_iter()
        .filter(|t| !t.status.is_closed())
        .collect();
    Dashboard {
        assigned: counts,
        overdue,
        due_this_week,
        recent,
    }
}

// ── Handlers: auth ────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn register(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.auth.allow_registration {
        return Err(ApiError::Forbidden("Registration is disabled".into()));
    }
    let name = required("name", &req.name)?;
    let email = normalize_email(&req.email)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid email '{}'", req.email)))?;
    check_password(&req.password, state.auth.min_password_length)?;

    let salt = new_salt();
    let hash = hash_password(&req.password, &salt);
    let token = new_session_token();
    let ttl = state.auth.session_ttl_hours;
    let session_token = token.clone();
    let user = state
        .db
        .call(move |db| {
            let role = if db.count_users()? == 0 {
                UserRole::Admin
            } else {
                UserRole::Member
            };
            let user = db.create_user(&name, &email, role, &hash, &salt)?;
            db.create_session(&session_token, user.id, ttl)?;
            Ok(user)
        })
        .await?;
    tracing::info!(user_id = user.id, role = %user.role, "User registered");
    Ok((StatusCode::CREATED, Json(SessionResponse { user, token })))
}

async fn login(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let invalid = || ApiError::Unauthorized("Invalid email or password".into());
    let email = normalize_email(&req.email).ok_or_else(invalid)?;
    let token = new_session_token();
    let ttl = state.auth.session_ttl_hours;
    let session_token = token.clone();
    let password = req.password;
    let user = state
        .db
        .call(move |db| {
            let Some((user, hash, salt)) = db.get_user_credentials(&email)? else {
                return Ok(None);
            };
            if !verify_password(&password, &salt, &hash) {
                return Ok(None);
            }
            db.create_session(&session_token, user.id, ttl)?;
            Ok(Some(user))
        })
        .await?;
    match user {
        Some(user) => {
            tracing::info!(user_id = user.id, "User logged in");
            Ok(Json(SessionResponse { user, token }))
        }
        None => {
            tracing::warn!("Failed login attempt");
            Err(invalid())
        }
    }
}

async fn logout(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let token = auth.token;
    state.db.call(move |db| db.delete_session(&token)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_me(auth: AuthUser) -> Json<User> {
    Json(auth.user)
}

async fn update_me(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = optional_required("name", req.name)?;
    if let Some(ref password) = req.password {
        check_password(password, state.auth.min_password_length)?;
    }
    let user = auth.user;
    let updated = state
        .db
        .call(move |db| {
            if let Some(password) = req.password {
                let current = req.current_password.unwrap_or_default();
                let (_, hash, salt) = db
                    .get_user_credentials(&user.email)?
                    .ok_or(BoardError::UserNotFound { id: user.id })?;
                if !verify_password(&current, &salt, &hash) {
                    return Err(BoardError::Forbidden("Current password is incorrect".into()).into());
                }
                let salt = new_salt();
                db.update_user_password(user.id, &hash_password(&password, &salt), &salt)?;
            }
            match name {
                Some(name) => db.update_user_name(user.id, &name),
                None => Ok(user),
            }
        })
        .await?;
    Ok(Json(updated))
}

// ── Handlers: users (admin) ───────────────────────────────────────────

async fn list_users(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin()?;
    let users = state.db.call(|db| db.list_users()).await?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin()?;
    let name = required("name", &req.name)?;
    let email = normalize_email(&req.email)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid email '{}'", req.email)))?;
    check_password(&req.password, state.auth.min_password_length)?;
    let role = req.role.unwrap_or(UserRole::Member);
    let salt = new_salt();
    let hash = hash_password(&req.password, &salt);
    let user = state
        .db
        .call(move |db| db.create_user(&name, &email, role, &hash, &salt))
        .await?;
    tracing::info!(user_id = user.id, created_by = auth.user.id, "User created");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin()?;
    if id == auth.user.id && req.role != UserRole::Admin {
        return Err(ApiError::Conflict("You cannot remove your own admin role".into()));
    }
    let role = req.role;
    let user = state
        .db
        .call(move |db| db.update_user_role(id, role))
        .await?;
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin()?;
    if id == auth.user.id {
        return Err(ApiError::BadRequest("You cannot delete yourself".into()));
    }
    let deleted = state.db.call(move |db| db.delete_user(id)).await?;
    match deleted {
        true => {
            tracing::info!(user_id = id, deleted_by = auth.user.id, "User deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(BoardError::UserNotFound { id }.into()),
    }
}

// ── Handlers: projects ────────────────────────────────────────────────

async fn list_projects(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let scope = member_scope(&auth.user);
    let projects = state.db.call(move |db| db.list_projects(scope)).await?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = required("name", &req.name)?;
    let description = req.description.unwrap_or_default();
    let owner_id = auth.user.id;
    let project = state
        .db
        .call(move |db| db.create_project(&name, &description, owner_id))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ProjectCreated {
            project: project.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            visible_project(db, &auth.user, id)?;
            db.get_project_detail(id)
        })
        .await?;
    Ok(Json(detail))
}

async fn update_project(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = optional_required("name", req.name)?;
    let description = req.description;
    let project = state
        .db
        .call(move |db| {
            managed_project(db, &auth.user, id)?;
            db.update_project(id, name.as_deref(), description.as_deref())
        })
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ProjectUpdated {
            project: project.clone(),
        },
    );
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| {
            managed_project(db, &auth.user, id)?;
            db.delete_project(id)
        })
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::ProjectDeleted { project_id: id });
    Ok(StatusCode::NO_CONTENT)
}

async fn list_members(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let members = state
        .db
        .call(move |db| {
            visible_project(db, &auth.user, id)?;
            db.list_members(id)
        })
        .await?;
    Ok(Json(members))
}

async fn add_member(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let member = state
        .db
        .call(move |db| {
            managed_project(db, &auth.user, id)?;
            db.add_member(id, req.user_id)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

async fn remove_member(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath((id, user_id)): ApiPath<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state
        .db
        .call(move |db| {
            managed_project(db, &auth.user, id)?;
            db.remove_member(id, user_id)
        })
        .await?;
    match removed {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound(format!(
            "User {} is not a member of project {}",
            user_id, id
        ))),
    }
}

async fn get_board(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state
        .db
        .call(move |db| {
            visible_project(db, &auth.user, id)?;
            db.list_tasks(id, &TaskFilter::default())
        })
        .await?;
    Ok(Json(KanbanBoard::from_tasks(tasks)))
}

// ── Handlers: tasks ───────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(filter): ApiQuery<TaskFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state
        .db
        .call(move |db| {
            visible_project(db, &auth.user, id)?;
            db.list_tasks(id, &filter)
        })
        .await?;
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(project_id): ApiPath<i64>,
    ApiJson(req): ApiJson<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = required("title", &req.title)?;
    let description = req.description.unwrap_or_default();
    let priority = req.priority.unwrap_or(TaskPriority::Medium);
    let assignee_id = req.assignee_id;
    let due_date = req.due_date;
    let task = state
        .db
        .call(move |db| {
            visible_project(db, &auth.user, project_id)?;
            check_assignee(db, project_id, assignee_id)?;
            db.create_task(
                project_id,
                &title,
                &description,
                priority,
                assignee_id,
                auth.user.id,
                due_date,
            )
        })
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::TaskCreated { task: task.clone() });
    Ok((StatusCode::CREATED, Json(task)))
}

async fn my_tasks(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user.id;
    let tasks = state
        .db
        .call(move |db| db.list_assigned_tasks(user_id))
        .await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            let task = db.require_task(id)?;
            visible_project(db, &auth.user, task.project_id)?;
            db.get_task_detail(id)
        })
        .await?;
    Ok(Json(detail))
}

async fn update_task(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let changes = TaskChanges {
        title: optional_required("title", req.title)?,
        description: req.description,
        priority: req.priority,
        assignee_id: req.assignee_id,
        due_date: req.due_date,
    };
    let task = state
        .db
        .call(move |db| {
            let (task, _) = editable_task(db, &auth.user, id)?;
            if let Some(assignee) = changes.assignee_id {
                check_assignee(db, task.project_id, assignee)?;
            }
            db.update_task(id, &changes)
        })
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::TaskUpdated { task: task.clone() });
    Ok(Json(task))
}

/// The kanban drop target. Any project member may move a task; the write
/// touches only the task's status and `updated_at`.
async fn update_task_status(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = TaskStatus::from_str(&req.status).map_err(|_| BoardError::InvalidStatus {
        status: req.status.clone(),
    })?;
    let (from, task) = state
        .db
        .call(move |db| {
            let task = db.require_task(id)?;
            visible_project(db, &auth.user, task.project_id)?;
            if task.status == status {
                return Ok((task.status, task));
            }
            let from = task.status;
            Ok((from, db.update_task_status(id, status)?))
        })
        .await?;
    if from != task.status {
        tracing::debug!(task_id = id, from = %from, to = %task.status, "Task moved");
        broadcast_message(
            &state.ws_tx,
            &WsMessage::TaskMoved {
                task_id: id,
                project_id: task.project_id,
                from_status: from,
                to_status: task.status,
            },
        );
    }
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .call(move |db| {
            let (task, _) = editable_task(db, &auth.user, id)?;
            db.delete_task(id)?;
            Ok(task)
        })
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::TaskDeleted {
            task_id: id,
            project_id: task.project_id,
        },
    );
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: comments ────────────────────────────────────────────────

async fn list_comments(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(task_id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let comments = state
        .db
        .call(move |db| {
            let task = db.require_task(task_id)?;
            visible_project(db, &auth.user, task.project_id)?;
            db.list_comments(task_id)
        })
        .await?;
    Ok(Json(comments))
}

async fn create_comment(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(task_id): ApiPath<i64>,
    ApiJson(req): ApiJson<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let body = required("body", &req.body)?;
    let comment = state
        .db
        .call(move |db| {
            let task = db.require_task(task_id)?;
            visible_project(db, &auth.user, task.project_id)?;
            let comment = db.create_comment(task_id, auth.user.id, &body)?;
            Ok((comment, task.project_id))
        })
        .await?;
    let (comment, project_id) = comment;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::CommentAdded {
            comment: comment.clone(),
            project_id,
        },
    );
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn update_comment(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let body = required("body", &req.body)?;
    let comment = state
        .db
        .call(move |db| {
            let comment = db.require_comment(id)?;
            if !can_edit_comment(&auth.user, &comment) {
                return Err(BoardError::Forbidden("Only the author can edit a comment".into()).into());
            }
            db.update_comment(id, &body)
        })
        .await?;
    Ok(Json(comment))
}

async fn delete_comment(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let comment = state
        .db
        .call(move |db| {
            let comment = db.require_comment(id)?;
            if !can_edit_comment(&auth.user, &comment) {
                return Err(BoardError::Forbidden("Only the author can delete a comment".into()).into());
            }
            let project_id = db.require_task(comment.task_id)?.project_id;
            db.delete_comment(id)?;
            Ok((comment, project_id))
        })
        .await?;
    let (comment, project_id) = comment;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::CommentDeleted {
            comment_id: id,
            task_id: comment.task_id,
            project_id,
        },
    );
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: calendar & dashboard ────────────────────────────────────

async fn calendar_month(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiQuery(q): ApiQuery<CalendarQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (first, last) = month_bounds(q.year, q.month)?;
    let scope = member_scope(&auth.user);
    let project_id = q.project_id;
    let tasks = state
        .db
        .call(move |db| {
            if let Some(pid) = project_id {
                visible_project(db, &auth.user, pid)?;
            }
            db.list_tasks_due_between(scope, project_id, first, last)
        })
        .await?;
    Ok(Json(month_view(tasks, q.year, q.month)?))
}

async fn calendar_summary(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiQuery(q): ApiQuery<SummaryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (first, _) = month_bounds(q.year, 1)?;
    let (_, last) = month_bounds(q.year, 12)?;
    let scope = member_scope(&auth.user);
    let project_id = q.project_id;
    let tasks = state
        .db
        .call(move |db| {
            if let Some(pid) = project_id {
                visible_project(db, &auth.user, pid)?;
            }
            db.list_tasks_due_between(scope, project_id, first, last)
        })
        .await?;
    Ok(Json(year_summary(&tasks, q.year)))
}

async fn dashboard(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let today = chrono::Utc::now().date_naive();
    let (monday, sunday) = week_range(today);
    let scope = member_scope(&auth.user);
    let user_id = auth.user.id;
    let (assigned, this_week, recent) = state
        .db
        .call(move |db| {
            Ok((
                db.list_assigned_tasks(user_id)?,
                db.list_tasks_due_between(scope, None, monday, sunday)?,
                db.list_recent_tasks(scope, RECENT_TASKS)?,
            ))
        })
        .await?;
    Ok(Json(build_dashboard(assigned, this_week, recent, today)))
}

// ── Handlers: patch notes ─────────────────────────────────────────────

async fn list_patch_notes(
    State(state): State<SharedState>,
    _auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let notes = state.db.call(|db| db.list_patch_notes()).await?;
    Ok(Json(notes))
}

async fn get_patch_note(
    State(state): State<SharedState>,
    _auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let note = state.db.call(move |db| db.require_patch_note(id)).await?;
    Ok(Json(note))
}

async fn create_patch_note(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<CreatePatchNoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin()?;
    let version = required("version", &req.version)?;
    let title = required("title", &req.title)?;
    let body = req.body;
    let author_id = auth.user.id;
    let note = state
        .db
        .call(move |db| db.create_patch_note(&version, &title, &body, author_id))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::PatchNotePublished { note: note.clone() });
    Ok((StatusCode::CREATED, Json(note)))
}

async fn update_patch_note(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdatePatchNoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin()?;
    let version = optional_required("version", req.version)?;
    let title = optional_required("title", req.title)?;
    let body = req.body;
    let note = state
        .db
        .call(move |db| {
            db.update_patch_note(id, version.as_deref(), title.as_deref(), body.as_deref())
        })
        .await?;
    Ok(Json(note))
}

async fn delete_patch_note(
    State(state): State<SharedState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_patch_note(id)).await?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(BoardError::PatchNoteNotFound { id }.into()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn test_state(auth: AuthSection) -> SharedState {
        let db = BoardDb::new_in_memory().unwrap();
        let (ws_tx, _) = broadcast::channel(64);
        Arc::new(AppState {
            db: DbHandle::new(db),
            ws_tx,
            auth,
        })
    }

    fn test_app() -> (Router, SharedState) {
        let state = test_state(AuthSection::default());
        (api_router().with_state(state.clone()), state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Send a request and return the status and parsed JSON body
    /// (`Value::Null` for empty bodies).
    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Register a user and return (id, token).
    async fn register_user(app: &Router, name: &str) -> (i64, String) {
        let (status, body) = send(
            app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({
                "name": name,
                "email": format!("{}@example.com", name.to_lowercase()),
                "password": "correct-horse",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "register {}: {}", name, body);
        (
            body["user"]["id"].as_i64().unwrap(),
            body["token"].as_str().unwrap().to_string(),
        )
    }

    async fn create_project(app: &Router, token: &str, name: &str) -> i64 {
        let (status, body) = send(
            app,
            "POST",
            "/api/projects",
            Some(token),
            Some(json!({"name": name, "description": "desc"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().unwrap()
    }

    async fn create_task(app: &Router, token: &str, project_id: i64, body: Value) -> Value {
        let (status, task) = send(
            app,
            "POST",
            &format!("/api/projects/{}/tasks", project_id),
            Some(token),
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "create task: {}", task);
        task
    }

    async fn add_member(app: &Router, token: &str, project_id: i64, user_id: i64) {
        let (status, _) = send(
            app,
            "POST",
            &format!("/api/projects/{}/members", project_id),
            Some(token),
            Some(json!({"user_id": user_id})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    // ── Auth ──

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_first_registered_user_is_admin() {
        let (app, _) = test_app();
        let (_, admin_token) = register_user(&app, "Ada").await;
        let (_, member_token) = register_user(&app, "Bob").await;

        let (status, me) = send(&app, "GET", "/api/auth/me", Some(&admin_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["role"], "admin");
        assert_eq!(me["email"], "ada@example.com");
        assert!(me.get("password_hash").is_none());

        let (_, me) = send(&app, "GET", "/api/auth/me", Some(&member_token), None).await;
        assert_eq!(me["role"], "member");
    }

    #[tokio::test]
    async fn test_register_validation() {
        let (app, _) = test_app();
        register_user(&app, "Ada").await;

        // duplicate email, different case
        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"name": "Other", "email": "ADA@example.com", "password": "long-enough"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already registered"));

        let (status, _) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"name": "Short", "email": "short@example.com", "password": "abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"name": "  ", "email": "blank@example.com", "password": "long-enough"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"name": "Bad", "email": "not-an-email", "password": "long-enough"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_registration_can_be_disabled() {
        let state = test_state(AuthSection {
            allow_registration: false,
            ..AuthSection::default()
        });
        let app = api_router().with_state(state);
        let (status, _) = send(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"name": "Ada", "email": "ada@example.com", "password": "long-enough"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let (app, _) = test_app();
        register_user(&app, "Ada").await;

        let (status, _) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"email": "ada@example.com", "password": "wrong-password"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"email": "nobody@example.com", "password": "correct-horse"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"email": " Ada@Example.com", "password": "correct-horse"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap().to_string();
        assert_eq!(body["user"]["name"], "Ada");

        let (status, _) = send(&app, "POST", "/api/auth/logout", Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, "GET", "/api/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_requests_without_token_are_unauthorized() {
        let (app, _) = test_app();
        let (status, body) = send(&app, "GET", "/api/projects", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, "GET", "/api/projects", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_update_profile() {
        let (app, _) = test_app();
        let (_, token) = register_user(&app, "Ada").await;

        let (status, me) = send(
            &app,
            "PATCH",
            "/api/auth/me",
            Some(&token),
            Some(json!({"name": "Ada Lovelace"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["name"], "Ada Lovelace");

        let (status, _) = send(
            &app,
            "PATCH",
            "/api/auth/me",
            Some(&token),
            Some(json!({"password": "new-password", "current_password": "wrong"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(
            &app,
            "PATCH",
            "/api/auth/me",
            Some(&token),
            Some(json!({"password": "new-password", "current_password": "correct-horse"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"email": "ada@example.com", "password": "new-password"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // ── Users ──

    #[tokio::test]
    async fn test_user_admin_routes() {
        let (app, _) = test_app();
        let (admin_id, admin) = register_user(&app, "Ada").await;
        let (bob_id, bob) = register_user(&app, "Bob").await;

        let (status, _) = send(&app, "GET", "/api/users", Some(&bob), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, users) = send(&app, "GET", "/api/users", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(users.as_array().unwrap().len(), 2);

        let (status, created) = send(
            &app,
            "POST",
            "/api/users",
            Some(&admin),
            Some(json!({"name": "Cy", "email": "cy@example.com", "password": "long-enough"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["role"], "member");

        let (status, promoted) = send(
            &app,
            "PATCH",
            &format!("/api/users/{}", bob_id),
            Some(&admin),
            Some(json!({"role": "admin"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(promoted["role"], "admin");

        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/api/users/{}", admin_id),
            Some(&admin),
            Some(json!({"role": "member"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_admin_cannot_delete_self() {
        let (app, _) = test_app();
        let (admin_id, admin) = register_user(&app, "Ada").await;
        let (bob_id, _) = register_user(&app, "Bob").await;

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/users/{}", admin_id),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/users/{}", bob_id),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/users/{}", bob_id),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ── Projects ──

    #[tokio::test]
    async fn test_project_visibility() {
        let (app, _) = test_app();
        let (_, admin) = register_user(&app, "Ada").await;
        let (_, bob) = register_user(&app, "Bob").await;
        let (cy_id, cy) = register_user(&app, "Cy").await;

        let project_id = create_project(&app, &bob, "Apollo").await;

        let (status, _) = send(&app, "GET", &format!("/api/projects/{}", project_id), Some(&cy), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, list) = send(&app, "GET", "/api/projects", Some(&cy), None).await;
        assert!(list.as_array().unwrap().is_empty());

        let (_, list) = send(&app, "GET", "/api/projects", Some(&admin), None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        add_member(&app, &bob, project_id, cy_id).await;

        let (status, detail) = send(&app, "GET", &format!("/api/projects/{}", project_id), Some(&cy), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["project"]["name"], "Apollo");
        assert_eq!(detail["members"].as_array().unwrap().len(), 2);
        assert_eq!(detail["task_counts"]["todo"], 0);

        // members cannot manage
        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/api/projects/{}", project_id),
            Some(&cy),
            Some(json!({"name": "Renamed"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_project_not_found() {
        let (app, _) = test_app();
        let (_, token) = register_user(&app, "Ada").await;
        let (status, body) = send(&app, "GET", "/api/projects/999", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("999"));
    }

    #[tokio::test]
    async fn test_project_owner_cannot_be_removed() {
        let (app, _) = test_app();
        register_user(&app, "Ada").await;
        let (bob_id, bob) = register_user(&app, "Bob").await;
        let (cy_id, _) = register_user(&app, "Cy").await;
        let project_id = create_project(&app, &bob, "Apollo").await;
        add_member(&app, &bob, project_id, cy_id).await;

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/projects/{}/members/{}", project_id, bob_id),
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/projects/{}/members/{}", project_id, cy_id),
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, members) = send(
            &app,
            "GET",
            &format!("/api/projects/{}/members", project_id),
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(members.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_project_broadcast() {
        let (app, state) = test_app();
        let (_, token) = register_user(&app, "Ada").await;
        let mut rx = state.ws_tx.subscribe();

        let project_id = create_project(&app, &token, "Apollo").await;
        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "ProjectCreated");

        let (status, project) = send(
            &app,
            "PATCH",
            &format!("/api/projects/{}", project_id),
            Some(&token),
            Some(json!({"name": "Artemis"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(project["name"], "Artemis");
        assert_eq!(project["description"], "desc");
        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "ProjectUpdated");

        let task = create_task(&app, &token, project_id, json!({"title": "Launch"})).await;
        let _ = rx.recv().await.unwrap();

        let (status, _) = send(&app, "DELETE", &format!("/api/projects/{}", project_id), Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "ProjectDeleted");
        assert_eq!(msg["data"]["project_id"], project_id);

        // tasks go with the project
        let (status, _) = send(&app, "GET", &format!("/api/tasks/{}", task["id"]), Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ── Tasks ──

    #[tokio::test]
    async fn test_create_task_validates_title_and_assignee() {
        let (app, _) = test_app();
        register_user(&app, "Ada").await;
        let (_, bob) = register_user(&app, "Bob").await;
        let (cy_id, _) = register_user(&app, "Cy").await;
        let project_id = create_project(&app, &bob, "Apollo").await;

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", project_id),
            Some(&bob),
            Some(json!({"title": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", project_id),
            Some(&bob),
            Some(json!({"title": "Fuel", "assignee_id": cy_id})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not a member"));

        let task = create_task(
            &app,
            &bob,
            project_id,
            json!({"title": "  Fuel  ", "priority": "urgent", "due_date": "2026-10-20"}),
        )
        .await;
        assert_eq!(task["title"], "Fuel");
        assert_eq!(task["status"], "todo");
        assert_eq!(task["priority"], "urgent");
        assert_eq!(task["due_date"], "2026-10-20");
    }

    #[tokio::test]
    async fn test_list_tasks_with_filters() {
        let (app, _) = test_app();
        let (_, token) = register_user(&app, "Ada").await;
        let project_id = create_project(&app, &token, "Apollo").await;
        create_task(&app, &token, project_id, json!({"title": "Fuel the rocket"})).await;
        let second = create_task(&app, &token, project_id, json!({"title": "Paint"})).await;
        send(
            &app,
            "PATCH",
            &format!("/api/tasks/{}/status", second["id"]),
            Some(&token),
            Some(json!({"status": "in_progress"})),
        )
        .await;

        let (status, tasks) = send(
            &app,
            "GET",
            &format!("/api/projects/{}/tasks?status=in_progress", project_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let tasks = tasks.as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["title"], "Paint");

        let (_, tasks) = send(
            &app,
            "GET",
            &format!("/api/projects/{}/tasks?search=rocket", project_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(tasks.as_array().unwrap().len(), 1);

        let (_, tasks) = send(
            &app,
            "GET",
            &format!("/api/projects/{}/tasks", project_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(tasks.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_status_move_updates_board_and_broadcasts() {
        let (app, state) = test_app();
        register_user(&app, "Ada").await;
        let (_, bob) = register_user(&app, "Bob").await;
        let (cy_id, cy) = register_user(&app, "Cy").await;
        let project_id = create_project(&app, &bob, "Apollo").await;
        add_member(&app, &bob, project_id, cy_id).await;
        let task = create_task(&app, &bob, project_id, json!({"title": "Fuel"})).await;
        let task_id = task["id"].as_i64().unwrap();

        let mut rx = state.ws_tx.subscribe();

        // any member may move a task, even without edit rights
        let (status, moved) = send(
            &app,
            "PATCH",
            &format!("/api/tasks/{}/status", task_id),
            Some(&cy),
            Some(json!({"status": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["status"], "completed");
        assert_eq!(moved["title"], "Fuel");

        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "TaskMoved");
        assert_eq!(msg["data"]["task_id"], task_id);
        assert_eq!(msg["data"]["project_id"], project_id);
        assert_eq!(msg["data"]["from_status"], "todo");
        assert_eq!(msg["data"]["to_status"], "completed");

        let (status, board) = send(
            &app,
            "GET",
            &format!("/api/projects/{}/board", project_id),
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let columns = board["columns"].as_array().unwrap();
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[0]["status"], "todo");
        assert!(columns[0]["tasks"].as_array().unwrap().is_empty());
        assert_eq!(columns[2]["status"], "completed");
        assert_eq!(columns[2]["tasks"][0]["id"], task_id);
    }

    #[tokio::test]
    async fn test_status_move_rejects_bad_input() {
        let (app, _) = test_app();
        register_user(&app, "Ada").await;
        let (_, bob) = register_user(&app, "Bob").await;
        let (_, outsider) = register_user(&app, "Cy").await;
        let project_id = create_project(&app, &bob, "Apollo").await;
        let task = create_task(&app, &bob, project_id, json!({"title": "Fuel"})).await;
        let uri = format!("/api/tasks/{}/status", task["id"]);

        let (status, body) = send(&app, "PATCH", &uri, Some(&bob), Some(json!({"status": "done"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("done"));

        let (status, _) = send(&app, "PATCH", &uri, Some(&outsider), Some(json!({"status": "completed"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(
            &app,
            "PATCH",
            "/api/tasks/9999/status",
            Some(&bob),
            Some(json!({"status": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_move_to_same_status_does_not_broadcast() {
        let (app, state) = test_app();
        let (_, token) = register_user(&app, "Ada").await;
        let project_id = create_project(&app, &token, "Apollo").await;
        let task = create_task(&app, &token, project_id, json!({"title": "Fuel"})).await;
        let mut rx = state.ws_tx.subscribe();

        let (status, same) = send(
            &app,
            "PATCH",
            &format!("/api/tasks/{}/status", task["id"]),
            Some(&token),
            Some(json!({"status": "todo"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(same["updated_at"], task["updated_at"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_task_edit_permissions() {
        let (app, _) = test_app();
        register_user(&app, "Ada").await;
        let (_, bob) = register_user(&app, "Bob").await;
        let (cy_id, cy) = register_user(&app, "Cy").await;
        let (dee_id, dee) = register_user(&app, "Dee").await;
        let project_id = create_project(&app, &bob, "Apollo").await;
        add_member(&app, &bob, project_id, cy_id).await;
        add_member(&app, &bob, project_id, dee_id).await;

        let task = create_task(
            &app,
            &cy,
            project_id,
            json!({"title": "Fuel", "due_date": "2026-10-20", "assignee_id": cy_id}),
        )
        .await;
        let uri = format!("/api/tasks/{}", task["id"]);

        // Dee is a member but neither creator, assignee nor owner
        let (status, _) = send(&app, "PATCH", &uri, Some(&dee), Some(json!({"title": "Hijack"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, "DELETE", &uri, Some(&dee), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // creator clears the due date and reassigns
        let (status, updated) = send(
            &app,
            "PATCH",
            &uri,
            Some(&cy),
            Some(json!({"due_date": null, "assignee_id": dee_id, "priority": "high"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(updated["due_date"].is_null());
        assert_eq!(updated["assignee_id"], dee_id);
        assert_eq!(updated["priority"], "high");
        assert_eq!(updated["title"], "Fuel");

        // now the assignee can edit
        let (status, _) = send(&app, "PATCH", &uri, Some(&dee), Some(json!({"description": "Top up"}))).await;
        assert_eq!(status, StatusCode::OK);

        // owner deletes
        let (status, _) = send(&app, "DELETE", &uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_my_tasks() {
        let (app, _) = test_app();
        let (ada_id, ada) = register_user(&app, "Ada").await;
        let project_id = create_project(&app, &ada, "Apollo").await;
        create_task(&app, &ada, project_id, json!({"title": "Mine", "assignee_id": ada_id})).await;
        create_task(&app, &ada, project_id, json!({"title": "Unassigned"})).await;

        let (status, tasks) = send(&app, "GET", "/api/tasks/mine", Some(&ada), None).await;
        assert_eq!(status, StatusCode::OK);
        let tasks = tasks.as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["title"], "Mine");
    }

    // ── Comments ──

    #[tokio::test]
    async fn test_comments_flow() {
        let (app, state) = test_app();
        register_user(&app, "Ada").await;
        let (_, bob) = register_user(&app, "Bob").await;
        let (cy_id, cy) = register_user(&app, "Cy").await;
        let project_id = create_project(&app, &bob, "Apollo").await;
        add_member(&app, &bob, project_id, cy_id).await;
        let task = create_task(&app, &bob, project_id, json!({"title": "Fuel"})).await;
        let comments_uri = format!("/api/tasks/{}/comments", task["id"]);
        let mut rx = state.ws_tx.subscribe();

        let (status, comment) = send(&app, "POST", &comments_uri, Some(&cy), Some(json!({"body": "On it"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(comment["author_name"], "Cy");
        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "CommentAdded");
        assert_eq!(msg["data"]["project_id"], project_id);

        send(&app, "POST", &comments_uri, Some(&bob), Some(json!({"body": "Thanks"}))).await;

        let (status, detail) = send(&app, "GET", &format!("/api/tasks/{}", task["id"]), Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        let bodies: Vec<&str> = detail["comments"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["body"].as_str().unwrap())
            .collect();
        assert_eq!(bodies, vec!["On it", "Thanks"]);

        let comment_uri = format!("/api/comments/{}", comment["id"]);
        let (status, _) = send(&app, "PATCH", &comment_uri, Some(&bob), Some(json!({"body": "Edited"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, edited) = send(&app, "PATCH", &comment_uri, Some(&cy), Some(json!({"body": "On it now"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(edited["body"], "On it now");

        let (status, _) = send(&app, "DELETE", &comment_uri, Some(&cy), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, comments) = send(&app, "GET", &comments_uri, Some(&cy), None).await;
        assert_eq!(comments.as_array().unwrap().len(), 1);
    }

    // ── Calendar & dashboard ──

    #[tokio::test]
    async fn test_calendar_month_and_summary() {
        let (app, _) = test_app();
        let (_, ada) = register_user(&app, "Ada").await;
        let (_, bob) = register_user(&app, "Bob").await;
        let project_id = create_project(&app, &ada, "Apollo").await;
        let other_project = create_project(&app, &bob, "Gemini").await;
        create_task(&app, &ada, project_id, json!({"title": "Low", "priority": "low", "due_date": "2026-10-05"})).await;
        create_task(&app, &ada, project_id, json!({"title": "Urgent", "priority": "urgent", "due_date": "2026-10-05"})).await;
        create_task(&app, &ada, project_id, json!({"title": "November", "due_date": "2026-11-02"})).await;
        create_task(&app, &bob, other_project, json!({"title": "Bob's", "due_date": "2026-10-05"})).await;

        // Bob only sees his own project
        let (status, month) = send(&app, "GET", "/api/calendar?year=2026&month=10", Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(month["days"].as_array().unwrap().len(), 31);
        let fifth = month["days"][4]["tasks"].as_array().unwrap();
        assert_eq!(fifth.len(), 1);
        assert_eq!(fifth[0]["title"], "Bob's");

        // admin filtered to one project
        let (_, month) = send(
            &app,
            "GET",
            &format!("/api/calendar?year=2026&month=10&project_id={}", project_id),
            Some(&ada),
            None,
        )
        .await;
        assert_eq!(month["days"][4]["date"], "2026-10-05");
        let titles: Vec<&str> = month["days"][4]["tasks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["Urgent", "Low"]);

        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/calendar?year=2026&month=10&project_id={}", project_id),
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&app, "GET", "/api/calendar?year=2026&month=13", Some(&ada), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, summary) = send(
            &app,
            "GET",
            &format!("/api/calendar/summary?year=2026&project_id={}", project_id),
            Some(&ada),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let summary = summary.as_array().unwrap();
        assert_eq!(summary.len(), 12);
        assert_eq!(summary[9]["total"], 2);
        assert_eq!(summary[9]["open"], 2);
        assert_eq!(summary[10]["total"], 1);
    }

    #[tokio::test]
    async fn test_dashboard_counts_assigned_tasks() {
        let (app, _) = test_app();
        let (ada_id, ada) = register_user(&app, "Ada").await;
        let project_id = create_project(&app, &ada, "Apollo").await;
        create_task(&app, &ada, project_id, json!({"title": "Late", "assignee_id": ada_id, "due_date": "2000-01-01"})).await;
        let done = create_task(&app, &ada, project_id, json!({"title": "Done", "assignee_id": ada_id})).await;
        send(
            &app,
            "PATCH",
            &format!("/api/tasks/{}/status", done["id"]),
            Some(&ada),
            Some(json!({"status": "completed"})),
        )
        .await;

        let (status, dash) = send(&app, "GET", "/api/dashboard", Some(&ada), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dash["assigned"]["todo"], 1);
        assert_eq!(dash["assigned"]["completed"], 1);
        assert_eq!(dash["overdue"].as_array().unwrap().len(), 1);
        assert_eq!(dash["overdue"][0]["title"], "Late");
        assert_eq!(dash["recent"].as_array().unwrap().len(), 2);
        assert_eq!(dash["recent"][0]["title"], "Done");
    }

    #[test]
    fn test_build_dashboard_filters_closed_tasks() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        let task = |id: i64, status: TaskStatus, due: Option<(i32, u32, u32)>| Task {
            id,
            project_id: 1,
            title: format!("t{}", id),
            description: String::new(),
            status,
            priority: TaskPriority::Medium,
            assignee_id: Some(1),
            creator_id: 1,
            due_date: due.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let assigned = vec![
            task(1, TaskStatus::Todo, Some((2026, 10, 1))),
            task(2, TaskStatus::Canceled, Some((2026, 10, 1))),
            task(3, TaskStatus::InProgress, Some((2026, 10, 14))),
            task(4, TaskStatus::Todo, None),
        ];
        let week = vec![
            task(3, TaskStatus::InProgress, Some((2026, 10, 14))),
            task(5, TaskStatus::Completed, Some((2026, 10, 15))),
        ];
        let dash = build_dashboard(assigned, week, Vec::new(), today);
        assert_eq!(dash.assigned.total(), 4);
        assert_eq!(dash.assigned.canceled, 1);
        let overdue: Vec<i64> = dash.overdue.iter().map(|t| t.id).collect();
        assert_eq!(overdue, vec![1]);
        let week: Vec<i64> = dash.due_this_week.iter().map(|t| t.id).collect();
        assert_eq!(week, vec![3]);
    }

    // ── Patch notes ──

    #[tokio::test]
    async fn test_patch_notes_admin_only_writes() {
        let (app, state) = test_app();
        let (_, admin) = register_user(&app, "Ada").await;
        let (_, bob) = register_user(&app, "Bob").await;
        let mut rx = state.ws_tx.subscribe();

        let (status, _) = send(
            &app,
            "POST",
            "/api/patch-notes",
            Some(&bob),
            Some(json!({"version": "1.0.0", "title": "Hi", "body": "..."})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, first) = send(
            &app,
            "POST",
            "/api/patch-notes",
            Some(&admin),
            Some(json!({"version": "1.0.0", "title": "Launch", "body": "First release"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "PatchNotePublished");
        assert_eq!(msg["data"]["note"]["version"], "1.0.0");

        send(
            &app,
            "POST",
            "/api/patch-notes",
            Some(&admin),
            Some(json!({"version": "1.1.0", "title": "Calendar", "body": "Month view"})),
        )
        .await;

        let (status, notes) = send(&app, "GET", "/api/patch-notes", Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        let versions: Vec<&str> = notes
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["version"].as_str().unwrap())
            .collect();
        assert_eq!(versions, vec!["1.1.0", "1.0.0"]);

        let note_uri = format!("/api/patch-notes/{}", first["id"]);
        let (status, _) = send(&app, "PATCH", &note_uri, Some(&bob), Some(json!({"title": "x"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, updated) = send(&app, "PATCH", &note_uri, Some(&admin), Some(json!({"title": "Liftoff"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["title"], "Liftoff");
        assert_eq!(updated["body"], "First release");

        let (status, _) = send(&app, "DELETE", &note_uri, Some(&admin), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &note_uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ── Error mapping ──

    #[test]
    fn test_api_error_from_board_error() {
        use anyhow::Context;

        let err: anyhow::Error = Err::<(), _>(BoardError::TaskNotFound { id: 3 })
            .context("loading task")
            .unwrap_err();
        assert!(matches!(ApiError::from(err), ApiError::NotFound(_)));
        assert!(matches!(
            ApiError::from(BoardError::Conflict("dup".into())),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(BoardError::InvalidStatus { status: "x".into() }),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(anyhow::anyhow!("disk on fire")),
            ApiError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn test_malformed_input_gets_json_error() {
        let (app, _) = test_app();
        let (_, ada) = register_user(&app, "Ada").await;
        let project_id = create_project(&app, &ada, "Apollo").await;

        let (status, body) = send(
            &app,
            "GET",
            &format!("/api/projects/{}/tasks?status=done", project_id),
            Some(&ada),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("done"));

        let (status, body) = send(&app, "GET", "/api/tasks/abc", Some(&ada), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let request = Request::builder()
            .method("POST")
            .uri("/api/projects")
            .header("authorization", format!("Bearer {}", ada))
            .header("content-type", "application/json")
            .body(Body::from("{\"name\": "))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = ApiError::Forbidden("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body, json!({"error": "nope"}));
    }
}
