use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use super::models::*;
use crate::errors::BoardError;

/// Millisecond-precision UTC timestamp, so `updated_at` ordering survives
/// several writes within the same second.
const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

const USER_COLUMNS: &str = "id, name, email, role, created_at";
const PROJECT_COLUMNS: &str = "id, name, description, owner_id, created_at, updated_at";
const TASK_COLUMNS: &str = "id, project_id, title, description, status, priority, assignee_id, creator_id, due_date, created_at, updated_at";

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| BoardError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct BoardDb {
    conn: Connection,
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        let schema = format!(
            "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL DEFAULT 'member',
                password_hash TEXT NOT NULL,
                password_salt TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL DEFAULT ({now}),
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                owner_id INTEGER NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS project_members (
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                added_at TEXT NOT NULL DEFAULT ({now}),
                PRIMARY KEY (project_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'todo',
                priority TEXT NOT NULL DEFAULT 'medium',
                assignee_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                creator_id INTEGER NOT NULL,
                due_date TEXT,
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                author_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS patch_notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                author_id INTEGER NOT NULL,
                published_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_members_user ON project_members(user_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(due_date);
            CREATE INDEX IF NOT EXISTS idx_comments_task ON comments(task_id);
            ",
            now = NOW
        );
        self.conn
            .execute_batch(&schema)
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        name: &str,
        email: &str,
        role: UserRole,
        password_hash: &str,
        password_salt: &str,
    ) -> Result<User> {
        if self.get_user_by_email(email)?.is_some() {
            return Err(BoardError::Conflict(format!("Email {} is already registered", email)).into());
        }
        self.conn
            .execute(
                "INSERT INTO users (name, email, role, password_hash, password_salt) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, email, role.as_str(), password_hash, password_salt],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn count_users(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("Failed to count users")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_row,
            )
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                user_row,
            )
            .optional()
            .context("Failed to query user by email")?;
        row.map(UserRow::into_user).transpose()
    }

    /// Returns the user together with their stored `(hash, salt)` pair.
    pub fn get_user_credentials(&self, email: &str) -> Result<Option<(User, String, String)>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS}, password_hash, password_salt FROM users WHERE email = ?1"),
                params![email],
                |row| Ok((user_row(row)?, row.get::<_, String>(5)?, row.get::<_, String>(6)?)),
            )
            .optional()
            .context("Failed to query user credentials")?;
        match row {
            Some((user, hash, salt)) => Ok(Some((user.into_user()?, hash, salt))),
            None => Ok(None),
        }
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
            .context("Failed to prepare list_users")?;
        let rows = stmt.query_map([], user_row).context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?.into_user()?);
        }
        Ok(users)
    }

    pub fn update_user_role(&self, id: i64, role: UserRole) -> Result<User> {
        let count = self
            .conn
            .execute(
                "UPDATE users SET role = ?1 WHERE id = ?2",
                params![role.as_str(), id],
            )
            .context("Failed to update user role")?;
        if count == 0 {
            return Err(BoardError::UserNotFound { id }.into());
        }
        self.get_user(id)?.context("User not found after role update")
    }

    pub fn update_user_name(&self, id: i64, name: &str) -> Result<User> {
        let count = self
            .conn
            .execute("UPDATE users SET name = ?1 WHERE id = ?2", params![name, id])
            .context("Failed to update user name")?;
        if count == 0 {
            return Err(BoardError::UserNotFound { id }.into());
        }
        self.get_user(id)?.context("User not found after name update")
    }

    pub fn update_user_password(&self, id: i64, password_hash: &str, password_salt: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE users SET password_hash = ?1, password_salt = ?2 WHERE id = ?3",
                params![password_hash, password_salt, id],
            )
            .context("Failed to update user password")?;
        Ok(())
    }

    /// Delete a user. Refused while the user still owns projects.
    pub fn delete_user(&self, id: i64) -> Result<bool> {
        let owned: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE owner_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to count owned projects")?;
        if owned > 0 {
            return Err(BoardError::Conflict(format!(
                "User {} still owns {} project(s)",
                id, owned
            ))
            .into());
        }
        let count = self
            .conn
            .execute("DELETE FROM users WHERE id = ?1", params![id])
            .context("Failed to delete user")?;
        Ok(count > 0)
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(&self, token: &str, user_id: i64, ttl_hours: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (token, user_id, expires_at)
                 VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?3))",
                params![token, user_id, format!("{:+} hours", ttl_hours)],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    /// Resolve a session token to its user. Expired sessions resolve to `None`.
    pub fn get_session_user(&self, token: &str) -> Result<Option<User>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT u.id, u.name, u.email, u.role, u.created_at
                     FROM sessions s JOIN users u ON u.id = s.user_id
                     WHERE s.token = ?1 AND s.expires_at > {NOW}"
                ),
                params![token],
                user_row,
            )
            .optional()
            .context("Failed to resolve session")?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn delete_session(&self, token: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .context("Failed to delete session")?;
        Ok(count > 0)
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        self.conn
            .execute(&format!("DELETE FROM sessions WHERE expires_at <= {NOW}"), [])
            .context("Failed to purge expired sessions")
    }

    // ── Projects ──────────────────────────────────────────────────────

    /// Create a project. The owner is added as its first member.
    pub fn create_project(&self, name: &str, description: &str, owner_id: i64) -> Result<Project> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO projects (name, description, owner_id) VALUES (?1, ?2, ?3)",
            params![name, description, owner_id],
        )
        .context("Failed to insert project")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO project_members (project_id, user_id) VALUES (?1, ?2)",
            params![id, owner_id],
        )
        .context("Failed to add project owner as member")?;
        tx.commit().context("Failed to commit project creation")?;
        self.get_project(id)?.context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                project_row,
            )
            .optional()
            .context("Failed to query project")
    }

    /// Like `get_project`, but a missing project is an error.
    pub fn require_project(&self, id: i64) -> Result<Project> {
        self.get_project(id)?
            .ok_or_else(|| BoardError::ProjectNotFound { id }.into())
    }

    /// List projects visible to `member_id`, or every project when `None`.
    pub fn list_projects(&self, member_id: Option<i64>) -> Result<Vec<Project>> {
        let (sql, values) = match member_id {
            Some(user_id) => (
                format!(
                    "SELECT {PROJECT_COLUMNS} FROM projects
                     WHERE id IN (SELECT project_id FROM project_members WHERE user_id = ?1)
                     ORDER BY id"
                ),
                vec![Value::Integer(user_id)],
            ),
            None => (
                format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id"),
                Vec::new(),
            ),
        };
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), project_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Project> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(n) = name {
            tx.execute(
                &format!("UPDATE projects SET name = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![n, id],
            )
            .context("Failed to update project name")?;
        }
        if let Some(d) = description {
            tx.execute(
                &format!("UPDATE projects SET description = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![d, id],
            )
            .context("Failed to update project description")?;
        }
        tx.commit().context("Failed to commit project update")?;
        self.require_project(id)
    }

    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(count > 0)
    }

    // ── Project members ───────────────────────────────────────────────

    pub fn add_member(&self, project_id: i64, user_id: i64) -> Result<ProjectMember> {
        self.require_project(project_id)?;
        if self.get_user(user_id)?.is_none() {
            return Err(BoardError::UserNotFound { id: user_id }.into());
        }
        self.conn
            .execute(
                "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?1, ?2)",
                params![project_id, user_id],
            )
            .context("Failed to add project member")?;
        self.list_members(project_id)?
            .into_iter()
            .find(|m| m.user_id == user_id)
            .context("Member not found after insert")
    }

    /// Remove a member and unassign them from the project's tasks.
    /// The project owner cannot be removed.
    pub fn remove_member(&self, project_id: i64, user_id: i64) -> Result<bool> {
        let project = self.require_project(project_id)?;
        if project.owner_id == user_id {
            return Err(BoardError::Conflict("The project owner cannot be removed".into()).into());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let count = tx
            .execute(
                "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
            )
            .context("Failed to remove project member")?;
        let unassigned = tx
            .execute(
                &format!(
                    "UPDATE tasks SET assignee_id = NULL, updated_at = {NOW}
                     WHERE project_id = ?1 AND assignee_id = ?2"
                ),
                params![project_id, user_id],
            )
            .context("Failed to unassign removed member")?;
        tx.commit().context("Failed to commit member removal")?;
        if unassigned > 0 {
            tracing::debug!(project_id, user_id, unassigned, "Unassigned tasks of removed member");
        }
        Ok(count > 0)
    }

    pub fn list_members(&self, project_id: i64) -> Result<Vec<ProjectMember>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT m.project_id, m.user_id, u.name, m.added_at
                 FROM project_members m JOIN users u ON u.id = m.user_id
                 WHERE m.project_id = ?1 ORDER BY m.added_at, m.user_id",
            )
            .context("Failed to prepare list_members")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(ProjectMember {
                    project_id: row.get(0)?,
                    user_id: row.get(1)?,
                    user_name: row.get(2)?,
                    added_at: row.get(3)?,
                })
            })
            .context("Failed to query project members")?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row.context("Failed to read member row")?);
        }
        Ok(members)
    }

    pub fn is_member(&self, project_id: i64, user_id: i64) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
                |row| row.get(0),
            )
            .context("Failed to check project membership")
    }

    pub fn get_project_detail(&self, id: i64) -> Result<ProjectDetail> {
        let project = self.require_project(id)?;
        let members = self.list_members(id)?;
        let tasks = self.list_tasks(id, &TaskFilter::default())?;
        Ok(ProjectDetail {
            project,
            members,
            task_counts: TaskCounts::from_tasks(&tasks),
        })
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_task(
        &self,
        project_id: i64,
        title: &str,
        description: &str,
        priority: TaskPriority,
        assignee_id: Option<i64>,
        creator_id: i64,
        due_date: Option<NaiveDate>,
    ) -> Result<Task> {
        self.require_project(project_id)?;
        self.conn
            .execute(
                "INSERT INTO tasks (project_id, title, description, priority, assignee_id, creator_id, due_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project_id,
                    title,
                    description,
                    priority.as_str(),
                    assignee_id,
                    creator_id,
                    due_date.map(|d| d.to_string()),
                ],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.require_task(id)
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn require_task(&self, id: i64) -> Result<Task> {
        self.get_task(id)?
            .ok_or_else(|| BoardError::TaskNotFound { id }.into())
    }

    /// List a project's tasks, most recently updated first.
    pub fn list_tasks(&self, project_id: i64, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?");
        let mut values = vec![Value::Integer(project_id)];
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(assignee) = filter.assignee_id {
            sql.push_str(" AND assignee_id = ?");
            values.push(Value::Integer(assignee));
        }
        if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            sql.push_str(" AND (LOWER(title) LIKE ? OR LOWER(description) LIKE ?)");
            let pattern = format!("%{}%", term.to_lowercase());
            values.push(Value::Text(pattern.clone()));
            values.push(Value::Text(pattern));
        }
        sql.push_str(" ORDER BY updated_at DESC, id DESC");
        self.query_tasks(&sql, values)
    }

    /// Open and closed tasks assigned to a user across all projects.
    pub fn list_assigned_tasks(&self, user_id: i64) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE assignee_id = ?
                 ORDER BY due_date IS NULL, due_date, id"
            ),
            vec![Value::Integer(user_id)],
        )
    }

    /// Tasks due within `[from, to]` (inclusive), limited to projects
    /// `member_id` belongs to (all projects when `None`) and optionally to
    /// a single project.
    pub fn list_tasks_due_between(
        &self,
        member_id: Option<i64>,
        project_id: Option<i64>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Task>> {
        let mut sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE due_date IS NOT NULL AND due_date BETWEEN ? AND ?"
        );
        let mut values = vec![Value::Text(from.to_string()), Value::Text(to.to_string())];
        if let Some(user_id) = member_id {
            sql.push_str(" AND project_id IN (SELECT project_id FROM project_members WHERE user_id = ?)");
            values.push(Value::Integer(user_id));
        }
        if let Some(pid) = project_id {
            sql.push_str(" AND project_id = ?");
            values.push(Value::Integer(pid));
        }
        sql.push_str(" ORDER BY due_date, id");
        self.query_tasks(&sql, values)
    }

    /// Most recently touched tasks across the visible projects.
    pub fn list_recent_tasks(&self, member_id: Option<i64>, limit: i64) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
        let mut values = Vec::new();
        if let Some(user_id) = member_id {
            sql.push_str(" WHERE project_id IN (SELECT project_id FROM project_members WHERE user_id = ?)");
            values.push(Value::Integer(user_id));
        }
        sql.push_str(" ORDER BY updated_at DESC, id DESC LIMIT ?");
        values.push(Value::Integer(limit));
        self.query_tasks(&sql, values)
    }

    fn query_tasks(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), task_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn update_task(&self, id: i64, changes: &TaskChanges) -> Result<Task> {
        // Use unchecked_transaction so all updates are atomic.
        // DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(t) = &changes.title {
            tx.execute(
                &format!("UPDATE tasks SET title = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![t, id],
            )
            .context("Failed to update task title")?;
        }
        if let Some(d) = &changes.description {
            tx.execute(
                &format!("UPDATE tasks SET description = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![d, id],
            )
            .context("Failed to update task description")?;
        }
        if let Some(p) = changes.priority {
            tx.execute(
                &format!("UPDATE tasks SET priority = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![p.as_str(), id],
            )
            .context("Failed to update task priority")?;
        }
        if let Some(assignee) = changes.assignee_id {
            tx.execute(
                &format!("UPDATE tasks SET assignee_id = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![assignee, id],
            )
            .context("Failed to update task assignee")?;
        }
        if let Some(due) = changes.due_date {
            tx.execute(
                &format!("UPDATE tasks SET due_date = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![due.map(|d| d.to_string()), id],
            )
            .context("Failed to update task due date")?;
        }

        tx.commit().context("Failed to commit task update")?;
        self.require_task(id)
    }

    /// The kanban mutation: a single-row update of the status column.
    pub fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<Task> {
        let count = self
            .conn
            .execute(
                &format!("UPDATE tasks SET status = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![status.as_str(), id],
            )
            .context("Failed to update task status")?;
        if count == 0 {
            return Err(BoardError::TaskNotFound { id }.into());
        }
        self.require_task(id)
    }

    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(count > 0)
    }

    pub fn get_task_detail(&self, id: i64) -> Result<TaskDetail> {
        let task = self.require_task(id)?;
        let comments = self.list_comments(id)?;
        Ok(TaskDetail { task, comments })
    }

    // ── Comments ──────────────────────────────────────────────────────

    pub fn create_comment(&self, task_id: i64, author_id: i64, body: &str) -> Result<Comment> {
        self.require_task(task_id)?;
        self.conn
            .execute(
                "INSERT INTO comments (task_id, author_id, body) VALUES (?1, ?2, ?3)",
                params![task_id, author_id, body],
            )
            .context("Failed to insert comment")?;
        let id = self.conn.last_insert_rowid();
        self.require_comment(id)
    }

    pub fn get_comment(&self, id: i64) -> Result<Option<Comment>> {
        self.conn
            .query_row(
                "SELECT c.id, c.task_id, c.author_id, COALESCE(u.name, '(deleted user)'), c.body,
                        c.created_at, c.updated_at
                 FROM comments c LEFT JOIN users u ON u.id = c.author_id WHERE c.id = ?1",
                params![id],
                comment_row,
            )
            .optional()
            .context("Failed to query comment")
    }

    pub fn require_comment(&self, id: i64) -> Result<Comment> {
        self.get_comment(id)?
            .ok_or_else(|| BoardError::CommentNotFound { id }.into())
    }

    /// Comments on a task, oldest first.
    pub fn list_comments(&self, task_id: i64) -> Result<Vec<Comment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.task_id, c.author_id, COALESCE(u.name, '(deleted user)'), c.body,
                        c.created_at, c.updated_at
                 FROM comments c LEFT JOIN users u ON u.id = c.author_id
                 WHERE c.task_id = ?1 ORDER BY c.created_at, c.id",
            )
            .context("Failed to prepare list_comments")?;
        let rows = stmt
            .query_map(params![task_id], comment_row)
            .context("Failed to query comments")?;
        let mut comments = Vec::new();
        for row in rows {
            comments.push(row.context("Failed to read comment row")?);
        }
        Ok(comments)
    }

    pub fn update_comment(&self, id: i64, body: &str) -> Result<Comment> {
        let count = self
            .conn
            .execute(
                &format!("UPDATE comments SET body = ?1, updated_at = {NOW} WHERE id = ?2"),
                params![body, id],
            )
            .context("Failed to update comment")?;
        if count == 0 {
            return Err(BoardError::CommentNotFound { id }.into());
        }
        self.require_comment(id)
    }

    pub fn delete_comment(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM comments WHERE id = ?1", params![id])
            .context("Failed to delete comment")?;
        Ok(count > 0)
    }

    // ── Patch notes ───────────────────────────────────────────────────

    pub fn create_patch_note(
        &self,
        version: &str,
        title: &str,
        body: &str,
        author_id: i64,
    ) -> Result<PatchNote> {
        self.conn
            .execute(
                "INSERT INTO patch_notes (version, title, body, author_id) VALUES (?1, ?2, ?3, ?4)",
                params![version, title, body, author_id],
            )
            .context("Failed to insert patch note")?;
        let id = self.conn.last_insert_rowid();
        self.require_patch_note(id)
    }

    pub fn get_patch_note(&self, id: i64) -> Result<Option<PatchNote>> {
        self.conn
            .query_row(
                "SELECT id, version, title, body, author_id, published_at FROM patch_notes WHERE id = ?1",
                params![id],
                patch_note_row,
            )
            .optional()
            .context("Failed to query patch note")
    }

    pub fn require_patch_note(&self, id: i64) -> Result<PatchNote> {
        self.get_patch_note(id)?
            .ok_or_else(|| BoardError::PatchNoteNotFound { id }.into())
    }

    /// Patch notes, newest first.
    pub fn list_patch_notes(&self) -> Result<Vec<PatchNote>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, version, title, body, author_id, published_at
                 FROM patch_notes ORDER BY published_at DESC, id DESC",
            )
            .context("Failed to prepare list_patch_notes")?;
        let rows = stmt
            .query_map([], patch_note_row)
            .context("Failed to query patch notes")?;
        let mut notes = Vec::new();
        for row in rows {
            notes.push(row.context("Failed to read patch note row")?);
        }
        Ok(notes)
    }

    pub fn update_patch_note(
        &self,
        id: i64,
        version: Option<&str>,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<PatchNote> {
        self.require_patch_note(id)?;
        self.conn
            .execute(
                "UPDATE patch_notes SET
                    version = COALESCE(?1, version),
                    title = COALESCE(?2, title),
                    body = COALESCE(?3, body)
                 WHERE id = ?4",
                params![version, title, body, id],
            )
            .context("Failed to update patch note")?;
        self.require_patch_note(id)
    }

    pub fn delete_patch_note(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM patch_notes WHERE id = ?1", params![id])
            .context("Failed to delete patch note")?;
        Ok(count > 0)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

/// Intermediate row struct for reading users before parsing the role.
struct UserRow {
    id: i64,
    name: String,
    email: String,
    role: String,
    created_at: String,
}

fn user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        role: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        let role = UserRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse user role")?;
        Ok(User {
            id: self.id,
            name: self.name,
            email: self.email,
            role,
            created_at: self.created_at,
        })
    }
}

fn project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Intermediate row struct for tasks; status, priority and due date are
/// stored as text and parsed in `into_task`.
struct TaskRow {
    id: i64,
    project_id: i64,
    title: String,
    description: String,
    status: String,
    priority: String,
    assignee_id: Option<i64>,
    creator_id: i64,
    due_date: Option<String>,
    created_at: String,
    updated_at: String,
}

fn task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        assignee_id: row.get(6)?,
        creator_id: row.get(7)?,
        due_date: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let priority = TaskPriority::from_str(&self.priority)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task priority")?;
        let due_date = self
            .due_date
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
            .transpose()
            .context("Failed to parse task due date")?;
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            status,
            priority,
            assignee_id: self.assignee_id,
            creator_id: self.creator_id,
            due_date,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn comment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        task_id: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        body: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn patch_note_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PatchNote> {
    Ok(PatchNote {
        id: row.get(0)?,
        version: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        author_id: row.get(4)?,
        published_at: row.get(5)?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────
