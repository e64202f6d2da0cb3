//! Team project board back-end.
//!
//! ## Overview
//!
//! Projects own tasks; tasks carry comments. Every task sits in one of four
//! kanban buckets and may have a due date that places it on the calendar.
//! Admins manage accounts and publish patch notes. All state lives in SQLite
//! and every mutation is broadcast over a WebSocket to the clients allowed
//! to see it.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig, tracing) │
//! │ (browser)│ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │  AuthUser extractor + access guards    │
//!                       │         v                                        │
//!                       │  auth.rs     (password hashing, sessions)        │
//!                       │         │                                        │
//!                       │         │ DbHandle::call() on spawn_blocking     │
//!                       │         v                                        │
//!                       │  db.rs       (BoardDb over rusqlite)             │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                             |
//! |------------|------------------------------------------------------------|
//! | `models`   | Shared types: `Task`, `TaskStatus`, `Project`, `User`      |
//! | `kanban`   | Four-bucket board, optimistic drag/drop, `StatusSync`      |
//! | `calendar` | Month view by due day, per-month year summary              |
//! | `ws`       | `WsMessage`, per-socket visibility screening, broadcasting |
//!
//! ## Typical Request Flow (drag a task to "Completed")
//!
//! 1. The client moves the card locally (`KanbanBoard::drop_on`) and fires
//!    `PATCH /api/tasks/{id}/status` without waiting on it.
//! 2. `api::update_task_status` checks the caller is a project member and
//!    updates the one row's `status` and `updated_at`.
//! 3. A `TaskMoved` message goes out on the broadcast channel; other clients
//!    apply it with `KanbanBoard::move_task`.
//! 4. If the request fails the client only logs it. Nothing is rolled back.

pub mod api;
pub mod auth;
pub mod calendar;
pub mod db;
pub mod kanban;
pub mod models;
pub mod server;
pub mod ws;
