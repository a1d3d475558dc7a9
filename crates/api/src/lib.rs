//! HTTP surface for scheduling notifications.
//!
//! Endpoints:
//! - POST   /api/notify — Schedule a notification
//! - GET    /api/notify — List all notifications, newest first
//! - GET    /api/notify/{id} — Fetch one notification
//! - DELETE /api/notify/{id} — Cancel (or with `?purge=true`, remove) a notification
//! - GET    /api/metrics — Record counts by status
//! - GET    /api/health — Liveness

pub mod routes;
pub mod state;
