//! Trafic agent - access gate and lifecycle manager for preview environments
//!
//! The agent sits next to a reverse proxy on a host running many container
//! projects and:
//! - Answers forward-auth calls using IP, token, Basic and hostname-rule policies
//! - Wakes stopped projects when the proxy reports an unavailable upstream
//! - Stops projects that have not been accessed for their idle timeout
//! - Takes daily database backups and prunes old ones
//! - Keeps project state and access logs in a local SQLite registry

pub mod auth;
pub mod backup;
pub mod config;
pub mod context;
pub mod control;
pub mod db;
pub mod error;
pub mod idle;
pub mod projects;
pub mod server;
pub mod templates;
pub mod wake;
