//! ao3-opds: OPDS feeds for Archive of Our Own reading lists.
//!
//! This crate logs into AO3 on behalf of its users, mirrors their reading
//! lists into SQLite and serves each list as an OPDS acquisition feed that
//! e-readers like KOReader can browse and download from.
//!
//! # Features
//!
//! - Marked for Later, Bookmarks, Subscriptions and History feeds
//! - Incremental sync with per-level freshness windows
//! - Background job queue with high and low priority lanes
//! - Rate-limit aware remote client
//! - Local user accounts and public share links

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication and user management.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// AO3 credentials and sessions.
pub mod credentials;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// Feed assembly from stored collections.
pub mod feed;
/// OPDS feed generation.
pub mod opds;
/// Remote site access.
pub mod remote;
/// HTTP server.
pub mod server;
/// Reading list synchronization.
pub mod sync;


pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use server::AppState;
