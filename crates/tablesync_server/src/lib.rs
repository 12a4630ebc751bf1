//! # tablesync server
//!
//! Reference table server for tablesync.
//!
//! This crate provides:
//! - The remote table API (table state, diff, alterRows)
//! - Row attachment endpoints (manifest, multipart upload and download)
//! - Authentication middleware (HMAC-SHA256 bearer tokens)
//! - Optimistic concurrency on the table data ETag
//!
//! # Architecture
//!
//! Tables live in memory. Every accepted write bumps the table version,
//! which doubles as the data ETag (`d<version>`); rows remember the version
//! they were last written at, so a diff is a scan for newer rows.
//!
//! # Authentication
//!
//! ```rust,ignore
//! use tablesync_server::{ServerConfig, TableServer};
//!
//! let server = TableServer::new(ServerConfig::default().with_auth(secret));
//! let token = server.issue_token("collector7").unwrap()?;
//! // clients send `Authorization: Bearer <token>`
//! ```
//!
//! # Protocol
//!
//! 1. A push names the data ETag it is based on; a stale one is rejected
//!    whole with 409
//! 2. Otherwise each row gets its own outcome (success, conflict, failed,
//!    denied) and the batch bumps the version once

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod tables;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler, ServerRequest, ServerResponse};
pub use server::TableServer;
pub use tables::ServerTables;
