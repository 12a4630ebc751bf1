//! CLI command implementations.

pub mod attachments;
pub mod classify;
pub mod etag_cache;
pub mod token;
