//! # tablesync testkit
//!
//! Test utilities for tablesync.
//!
//! This crate provides:
//! - Replica fixtures (a memory row store with a registered table)
//! - Temporary attachment directories
//! - Reference server fixtures and remote-edit helpers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablesync_testkit::prelude::*;
//!
//! #[test]
//! fn replica_starts_empty() {
//!     let replica = TestReplica::new();
//!     assert!(replica.rows().is_empty());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
