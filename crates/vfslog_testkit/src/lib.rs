//! # vfslog Testkit
//!
//! Test utilities for vfslog.
//!
//! This crate provides:
//! - Temporary logged stores and recovery helpers
//! - Property-based generators of mutation scripts using proptest
//! - Scenario builders shared by the integration tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vfslog_testkit::prelude::*;
//!
//! #[test]
//! fn recovery_is_identity() {
//!     let source = TestStore::new();
//!     scenarios::populated_tree(&source, 3, 2);
//!     let recovered = source.recover("recovered");
//!     assert_no_diff(&source, &recovered.store);
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
