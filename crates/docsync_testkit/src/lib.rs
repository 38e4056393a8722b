//! # docsync Testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - Document and store fixtures
//! - Property-based test generators using proptest
//! - Builders for scripted listen stream traffic
//! - Log capture for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[test]
//! fn seeded_store() {
//!     let store = memory_store();
//!     let doc = found_doc("items/a", 1, serde_json::json!({ "qty": 3 }));
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod watch;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::watch::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use watch::*;
