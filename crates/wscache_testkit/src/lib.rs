//! # wscache testkit
//!
//! Test utilities for the wscache sync engine.
//!
//! This crate provides:
//! - An in-memory cache store with transaction snapshots
//! - An in-memory repository server with failure injection
//! - Fixtures wiring both into a data source
//! - Property-based generators for offline edit sessions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wscache_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_data_source() {
//!     let mut env = TestEnv::new();
//!     env.server().insert(test_instance("A"));
//!     let source = env.data_source();
//!     // ... sync operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod memory_store;
pub mod mock_repository;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::memory_store::*;
    pub use crate::mock_repository::*;
}

pub use fixtures::*;
pub use generators::*;
pub use memory_store::MemoryStore;
pub use mock_repository::{FileStats, MockRepository, Op, Request, Target};
