//! Refract core library: static analysis and guarded refactoring over a
//! multi-language source tree.
//!
//! The crate indexes Python, Java, TypeScript/JavaScript and Go sources into
//! a generation-stamped [`store::index::ProjectIndex`], derives a dependency
//! graph with cycle detection, runs structural pattern rules and quality
//! metrics, and plans/applies refactors with backups and rollback. The
//! [`engine::Engine`] facade ties the pieces together for one project root.

pub mod config;
pub mod engine;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod query;
pub mod refactor;
pub mod store;

pub use config::Config;
pub use engine::Engine;
pub use errors::{RefractError, RefractResult};
