//! Use-case helpers layered on the repository contract.
//!
//! # Responsibility
//! - Compose repository calls that callers would otherwise repeat.
//! - Stay storage-agnostic; only trait objects from `Storage` are used.

pub mod catalog;

pub use catalog::{CascadeSummary, CatalogService};
