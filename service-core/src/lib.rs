//! service-core: Shared infrastructure for the reconciler services.
pub mod config;
pub mod error;
pub mod observability;
