//! Reconciler service: consumes per-account tasks, finds source transactions
//! missing from the budgeting destination and forwards them in batches.

pub mod bus;
pub mod config;
pub mod models;
pub mod reconcile;
pub mod services;
pub mod startup;
