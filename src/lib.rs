//! Consolidated fleet state for distributed process-execution engines.
//!
//! Every engine only knows its own slice of a distributed process instance.
//! This crate polls the fleet, merges the per-machine partial views into one
//! consolidated picture (deployments, instance detail, active user tasks)
//! and keeps that picture fresh for as long as someone subscribes to it.

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod machines;
pub mod manager;
pub mod model;
pub mod persistence;
pub mod polling;
pub mod reconcile;
pub mod store;
