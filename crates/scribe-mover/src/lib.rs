//! Reconciliation engine for ReplicationSource
//!
//! A reconcile pass selects the mover for the object's method block and runs
//! its ordered step table through the pipeline executor:
//!
//! - [`schedule`]: when a sync is due, and the bookkeeping once it completes
//! - [`pipeline`]: runs steps in order, stopping at the first suspend or error
//! - [`volume`]: the volume a mover reads, copied via clone or snapshot
//! - [`job`]: the mover Job's lifecycle
//! - [`mover`]: the rsync, rclone and restic movers
//! - [`controller`]: `reconcile` / `error_policy` for kube-runtime

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod job;
pub mod mover;
pub mod pipeline;
pub mod schedule;
pub mod volume;

#[cfg(test)]
mod fake;

pub use client::{MoverKubeClient, MoverKubeClientImpl};
pub use config::MoverImages;
pub use controller::{error_policy, reconcile, MoverContext};
