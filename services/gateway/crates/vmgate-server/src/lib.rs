//! VM lifecycle gateway.
//!
//! Accepts status/start/stop/suspend/resume requests for cloud VMs over HTTP,
//! authorizes them, drives the `gcloud` CLI, streams progress back to the
//! caller and records every request in a monthly CSV audit trail.

pub mod audit;
pub mod command_runner;
pub mod directory;
pub mod error;
pub mod executor;
pub mod gcloud;
pub mod http;
pub mod names;
pub mod policy;
pub mod progress;
pub mod sanitize;
pub mod state;
