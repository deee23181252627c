//! Watchboard - dashboard screenshot aggregation daemon.
//!
//! Periodically logs headless browsers into monitoring backends, captures
//! each configured graph as a PNG, and keeps the images fresh on disk.
//! The web front end consumes [`api::DashboardApi`] for metadata and
//! config edits; the daemon binary wires everything together.

pub mod api;
pub mod browser;
pub mod config;
pub mod plugins;
pub mod scheduler;
