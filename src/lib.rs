//! Shared storage for IVOA Universal Worker Service job records.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
