//! HTTP request handlers for the REST surface.

pub mod config;

pub use config::{get_config, update_config};
