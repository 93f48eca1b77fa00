//! Library crate for fusion-sync-rs exposing reusable modules.
pub mod classify;
pub mod collector;
pub mod config;
pub mod export;
pub mod logging;
pub mod pagination;
pub mod provider;
pub mod server;
pub mod state;
pub mod types;
