// Library entry point for stash-vm
// Exposes modules for testing

pub mod api;
pub mod auth;
pub mod config;
pub mod content;
pub mod graph;
pub mod models;
pub mod notify;
pub mod purge;
pub mod resolver;
pub mod store;
