//! `HavenChat` — realtime client core for the Haven peer-support platform.

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod store;
