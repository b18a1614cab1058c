//! `HavenChat` Gateway library.
//!
//! Exposes the gateway for use in tests and embedding. The gateway issues
//! single-use socket tokens over HTTP, authenticates WebSocket connections on
//! the `/peer` and `/private-chat` namespaces, and fans room traffic out to
//! every member.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod rooms;
pub mod store;
