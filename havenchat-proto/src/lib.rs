//! Shared protocol definitions for the `HavenChat` wire format.

pub mod auth;
pub mod codec;
pub mod frame;
pub mod message;
pub mod room;
