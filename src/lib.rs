//! Palisade - Embeddable HTTP/1.1 Service Framework
//!
//! Core library: the per-connection server core, the handler contract, and
//! the listeners that feed it.

pub mod config;
pub mod http;
pub mod server;
