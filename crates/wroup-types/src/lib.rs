//! Core types for Wroup, ad-hoc peer discovery and group messaging.
//!
//! This crate defines the data structures shared by the wire protocol, the
//! discovery layer, and the CLI. It contains no networking.

pub mod config;
pub mod error;
pub mod peer;
pub mod service;

pub use error::{ErrorCode, WroupError, WroupResult};
pub use peer::Peer;
pub use service::{Attributes, ServiceRecord};
