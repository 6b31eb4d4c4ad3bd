//! callhub Core - Shared identity types for the signaling relay
//!
//! This crate provides the identifiers shared between the wire
//! protocol (callhub-protocol) and the daemon (callhubd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod ident;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use ident::{CallId, ConnectionId, Username};
