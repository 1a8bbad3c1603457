//! Adapters Layer
//!
//! Implementations of the domain ports against the local filesystem.

pub mod outbound;
