//! HTTP client for a single scanning node.
//!
//! Provides typed wire messages, the submit/poll REST wrapper, and the
//! capability fetcher that turns a node's engine list (protocol 3 or 4)
//! into a normalized snapshot.

pub mod api;
pub mod capability;
pub mod messages;
