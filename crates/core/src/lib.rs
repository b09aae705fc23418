//! Domain types and pure functions shared by the scan fleet crates.
//!
//! Nothing in here performs I/O. The node client and the dispatcher
//! build on these types.

pub mod engine;
pub mod error;
pub mod hashing;
pub mod load;
pub mod types;
pub mod verdict;
