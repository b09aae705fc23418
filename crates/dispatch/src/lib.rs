//! Multi-node scan dispatch.
//!
//! [`ScanDispatcher`](dispatcher::ScanDispatcher) submits artifacts to one
//! active node out of a configured set, polls until the node finishes,
//! and returns a normalized verdict. Node health, capability snapshots and
//! queue-time statistics live in a single [`Session`](session::Session)
//! guarded by one lock; [`NodeSelector`](selector::NodeSelector) decides
//! when and where to rotate.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod selector;
pub mod session;
pub mod verdict;

pub use config::DispatchConfig;
pub use dispatcher::ScanDispatcher;
pub use error::DispatchError;
