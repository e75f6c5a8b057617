//! Topic-indexed pub/sub fabric.
//!
//! Topics are ephemeral: created on first subscribe, gone when the last
//! subscriber leaves, no history. Publishes travel through the backing
//! store's channel so every process sharing the store sees them; each process
//! bridges the channel into a local fan-out.

#[allow(clippy::module_inception)]
pub mod registry;
pub mod topic;

pub use registry::TopicRegistry;
pub use topic::Topic;
