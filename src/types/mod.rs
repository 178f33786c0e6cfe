//! Core data model shared by the crawler, index and transport layers
//!
//! - `ResourceType`: what a listed hash turned out to be (file, directory or unsupported)
//! - `WorkItem`: a queued unit of crawl work
//! - `Reference`: one place a hash was linked from

mod resource_type;
mod work_item;

pub use resource_type::ResourceType;
pub use work_item::{Reference, WorkItem};

/// Index type recorded for objects that broke the filesystem protocol
///
/// Writing this record stops the hash from being re-crawled forever.
pub const INVALID_TYPE: &str = "invalid";
