//! Upstream filtering logic

pub mod matcher;

pub use matcher::UpstreamFilter;
