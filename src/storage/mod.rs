//! Storage module - on-disk caches of gossip state

mod cache;

pub use cache::*;
