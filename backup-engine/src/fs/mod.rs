//! File system helpers: source traversal, archive checksums and free space.

pub mod checksum;
pub mod space;
pub mod walker;
