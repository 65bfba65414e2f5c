//! Shared foundational types used across the Kiln build cache.
//!
//! This crate provides content hashing (XXH3-128 digests and a canonical
//! field hasher) and target addresses.

#![warn(missing_docs)]

pub mod address;
pub mod hash;

pub use address::{Address, ParseAddressError};
pub use hash::{ContentHash, ContentHasher};
