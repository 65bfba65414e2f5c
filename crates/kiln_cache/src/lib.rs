//! Content-addressed build result cache.
//!
//! A build unit's [`Fingerprint`] covers its source contents, its options and
//! the fingerprints of everything it depends on. Results live in one
//! directory per fingerprint under the cache root; [`IsolatedWorkspace`]
//! hands out private scratch directories and atomically promotes them into
//! place. [`BuildCache`] ties this together with a `manifest.json` index.

#![warn(missing_docs)]

pub mod artifact;
pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod workspace;

pub use artifact::{ArtifactFile, ArtifactRecord, RECORD_FILE};
pub use cache::{BuildCache, CacheEntry, GcReport};
pub use error::CacheError;
pub use fingerprint::{Fingerprint, FingerprintInput, FingerprintStore};
pub use manifest::{CacheManifest, UnitEntry};
pub use workspace::{IsolatedWorkspace, ScratchDir};
