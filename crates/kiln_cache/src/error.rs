//! Error types for cache operations.

use std::path::PathBuf;

/// Errors that can occur during cache operations.
///
/// Reads of cached results are fail-safe: a damaged record is a cache miss,
/// not an error. The variants below cover fingerprinting failures, workspace
/// misuse and I/O while writing.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A declared source file does not exist, so no fingerprint can be
    /// computed for the unit.
    #[error("missing source for {unit}: {path}")]
    MissingSource {
        /// The unit being fingerprinted.
        unit: String,
        /// The absent file.
        path: PathBuf,
    },

    /// A scratch directory was requested for a fingerprint that is already
    /// being built.
    #[error("workspace conflict: fingerprint {fingerprint} is already being built")]
    WorkspaceConflict {
        /// The contested fingerprint.
        fingerprint: String,
    },

    /// A unit names a dependency that is not part of the fingerprinted set.
    #[error("{unit} depends on unknown unit {dependency}")]
    UnknownDependency {
        /// The dependent unit.
        unit: String,
        /// The unknown dependency.
        dependency: String,
    },

    /// Units depend on each other in a cycle.
    #[error("dependency cycle through {unit}")]
    DependencyCycle {
        /// A unit on the cycle.
        unit: String,
    },

    /// A dependency could not be fingerprinted, so neither can the unit.
    #[error("{unit} cannot be fingerprinted: dependency {dependency} failed")]
    UpstreamUnavailable {
        /// The dependent unit.
        unit: String,
        /// The dependency that failed.
        dependency: String,
    },

    /// An artifact record has an invalid or missing header.
    #[error("invalid artifact header in {path}: {reason}")]
    InvalidHeader {
        /// The record file path.
        path: PathBuf,
        /// Description of the header problem.
        reason: String,
    },

    /// The stored checksum does not match the computed checksum of the payload.
    #[error("checksum mismatch in {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The record file path.
        path: PathBuf,
        /// The expected checksum from the header.
        expected: String,
        /// The actual checksum computed from the payload.
        actual: String,
    },

    /// The record format version does not match the current version.
    #[error("version mismatch in {path}: expected {expected}, got {actual}")]
    VersionMismatch {
        /// The record file path.
        path: PathBuf,
        /// The expected format version.
        expected: u32,
        /// The actual format version found in the file.
        actual: u32,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

impl CacheError {
    /// Wraps an I/O error with the path it happened at.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err = CacheError::io(
            "/tmp/cache/manifest.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("cache I/O error"));
        assert!(msg.contains("manifest.json"));
    }

    #[test]
    fn missing_source_display() {
        let err = CacheError::MissingSource {
            unit: "src/pkg:fast".to_string(),
            path: PathBuf::from("src/pkg/fast.pyx"),
        };
        let msg = err.to_string();
        assert!(msg.contains("src/pkg:fast"));
        assert!(msg.contains("fast.pyx"));
    }

    #[test]
    fn workspace_conflict_display() {
        let err = CacheError::WorkspaceConflict {
            fingerprint: "abcd".to_string(),
        };
        assert!(err.to_string().contains("already being built"));
    }

    #[test]
    fn upstream_unavailable_display() {
        let err = CacheError::UpstreamUnavailable {
            unit: "a".to_string(),
            dependency: "b".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "a cannot be fingerprinted: dependency b failed"
        );
    }

    #[test]
    fn checksum_mismatch_display() {
        let err = CacheError::ChecksumMismatch {
            path: PathBuf::from(".kiln-artifact"),
            expected: "aabb".to_string(),
            actual: "ccdd".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("checksum mismatch"));
        assert!(msg.contains("aabb"));
        assert!(msg.contains("ccdd"));
    }

    #[test]
    fn version_mismatch_display() {
        let err = CacheError::VersionMismatch {
            path: PathBuf::from(".kiln-artifact"),
            expected: 2,
            actual: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 2"));
        assert!(msg.contains("got 1"));
    }
}
