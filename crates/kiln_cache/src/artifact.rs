//! The artifact record stored inside every results directory.
//!
//! The record lists the files a build produced, with their hashes, so that a
//! cache hit can hand the exact file list to the graph without trusting a
//! directory that may have been tampered with. It is written as a binary file
//! with a header containing magic bytes, format version and a checksum.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::ContentHash;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::fingerprint::Fingerprint;

/// File name of the record inside a results directory. Never listed as an
/// output file.
pub const RECORD_FILE: &str = ".kiln-artifact";

/// Magic bytes identifying a kiln artifact record.
const RECORD_MAGIC: [u8; 4] = *b"KILN";

/// Current record format version. Increment on breaking changes to
/// the header or payload format.
const RECORD_FORMAT_VERSION: u32 = 1;

/// Header prepended to every record for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordHeader {
    magic: [u8; 4],
    format_version: u32,
    kiln_version: String,
    checksum: ContentHash,
}

/// One output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the results directory, `/`-separated.
    pub path: String,
    /// Content hash.
    pub hash: ContentHash,
    /// Size in bytes.
    pub size: u64,
}

/// The files a unit produced, plus how they were produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Address of the unit that produced the artifact.
    pub unit: String,
    /// Fingerprint of the unit.
    pub fingerprint: Fingerprint,
    /// Output files, sorted by path.
    pub files: Vec<ArtifactFile>,
    /// Set when the artifact contains a placeholder instead of real native
    /// output.
    pub synthetic_marker: bool,
    /// Builder-specific facts (wheel name, image tag, ...).
    pub metadata: BTreeMap<String, String>,
}

impl ArtifactRecord {
    /// Builds a record by scanning every file under `dir`.
    pub fn scan(unit: &str, fingerprint: Fingerprint, dir: &Path) -> Result<Self, CacheError> {
        let mut paths = Vec::new();
        collect_files(dir, dir, &mut paths)?;
        paths.sort();
        let mut files = Vec::with_capacity(paths.len());
        for rel in paths {
            let full = dir.join(&rel);
            let content = std::fs::read(&full).map_err(|e| CacheError::io(&full, e))?;
            files.push(ArtifactFile {
                path: rel,
                hash: ContentHash::from_bytes(&content),
                size: content.len() as u64,
            });
        }
        Ok(Self {
            unit: unit.to_string(),
            fingerprint,
            files,
            synthetic_marker: false,
            metadata: BTreeMap::new(),
        })
    }

    /// Relative paths of the output files.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| PathBuf::from(&f.path)).collect()
    }

    /// Writes the record into `dir`.
    pub fn write(&self, dir: &Path, kiln_version: &str) -> Result<(), CacheError> {
        let payload = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        let header = RecordHeader {
            magic: RECORD_MAGIC,
            format_version: RECORD_FORMAT_VERSION,
            kiln_version: kiln_version.to_string(),
            checksum: ContentHash::from_bytes(&payload),
        };
        let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;

        // 4-byte header length (little-endian) + header + payload
        let header_len = header_bytes.len() as u32;
        let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
        output.extend_from_slice(&header_len.to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(&payload);

        let path = dir.join(RECORD_FILE);
        std::fs::write(&path, &output).map_err(|e| CacheError::io(path, e))
    }

    /// Reads and validates the record in `dir`.
    pub fn read(dir: &Path) -> Result<Self, CacheError> {
        let path = dir.join(RECORD_FILE);
        let raw = std::fs::read(&path).map_err(|e| CacheError::io(&path, e))?;
        let invalid = |reason: &str| CacheError::InvalidHeader {
            path: path.clone(),
            reason: reason.to_string(),
        };

        if raw.len() < 4 {
            return Err(invalid("file too short"));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&raw[..4]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        if raw.len() < 4 + header_len {
            return Err(invalid("truncated header"));
        }

        let (header, _): (RecordHeader, usize) =
            bincode::serde::decode_from_slice(&raw[4..4 + header_len], bincode::config::standard())
                .map_err(|e| invalid(&e.to_string()))?;
        if header.magic != RECORD_MAGIC {
            return Err(invalid("missing magic bytes"));
        }
        if header.format_version != RECORD_FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                path,
                expected: RECORD_FORMAT_VERSION,
                actual: header.format_version,
            });
        }

        let payload = &raw[4 + header_len..];
        let actual = ContentHash::from_bytes(payload);
        if actual != header.checksum {
            return Err(CacheError::ChecksumMismatch {
                path,
                expected: header.checksum.to_string(),
                actual: actual.to_string(),
            });
        }

        let (record, _): (ArtifactRecord, usize) =
            bincode::serde::decode_from_slice(payload, bincode::config::standard()).map_err(
                |e| CacheError::Serialization {
                    reason: e.to_string(),
                },
            )?;
        Ok(record)
    }

    /// Like [`read`](Self::read), but any problem is a miss.
    pub fn load(dir: &Path) -> Option<Self> {
        match Self::read(dir) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "ignoring unreadable artifact record");
                None
            }
        }
    }

    /// Returns `true` if every listed file exists in `dir` with the recorded
    /// size.
    pub fn files_present(&self, dir: &Path) -> bool {
        self.files.iter().all(|f| {
            std::fs::metadata(dir.join(&f.path))
                .map(|m| m.is_file() && m.len() == f.size)
                .unwrap_or(false)
        })
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), CacheError> {
    let entries = std::fs::read_dir(dir).map_err(|e| CacheError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            if rel == Path::new(RECORD_FILE) {
                continue;
            }
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}
