//! Build unit fingerprints.
//!
//! A fingerprint is an XXH3-128 digest over, in order: the store salt, the
//! unit id and kind, every option (sorted by name), every source (sorted by
//! relative path, as path plus content hash), every unit dependency (sorted,
//! as id plus fingerprint) and every external input (sorted by name).
//! Nothing order-dependent or machine-dependent enters the digest, so equal
//! units fingerprint equally across runs and machines.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use kiln_common::{ContentHash, ContentHasher};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CacheError;

/// Content-derived identity of a build unit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(ContentHash);

impl Fingerprint {
    /// Wraps a raw hash.
    pub fn from_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    /// Parses the hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        ContentHash::from_hex(s).map(Self)
    }

    /// The underlying hash.
    pub fn hash(&self) -> ContentHash {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.to_string();
        write!(f, "Fingerprint({})", &hex[..8])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint '{s}'")))
    }
}

/// Everything that determines one unit's fingerprint.
#[derive(Debug, Clone, Default)]
pub struct FingerprintInput {
    /// Unit identity, unique within one call to
    /// [`FingerprintStore::fingerprint_all`].
    pub id: String,
    /// Builder kind (`cythonize`, `wheel`, ...).
    pub kind: String,
    /// Directory `sources` are relative to.
    pub source_root: PathBuf,
    /// Source files relative to `source_root`. Order does not matter.
    pub sources: Vec<PathBuf>,
    /// Fingerprint-sensitive options.
    pub options: BTreeMap<String, String>,
    /// Ids of other units in the same batch this unit depends on.
    pub dependencies: Vec<String>,
    /// Hashes of inputs that are not units (for example the invalidation
    /// hash of a plain library the unit consumes).
    pub external: BTreeMap<String, ContentHash>,
}

/// Computes fingerprints for batches of build units.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    salt: String,
}

impl FingerprintStore {
    /// Creates a store whose fingerprints are additionally keyed by `salt`
    /// (typically the tool version, so upgrades invalidate old results).
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Fingerprints every input, resolving unit dependencies within the
    /// batch.
    ///
    /// A unit that cannot be fingerprinted gets an error entry; this never
    /// falls back to a fingerprint computed from partial content. Units that
    /// depend on a failed unit fail with
    /// [`CacheError::UpstreamUnavailable`]. If two inputs share an id, the
    /// first wins.
    pub fn fingerprint_all(
        &self,
        inputs: &[FingerprintInput],
    ) -> BTreeMap<String, Result<Fingerprint, CacheError>> {
        let mut by_id: HashMap<&str, &FingerprintInput> = HashMap::with_capacity(inputs.len());
        for input in inputs {
            by_id.entry(input.id.as_str()).or_insert(input);
        }

        let mut walk = Walk {
            store: self,
            by_id: &by_id,
            visiting: BTreeSet::new(),
            results: BTreeMap::new(),
        };
        for input in inputs {
            walk.visit(&input.id);
        }
        walk.results
    }

    /// Fingerprints a single unit whose unit dependencies are already
    /// fingerprinted.
    pub fn fingerprint(
        &self,
        input: &FingerprintInput,
        dependencies: &BTreeMap<String, Fingerprint>,
    ) -> Result<Fingerprint, CacheError> {
        let mut hasher = ContentHasher::new();
        hasher
            .write_str("kiln-fingerprint")
            .write_str(&self.salt)
            .write_str(&input.id)
            .write_str(&input.kind);

        hasher.write_u64(input.options.len() as u64);
        for (name, value) in &input.options {
            hasher.write_str(name).write_str(value);
        }

        let mut sources: Vec<&PathBuf> = input.sources.iter().collect();
        sources.sort();
        sources.dedup();
        hasher.write_u64(sources.len() as u64);
        for rel in sources {
            let hash = hash_source(&input.id, &input.source_root.join(rel))?;
            hasher.write_str(&portable(rel)).write_hash(&hash);
        }

        hasher.write_u64(dependencies.len() as u64);
        for (id, fingerprint) in dependencies {
            hasher.write_str(id).write_hash(&fingerprint.0);
        }

        hasher.write_u64(input.external.len() as u64);
        for (name, hash) in &input.external {
            hasher.write_str(name).write_hash(hash);
        }

        Ok(Fingerprint(hasher.finish()))
    }
}

/// Depth-first fingerprinting state for one batch.
struct Walk<'a> {
    store: &'a FingerprintStore,
    by_id: &'a HashMap<&'a str, &'a FingerprintInput>,
    visiting: BTreeSet<String>,
    results: BTreeMap<String, Result<Fingerprint, CacheError>>,
}

impl Walk<'_> {
    fn visit(&mut self, id: &str) {
        if self.results.contains_key(id) {
            return;
        }
        let by_id = self.by_id;
        let Some(input) = by_id.get(id).copied() else {
            return;
        };
        self.visiting.insert(id.to_string());
        let result = self.compute(input);
        self.visiting.remove(id);
        self.results.insert(id.to_string(), result);
    }

    fn compute(&mut self, input: &FingerprintInput) -> Result<Fingerprint, CacheError> {
        let deps: BTreeSet<&str> = input.dependencies.iter().map(String::as_str).collect();
        let mut resolved = BTreeMap::new();
        for dep in deps {
            if !self.by_id.contains_key(dep) {
                return Err(CacheError::UnknownDependency {
                    unit: input.id.clone(),
                    dependency: dep.to_string(),
                });
            }
            if self.visiting.contains(dep) {
                return Err(CacheError::DependencyCycle {
                    unit: input.id.clone(),
                });
            }
            self.visit(dep);
            match self.results.get(dep) {
                Some(Ok(fp)) => {
                    resolved.insert(dep.to_string(), *fp);
                }
                _ => {
                    return Err(CacheError::UpstreamUnavailable {
                        unit: input.id.clone(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }
        self.store.fingerprint(input, &resolved)
    }
}

fn hash_source(unit: &str, path: &Path) -> Result<ContentHash, CacheError> {
    match std::fs::read(path) {
        Ok(content) => Ok(ContentHash::from_bytes(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CacheError::MissingSource {
            unit: unit.to_string(),
            path: path.to_path_buf(),
        }),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// `/`-separated form of a relative path.
fn portable(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
