//! Graph node payloads.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use kiln_common::{Address, ContentHash, ContentHasher};
use petgraph::stable_graph::NodeIndex;

/// Opaque, copyable handle to a node in a [`BuildGraph`](crate::BuildGraph).
///
/// Handles stay valid while other nodes are added or removed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) NodeIndex);

impl NodeId {
    /// Returns the raw index.
    pub fn as_raw(self) -> u32 {
        self.0.index() as u32
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0.index())
    }
}

/// Where a node came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOrigin {
    /// Declared by the user.
    Original,
    /// Generated from the output of building `original`.
    ///
    /// `original` is the node the build unit was created from, which may
    /// itself be derived; [`resolve_original`](crate::resolve_original) walks
    /// the chain to the declared root.
    Derived {
        /// The node this one was produced from.
        original: NodeId,
    },
}

/// One native extension module inside a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtModule {
    /// Dotted module name.
    pub name: String,
    /// Sources, relative to the owning node's source root.
    pub sources: Vec<String>,
    /// Include directories, relative to the owning node's source root.
    pub include_dirs: Vec<String>,
    /// `(NAME, VALUE)` preprocessor macros.
    pub define_macros: Vec<(String, Option<String>)>,
    /// Link libraries.
    pub libraries: Vec<String>,
    /// Extra compiler flags.
    pub extra_compile_args: Vec<String>,
}

impl ExtModule {
    /// An extension with only a name, every other field empty.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            include_dirs: Vec::new(),
            define_macros: Vec::new(),
            libraries: Vec::new(),
            extra_compile_args: Vec::new(),
        }
    }

    /// Feeds every field into `hasher` in a fixed order.
    pub fn hash_into(&self, hasher: &mut ContentHasher) {
        hasher.write_str(&self.name);
        for list in [
            &self.sources,
            &self.include_dirs,
            &self.libraries,
            &self.extra_compile_args,
        ] {
            hasher.write_u64(list.len() as u64);
            for item in list {
                hasher.write_str(item);
            }
        }
        hasher.write_u64(self.define_macros.len() as u64);
        for (name, value) in &self.define_macros {
            hasher.write_str(name);
            hasher.write_str(value.as_deref().unwrap_or(""));
            hasher.write_bool(value.is_some());
        }
    }
}

/// Distribution identity of a target (its `setup.py` keywords).
///
/// A derived node publishing the same distribution as its original replaces
/// it in the exported view; see
/// [`exported_targets`](crate::exported_targets).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Provides {
    /// Distribution name.
    pub name: String,
    /// Distribution version.
    pub version: String,
    /// Extension modules to build while packaging.
    pub ext_modules: Vec<ExtModule>,
    /// Set when `ext_modules` holds a placeholder that exists only to make
    /// the distribution platform-specific.
    pub synthetic_marker: bool,
}

impl Provides {
    /// Creates a provides block without extensions.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ext_modules: Vec::new(),
            synthetic_marker: false,
        }
    }

    /// Returns a copy whose extension list is replaced.
    pub fn with_ext_modules(&self, ext_modules: Vec<ExtModule>) -> Self {
        Self {
            ext_modules,
            ..self.clone()
        }
    }

    /// Returns a copy carrying a single empty placeholder extension named
    /// `name` and the synthetic marker.
    pub fn with_placeholder_extension(&self, name: &str) -> Self {
        Self {
            ext_modules: vec![ExtModule::named(name)],
            synthetic_marker: true,
            ..self.clone()
        }
    }

    /// Returns `true` if both publish the same distribution (name and
    /// version), whatever their extension lists.
    pub fn same_distribution(&self, other: &Provides) -> bool {
        self.name == other.name && self.version == other.version
    }

    /// The `.dist-info` directory name of the distribution.
    pub fn dist_info_dir(&self) -> String {
        format!("{}-{}.dist-info", self.name.replace('-', "_"), self.version)
    }

    /// Feeds every field into `hasher` in a fixed order.
    pub fn hash_into(&self, hasher: &mut ContentHasher) {
        hasher.write_str(&self.name);
        hasher.write_str(&self.version);
        hasher.write_bool(self.synthetic_marker);
        hasher.write_u64(self.ext_modules.len() as u64);
        for ext in &self.ext_modules {
            ext.hash_into(hasher);
        }
    }
}

/// A target in the build graph.
#[derive(Debug, Clone)]
pub struct TargetNode {
    /// Unique address.
    pub address: Address,
    /// Kind label (`cython_library`, `wheel_library`, ...).
    pub kind: String,
    /// Declared or derived.
    pub origin: NodeOrigin,
    /// Directory `sources` are relative to.
    pub source_root: PathBuf,
    /// Source files, relative to `source_root`.
    pub sources: Vec<PathBuf>,
    /// Distribution identity, if any.
    pub provides: Option<Provides>,
    /// Free-form tags.
    pub tags: BTreeSet<String>,
    /// Hash of the node's own payload (source contents and attributes),
    /// supplied by whoever creates the node.
    pub payload_hash: ContentHash,
}

impl TargetNode {
    /// Creates a declared node with no sources.
    pub fn original(address: Address, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        let payload_hash = ContentHasher::new()
            .write_str(&address.to_string())
            .write_str(&kind)
            .finish();
        Self {
            address,
            kind,
            origin: NodeOrigin::Original,
            source_root: PathBuf::new(),
            sources: Vec::new(),
            provides: None,
            tags: BTreeSet::new(),
            payload_hash,
        }
    }

    /// Sets the sources and their root.
    pub fn with_sources(mut self, source_root: impl Into<PathBuf>, sources: Vec<PathBuf>) -> Self {
        self.source_root = source_root.into();
        self.sources = sources;
        self
    }

    /// Sets the distribution identity.
    pub fn with_provides(mut self, provides: Provides) -> Self {
        self.provides = Some(provides);
        self
    }

    /// Sets the payload hash.
    pub fn with_payload_hash(mut self, payload_hash: ContentHash) -> Self {
        self.payload_hash = payload_hash;
        self
    }

    /// Returns `true` for nodes created from build output.
    pub fn is_derived(&self) -> bool {
        matches!(self.origin, NodeOrigin::Derived { .. })
    }

    /// Absolute (or root-relative) paths of every source.
    pub fn source_paths(&self) -> Vec<PathBuf> {
        self.sources
            .iter()
            .map(|s| self.source_root.join(s))
            .collect()
    }
}
