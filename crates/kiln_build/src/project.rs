//! A loaded project: configuration plus the graph of declared targets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::{Address, ContentHash, ContentHasher};
use kiln_config::{
    load_config, parse_define_macro, ConfigError, ProjectConfig, ProvidesConfig, TargetConfig,
};
use kiln_graph::{
    resolve_original, BuildGraph, ExtModule, GraftOutcome, GraftRequest, GraphError, GraphSplicer,
    NodeId, Provides, TargetNode,
};

use crate::error::BuildError;
use crate::setup_py::EXTRA_COMPILE_ARGS;

/// A project rooted at a directory holding `kiln.toml`.
#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    config: ProjectConfig,
    graph: BuildGraph,
    splicer: GraphSplicer,
    declared: BTreeMap<Address, String>,
}

impl Project {
    /// Loads `kiln.toml` from `root` and builds the target graph.
    pub fn load(root: &Path) -> Result<Self, BuildError> {
        let config = load_config(root)?;
        Self::from_config(root, config)
    }

    /// Builds the target graph for an already loaded configuration.
    ///
    /// Every declared target becomes a target root.
    pub fn from_config(root: &Path, config: ProjectConfig) -> Result<Self, BuildError> {
        let mut graph = BuildGraph::new();
        let mut declared = BTreeMap::new();
        let mut ids: BTreeMap<Address, NodeId> = BTreeMap::new();

        for (raw, target) in &config.targets {
            let address = parse_address(raw, raw)?;
            let node = declared_node(root, raw, &address, target)?;
            let id = graph.add_target(node)?;
            graph.add_target_root(id)?;
            ids.insert(address.clone(), id);
            declared.insert(address, raw.clone());
        }

        for (raw, target) in &config.targets {
            let address = parse_address(raw, raw)?;
            let Some(&id) = ids.get(&address) else {
                continue;
            };
            for dep in target.dependencies() {
                let dep_address = parse_address(raw, dep)?;
                let dep_id = ids
                    .get(&dep_address)
                    .copied()
                    .ok_or_else(|| ConfigError::UnknownTarget(dep.clone()))?;
                graph.inject_dependency(id, dep_id)?;
            }
        }
        tracing::debug!(targets = graph.len(), "loaded target graph");

        Ok(Self {
            root: root.to_path_buf(),
            config,
            graph,
            splicer: GraphSplicer::new(),
            declared,
        })
    }

    /// The project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The configuration.
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// The target graph.
    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    /// The target graph, for grafting.
    pub fn graph_mut(&mut self) -> &mut BuildGraph {
        &mut self.graph
    }

    /// Starts a pass, dropping nodes grafted by the previous one.
    pub fn begin_pass(&mut self) {
        self.splicer.begin_pass(&mut self.graph);
    }

    /// Grafts a unit's committed results onto the node it was built from.
    pub fn graft(&mut self, request: GraftRequest) -> Result<GraftOutcome, GraphError> {
        self.splicer.mark_built(&request.original);
        self.splicer.graft(&mut self.graph, request)
    }

    /// The declaration of a user-declared target.
    pub fn target(&self, address: &Address) -> Option<&TargetConfig> {
        let raw = self.declared.get(address)?;
        self.config.targets.get(raw)
    }

    /// The declaration behind `node`, following derived nodes back to the
    /// target they were derived from.
    pub fn target_of(&self, node: NodeId) -> Option<&TargetConfig> {
        let original = resolve_original(&self.graph, node);
        let address = &self.graph.node(original)?.address;
        self.target(address)
    }

    /// The cache root.
    pub fn cache_root(&self) -> PathBuf {
        self.root.join(&self.config.cache.root)
    }

    /// Where packaged distributions are published.
    pub fn dist_dir(&self) -> PathBuf {
        self.root.join(&self.config.build.dist_dir)
    }
}

fn parse_address(owner: &str, raw: &str) -> Result<Address, ConfigError> {
    Address::parse(raw).map_err(|e| ConfigError::InvalidTarget {
        address: owner.to_string(),
        reason: e.to_string(),
    })
}

fn declared_node(
    root: &Path,
    raw: &str,
    address: &Address,
    target: &TargetConfig,
) -> Result<TargetNode, ConfigError> {
    let base = target
        .library()
        .and_then(|lib| lib.base.clone())
        .unwrap_or_else(|| address.spec_path().to_string());
    let source_root = root.join(&base);

    let mut sources = Vec::new();
    for source in target.sources() {
        let rel = root
            .join(&source)
            .strip_prefix(&source_root)
            .map(Path::to_path_buf)
            .map_err(|_| ConfigError::InvalidTarget {
                address: raw.to_string(),
                reason: format!("source '{source}' is outside of base '{base}'"),
            })?;
        sources.push(rel);
    }
    sources.sort();
    sources.dedup();

    let provides = match target.library().and_then(|lib| lib.provides.as_ref()) {
        Some(p) => Some(provides_from_config(p).map_err(|e| ConfigError::InvalidTarget {
            address: raw.to_string(),
            reason: e.to_string(),
        })?),
        None => None,
    };

    let payload_hash = payload_hash(raw, target, &source_root, &sources)?;
    let mut node = TargetNode::original(address.clone(), target.kind_name())
        .with_sources(source_root, sources)
        .with_payload_hash(payload_hash);
    if let Some(provides) = provides {
        node = node.with_provides(provides);
    }
    if let Some(lib) = target.library() {
        node.tags = lib.tags.iter().cloned().collect();
    }
    Ok(node)
}

/// Content of the declaration plus the content of every source. The
/// declaration is hashed in its JSON form. A missing source hashes as absent
/// here; fingerprinting reports it.
fn payload_hash(
    raw: &str,
    target: &TargetConfig,
    source_root: &Path,
    sources: &[PathBuf],
) -> Result<ContentHash, ConfigError> {
    let declaration = serde_json::to_vec(target).map_err(|e| ConfigError::InvalidTarget {
        address: raw.to_string(),
        reason: format!("cannot serialize declaration: {e}"),
    })?;
    let mut hasher = ContentHasher::new();
    hasher
        .write_str(target.kind_name())
        .write_bytes(&declaration)
        .write_u64(sources.len() as u64);
    for rel in sources {
        hasher.write_str(&rel.to_string_lossy());
        match std::fs::read(source_root.join(rel)) {
            Ok(content) => hasher.write_bool(true).write_hash(&ContentHash::from_bytes(&content)),
            Err(_) => hasher.write_bool(false),
        };
    }
    Ok(hasher.finish())
}

/// Converts a `provides` block.
pub fn provides_from_config(config: &ProvidesConfig) -> Result<Provides, ConfigError> {
    let mut ext_modules = Vec::with_capacity(config.ext_modules.len());
    for module in &config.ext_modules {
        let mut ext = ExtModule::named(module.name.clone());
        ext.sources = module.sources.clone();
        ext.include_dirs = module.include_dirs.clone();
        ext.define_macros = module
            .define_macros
            .iter()
            .map(|m| parse_define_macro(m))
            .collect::<Result<_, _>>()?;
        ext.libraries = module.libraries.clone();
        ext.extra_compile_args = EXTRA_COMPILE_ARGS.iter().map(|s| s.to_string()).collect();
        ext_modules.push(ext);
    }
    Ok(Provides::new(config.name.clone(), config.version.clone()).with_ext_modules(ext_modules))
}
