//! The package builder: exploded wheels and `.whl` archives.
//!
//! A wheel unit stages its distribution's files into `<ws>/setup`, generates
//! a `setup.py` from the unit's `provides` and runs `bdist_wheel` keeping the
//! unpacked build directory. That directory, renamed after the wheel, is the
//! artifact. An archive unit zips an exploded wheel into a `.whl` with a
//! fresh `RECORD`, byte-for-byte reproducibly.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use kiln_config::ToolsConfig;
use kiln_graph::Provides;
use sha2::{Digest, Sha256};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::builder::{ArtifactBuilder, BuildOutput};
use crate::error::BuildError;
use crate::setup_py::SetupScript;
use crate::stage::{self, PACKAGE_INIT};
use crate::tool::{Invocation, ToolInvoker};
use crate::unit::{has_extension, BuildUnit, PackageSpec, StagedFile, UnitSpec};

/// Metadata key holding the wheel name (the `.whl` file stem).
pub const WHEEL_NAME: &str = "wheel_name";

/// Extensions never shipped as package data.
pub const C_SOURCE_EXTENSIONS: &[&str] = &["c", "h", "cpp", "hpp", "pyx"];

/// Extensions of files a consumer of an exploded wheel imports.
pub const WHEEL_MODULE_EXTENSIONS: &[&str] = &["py", "pyc", "so", "a"];

const SETUP_DIR: &str = "setup";
const TEMP_DIR: &str = "temp";
const DUMMY_BUILD_DIR: &str = "dummy";

/// Builds [`PackageSpec`] units.
pub struct PackageBuilder {
    python: String,
    invoker: Arc<dyn ToolInvoker>,
}

impl PackageBuilder {
    /// Creates a builder using the configured interpreter.
    pub fn new(tools: &ToolsConfig, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            python: tools.python.clone(),
            invoker,
        }
    }

    fn wheel(
        &self,
        unit: &BuildUnit,
        staged: &[StagedFile],
        using_dummy: bool,
        workspace: &Path,
    ) -> Result<BuildOutput, BuildError> {
        let provides = unit.provides.as_ref().ok_or_else(|| BuildError::Unsupported {
            unit: unit.id.clone(),
            builder: self.name(),
        })?;

        let setup_dir = workspace.join(SETUP_DIR);
        std::fs::create_dir_all(&setup_dir).map_err(|e| BuildError::io(&setup_dir, e))?;
        for file in staged {
            tracing::debug!(unit = %unit.id, file = %file.path.display(), "staging");
            stage::copy_file(&file.source(), &setup_dir.join(&file.path))?;
        }
        let script = wheel_setup_script(&setup_dir, provides)?;
        let script_path = setup_dir.join("setup.py");
        std::fs::write(&script_path, script.render())
            .map_err(|e| BuildError::io(&script_path, e))?;

        let temp = workspace.join(TEMP_DIR);
        std::fs::create_dir_all(&temp).map_err(|e| BuildError::io(&temp, e))?;
        let dist = setup_dir.join("dist");

        let mut invocation = Invocation::new(&unit.id, &self.python, &setup_dir).arg("setup.py");
        if using_dummy {
            invocation = invocation.args(["build_ext", "-b", DUMMY_BUILD_DIR]);
        }
        invocation = invocation
            .arg("bdist_wheel")
            .arg("-b")
            .arg(temp.to_string_lossy())
            .arg("-k")
            .arg("--dist-dir")
            .arg(dist.to_string_lossy());
        self.invoker.invoke(&invocation)?;

        let wheel_file = stage::find_files(&dist, Some(&["whl"]))?
            .into_iter()
            .next()
            .ok_or_else(|| BuildError::MissingOutput {
                unit: unit.id.clone(),
                reason: "bdist_wheel produced no .whl file".to_string(),
            })?;
        let wheel_name = wheel_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let exploded = workspace.join(&wheel_name);
        std::fs::rename(&temp, &exploded).map_err(|e| BuildError::io(&temp, e))?;
        stage::remove_dir(&setup_dir)?;
        tracing::info!(unit = %unit.id, wheel = %wheel_name, "built exploded wheel");
        Ok(BuildOutput::default().with(WHEEL_NAME, wheel_name))
    }

    fn archive(
        &self,
        unit: &BuildUnit,
        wheel_name: &str,
        workspace: &Path,
    ) -> Result<BuildOutput, BuildError> {
        let dest = workspace.join(format!("{wheel_name}.whl"));
        write_wheel_archive(&unit.id, &unit.source_root, &unit.sources, &dest)?;
        Ok(BuildOutput::default().with(WHEEL_NAME, wheel_name))
    }
}

impl ArtifactBuilder for PackageBuilder {
    fn name(&self) -> &'static str {
        "package"
    }

    fn build(&self, unit: &BuildUnit, workspace: &Path) -> Result<BuildOutput, BuildError> {
        match &unit.spec {
            UnitSpec::Package(PackageSpec::Wheel {
                staged,
                using_dummy,
            }) => self.wheel(unit, staged, *using_dummy, workspace),
            UnitSpec::Package(PackageSpec::Archive { wheel_name }) => {
                self.archive(unit, wheel_name, workspace)
            }
            _ => Err(BuildError::Unsupported {
                unit: unit.id.clone(),
                builder: self.name(),
            }),
        }
    }
}

/// The `setup()` call for the files staged under `setup_dir`.
///
/// Packages are the directories holding an `__init__.py`. Every other
/// non-Python file becomes package data of its nearest enclosing package,
/// except C sources.
pub fn wheel_setup_script(setup_dir: &Path, provides: &Provides) -> Result<SetupScript, BuildError> {
    let files = stage::find_files(setup_dir, None)?;
    let package_dirs: BTreeSet<PathBuf> = files
        .iter()
        .filter(|f| f.file_name().is_some_and(|n| n == PACKAGE_INIT))
        .filter_map(|f| f.parent().map(Path::to_path_buf))
        .filter(|d| !d.as_os_str().is_empty())
        .collect();

    let mut package_data: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for file in &files {
        if has_extension(file, &["py"]) || has_extension(file, C_SOURCE_EXTENSIONS) {
            continue;
        }
        let owner = file.ancestors().skip(1).find(|a| package_dirs.contains(*a));
        if let Some(owner) = owner {
            if let Ok(rel) = file.strip_prefix(owner) {
                package_data
                    .entry(dotted(owner))
                    .or_default()
                    .push(stage::portable(rel));
            }
        }
    }

    Ok(SetupScript {
        name: Some(provides.name.clone()),
        version: Some(provides.version.clone()),
        packages: package_dirs.iter().map(|d| dotted(d)).collect(),
        package_data,
        ext_modules: provides.ext_modules.clone(),
    })
}

fn dotted(dir: &Path) -> String {
    stage::portable(dir).replace('/', ".")
}

/// Zips `files` (relative to `root`) into the wheel archive `dest`.
///
/// Entries are sorted with the `.dist-info` directory last and a freshly
/// computed `RECORD` as the final entry. Timestamps and permissions are
/// fixed, so equal inputs give byte-identical archives.
pub fn write_wheel_archive(
    unit: &str,
    root: &Path,
    files: &[PathBuf],
    dest: &Path,
) -> Result<(), BuildError> {
    let mut names: Vec<String> = files.iter().map(|f| stage::portable(f)).collect();
    let dist_info = names
        .iter()
        .filter_map(|n| n.split('/').next())
        .find(|top| top.ends_with(".dist-info"))
        .map(str::to_string)
        .ok_or_else(|| BuildError::MissingOutput {
            unit: unit.to_string(),
            reason: format!("no .dist-info directory in {}", root.display()),
        })?;
    let record_name = format!("{dist_info}/RECORD");
    names.retain(|n| *n != record_name);
    names.sort_by_key(|n| (n.starts_with(&format!("{dist_info}/")), n.clone()));
    names.dedup();

    let out = std::fs::File::create(dest).map_err(|e| BuildError::io(dest, e))?;
    let mut zip = ZipWriter::new(out);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let zip_err = |e: zip::result::ZipError| BuildError::io(dest, std::io::Error::other(e));

    let mut record = String::new();
    for name in &names {
        let path = root.join(name);
        let content = std::fs::read(&path).map_err(|e| BuildError::io(&path, e))?;
        let digest = Sha256::digest(&content);
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        record.push_str(&format!("{name},sha256={encoded},{}\n", content.len()));
        zip.start_file(name.as_str(), options).map_err(zip_err)?;
        zip.write_all(&content).map_err(|e| BuildError::io(dest, e))?;
    }
    record.push_str(&format!("{record_name},,\n"));
    zip.start_file(record_name.as_str(), options)
        .map_err(zip_err)?;
    zip.write_all(record.as_bytes())
        .map_err(|e| BuildError::io(dest, e))?;
    zip.finish().map_err(zip_err)?;
    Ok(())
}

/// Copies `<wheel_name>.whl` from a results directory into `dist_dir`.
pub fn publish_wheel(
    results_dir: &Path,
    wheel_name: &str,
    dist_dir: &Path,
) -> Result<PathBuf, BuildError> {
    let file = format!("{wheel_name}.whl");
    let dest = dist_dir.join(&file);
    stage::copy_file(&results_dir.join(&file), &dest)?;
    tracing::info!(wheel = %dest.display(), "published wheel");
    Ok(dest)
}
