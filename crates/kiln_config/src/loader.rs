//! Configuration file loading and validation.

use std::collections::BTreeMap;
use std::path::Path;

use kiln_common::Address;

use crate::error::ConfigError;
use crate::resolve::{parse_build_args, parse_define_macro};
use crate::types::{ProjectConfig, TargetConfig};

/// Name of the configuration file at the project root.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Loads and validates a `kiln.toml` configuration from a project directory.
pub fn load_config(project_dir: &Path) -> Result<ProjectConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE);
    let content = std::fs::read_to_string(&config_path)?;
    load_config_from_str(&content)
}

/// Parses and validates a `kiln.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<ProjectConfig, ConfigError> {
    let config: ProjectConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates required fields and cross-target consistency.
fn validate_config(config: &ProjectConfig) -> Result<(), ConfigError> {
    if config.project.name.is_empty() {
        return Err(ConfigError::MissingField("project.name".to_string()));
    }
    if config.build.jobs == Some(0) {
        return Err(ConfigError::ValidationError(
            "build.jobs must be at least 1".to_string(),
        ));
    }

    let mut known = BTreeMap::new();
    for raw in config.targets.keys() {
        let address = Address::parse(raw).map_err(|e| ConfigError::InvalidTarget {
            address: raw.clone(),
            reason: e.reason.to_string(),
        })?;
        if let Some(previous) = known.insert(address, raw) {
            return Err(ConfigError::InvalidTarget {
                address: raw.clone(),
                reason: format!("same address as '{previous}'"),
            });
        }
    }

    for (raw, target) in &config.targets {
        for dep in target.dependencies() {
            let dep_address = Address::parse(dep).map_err(|e| ConfigError::InvalidTarget {
                address: raw.clone(),
                reason: format!("dependency {e}"),
            })?;
            if !known.contains_key(&dep_address) {
                return Err(ConfigError::UnknownTarget(dep.clone()));
            }
        }
        validate_target(raw, target)?;
    }
    Ok(())
}

fn validate_target(raw: &str, target: &TargetConfig) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidTarget {
        address: raw.to_string(),
        reason,
    };
    match target {
        TargetConfig::WheelLibrary(lib) if lib.provides.is_none() => Err(invalid(
            "a wheel_library must declare a 'provides' block".to_string(),
        )),
        TargetConfig::ExtensionModule(ext) => {
            for m in &ext.define_macros {
                parse_define_macro(m).map_err(|e| invalid(e.to_string()))?;
            }
            Ok(())
        }
        TargetConfig::DockerImage(image) => {
            let file_name = Path::new(&image.source)
                .file_name()
                .and_then(|n| n.to_str());
            if file_name != Some("Dockerfile") {
                return Err(invalid(
                    "'source' must specify a path to a Dockerfile".to_string(),
                ));
            }
            parse_build_args(&image.build_args).map_err(|e| invalid(e.to_string()))?;
            Ok(())
        }
        _ => Ok(()),
    }
}
