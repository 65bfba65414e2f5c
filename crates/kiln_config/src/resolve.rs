//! Resolution of derived settings: task options, worker count, argument lists.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::types::ProjectConfig;

/// Returns the fingerprint-sensitive options for `task` as canonical strings.
///
/// Values are rendered in TOML syntax so that `true` and `"true"` stay
/// distinct. The map is ordered, so equal option sets always compare and hash
/// equal regardless of declaration order.
pub fn resolve_task_options(config: &ProjectConfig, task: &str) -> BTreeMap<String, String> {
    config
        .options
        .get(task)
        .map(|opts| {
            opts.iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Resolves the worker pool size: the configured value, or the available
/// CPU parallelism.
pub fn resolve_jobs(config: &ProjectConfig) -> usize {
    config.build.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

/// Parses `name=value` build arguments into an ordered map.
///
/// Whitespace around names and values is trimmed. An entry without `=` is
/// rejected.
pub fn parse_build_args(args: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut out = BTreeMap::new();
    for arg in args {
        let (name, value) = arg.split_once('=').ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "invalid build arg '{arg}': expected the form name=value"
            ))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "invalid build arg '{arg}': name is empty"
            )));
        }
        out.insert(name.to_string(), value.trim().to_string());
    }
    Ok(out)
}

/// Parses a `NAME` or `NAME=VALUE` preprocessor macro.
pub fn parse_define_macro(spec: &str) -> Result<(String, Option<String>), ConfigError> {
    let (name, value) = match spec.split_once('=') {
        Some((n, v)) => (n.trim(), Some(v.trim().to_string())),
        None => (spec.trim(), None),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::ValidationError(format!(
            "invalid macro '{spec}': name must be a C identifier"
        )));
    }
    Ok((name.to_string(), value))
}
