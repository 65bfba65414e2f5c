//! Target addresses of the form `path/to/dir:name`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The identity of a target in the build graph.
///
/// An address is the directory the target was declared in (`spec_path`,
/// relative to the project root and always `/`-separated) plus a name that is
/// unique within that directory. `src/pkg:fast` and `src/pkg` (shorthand for
/// `src/pkg:pkg`) are both valid spellings.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    spec_path: String,
    name: String,
}

/// Error returned when an address string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address '{input}': {reason}")]
pub struct ParseAddressError {
    /// The rejected input.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl Address {
    /// Creates an address from its parts.
    pub fn new(spec_path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            spec_path: spec_path.into().trim_matches('/').replace('\\', "/"),
            name: name.into(),
        }
    }

    /// Parses an address string.
    pub fn parse(s: &str) -> Result<Self, ParseAddressError> {
        s.parse()
    }

    /// Returns the directory part.
    pub fn spec_path(&self) -> &str {
        &self.spec_path
    }

    /// Returns the target name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A flat identifier usable as a file or directory name
    /// (`src/pkg:fast` becomes `src.pkg.fast`).
    pub fn id(&self) -> String {
        if self.spec_path.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.spec_path.replace('/', "."), self.name)
        }
    }
}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseAddressError {
            input: s.to_string(),
            reason,
        };
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(err("address is empty"));
        }
        match trimmed.split_once(':') {
            Some((path, name)) => {
                if name.is_empty() {
                    return Err(err("target name after ':' is empty"));
                }
                if name.contains(':') || name.contains('/') {
                    return Err(err("target name may not contain ':' or '/'"));
                }
                Ok(Address::new(path, name))
            }
            None => {
                let path = trimmed.trim_end_matches('/');
                let name = path.rsplit('/').next().unwrap_or(path);
                if name.is_empty() {
                    return Err(err("cannot infer a target name from the path"));
                }
                Ok(Address::new(path, name))
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.spec_path, self.name)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_form() {
        let a = Address::parse("src/pkg:fast").unwrap();
        assert_eq!(a.spec_path(), "src/pkg");
        assert_eq!(a.name(), "fast");
        assert_eq!(a.to_string(), "src/pkg:fast");
    }

    #[test]
    fn parse_shorthand_uses_last_component() {
        let a = Address::parse("src/pkg").unwrap();
        assert_eq!(a.name(), "pkg");
        assert_eq!(a, Address::parse("src/pkg:pkg").unwrap());
    }

    #[test]
    fn parse_root_target() {
        let a = Address::parse(":app").unwrap();
        assert_eq!(a.spec_path(), "");
        assert_eq!(a.id(), "app");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("src/pkg:").is_err());
        assert!(Address::parse("src:a:b").is_err());
    }

    #[test]
    fn id_is_flat() {
        let a = Address::new("src/pkg/", "fast");
        assert_eq!(a.id(), "src.pkg.fast");
    }

    #[test]
    fn ordering_is_by_path_then_name() {
        let mut v = vec![
            Address::new("b", "x"),
            Address::new("a", "z"),
            Address::new("a", "y"),
        ];
        v.sort();
        let rendered: Vec<_> = v.iter().map(|a| a.to_string()).collect();
        assert_eq!(rendered, vec!["a:y", "a:z", "b:x"]);
    }
}
