//! Generated `setup.py` scripts.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use kiln_graph::ExtModule;

/// Compiler flags every extension is built with.
pub const EXTRA_COMPILE_ARGS: &[&str] = &["-Os"];

/// A `setup()` call to render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupScript {
    /// Distribution name.
    pub name: Option<String>,
    /// Distribution version.
    pub version: Option<String>,
    /// Dotted package names.
    pub packages: Vec<String>,
    /// Non-code files per package, relative to the package directory.
    pub package_data: BTreeMap<String, Vec<String>>,
    /// Extension modules.
    pub ext_modules: Vec<ExtModule>,
}

impl SetupScript {
    /// Renders the script. Output is byte-identical for equal scripts.
    pub fn render(&self) -> String {
        let mut out = String::from("from setuptools import Extension, setup\n\nsetup(\n");
        if let Some(name) = &self.name {
            let _ = writeln!(out, "    name={},", py_str(name));
        }
        if let Some(version) = &self.version {
            let _ = writeln!(out, "    version={},", py_str(version));
        }
        if !self.packages.is_empty() {
            let _ = writeln!(out, "    packages={},", py_list(&self.packages));
        }
        if !self.package_data.is_empty() {
            out.push_str("    package_data={\n");
            for (package, files) in &self.package_data {
                let _ = writeln!(out, "        {}: {},", py_str(package), py_list(files));
            }
            out.push_str("    },\n");
        }
        if !self.ext_modules.is_empty() {
            out.push_str("    ext_modules=[\n");
            for ext in &self.ext_modules {
                render_extension(&mut out, ext);
            }
            out.push_str("    ],\n");
        }
        out.push_str(")\n");
        out
    }
}

fn render_extension(out: &mut String, ext: &ExtModule) {
    let _ = writeln!(out, "        Extension(");
    let _ = writeln!(out, "            {},", py_str(&ext.name));
    let _ = writeln!(out, "            sources={},", py_list(&ext.sources));
    if !ext.include_dirs.is_empty() {
        let _ = writeln!(out, "            include_dirs={},", py_list(&ext.include_dirs));
    }
    if !ext.define_macros.is_empty() {
        let macros: Vec<String> = ext
            .define_macros
            .iter()
            .map(|(name, value)| {
                let value = value.as_deref().map_or_else(|| "None".to_string(), py_str);
                format!("({}, {value})", py_str(name))
            })
            .collect();
        let _ = writeln!(out, "            define_macros=[{}],", macros.join(", "));
    }
    if !ext.libraries.is_empty() {
        let _ = writeln!(out, "            libraries={},", py_list(&ext.libraries));
    }
    if !ext.extra_compile_args.is_empty() {
        let _ = writeln!(
            out,
            "            extra_compile_args={},",
            py_list(&ext.extra_compile_args)
        );
    }
    let _ = writeln!(out, "        ),");
}

/// A Python string literal.
pub fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn py_list(items: &[String]) -> String {
    let items: Vec<String> = items.iter().map(|s| py_str(s)).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_escaped() {
        assert_eq!(py_str(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(py_str("x\ny"), r#""x\ny""#);
    }

    #[test]
    fn extension_script() {
        let mut ext = ExtModule::named("pkg.fast");
        ext.sources = vec!["pkg/fast.c".to_string()];
        ext.include_dirs = vec!["pkg".to_string()];
        ext.define_macros = vec![
            ("NDEBUG".to_string(), None),
            ("LEVEL".to_string(), Some("2".to_string())),
        ];
        ext.extra_compile_args = vec!["-Os".to_string()];
        let script = SetupScript {
            ext_modules: vec![ext],
            ..SetupScript::default()
        };
        let rendered = script.render();
        assert!(rendered.starts_with("from setuptools import Extension, setup\n"));
        assert!(rendered.contains(r#"            "pkg.fast","#));
        assert!(rendered.contains(r#"sources=["pkg/fast.c"]"#));
        assert!(rendered.contains(r#"define_macros=[("NDEBUG", None), ("LEVEL", "2")]"#));
        assert!(rendered.contains(r#"extra_compile_args=["-Os"]"#));
        assert!(!rendered.contains("libraries="));
        assert!(!rendered.contains("name="));
    }

    #[test]
    fn distribution_script() {
        let mut package_data = BTreeMap::new();
        package_data.insert("pkg".to_string(), vec!["data/table.csv".to_string()]);
        let script = SetupScript {
            name: Some("demo-pkg".to_string()),
            version: Some("1.0".to_string()),
            packages: vec!["pkg".to_string(), "pkg.sub".to_string()],
            package_data,
            ext_modules: vec![ExtModule::named("pkg")],
        };
        let rendered = script.render();
        assert!(rendered.contains(r#"    name="demo-pkg","#));
        assert!(rendered.contains(r#"    packages=["pkg", "pkg.sub"],"#));
        assert!(rendered.contains(r#"        "pkg": ["data/table.csv"],"#));
        assert!(rendered.contains("sources=[],"));
        assert_eq!(rendered, script.clone().render());
    }
}
