//! Format-dispatched parsing of a package file into a `RawPackage`
//! (§4.2): `.dv`/`.yaml`/`.yml` via `serde_yaml`, `.toml` via the `toml`
//! crate. Both paths converge on the same `RawPackage` so the rest of
//! the loader is encoding-agnostic.

use std::path::Path;

use crate::error::{FlowError, Result};

use super::raw::RawPackage;

pub fn parse_file(path: &Path, contents: &str) -> Result<RawPackage> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "dv" | "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| FlowError::ParseError {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        "toml" => toml::from_str(contents).map_err(|e| FlowError::ParseError {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        other => Err(FlowError::ParseError {
            path: path.display().to_string(),
            reason: format!("unsupported package file extension `.{other}`"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_minimal_yaml_package() {
        let yaml = "package:\n  name: proj\ntasks:\n  build:\n    shell: \"echo hi\"\n";
        let pkg = parse_file(&PathBuf::from("proj.yaml"), yaml).unwrap();
        assert_eq!(pkg.package.name, "proj");
        assert!(pkg.tasks.contains_key("build"));
    }

    #[test]
    fn parses_minimal_toml_package() {
        let toml_src = "[package]\nname = \"proj\"\n\n[tasks.build]\nshell = \"echo hi\"\n";
        let pkg = parse_file(&PathBuf::from("proj.toml"), toml_src).unwrap();
        assert_eq!(pkg.package.name, "proj");
        assert!(pkg.tasks.contains_key("build"));
    }

    #[test]
    fn unknown_field_is_rejected_by_deny_unknown_fields() {
        let yaml = "package:\n  name: proj\nbogus_field: 1\n";
        let result = parse_file(&PathBuf::from("proj.yaml"), yaml);
        assert!(result.is_err());
    }

    #[test]
    fn unsupported_extension_is_an_error() {
        let result = parse_file(&PathBuf::from("proj.json"), "{}");
        assert!(matches!(result, Err(FlowError::ParseError { .. })));
    }
}
