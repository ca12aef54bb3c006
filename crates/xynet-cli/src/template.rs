//! Template loading from JSON or TOML files

use std::path::Path;

use anyhow::Context;
use xynet_ir::EquationSet;

use crate::error::{CliError, CliResult};

/// Load a template, choosing the format by file extension
pub fn load_template(path: &Path) -> CliResult<EquationSet> {
    if !path.exists() {
        return Err(CliError::missing_resource(format!("template {}", path.display())));
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    parse_template(&text, extension).map_err(|e| match e {
        CliError::Template(reason) => CliError::template(format!("{}: {}", path.display(), reason)),
        other => other,
    })
}

/// Parse template text in the format named by `extension` (`json` or `toml`)
pub fn parse_template(text: &str, extension: &str) -> CliResult<EquationSet> {
    match extension.to_ascii_lowercase().as_str() {
        "json" => serde_json::from_str(text).map_err(|e| CliError::template(e.to_string())),
        "toml" => toml::from_str(text).map_err(|e| CliError::template(e.to_string())),
        other => Err(CliError::invalid_args(format!(
            "unsupported template format '{}', expected .json or .toml",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xynet_ir::Expr;

    #[test]
    fn parses_toml_templates() {
        let text = r#"
            name = "model"

            [[parts]]
            name = "cells"

            [[parts.variables]]
            name = "$n"
            equations = [ { expression = { num = 3.0 } } ]

            [[parts.variables]]
            name = "V"
            order = 1
            equations = [
                { expression = { unary = ["neg", { var = "V" }] } },
                { expression = { num = -65.0 }, initial = true },
            ]
        "#;
        let t = parse_template(text, "toml").unwrap();
        let cells = &t.parts[0];
        assert_eq!(cells.variables[1].order, 1);
        assert_eq!(cells.variables[1].equations[0].expression, -Expr::var("V"));
        assert!(cells.variables[1].equations[1].initial);
    }

    #[test]
    fn rejects_unknown_formats() {
        assert!(matches!(parse_template("", "yaml"), Err(CliError::InvalidArgs(_))));
        assert!(matches!(parse_template("{", "json"), Err(CliError::Template(_))));
    }

    #[test]
    fn missing_files() {
        let err = load_template(Path::new("/nonexistent/model.json")).unwrap_err();
        assert!(matches!(err, CliError::MissingResource(_)));
    }
}
