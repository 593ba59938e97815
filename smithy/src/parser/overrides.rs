use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::component::Parameter;

/// Component name to parameter name to replacement parameter.
pub type Overrides = BTreeMap<String, BTreeMap<String, Parameter>>;

/// Reads an overrides file of the form `<component>: [{name, type, value}, ...]`.
pub fn read_overrides(path: &Path) -> Result<Overrides> {
    if !path.exists() {
        anyhow::bail!("{} does not exist", path.display());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read overrides file {}", path.display()))?;
    parse_overrides(&contents)
        .with_context(|| format!("invalid overrides file {}", path.display()))
}

pub fn parse_overrides(contents: &str) -> Result<Overrides> {
    if contents.trim().is_empty() {
        return Ok(Overrides::new());
    }
    let raw: Option<BTreeMap<String, Vec<Parameter>>> =
        serde_yaml::from_str(contents).context("failed to decode overrides")?;

    let mut overrides = Overrides::new();
    for (component, params) in raw.unwrap_or_default() {
        let entry = overrides.entry(component.clone()).or_default();
        for param in params {
            param.validate().with_context(|| {
                format!("invalid override parameter for component '{component}'")
            })?;
            entry.insert(param.name.clone(), param);
        }
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ParameterType, ParameterValue};

    #[test]
    fn groups_by_component_and_parameter() {
        let overrides = parse_overrides(
            r#"
gosec:
  - name: flags
    type: string
    value: "-exclude-dir=test"
trufflehog:
  - name: paths
    type: list:string
    value: ["src", "lib"]
"#,
        )
        .unwrap();

        assert_eq!(
            overrides["gosec"]["flags"].value,
            Some(ParameterValue::String("-exclude-dir=test".into()))
        );
        assert_eq!(overrides["trufflehog"]["paths"].kind, ParameterType::ListString);
    }

    #[test]
    fn invalid_override_fails() {
        let err = parse_overrides(
            "gosec:\n  - name: flags\n    type: list:string\n    value: not-a-list\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("gosec"));
    }

    #[test]
    fn empty_file_means_no_overrides() {
        assert!(parse_overrides("").unwrap().is_empty());
    }
}
