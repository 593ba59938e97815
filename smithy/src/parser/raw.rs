use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::component::Component;
use crate::error::Error;
use crate::images::ImageReference;

const LOCAL_PREFIX: &str = "file://";
const WORKFLOW_FILE_NAMES: [&str; 2] = ["workflow.yaml", "workflow.yml"];

/// Where a workflow entry's component comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentSource {
    /// Declared in full inside the workflow file.
    Inline(Box<Component>),
    /// `file://<path>` pointing at a component directory or its `component.yaml`.
    Local(PathBuf),
    /// OCI package reference, fetched from the registry.
    Remote(ImageReference),
}

impl ComponentSource {
    fn from_reference(raw: &str) -> Result<Self> {
        if let Some(path) = raw.strip_prefix(LOCAL_PREFIX) {
            if path.is_empty() {
                bail!("local component reference '{raw}' has no path");
            }
            return Ok(Self::Local(PathBuf::from(path)));
        }
        let reference = raw
            .parse()
            .with_context(|| format!("'{raw}' is not a valid remote component reference"))?;
        Ok(Self::Remote(reference))
    }
}

impl<'de> Deserialize<'de> for ComponentSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(raw) => {
                Self::from_reference(&raw).map_err(|e| D::Error::custom(format!("{e:#}")))
            }
            serde_yaml::Value::Mapping(_) => serde_yaml::from_value(value)
                .map(|c| Self::Inline(Box::new(c)))
                .map_err(|e| D::Error::custom(format!("invalid inline component: {e}"))),
            _ => Err(D::Error::custom(
                "component must be a reference string or a component definition",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawComponentRef {
    pub component: ComponentSource,
}

/// The workflow file as written, before any component is resolved.
#[derive(Debug, Deserialize)]
pub struct RawWorkflow {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub components: Vec<RawComponentRef>,
}

pub fn read_workflow_spec(path: &Path) -> Result<RawWorkflow> {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if !WORKFLOW_FILE_NAMES.contains(&file_name) {
        bail!(Error::Validation(format!(
            "invalid file path {}, it has to point to a workflow.yaml or workflow.yml file",
            path.display()
        )));
    }
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to decode workflow file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;

    fn decode(yaml: &str) -> Result<RawWorkflow, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    #[test]
    fn decodes_all_three_reference_forms() {
        let raw = decode(
            r#"
name: mixed
description: one of each
components:
  - component: file://components/scanners/gosec
  - component: ghcr.io/smithy-security/manifests/components/scanners/trufflehog:v1.0.0
  - component:
      name: inline
      type: reporter
      steps:
        - name: report
          image: alpine:3.19
"#,
        )
        .unwrap();

        assert_eq!(raw.name, "mixed");
        assert_eq!(
            raw.components[0].component,
            ComponentSource::Local(PathBuf::from("components/scanners/gosec"))
        );
        match &raw.components[1].component {
            ComponentSource::Remote(r) => {
                assert_eq!(r.registry(), "ghcr.io");
                assert_eq!(r.explicit_tag(), Some("v1.0.0"));
            }
            other => panic!("expected remote, got {other:?}"),
        }
        match &raw.components[2].component {
            ComponentSource::Inline(c) => {
                assert_eq!(c.name, "inline");
                assert_eq!(c.kind, ComponentKind::Reporter);
            }
            other => panic!("expected inline, got {other:?}"),
        }
    }

    #[test]
    fn absolute_local_path_is_kept() {
        let raw = decode("components:\n  - component: file:///opt/components/scanners/gosec/component.yaml\n")
            .unwrap();
        assert_eq!(
            raw.components[0].component,
            ComponentSource::Local(PathBuf::from("/opt/components/scanners/gosec/component.yaml"))
        );
    }

    #[test]
    fn malformed_remote_reference_is_rejected() {
        let err = decode("components:\n  - component: \"Not A Ref\"\n").unwrap_err();
        assert!(err.to_string().contains("not a valid remote component reference"));
    }

    #[test]
    fn scalar_that_is_not_a_string_is_rejected() {
        assert!(decode("components:\n  - component: 42\n").is_err());
    }

    #[test]
    fn extra_keys_next_to_component_are_rejected() {
        let err = decode(
            "components:\n  - component: alpine:3.19\n    remote: ghcr.io/org/x:v1\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn spec_path_must_name_a_workflow_file() {
        let err = read_workflow_spec(Path::new("testdata/scanners/gosec/component.yaml"))
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_))));
    }

    #[test]
    fn missing_spec_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_workflow_spec(&dir.path().join("workflow.yaml")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
