use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The closed set of component kinds. Declaration order is the stage order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Target,
    Scanner,
    Enricher,
    Filter,
    Reporter,
    #[default]
    Unknown,
}

impl ComponentKind {
    /// Kinds that can be scheduled, in execution order.
    pub const ORDERED: [ComponentKind; 5] = [
        ComponentKind::Target,
        ComponentKind::Scanner,
        ComponentKind::Enricher,
        ComponentKind::Filter,
        ComponentKind::Reporter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Target => "target",
            Self::Scanner => "scanner",
            Self::Enricher => "enricher",
            Self::Filter => "filter",
            Self::Reporter => "reporter",
            Self::Unknown => "unknown",
        }
    }

    /// Directory name used for components of this kind, e.g. `scanners`.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Target => "targets",
            Self::Scanner => "scanners",
            Self::Enricher => "enrichers",
            Self::Filter => "filters",
            Self::Reporter => "reporters",
            Self::Unknown => "unknowns",
        }
    }

    /// Inverse of [`ComponentKind::plural`] for schedulable kinds.
    pub fn from_plural(s: &str) -> Option<Self> {
        Self::ORDERED.into_iter().find(|k| k.plural() == s)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "target" => Ok(Self::Target),
            "scanner" => Ok(Self::Scanner),
            "enricher" => Ok(Self::Enricher),
            "filter" => Ok(Self::Filter),
            "reporter" => Ok(Self::Reporter),
            "unknown" => Ok(Self::Unknown),
            other => bail!("unknown component type: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "const:string")]
    ConstString,
    #[serde(rename = "list:string")]
    ListString,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::ConstString => f.write_str("const:string"),
            Self::ListString => f.write_str("list:string"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    String(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub value: Option<ParameterValue>,
}

impl Parameter {
    /// Checks the value shape against the declared type. A missing value is valid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!(Error::Validation("parameter name must not be empty".into()));
        }
        let matches = match (&self.kind, &self.value) {
            (_, None) => true,
            (ParameterType::String | ParameterType::ConstString, Some(ParameterValue::String(_))) => {
                true
            }
            (ParameterType::ListString, Some(ParameterValue::List(_))) => true,
            _ => false,
        };
        if !matches {
            bail!(Error::Validation(format!(
                "parameter '{}' declares type '{}' but its value has a different shape",
                self.name, self.kind
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, alias = "env", skip_serializing_if = "BTreeMap::is_empty")]
    pub env_vars: BTreeMap<String, String>,
}

impl Step {
    /// Executable (if any) followed by args.
    pub fn command(&self) -> Vec<String> {
        self.executable
            .iter()
            .filter(|e| !e.is_empty())
            .cloned()
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// A container-based unit of work as declared in `component.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: ComponentKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl FromStr for Component {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl Component {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!(Error::Validation("component name must not be empty".into()));
        }
        if self.kind == ComponentKind::Unknown {
            bail!(Error::Validation(format!(
                "component '{}' has no known type",
                self.name
            )));
        }
        if self.steps.is_empty() {
            bail!(Error::Validation(format!(
                "component '{}' must declare at least one step",
                self.name
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                bail!(Error::Validation(format!(
                    "component '{}' step #{i} has no name",
                    self.name
                )));
            }
            if step.image.is_empty() {
                bail!(Error::Validation(format!(
                    "component '{}' step '{}' has no image",
                    self.name, step.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for param in &self.parameters {
            param
                .validate()
                .with_context(|| format!("invalid parameter in component '{}'", self.name))?;
            if !seen.insert(param.name.as_str()) {
                bail!(Error::Validation(format!(
                    "component '{}' declares parameter '{}' more than once",
                    self.name, param.name
                )));
            }
        }
        Ok(())
    }

    /// Replaces parameters that share a name with an override. Unknown names are ignored.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, Parameter>) {
        for param in &mut self.parameters {
            if let Some(replacement) = overrides.get(&param.name) {
                *param = replacement.clone();
            }
        }
    }
}
