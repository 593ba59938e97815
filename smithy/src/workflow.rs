use std::collections::HashSet;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentKind};
use crate::error::Error;

/// Components of a single kind, run as one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub kind: ComponentKind,
    pub components: Vec<Component>,
}

/// A resolved, executable workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<Stage>,
}

impl Workflow {
    /// Groups components into stages ordered target, scanner, enricher, filter, reporter.
    /// Declaration order is kept within a stage and empty kinds are omitted.
    pub fn from_components(
        name: impl Into<String>,
        description: impl Into<String>,
        components: Vec<Component>,
    ) -> Self {
        let mut stages: Vec<Stage> = ComponentKind::ORDERED
            .into_iter()
            .map(|kind| Stage {
                kind,
                components: vec![],
            })
            .collect();
        let mut unscheduled = vec![];

        for component in components {
            match stages.iter_mut().find(|s| s.kind == component.kind) {
                Some(stage) => stage.components.push(component),
                None => unscheduled.push(component),
            }
        }
        stages.retain(|s| !s.components.is_empty());

        // Unknown kinds fail validation; keep them visible in a trailing stage.
        if !unscheduled.is_empty() {
            stages.push(Stage {
                kind: ComponentKind::Unknown,
                components: unscheduled,
            });
        }

        Self {
            name: name.into(),
            description: description.into(),
            stages,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!(Error::Validation("workflow name must not be empty".into()));
        }
        if self.stages.is_empty() {
            bail!(Error::Validation(format!(
                "workflow '{}' has no stages",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.components.is_empty() {
                bail!(Error::Validation(format!(
                    "workflow '{}' has an empty {} stage",
                    self.name, stage.kind
                )));
            }
            for component in &stage.components {
                component
                    .validate()
                    .with_context(|| format!("invalid component in workflow '{}'", self.name))?;
                if !names.insert(component.name.as_str()) {
                    bail!(Error::Validation(format!(
                        "component '{}' appears more than once in workflow '{}'",
                        component.name, self.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.stages.iter().flat_map(|s| s.components.iter())
    }
}
