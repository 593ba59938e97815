use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::component::Component;
use crate::error::Error;

const COMPONENT_FILE_NAMES: [&str; 2] = ["component.yaml", "component.yml"];

/// Reads a `component.yaml` from disk.
pub trait ComponentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Component>;
}

/// Decodes and validates component files.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComponentParser;

impl ComponentParser for LocalComponentParser {
    fn parse(&self, path: &Path) -> Result<Component> {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !COMPONENT_FILE_NAMES.contains(&file_name) {
            bail!(Error::Validation(format!(
                "invalid file path {}, it has to point to a component.yaml or component.yml file",
                path.display()
            )));
        }
        if !path.exists() {
            bail!("{} does not exist", path.display());
        }
        if path.is_dir() {
            bail!("{} is a directory", path.display());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read component file {}", path.display()))?;
        let component: Component = contents
            .parse()
            .with_context(|| format!("failed to decode component file {}", path.display()))?;
        component
            .validate()
            .with_context(|| format!("invalid component spec {}", path.display()))?;
        Ok(component)
    }
}
