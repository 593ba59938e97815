//! Turns a `workflow.yaml` into an executable [`Workflow`].
//!
//! Component references are resolved first (inline, `file://` or a registry
//! package), then every step image is made runnable, overrides are applied and
//! parameters are rendered. The result is grouped into stages and validated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, instrument};

use crate::component::{Component, ComponentKind};
use crate::error::Error;
use crate::images::{ImageResolverFactory, ResolutionOptions, Resolver};
use crate::registry::ComponentFetcher;
use crate::workflow::Workflow;

mod component;
mod overrides;
mod raw;
mod render;

pub use component::{ComponentParser, LocalComponentParser};
pub use overrides::{parse_overrides, read_overrides, Overrides};
pub use raw::{read_workflow_spec, ComponentSource, RawComponentRef, RawWorkflow};
pub(crate) use render::expression_environment;
pub use render::{render_component, WORKSPACE_TOKENS};

/// Inputs of one parse.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub spec_path: PathBuf,
    /// Skipped when unset.
    pub overrides_path: Option<PathBuf>,
    pub resolution: ResolutionOptions,
}

impl ParserConfig {
    pub fn new(spec_path: impl Into<PathBuf>) -> Self {
        Self {
            spec_path: spec_path.into(),
            overrides_path: None,
            resolution: ResolutionOptions::default(),
        }
    }

    pub fn with_overrides_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.overrides_path = Some(path.into());
        self
    }

    pub fn with_resolution(mut self, resolution: ResolutionOptions) -> Self {
        self.resolution = resolution;
        self
    }
}

pub struct SpecParser {
    fetcher: Arc<dyn ComponentFetcher>,
    component_parser: Arc<dyn ComponentParser>,
    resolvers: Arc<dyn ImageResolverFactory>,
}

impl SpecParser {
    pub fn new(
        fetcher: Arc<dyn ComponentFetcher>,
        component_parser: Arc<dyn ComponentParser>,
        resolvers: Arc<dyn ImageResolverFactory>,
    ) -> Self {
        Self {
            fetcher,
            component_parser,
            resolvers,
        }
    }

    #[instrument(skip(self, config), fields(spec = %config.spec_path.display()))]
    pub async fn parse(&self, config: &ParserConfig) -> Result<Workflow> {
        let raw = read_workflow_spec(&config.spec_path)?;
        let overrides = match &config.overrides_path {
            Some(path) => read_overrides(path)?,
            None => Overrides::new(),
        };

        let mut resolved = Vec::with_capacity(raw.components.len());
        let mut errors = vec![];
        for (i, entry) in raw.components.into_iter().enumerate() {
            match self.resolve_component(entry.component).await {
                Ok(component) => resolved.push(component),
                Err(e) => errors.push(format!("component #{}: {e:#}", i + 1)),
            }
        }
        if !errors.is_empty() {
            bail!(Error::Validation(format!(
                "failed to parse components:\n  {}",
                errors.join("\n  ")
            )));
        }

        let mut components = Vec::with_capacity(resolved.len());
        for (mut component, resolver) in resolved {
            for step in &mut component.steps {
                step.image = resolver
                    .resolve(&step.image, &config.resolution)
                    .await
                    .with_context(|| {
                        format!(
                            "failed to resolve image '{}' of component '{}' step '{}'",
                            step.image, component.name, step.name
                        )
                    })?;
            }
            if let Some(params) = overrides.get(&component.name) {
                debug!(component = %component.name, "applying parameter overrides");
                component.apply_overrides(params);
            }
            components.push(render_component(&component)?);
        }

        let workflow = Workflow::from_components(raw.name, raw.description, components);
        workflow
            .validate()
            .context("failed to validate workflow spec")?;

        info!(
            workflow = %workflow.name,
            stages = workflow.stages.len(),
            "parsed workflow"
        );
        Ok(workflow)
    }

    async fn resolve_component(
        &self,
        source: ComponentSource,
    ) -> Result<(Component, Arc<dyn Resolver>)> {
        match source {
            ComponentSource::Inline(component) => Ok((*component, self.resolvers.remote())),
            ComponentSource::Remote(reference) => {
                let response = self
                    .fetcher
                    .fetch_package(&reference)
                    .await
                    .with_context(|| format!("failed to fetch remote component {}", reference.raw()))?;
                Ok((response.component, self.resolvers.remote()))
            }
            ComponentSource::Local(path) => {
                let path = local_component_file(&path)?;
                let component = self
                    .component_parser
                    .parse(&path)
                    .context("failed to parse local component")?;
                check_local_layout(&path, &component)?;
                let resolver = self.resolvers.local(&path).await?;
                Ok((component, resolver))
            }
        }
    }
}

/// Absolute path of the component file; a directory gets `component.yaml`
/// (or an existing `component.yml`) appended.
fn local_component_file(path: &Path) -> Result<PathBuf> {
    let path = std::path::absolute(path)
        .with_context(|| format!("failed to resolve component path {}", path.display()))?;
    if !path.is_dir() {
        return Ok(path);
    }
    let yml = path.join("component.yml");
    if !path.join("component.yaml").exists() && yml.exists() {
        return Ok(yml);
    }
    Ok(path.join("component.yaml"))
}

/// A local component lives at `<kinds>/<name>/component.yaml`.
fn check_local_layout(path: &Path, component: &Component) -> Result<()> {
    let dir = path.parent();
    let dir_name = dir
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let kind_dir = dir
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if component.name != dir_name {
        bail!(Error::Validation(format!(
            "component name '{}' does not match its directory '{dir_name}'",
            component.name
        )));
    }
    if ComponentKind::from_plural(kind_dir) != Some(component.kind) {
        bail!(Error::Validation(format!(
            "component '{}' of type '{}' must live under a '{}' directory, found '{kind_dir}'",
            component.name,
            component.kind,
            component.kind.plural()
        )));
    }
    Ok(())
}
