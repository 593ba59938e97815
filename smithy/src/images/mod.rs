//! Image reference classification and the resolve/build/pull capabilities
//! that make a step's image runnable on the local daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod docker;
pub mod reference;
pub mod repository;

pub use reference::ImageReference;
pub use repository::{parse_component_repository, ComponentRepository, Resolution};

pub const DEFAULT_REGISTRY: &str = "ghcr.io";
pub const DEFAULT_NAMESPACE: &str = "smithy-security/smithy";
pub const DEFAULT_BASE_DOCKERFILE: &str = "new-components/Dockerfile";
pub const DEFAULT_SDK_VERSION: &str = "unset";

/// Makes an image reference runnable and returns the reference the engine should use.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, image_ref: &str, options: &ResolutionOptions) -> anyhow::Result<String>;
    fn report(&self) -> Report;
}

/// Builds the image for a component-local repository.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, repository: &ComponentRepository) -> anyhow::Result<String>;
    fn report(&self) -> Vec<CustomImageReport>;
}

/// Hands out resolvers: one shared resolver for remote and inline components,
/// and one bound to the directory of each local component.
#[async_trait]
pub trait ImageResolverFactory: Send + Sync {
    fn remote(&self) -> Arc<dyn Resolver>;
    async fn local(&self, component_path: &Path) -> anyhow::Result<Arc<dyn Resolver>>;
    fn report(&self) -> Report;
}

/// Rewrites the `namespace/repository` string of component images.
pub trait RepositoryProcessor: Send + Sync + fmt::Debug {
    fn process(&self, repository: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRepoProcessor;

impl RepositoryProcessor for NoopRepoProcessor {
    fn process(&self, repository: &str) -> String {
        repository.to_string()
    }
}

/// Flattens nested repositories into one path segment: `a/b/c` becomes `a-b-c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenRepoProcessor;

impl RepositoryProcessor for FlattenRepoProcessor {
    fn process(&self, repository: &str) -> String {
        repository.replace('/', "-")
    }
}

/// Settings shared by every component image of a run.
#[derive(Debug, Clone)]
pub struct ResolutionOptions {
    pub registry: String,
    pub namespace: String,
    pub tags: Vec<String>,
    pub replacements: BTreeMap<String, String>,
    pub processor: Arc<dyn RepositoryProcessor>,
}

impl Default for ResolutionOptions {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            tags: vec![reference::DEFAULT_TAG.to_string()],
            replacements: BTreeMap::new(),
            processor: Arc::new(NoopRepoProcessor),
        }
    }
}

impl ResolutionOptions {
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = registry.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_replacement(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.replacements.insert(from.into(), to.into());
        self
    }

    pub fn with_processor(mut self, processor: impl RepositoryProcessor + 'static) -> Self {
        self.processor = Arc::new(processor);
        self
    }
}

/// What a built component image was made from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomImageReport {
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub build_args: BTreeMap<String, String>,
    pub context_path: String,
    pub dockerfile: String,
    pub component_path: String,
    pub platform: String,
}

/// Every image touched while resolving a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub external_images: BTreeSet<String>,
    pub custom_images: Vec<CustomImageReport>,
}

impl Report {
    pub fn merge(&mut self, other: Report) {
        self.external_images.extend(other.external_images);
        self.custom_images.extend(other.custom_images);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_processor_replaces_slashes() {
        assert_eq!(
            FlattenRepoProcessor.process("some/namespace/scanners/codeql"),
            "some-namespace-scanners-codeql"
        );
        assert_eq!(NoopRepoProcessor.process("a/b"), "a/b");
    }

    #[test]
    fn options_defaults() {
        let opts = ResolutionOptions::default();
        assert_eq!(opts.registry, "ghcr.io");
        assert_eq!(opts.namespace, "smithy-security/smithy");
        assert_eq!(opts.tags, vec!["latest"]);
        assert!(opts.replacements.is_empty());
    }

    #[test]
    fn report_merge_deduplicates_external_images() {
        let mut a = Report::default();
        a.external_images.insert("alpine:3.19".into());
        let mut b = Report::default();
        b.external_images.insert("alpine:3.19".into());
        b.custom_images.push(CustomImageReport::default());
        a.merge(b);
        assert_eq!(a.external_images.len(), 1);
        assert_eq!(a.custom_images.len(), 1);
    }
}
