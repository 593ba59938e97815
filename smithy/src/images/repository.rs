use std::path::{Component as PathComponent, Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::reference::ImageReference;
use super::ResolutionOptions;
use crate::component::ComponentKind;
use crate::error::Error;

/// The outcome of classifying an image reference against a component path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A registry image, possibly after replacement. Pulled, never built.
    External(ImageReference),
    /// An on-disk component directory that should be built.
    Component(ComponentRepository),
}

/// Image repository of a component built from source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRepository {
    registry: String,
    namespace: String,
    repository: String,
    component_name: String,
    directory: String,
    tags: Vec<String>,
    urls: Vec<String>,
}

impl ComponentRepository {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Processed `namespace/repository` string, without registry or tag.
    pub fn repo(&self) -> &str {
        &self.repository
    }

    /// Name of the component relative to its kind directory, e.g. `codeql/helper`.
    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    /// Build context directory relative to the working directory.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// One `registry/repo:tag` per tag, in tag order.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// Classifies `image_ref` relative to the component declared at `component_path`.
///
/// Replacements win over everything else. A reference is component-local when
/// it names an existing relative directory below the component's kind
/// directory (e.g. `.../scanners`); anything else is external.
pub fn parse_component_repository(
    component_path: &Path,
    image_ref: &str,
    options: &ResolutionOptions,
) -> Result<Resolution> {
    debug!(component_path = %component_path.display(), image_ref, "parsing image reference");

    let mut image_ref = image_ref;
    while let Some(rest) = image_ref.strip_prefix("./") {
        image_ref = rest;
    }

    let parsed: ImageReference = image_ref
        .parse()
        .with_context(|| format!("could not parse image reference '{image_ref}'"))?;

    if let Some(replacement) = find_replacement(options, &parsed) {
        let replaced: ImageReference = replacement.parse().with_context(|| {
            format!("{image_ref} => {replacement}: could not parse image replacement")
        })?;
        debug!(image_ref, replacement = %replaced, "image reference replaced");
        return Ok(Resolution::External(replaced));
    }

    if !is_local_path(image_ref) || !Path::new(image_ref).is_dir() {
        return Ok(Resolution::External(parsed));
    }

    let Some(kind_dir) = component_path.parent().and_then(Path::parent) else {
        return Ok(Resolution::External(parsed));
    };
    let kind_is_known = kind_dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(ComponentKind::from_plural)
        .is_some();
    if !kind_is_known {
        return Ok(Resolution::External(parsed));
    }

    let image_dir = absolute(Path::new(image_ref))?;
    let kind_dir = absolute(kind_dir)?;
    let Ok(relative) = image_dir.strip_prefix(&kind_dir) else {
        return Ok(Resolution::External(parsed));
    };

    if options.tags.is_empty() {
        bail!(Error::Configuration(
            "at least one tag is required for component images".into()
        ));
    }

    let joined = if options.namespace.is_empty() {
        parsed.repository().to_string()
    } else {
        format!(
            "{}/{}",
            options.namespace.trim_end_matches('/'),
            parsed.repository()
        )
    };
    let repository = options.processor.process(&joined);
    let urls = options
        .tags
        .iter()
        .map(|tag| format!("{}/{repository}:{tag}", options.registry))
        .collect();

    Ok(Resolution::Component(ComponentRepository {
        registry: options.registry.clone(),
        namespace: options.namespace.clone(),
        repository,
        component_name: relative.to_string_lossy().trim_start_matches('/').to_string(),
        directory: parsed.repository().to_string(),
        tags: options.tags.clone(),
        urls,
    }))
}

fn find_replacement<'a>(options: &'a ResolutionOptions, parsed: &ImageReference) -> Option<&'a str> {
    [
        parsed.raw().to_string(),
        parsed.name(),
        parsed.repository_name(),
        parsed.repository().to_string(),
    ]
    .iter()
    .find_map(|key| options.replacements.get(key))
    .map(String::as_str)
}

/// Relative, non-empty and never escaping the working directory.
fn is_local_path(p: &str) -> bool {
    !p.is_empty()
        && Path::new(p)
            .components()
            .all(|c| matches!(c, PathComponent::Normal(_) | PathComponent::CurDir))
}

fn absolute(p: &Path) -> Result<PathBuf> {
    std::path::absolute(p).with_context(|| format!("could not make {} absolute", p.display()))
}
