use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::{BuilderOptions, DockerBuilder, DockerPuller, ImageDaemon};
use crate::creds::CredentialStore;
use crate::images::{
    parse_component_repository, Builder, ImageResolverFactory, Report, Resolution,
    ResolutionOptions, Resolver,
};

/// Builds component-local images and pulls everything else.
pub struct ResolverBuilder {
    puller: Arc<DockerPuller>,
    builder: DockerBuilder,
}

impl ResolverBuilder {
    pub fn new(puller: Arc<DockerPuller>, builder: DockerBuilder) -> Self {
        Self { puller, builder }
    }
}

#[async_trait]
impl Resolver for ResolverBuilder {
    #[instrument(skip(self, options), fields(component_path = %self.builder.component_path().display()))]
    async fn resolve(&self, image_ref: &str, options: &ResolutionOptions) -> Result<String> {
        match parse_component_repository(self.builder.component_path(), image_ref, options)? {
            Resolution::External(reference) => {
                debug!(image = %reference.raw(), "image is external, pulling");
                self.puller.pull(reference.raw()).await
            }
            Resolution::Component(repository) => {
                debug!(image = image_ref, "image is a component image, building");
                self.builder.build(&repository).await
            }
        }
    }

    fn report(&self) -> Report {
        let mut report = self.puller.report();
        report.custom_images.extend(self.builder.report());
        report
    }
}

/// Hands out the shared puller, plus one [`ResolverBuilder`] per local
/// component when component images are built from source.
pub struct DockerResolverFactory {
    daemon: Arc<dyn ImageDaemon>,
    credentials: Arc<dyn CredentialStore>,
    puller: Arc<DockerPuller>,
    builder_options: BuilderOptions,
    build_component_images: bool,
    dry_run: bool,
    platform: OnceCell<String>,
    builders: Mutex<Vec<Arc<ResolverBuilder>>>,
}

impl DockerResolverFactory {
    pub fn new(
        daemon: Arc<dyn ImageDaemon>,
        credentials: Arc<dyn CredentialStore>,
        builder_options: BuilderOptions,
        build_component_images: bool,
        dry_run: bool,
    ) -> Self {
        let puller = Arc::new(DockerPuller::new(
            daemon.clone(),
            credentials.clone(),
            dry_run,
        ));
        Self {
            daemon,
            credentials,
            puller,
            builder_options,
            build_component_images,
            dry_run,
            platform: OnceCell::new(),
            builders: Mutex::new(vec![]),
        }
    }

    async fn platform(&self) -> Result<String> {
        if let Some(platform) = &self.builder_options.platform {
            return Ok(platform.clone());
        }
        self.platform
            .get_or_try_init(|| async {
                self.daemon
                    .platform()
                    .await
                    .context("could not connect to the Docker daemon")
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl ImageResolverFactory for DockerResolverFactory {
    fn remote(&self) -> Arc<dyn Resolver> {
        self.puller.clone()
    }

    async fn local(&self, component_path: &Path) -> Result<Arc<dyn Resolver>> {
        if !self.build_component_images {
            return Ok(self.puller.clone());
        }

        let options = self.builder_options.clone().with_platform(self.platform().await?);
        let builder = DockerBuilder::new(
            self.daemon.clone(),
            self.credentials.clone(),
            component_path,
            options,
            self.dry_run,
        )
        .await
        .with_context(|| {
            format!(
                "could not bootstrap image builder for {}",
                component_path.display()
            )
        })?;
        let resolver = Arc::new(ResolverBuilder::new(self.puller.clone(), builder));
        if let Ok(mut builders) = self.builders.lock() {
            builders.push(resolver.clone());
        }
        Ok(resolver)
    }

    fn report(&self) -> Report {
        let mut report = self.puller.report();
        if let Ok(builders) = self.builders.lock() {
            for builder in builders.iter() {
                report.custom_images.extend(builder.builder.report());
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::NoopStore;
    use crate::images::docker::fake::FakeDaemon;

    const GOSEC: &str = "testdata/scanners/gosec/component.yaml";

    fn factory(daemon: &FakeDaemon, build: bool) -> DockerResolverFactory {
        DockerResolverFactory::new(
            Arc::new(daemon.clone()),
            Arc::new(NoopStore),
            BuilderOptions::default()
                .with_base_dockerfile("testdata/Dockerfile")
                .with_make_recipes(false),
            build,
            false,
        )
    }

    #[tokio::test]
    async fn component_image_is_built_not_pulled() {
        let daemon = FakeDaemon::default();
        let factory = factory(&daemon, true);
        let resolver = factory.local(Path::new(GOSEC)).await.unwrap();

        let url = resolver
            .resolve("testdata/scanners/gosec", &ResolutionOptions::default())
            .await
            .unwrap();

        assert!(url.ends_with("/gosec:latest"));
        let calls = daemon.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("build "));

        let builds = daemon.builds.lock().unwrap();
        assert_eq!(builds[0].0.platform, "linux/amd64");
        assert_eq!(
            builds[0].0.build_args["COMPONENT_PATH"],
            "testdata/scanners/gosec"
        );
    }

    #[tokio::test]
    async fn external_image_is_pulled_by_local_resolver() {
        let daemon = FakeDaemon::default();
        let factory = factory(&daemon, true);
        let resolver = factory.local(Path::new(GOSEC)).await.unwrap();

        let url = resolver
            .resolve("alpine:3.19", &ResolutionOptions::default())
            .await
            .unwrap();

        assert_eq!(url, "alpine:3.19");
        assert_eq!(*daemon.calls.lock().unwrap(), vec!["pull alpine:3.19"]);
    }

    #[tokio::test]
    async fn replacement_is_pulled() {
        let daemon = FakeDaemon::default();
        let factory = factory(&daemon, true);
        let resolver = factory.local(Path::new(GOSEC)).await.unwrap();
        let options = ResolutionOptions::default()
            .with_replacement("testdata/scanners/gosec", "registry.internal/gosec:v2");

        let url = resolver
            .resolve("testdata/scanners/gosec", &options)
            .await
            .unwrap();

        assert_eq!(url, "registry.internal/gosec:v2");
        assert_eq!(
            *daemon.calls.lock().unwrap(),
            vec!["pull registry.internal/gosec:v2"]
        );
    }

    #[tokio::test]
    async fn building_disabled_hands_out_puller() {
        let daemon = FakeDaemon::default();
        let factory = factory(&daemon, false);
        let resolver = factory.local(Path::new(GOSEC)).await.unwrap();

        resolver
            .resolve("testdata/scanners/gosec", &ResolutionOptions::default())
            .await
            .unwrap();

        assert_eq!(
            *daemon.calls.lock().unwrap(),
            vec!["pull testdata/scanners/gosec"]
        );
    }

    #[tokio::test]
    async fn factory_report_aggregates_all_resolvers() {
        let daemon = FakeDaemon::default();
        let factory = factory(&daemon, true);
        let local = factory.local(Path::new(GOSEC)).await.unwrap();
        let options = ResolutionOptions::default();

        local.resolve("testdata/scanners/gosec", &options).await.unwrap();
        local.resolve("alpine:3.19", &options).await.unwrap();
        factory.remote().resolve("busybox:1.36", &options).await.unwrap();

        let report = factory.report();
        assert_eq!(
            report.external_images.into_iter().collect::<Vec<_>>(),
            vec!["alpine:3.19", "busybox:1.36"]
        );
        assert_eq!(report.custom_images.len(), 1);
        assert_eq!(report.custom_images[0].component_path, "testdata/scanners/gosec");
    }
}
