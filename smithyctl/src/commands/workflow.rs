use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use smithy::engine::{DockerExecutor, Executor, ExecutorConfig, CONTAINER_PLATFORM};
use smithy::images::docker::{
    BollardDaemon, BuilderOptions, DockerResolverFactory, ImageDaemon, OfflineDaemon,
};
use smithy::images::{FlattenRepoProcessor, ImageResolverFactory, ResolutionOptions};
use smithy::parser::{LocalComponentParser, ParserConfig, SpecParser};
use smithy::registry::OciRegistry;
use smithy::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cli::RunArgs;

fn resolution_options(args: &RunArgs) -> ResolutionOptions {
    let mut options = ResolutionOptions::default()
        .with_registry(&args.image_registry)
        .with_namespace(&args.image_namespace)
        .with_tags(args.image_tags.iter());
    for (from, to) in &args.image_replacements {
        options = options.with_replacement(from, to);
    }
    if args.flatten_image_repository {
        options = options.with_processor(FlattenRepoProcessor);
    }
    options
}

fn builder_options(args: &RunArgs) -> BuilderOptions {
    let options = BuilderOptions::default()
        .with_base_dockerfile(&args.base_component_dockerfile)
        .with_sdk_version(&args.sdk_version)
        .with_push(args.push_component_images);
    if args.dry_run {
        // no daemon round trip to discover the platform
        options.with_platform(CONTAINER_PLATFORM)
    } else {
        options
    }
}

fn image_daemon(dry_run: bool) -> Result<Arc<dyn ImageDaemon>> {
    match BollardDaemon::connect() {
        Ok(daemon) => Ok(Arc::new(daemon)),
        Err(e) if dry_run => {
            debug!(error = %e, "dry run continues without a Docker daemon");
            Ok(Arc::new(OfflineDaemon))
        }
        Err(e) => Err(e),
    }
}

pub async fn run(args: RunArgs, cancel: CancellationToken) -> Result<()> {
    let (credentials, insecure) = args.registry.credentials()?;
    let registry = OciRegistry::new(
        &args.registry.registry_url,
        &args.registry.registry_base_repository,
        credentials.clone(),
        insecure,
    )?;

    let resolvers = Arc::new(DockerResolverFactory::new(
        image_daemon(args.dry_run)?,
        credentials,
        builder_options(&args),
        args.build_component_images,
        args.dry_run,
    ));
    let parser = SpecParser::new(
        Arc::new(registry),
        Arc::new(LocalComponentParser),
        resolvers.clone(),
    );

    let mut config = ParserConfig::new(&args.spec_path).with_resolution(resolution_options(&args));
    if let Some(path) = &args.overrides_path {
        config = config.with_overrides_path(path);
    }

    let workflow = tokio::select! {
        _ = cancel.cancelled() => bail!(Error::Cancelled),
        workflow = parser.parse(&config) => workflow?,
    };

    if let Some(path) = &args.images_report {
        let report = serde_yaml::to_string(&resolvers.report()).context("could not encode images report")?;
        fs::write(path, report)
            .with_context(|| format!("could not write images report {}", path.display()))?;
        info!(path = %path.display(), "wrote images report");
    }

    if args.dry_run {
        let rendered = serde_yaml::to_string(&workflow).context("could not encode workflow")?;
        print!("{rendered}");
        return Ok(());
    }

    let executor = Executor::new(
        Arc::new(DockerExecutor::connect()?),
        ExecutorConfig::default().with_clean_up(args.clean_run),
    );
    executor.execute(&cancel, &workflow).await
}
