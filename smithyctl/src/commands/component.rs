use anyhow::{Context, Result};
use smithy::parser::{ComponentParser, LocalComponentParser};
use smithy::registry::{OciRegistry, PackageRequest};

use crate::cli::PackageArgs;

pub async fn package(args: PackageArgs) -> Result<()> {
    let component = LocalComponentParser
        .parse(&args.spec_path)
        .with_context(|| format!("could not load component {}", args.spec_path.display()))?;

    let (credentials, insecure) = args.registry.credentials()?;
    let registry = OciRegistry::new(
        &args.registry.registry_url,
        &args.registry.registry_base_repository,
        credentials,
        insecure,
    )?;

    let mut request = PackageRequest::new(component, args.sdk_version);
    if let Some(version) = args.version {
        request = request.with_version(version);
    }
    if let Some(path) = args.component_path {
        request = request.with_component_path(path);
    }

    let reference = registry.package(request).await?;
    println!("{reference}");
    Ok(())
}
