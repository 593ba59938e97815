use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use smithy::creds::{CredentialStore, NoopStore, StaticStore};
use smithy::images::{DEFAULT_BASE_DOCKERFILE, DEFAULT_NAMESPACE, DEFAULT_REGISTRY, DEFAULT_SDK_VERSION};
use smithy::registry::{DEFAULT_REGISTRY_HOST, DEFAULT_REGISTRY_NAMESPACE};

/// Package security scanning components and run workflows locally
#[derive(Parser)]
#[command(name = "smithyctl", version)]
pub struct Cli {
    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the smithyctl version
    Version,
    /// Work with single components
    #[command(subcommand)]
    Component(ComponentCommand),
    /// Work with workflows
    #[command(subcommand)]
    Workflow(WorkflowCommand),
}

#[derive(Subcommand)]
pub enum ComponentCommand {
    /// Package a component and push it to an OCI registry
    Package(PackageArgs),
    /// Build a component's images (reserved)
    Build,
    /// Run a single component (reserved)
    Run,
}

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Resolve a workflow and execute it with the local Docker engine
    Run(RunArgs),
}

/// Package registry connection shared by `component package` and `workflow run`.
#[derive(Args, Debug, Clone)]
pub struct RegistryArgs {
    /// Registry host, optionally with a port
    #[arg(long, env = "SMITHY_REGISTRY_URL", default_value = DEFAULT_REGISTRY_HOST)]
    pub registry_url: String,

    /// Repository prefix under which component packages live
    #[arg(long, env = "SMITHY_REGISTRY_BASE_REPOSITORY", default_value = DEFAULT_REGISTRY_NAMESPACE)]
    pub registry_base_repository: String,

    /// Authenticate against the registry; plain HTTP is used when disabled
    #[arg(long, env = "SMITHY_REGISTRY_AUTH_ENABLED")]
    pub registry_auth_enabled: bool,

    #[arg(long, env = "SMITHY_REGISTRY_AUTH_USERNAME", default_value = "")]
    pub registry_auth_username: String,

    #[arg(long, env = "SMITHY_REGISTRY_AUTH_PASSWORD", default_value = "", hide_env_values = true)]
    pub registry_auth_password: String,
}

impl RegistryArgs {
    /// Credentials store and whether to talk plain HTTP.
    pub fn credentials(&self) -> Result<(Arc<dyn CredentialStore>, bool)> {
        if !self.registry_auth_enabled {
            return Ok((Arc::new(NoopStore), true));
        }
        let store = StaticStore::new(
            self.registry_url.clone(),
            self.registry_auth_username.clone(),
            self.registry_auth_password.clone(),
        )?;
        Ok((Arc::new(store), false))
    }
}

#[derive(Args, Debug)]
pub struct PackageArgs {
    /// Path to the component.yaml to package
    #[arg(long)]
    pub spec_path: PathBuf,

    /// Package version, used as the manifest tag
    #[arg(long, env = "SMITHY_COMPONENT_VERSION")]
    pub version: Option<String>,

    /// SDK version the component was built against
    #[arg(long, env = "SMITHY_SDK_VERSION")]
    pub sdk_version: String,

    /// Repository path below the base repository; `<type plural>/<name>` by default
    #[arg(long)]
    pub component_path: Option<String>,

    #[command(flatten)]
    pub registry: RegistryArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow.yaml to run
    #[arg(long)]
    pub spec_path: PathBuf,

    /// Path to a parameter overrides file
    #[arg(long)]
    pub overrides_path: Option<PathBuf>,

    /// Build images of local components instead of pulling them
    #[arg(long)]
    pub build_component_images: bool,

    /// Push built component images
    #[arg(long)]
    pub push_component_images: bool,

    /// Delete the findings database when the run ends
    #[arg(long)]
    pub clean_run: bool,

    /// Registry of built component images
    #[arg(long, env = "SMITHY_IMAGE_REGISTRY", default_value = DEFAULT_REGISTRY)]
    pub image_registry: String,

    /// Namespace of built component images
    #[arg(long, env = "SMITHY_IMAGE_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub image_namespace: String,

    /// Tags given to built component images
    #[arg(long = "image-tag", default_value = "latest")]
    pub image_tags: Vec<String>,

    /// Replace a component image reference before resolution, as FROM=TO
    #[arg(long = "image-replacement", value_parser = parse_replacement)]
    pub image_replacements: Vec<(String, String)>,

    /// Flatten component image repositories into a single path segment
    #[arg(long)]
    pub flatten_image_repository: bool,

    /// Dockerfile used for components that ship none
    #[arg(long, env = "SMITHY_BASE_COMPONENT_DOCKERFILE", default_value = DEFAULT_BASE_DOCKERFILE)]
    pub base_component_dockerfile: String,

    /// SDK version passed to component image builds
    #[arg(long, env = "SMITHY_SDK_VERSION", default_value = DEFAULT_SDK_VERSION)]
    pub sdk_version: String,

    /// Resolve images and print the workflow without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Write a YAML report of resolved and built images
    #[arg(long)]
    pub images_report: Option<PathBuf>,

    #[command(flatten)]
    pub registry: RegistryArgs,
}

fn parse_replacement(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => Ok((from.into(), to.into())),
        _ => Err(format!("expected FROM=TO, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn replacement_needs_both_sides() {
        assert_eq!(
            parse_replacement("a/b:1=c/d:2").unwrap(),
            ("a/b:1".to_string(), "c/d:2".to_string())
        );
        assert!(parse_replacement("a/b:1").is_err());
        assert!(parse_replacement("=x").is_err());
    }

    #[test]
    fn disabled_auth_means_plain_http_without_credentials() {
        let cli = Cli::parse_from([
            "smithyctl",
            "component",
            "package",
            "--spec-path",
            "component.yaml",
            "--sdk-version",
            "v1",
        ]);
        let Command::Component(ComponentCommand::Package(args)) = cli.command else {
            panic!("expected component package");
        };
        let (store, insecure) = args.registry.credentials().unwrap();
        assert!(insecure);
        assert!(store.get(DEFAULT_REGISTRY_HOST).is_none());
    }

    #[test]
    fn enabled_auth_requires_credentials() {
        let args = RegistryArgs {
            registry_url: "ghcr.io".into(),
            registry_base_repository: DEFAULT_REGISTRY_NAMESPACE.into(),
            registry_auth_enabled: true,
            registry_auth_username: "".into(),
            registry_auth_password: "".into(),
        };
        assert!(args.credentials().is_err());
    }
}
