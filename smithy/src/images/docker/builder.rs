use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{default_labels, drain_progress, BuildRequest, ImageDaemon};
use crate::creds::CredentialStore;
use crate::images::{
    Builder, ComponentRepository, CustomImageReport, ImageReference, DEFAULT_BASE_DOCKERFILE,
    DEFAULT_SDK_VERSION,
};

/// How component images are built.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Target platform; the daemon's own `os/arch` when unset.
    pub platform: Option<String>,
    pub base_dockerfile: String,
    pub push: bool,
    pub labels: BTreeMap<String, String>,
    pub sdk_version: String,
    /// Directory the build context and make recipes are resolved against.
    pub context_root: PathBuf,
    pub make_recipes: bool,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            platform: None,
            base_dockerfile: DEFAULT_BASE_DOCKERFILE.to_string(),
            push: false,
            labels: default_labels(),
            sdk_version: DEFAULT_SDK_VERSION.to_string(),
            context_root: PathBuf::from("."),
            make_recipes: true,
        }
    }
}

impl BuilderOptions {
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_base_dockerfile(mut self, path: impl Into<String>) -> Self {
        self.base_dockerfile = path.into();
        self
    }

    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_sdk_version(mut self, version: impl Into<String>) -> Self {
        self.sdk_version = version.into();
        self
    }

    pub fn with_context_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.context_root = root.into();
        self
    }

    pub fn with_make_recipes(mut self, enabled: bool) -> Self {
        self.make_recipes = enabled;
        self
    }
}

/// Builds component images with a make recipe when the component ships one,
/// and with the shared base Dockerfile otherwise.
pub struct DockerBuilder {
    daemon: Arc<dyn ImageDaemon>,
    credentials: Arc<dyn CredentialStore>,
    component_path: PathBuf,
    options: BuilderOptions,
    platform: String,
    dry_run: bool,
    built: Mutex<Vec<CustomImageReport>>,
}

impl DockerBuilder {
    pub async fn new(
        daemon: Arc<dyn ImageDaemon>,
        credentials: Arc<dyn CredentialStore>,
        component_path: impl Into<PathBuf>,
        options: BuilderOptions,
        dry_run: bool,
    ) -> Result<Self> {
        let platform = match &options.platform {
            Some(platform) => platform.clone(),
            None => daemon
                .platform()
                .await
                .context("could not connect to the Docker daemon")?,
        };
        Ok(Self {
            daemon,
            credentials,
            component_path: component_path.into(),
            options,
            platform,
            dry_run,
            built: Mutex::new(vec![]),
        })
    }

    pub fn component_path(&self) -> &Path {
        &self.component_path
    }

    fn sdk_version(&self) -> &str {
        if self.options.sdk_version.is_empty() {
            DEFAULT_SDK_VERSION
        } else {
            &self.options.sdk_version
        }
    }

    fn record(&self, report: CustomImageReport) {
        if let Ok(mut built) = self.built.lock() {
            built.push(report);
        }
    }

    async fn build_with_make(&self, repository: &ComponentRepository) -> Result<String> {
        let first = first_url(repository)?;
        self.record(CustomImageReport {
            tags: repository.urls().to_vec(),
            context_path: repository.directory().to_string(),
            component_path: repository.directory().to_string(),
            platform: self.platform.clone(),
            ..Default::default()
        });
        if self.dry_run {
            return Ok(first);
        }

        let mut failures = vec![];
        for tag in repository.tags() {
            let env = [
                ("PUSH", self.options.push.to_string()),
                ("BUILD_ARCHITECTURE", self.platform.clone()),
                ("COMPONENT_REGISTRY", repository.registry().to_string()),
                ("COMPONENT_REPOSITORY", repository.repo().to_string()),
                ("COMPONENT_TAG", tag.clone()),
            ];
            if let Err(e) =
                run_make_recipe(&self.options.context_root, repository.directory(), &env).await
            {
                warn!(tag = %tag, error = %e, "make recipe failed");
                failures.push(format!("{tag}: {e:#}"));
            }
        }
        if !failures.is_empty() {
            bail!(
                "{}: make recipe failed: {}",
                repository.directory(),
                failures.join("; ")
            );
        }
        Ok(first)
    }

    async fn build_with_dockerfile(&self, repository: &ComponentRepository) -> Result<String> {
        let first = first_url(repository)?;
        let dockerfile = archive_name(&self.options.base_dockerfile);
        let build_args = BTreeMap::from([
            (
                "COMPONENT_PATH".to_string(),
                repository.directory().to_string(),
            ),
            ("SDK_VERSION".to_string(), self.sdk_version().to_string()),
        ]);

        self.record(CustomImageReport {
            tags: repository.urls().to_vec(),
            labels: self.options.labels.clone(),
            build_args: build_args.clone(),
            context_path: repository.directory().to_string(),
            dockerfile: dockerfile.clone(),
            component_path: repository.directory().to_string(),
            platform: self.platform.clone(),
        });
        if self.dry_run {
            return Ok(first);
        }

        info!(platform = %self.platform, tags = ?repository.urls(), "building component image");
        let root = self.options.context_root.clone();
        let paths = vec![dockerfile.clone(), repository.directory().to_string()];
        let context = tokio::task::spawn_blocking(move || build_context(&root, &paths))
            .await
            .context("build context task failed")?
            .context("could not create tar for the image build context")?;

        let request = BuildRequest {
            dockerfile,
            tag: first.clone(),
            build_args,
            labels: self.options.labels.clone(),
            platform: self.platform.clone(),
            pull_parent: true,
        };
        let mut stderr = tokio::io::stderr();
        drain_progress(self.daemon.build(request, context), &mut stderr)
            .await
            .with_context(|| {
                format!(
                    "{}: there was an error while building component image",
                    repository.directory()
                )
            })?;

        for url in repository.urls().iter().skip(1) {
            let target: ImageReference = url.parse()?;
            self.daemon.tag(&first, &target).await?;
        }

        if self.options.push {
            self.push(repository).await?;
        } else {
            debug!("not pushing image");
        }
        Ok(first)
    }

    async fn push(&self, repository: &ComponentRepository) -> Result<()> {
        let mut stderr = tokio::io::stderr();
        for url in repository.urls() {
            info!(image = %url, "pushing image");
            let target: ImageReference = url.parse()?;
            let credential = self.credentials.get(target.registry());
            drain_progress(self.daemon.push(&target, credential), &mut stderr)
                .await
                .with_context(|| format!("{url}: could not push image to the repository"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Builder for DockerBuilder {
    #[instrument(skip(self, repository), fields(directory = %repository.directory()))]
    async fn build(&self, repository: &ComponentRepository) -> Result<String> {
        if self.options.make_recipes
            && has_make_recipe(&self.options.context_root, repository.directory()).await
        {
            info!("building component image with make recipe");
            return self.build_with_make(repository).await;
        }
        self.build_with_dockerfile(repository).await
    }

    fn report(&self) -> Vec<CustomImageReport> {
        self.built.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

fn first_url(repository: &ComponentRepository) -> Result<String> {
    repository
        .urls()
        .first()
        .cloned()
        .with_context(|| format!("{}: component image has no tags", repository.directory()))
}

/// Path as stored in the build context archive.
fn archive_name(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('/').to_string()
}

/// Tars `paths` (files or directories relative to `root`) into an in-memory archive.
fn build_context(root: &Path, paths: &[String]) -> Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(false);
    for path in paths {
        let name = archive_name(path);
        let source = root.join(&name);
        if source.is_dir() {
            archive
                .append_dir_all(&name, &source)
                .with_context(|| format!("could not add {} to the build context", source.display()))?;
        } else {
            archive
                .append_path_with_name(&source, &name)
                .with_context(|| format!("could not add {} to the build context", source.display()))?;
        }
    }
    archive
        .into_inner()
        .context("could not finish the build context archive")
}

/// True when `make -C <dir> --dry-run --quiet image` succeeds.
async fn has_make_recipe(root: &Path, dir: &str) -> bool {
    let status = Command::new("make")
        .current_dir(root)
        .arg("-C")
        .arg(dir)
        .args(["--dry-run", "--quiet", "image"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;
    matches!(status, Ok(s) if s.success())
}

/// Runs the `image` make target, streaming its output to stderr.
async fn run_make_recipe(root: &Path, dir: &str, env: &[(&str, String)]) -> Result<()> {
    debug!(dir, "running make recipe");
    let mut child = Command::new("make")
        .current_dir(root)
        .arg("-C")
        .arg(dir)
        .args(["--quiet", "image"])
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("could not start make")?;

    let mut stdout = child.stdout.take().context("make stdout was not captured")?;
    let mut stderr = child.stderr.take().context("make stderr was not captured")?;
    let mut out_sink = tokio::io::stderr();
    let mut err_sink = tokio::io::stderr();
    tokio::try_join!(
        tokio::io::copy(&mut stdout, &mut out_sink),
        tokio::io::copy(&mut stderr, &mut err_sink),
    )
    .context("could not forward make output")?;

    let status = child.wait().await.context("could not wait for make")?;
    if !status.success() {
        bail!(
            "subprocess exited with error code: {}",
            status.code().unwrap_or(-1)
        );
    }
    Ok(())
}
