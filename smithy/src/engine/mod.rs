//! Runs a parsed [`Workflow`] as a sequence of containers sharing one workspace.
//!
//! Stages run in order, components within a stage run in declaration order and
//! steps run one after another. The first failing step aborts the run.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::component::Step;
use crate::error::Error;
use crate::workflow::Workflow;

mod docker;
mod template;

pub use docker::DockerExecutor;
pub use template::{render_step, RenderedStep};

pub const WORKSPACE_DIR: &str = ".smithy";
pub const DATABASE_FILE: &str = "smithy.db";
pub const CONTAINER_WORKSPACE: &str = "/workspace";
pub const CONTAINER_PLATFORM: &str = "linux/amd64";

/// The three per-run scratch areas a step can ask for through template tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkspaceKind {
    SourceCode,
    Scratch,
    TargetMetadata,
}

impl WorkspaceKind {
    pub const ALL: [WorkspaceKind; 3] = [Self::SourceCode, Self::Scratch, Self::TargetMetadata];

    pub fn token(&self) -> &'static str {
        match self {
            Self::SourceCode => "sourceCodeWorkspace",
            Self::Scratch => "scratchWorkspace",
            Self::TargetMetadata => "targetMetadataWorkspace",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.token() == token)
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::SourceCode => "source-code",
            Self::Scratch => "scratch",
            Self::TargetMetadata => "target-metadata",
        }
    }

    pub fn mount_path(&self) -> &'static str {
        match self {
            Self::SourceCode => "/workspace/source-code",
            Self::Scratch => "/workspace/scratch",
            Self::TargetMetadata => "/workspace/target-metadata",
        }
    }
}

impl fmt::Display for WorkspaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Everything a backend needs to run one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub platform: String,
    /// `None` keeps the image's entrypoint.
    pub entrypoint: Option<String>,
    pub args: Vec<String>,
    /// Sorted `KEY=value` pairs.
    pub env: Vec<String>,
    /// Sorted `host:container` bind mounts.
    pub binds: Vec<String>,
}

impl ContainerConfig {
    /// Entrypoint (when set) followed by args.
    pub fn command(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .cloned()
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Container backend: create, start, stream logs, wait, remove.
#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    /// Fails when the container exits non-zero or `cancel` fires first.
    /// The container is removed in every case.
    async fn run_and_wait(&self, cancel: &CancellationToken, config: ContainerConfig) -> Result<()>;
}

pub type InstanceIdGenerator = Arc<dyn Fn() -> Uuid + Send + Sync>;
pub type TmpDirProvisioner = Arc<dyn Fn(Uuid, WorkspaceKind) -> Result<PathBuf> + Send + Sync>;

fn default_tmp_dir(instance_id: Uuid, kind: WorkspaceKind) -> Result<PathBuf> {
    let prefix = format!("{kind}-{instance_id}-");
    let dir = tempfile::Builder::new()
        .prefix(&prefix)
        .keep(true)
        .tempdir()
        .with_context(|| format!("could not provision temporary folder {prefix}*"))?;
    Ok(dir.path().to_path_buf())
}

#[derive(Clone)]
pub struct ExecutorConfig {
    clean_up: bool,
    base_dir: Option<PathBuf>,
    instance_id: InstanceIdGenerator,
    tmp_dirs: TmpDirProvisioner,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            clean_up: false,
            base_dir: None,
            instance_id: Arc::new(Uuid::new_v4),
            tmp_dirs: Arc::new(default_tmp_dir),
        }
    }
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("clean_up", &self.clean_up)
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl ExecutorConfig {
    /// Remove `.smithy/smithy.db` when the run ends.
    pub fn with_clean_up(mut self, clean_up: bool) -> Self {
        self.clean_up = clean_up;
        self
    }

    /// Directory holding `.smithy`; the working directory when unset.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn with_instance_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> Uuid + Send + Sync + 'static,
    {
        self.instance_id = Arc::new(generator);
        self
    }

    pub fn with_tmp_dir_provisioner<F>(mut self, provisioner: F) -> Self
    where
        F: Fn(Uuid, WorkspaceKind) -> Result<PathBuf> + Send + Sync + 'static,
    {
        self.tmp_dirs = Arc::new(provisioner);
        self
    }
}

/// Host directories backing one run.
struct RunInstance {
    id: Uuid,
    workspace: PathBuf,
    tmp_dirs: BTreeMap<WorkspaceKind, PathBuf>,
}

impl RunInstance {
    fn provision(id: Uuid, workspace: PathBuf, provisioner: &TmpDirProvisioner) -> Result<Self> {
        let mut run = Self {
            id,
            workspace,
            tmp_dirs: BTreeMap::new(),
        };
        for kind in WorkspaceKind::ALL {
            match provisioner(id, kind) {
                Ok(dir) => {
                    let dir = std::path::absolute(&dir).unwrap_or(dir);
                    run.tmp_dirs.insert(kind, dir);
                }
                Err(e) => {
                    run.remove_tmp_dirs();
                    return Err(e);
                }
            }
        }
        Ok(run)
    }

    fn remove_tmp_dirs(&self) {
        for (kind, dir) in &self.tmp_dirs {
            if let Err(e) = fs::remove_dir_all(dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(workspace = %kind, path = %dir.display(), error = %e, "could not remove temporary folder");
                }
            }
        }
    }

    fn container_config(&self, component: &str, step: &Step) -> Result<ContainerConfig> {
        let rendered = render_step(step)
            .with_context(|| format!("could not render step '{}'", step.name))?;

        let mut binds = vec![format!(
            "{}:{CONTAINER_WORKSPACE}",
            self.workspace.display()
        )];
        for kind in &rendered.workspaces {
            if let Some(dir) = self.tmp_dirs.get(kind) {
                binds.push(format!("{}:{}", dir.display(), kind.mount_path()));
            }
        }
        binds.sort();

        let mut env = rendered.env;
        env.insert("SMITHY_INSTANCE_ID".into(), self.id.to_string());
        env.insert("SMITHY_LOG_LEVEL".into(), "debug".into());
        if rendered.workspaces.contains(&WorkspaceKind::TargetMetadata) {
            env.insert(
                "TARGET_METADATA_PATH".into(),
                WorkspaceKind::TargetMetadata.mount_path().into(),
            );
        }
        let mut env: Vec<String> = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort();

        Ok(ContainerConfig {
            name: container_name(self.id, component, &step.name),
            image: step.image.clone(),
            platform: CONTAINER_PLATFORM.to_string(),
            entrypoint: step.executable.clone().filter(|e| !e.is_empty()),
            args: rendered.args,
            env,
            binds,
        })
    }
}

/// `smithy-<instance>-<component>-<step>` restricted to characters Docker accepts.
fn container_name(instance_id: Uuid, component: &str, step: &str) -> String {
    format!("smithy-{instance_id}-{component}-{step}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub struct Executor {
    containers: Arc<dyn ContainerExecutor>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(containers: Arc<dyn ContainerExecutor>, config: ExecutorConfig) -> Self {
        Self { containers, config }
    }

    /// Runs every step of `workflow`. Temporary folders are always removed;
    /// the findings database only when clean-up is enabled.
    #[instrument(skip_all, fields(workflow = %workflow.name, instance_id = tracing::field::Empty))]
    pub async fn execute(&self, cancel: &CancellationToken, workflow: &Workflow) -> Result<()> {
        let instance_id = (self.config.instance_id)();
        tracing::Span::current().record("instance_id", tracing::field::display(instance_id));

        let base_dir = match &self.config.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("could not determine working directory")?,
        };
        let workspace = std::path::absolute(base_dir.join(WORKSPACE_DIR))
            .context("could not resolve workspace path")?;

        let result = match RunInstance::provision(instance_id, workspace.clone(), &self.config.tmp_dirs) {
            Ok(run) => {
                let result = self.run(cancel, workflow, &run).await;
                run.remove_tmp_dirs();
                result
            }
            Err(e) => Err(e),
        };

        if self.config.clean_up {
            remove_database(&workspace);
        }
        result
    }

    async fn run(&self, cancel: &CancellationToken, workflow: &Workflow, run: &RunInstance) -> Result<()> {
        fs::create_dir_all(&run.workspace).with_context(|| {
            format!("could not create workspace {}", run.workspace.display())
        })?;

        for stage in &workflow.stages {
            debug!(stage = %stage.kind, components = stage.components.len(), "running stage");
            for component in &stage.components {
                for step in &component.steps {
                    self.run_step(cancel, run, &component.name, step)
                        .await
                        .with_context(|| {
                            format!("failed to run step for component '{}'", component.name)
                        })?;
                }
            }
        }
        info!("workflow completed");
        Ok(())
    }

    #[instrument(skip(self, cancel, run, step), fields(step = %step.name, image = %step.image))]
    async fn run_step(
        &self,
        cancel: &CancellationToken,
        run: &RunInstance,
        component: &str,
        step: &Step,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            bail!(Error::Cancelled);
        }
        let config = run.container_config(component, step)?;
        debug!(container = %config.name, command = ?config.command(), "starting container");
        self.containers
            .run_and_wait(cancel, config)
            .await
            .with_context(|| format!("failed to execute step '{}'", step.name))
    }
}

fn remove_database(workspace: &Path) {
    let db = workspace.join(DATABASE_FILE);
    match fs::remove_file(&db) {
        Ok(()) => debug!(path = %db.display(), "removed findings database"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %db.display(), error = %e, "could not remove findings database"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::component::{Component, ComponentKind};

    const INSTANCE: Uuid = Uuid::from_u128(0x5eed);

    /// Records every container it is asked to run.
    #[derive(Default)]
    struct FakeContainers {
        runs: Mutex<Vec<ContainerConfig>>,
        fail_step: Option<(&'static str, i64)>,
        cancel_on_step: Option<(&'static str, CancellationToken)>,
    }

    #[async_trait]
    impl ContainerExecutor for FakeContainers {
        async fn run_and_wait(&self, _cancel: &CancellationToken, config: ContainerConfig) -> Result<()> {
            let name = config.name.clone();
            self.runs.lock().unwrap().push(config);
            if let Some((step, token)) = &self.cancel_on_step {
                if name.ends_with(step) {
                    token.cancel();
                }
            }
            match self.fail_step {
                Some((step, code)) if name.ends_with(step) => Err(Error::ContainerExit { code }.into()),
                _ => Ok(()),
            }
        }
    }

    impl FakeContainers {
        fn runs(&self) -> Vec<ContainerConfig> {
            self.runs.lock().unwrap().clone()
        }
    }

    struct Fixture {
        base: TempDir,
        tmp_root: TempDir,
        provisioned: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                base: tempfile::tempdir().unwrap(),
                tmp_root: tempfile::tempdir().unwrap(),
                provisioned: Arc::default(),
            }
        }

        fn config(&self) -> ExecutorConfig {
            let root = self.tmp_root.path().to_path_buf();
            let provisioned = self.provisioned.clone();
            ExecutorConfig::default()
                .with_base_dir(self.base.path())
                .with_instance_id_generator(|| INSTANCE)
                .with_tmp_dir_provisioner(move |id, kind| {
                    let dir = root.join(format!("{kind}-{id}"));
                    fs::create_dir_all(&dir)?;
                    provisioned.lock().unwrap().push(dir.clone());
                    Ok(dir)
                })
        }

        fn host_dir(&self, kind: WorkspaceKind) -> String {
            self.tmp_root
                .path()
                .join(format!("{kind}-{INSTANCE}"))
                .display()
                .to_string()
        }

        fn workspace(&self) -> PathBuf {
            self.base.path().join(WORKSPACE_DIR)
        }
    }

    fn step(name: &str, image: &str, executable: Option<&str>, args: &[&str]) -> Step {
        Step {
            name: name.into(),
            image: image.into(),
            executable: executable.map(Into::into),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    fn component(name: &str, kind: ComponentKind, steps: Vec<Step>) -> Component {
        Component {
            name: name.into(),
            kind,
            steps,
            ..Default::default()
        }
    }

    fn single_step(name: &str, kind: ComponentKind) -> Component {
        component(name, kind, vec![step("run", "alpine:3.19", None, &[])])
    }

    #[tokio::test]
    async fn minimal_run_creates_one_container() {
        let fx = Fixture::new();
        let containers = Arc::new(FakeContainers::default());
        let workflow = Workflow::from_components(
            "wf1",
            "",
            vec![component(
                "scanner-a",
                ComponentKind::Scanner,
                vec![step("s1", "alpine:3.19", Some("/bin/sh"), &["-c", "echo hi"])],
            )],
        );

        Executor::new(containers.clone(), fx.config())
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap();

        let runs = containers.runs();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.image, "alpine:3.19");
        assert_eq!(run.platform, "linux/amd64");
        assert_eq!(run.command(), vec!["/bin/sh", "-c", "echo hi"]);
        assert_eq!(
            run.env,
            vec![
                format!("SMITHY_INSTANCE_ID={INSTANCE}"),
                "SMITHY_LOG_LEVEL=debug".to_string()
            ]
        );
        assert_eq!(
            run.binds,
            vec![format!("{}:/workspace", fx.workspace().display())]
        );
        assert_eq!(run.name, format!("smithy-{INSTANCE}-scanner-a-s1"));
        assert!(fx.workspace().is_dir());
    }

    #[tokio::test]
    async fn stages_run_in_kind_order() {
        let fx = Fixture::new();
        let containers = Arc::new(FakeContainers::default());
        let workflow = Workflow::from_components(
            "ordered",
            "",
            vec![
                single_step("r", ComponentKind::Reporter),
                single_step("t", ComponentKind::Target),
                single_step("s", ComponentKind::Scanner),
            ],
        );

        Executor::new(containers.clone(), fx.config())
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap();

        let names: Vec<_> = containers.runs().into_iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec![
                format!("smithy-{INSTANCE}-t-run"),
                format!("smithy-{INSTANCE}-s-run"),
                format!("smithy-{INSTANCE}-r-run"),
            ]
        );
    }

    #[tokio::test]
    async fn workspace_tokens_become_mounts() {
        let fx = Fixture::new();
        let containers = Arc::new(FakeContainers::default());
        let workflow = Workflow::from_components(
            "templated",
            "",
            vec![component(
                "copy",
                ComponentKind::Target,
                vec![step(
                    "clone",
                    "alpine:3.19",
                    Some("/bin/cp"),
                    &["--from={{ sourceCodeWorkspace }}", "--to={{ scratchWorkspace }}"],
                )],
            )],
        );

        Executor::new(containers.clone(), fx.config())
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap();

        let run = &containers.runs()[0];
        assert_eq!(
            run.args,
            vec!["--from=/workspace/source-code", "--to=/workspace/scratch"]
        );
        let mut expected = vec![
            format!("{}:/workspace", fx.workspace().display()),
            format!("{}:/workspace/source-code", fx.host_dir(WorkspaceKind::SourceCode)),
            format!("{}:/workspace/scratch", fx.host_dir(WorkspaceKind::Scratch)),
        ];
        expected.sort();
        assert_eq!(run.binds, expected);
        assert!(!run.env.iter().any(|e| e.starts_with("TARGET_METADATA_PATH=")));
    }

    #[tokio::test]
    async fn target_metadata_mount_sets_env() {
        let fx = Fixture::new();
        let containers = Arc::new(FakeContainers::default());
        let mut meta = step("meta", "alpine:3.19", None, &[]);
        meta.env_vars.insert("ZED".into(), "1".into());
        meta.env_vars.insert("OUT".into(), "{{ targetMetadataWorkspace }}".into());
        meta.env_vars.insert("SMITHY_LOG_LEVEL".into(), "info".into());
        let workflow =
            Workflow::from_components("meta", "", vec![component("m", ComponentKind::Target, vec![meta])]);

        Executor::new(containers.clone(), fx.config())
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap();

        let env = &containers.runs()[0].env;
        assert_eq!(
            *env,
            vec![
                "OUT=/workspace/target-metadata".to_string(),
                format!("SMITHY_INSTANCE_ID={INSTANCE}"),
                "SMITHY_LOG_LEVEL=debug".to_string(),
                "TARGET_METADATA_PATH=/workspace/target-metadata".to_string(),
                "ZED=1".to_string(),
            ]
        );
        let mut sorted = env.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(&sorted, env);
    }

    #[tokio::test]
    async fn failing_step_aborts_later_stages() {
        let fx = Fixture::new();
        let containers = Arc::new(FakeContainers {
            fail_step: Some(("t-run", 2)),
            ..Default::default()
        });
        let workflow = Workflow::from_components(
            "failing",
            "",
            vec![
                single_step("t", ComponentKind::Target),
                single_step("s", ComponentKind::Scanner),
            ],
        );

        let err = Executor::new(containers.clone(), fx.config())
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap_err();

        assert!(matches!(
            err.root_cause().downcast_ref::<Error>(),
            Some(Error::ContainerExit { code: 2 })
        ));
        assert_eq!(containers.runs().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_container() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        let containers = Arc::new(FakeContainers {
            cancel_on_step: Some(("t-run", cancel.clone())),
            ..Default::default()
        });
        let workflow = Workflow::from_components(
            "cancelled",
            "",
            vec![
                single_step("t", ComponentKind::Target),
                single_step("s", ComponentKind::Scanner),
            ],
        );

        let err = Executor::new(containers.clone(), fx.config().with_clean_up(true))
            .execute(&cancel, &workflow)
            .await
            .unwrap_err();

        assert!(crate::error::is_cancelled(&err));
        assert_eq!(containers.runs().len(), 1);
        for dir in fx.provisioned.lock().unwrap().iter() {
            assert!(!dir.exists(), "{} left behind", dir.display());
        }
    }

    #[tokio::test]
    async fn clean_run_removes_database() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.workspace()).unwrap();
        let db = fx.workspace().join(DATABASE_FILE);
        fs::write(&db, b"findings").unwrap();
        let workflow =
            Workflow::from_components("clean", "", vec![single_step("t", ComponentKind::Target)]);

        Executor::new(Arc::new(FakeContainers::default()), fx.config())
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap();
        assert!(db.exists());

        Executor::new(Arc::new(FakeContainers::default()), fx.config().with_clean_up(true))
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap();
        assert!(!db.exists());
    }

    #[tokio::test]
    async fn tmp_dirs_are_removed_after_failure() {
        let fx = Fixture::new();
        let containers = Arc::new(FakeContainers {
            fail_step: Some(("t-run", 1)),
            ..Default::default()
        });
        let workflow =
            Workflow::from_components("tmp", "", vec![single_step("t", ComponentKind::Target)]);

        Executor::new(containers, fx.config())
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap_err();

        let provisioned = fx.provisioned.lock().unwrap();
        assert_eq!(provisioned.len(), 3);
        assert!(provisioned.iter().all(|d| !d.exists()));
    }

    #[tokio::test]
    async fn provisioning_failure_is_reported() {
        let fx = Fixture::new();
        let config = fx
            .config()
            .with_tmp_dir_provisioner(|_, _| Err(anyhow::anyhow!("disk full")));
        let workflow =
            Workflow::from_components("tmp", "", vec![single_step("t", ComponentKind::Target)]);
        let containers = Arc::new(FakeContainers::default());

        let err = Executor::new(containers.clone(), config)
            .execute(&CancellationToken::new(), &workflow)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(containers.runs().is_empty());
    }

    #[test]
    fn container_name_is_sanitised() {
        assert_eq!(
            container_name(INSTANCE, "my comp", "step/1"),
            format!("smithy-{INSTANCE}-my-comp-step-1")
        );
    }

    #[test]
    fn default_provisioner_creates_distinct_dirs() {
        let a = default_tmp_dir(INSTANCE, WorkspaceKind::Scratch).unwrap();
        let b = default_tmp_dir(INSTANCE, WorkspaceKind::Scratch).unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
        fs::remove_dir_all(a).unwrap();
        fs::remove_dir_all(b).unwrap();
    }
}
