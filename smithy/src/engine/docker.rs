use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerWaitResponse, HostConfig};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ContainerConfig, ContainerExecutor};
use crate::error::Error;

/// The container calls a step run makes against the engine.
#[async_trait]
pub(crate) trait ContainerApi: Send + Sync {
    async fn create(&self, config: &ContainerConfig) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    /// Followed stdout and stderr, as raw chunks.
    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<Vec<u8>, DockerError>>;
    fn wait<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<ContainerWaitResponse, DockerError>>;
    async fn remove(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl ContainerApi for Docker {
    async fn create(&self, config: &ContainerConfig) -> Result<String> {
        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: Some(config.platform.clone()),
        };
        let body = Config {
            image: Some(config.image.clone()),
            entrypoint: config.entrypoint.clone().map(|e| vec![e]),
            cmd: (!config.args.is_empty()).then(|| config.args.clone()),
            env: Some(config.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(config.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let response = self
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("could not create container {}", config.name))?;
        for warning in response.warnings {
            warn!(container = %config.name, warning = %warning, "docker warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("could not start container {id}"))
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<Vec<u8>, DockerError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        Docker::logs(self, id, Some(options))
            .map(|chunk| chunk.map(|output| output.into_bytes().to_vec()))
            .boxed()
    }

    fn wait<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<ContainerWaitResponse, DockerError>> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        self.wait_container(id, Some(options)).boxed()
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.remove_container(id, Some(options))
            .await
            .with_context(|| format!("could not remove container {id}"))
    }
}

/// [`ContainerExecutor`] backed by the local Docker engine.
#[derive(Clone)]
pub struct DockerExecutor {
    api: Arc<dyn ContainerApi>,
}

impl DockerExecutor {
    pub fn new(docker: Docker) -> Self {
        Self::with_api(Arc::new(docker))
    }

    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("could not connect to the Docker daemon")?;
        Ok(Self::new(docker))
    }

    pub(crate) fn with_api(api: Arc<dyn ContainerApi>) -> Self {
        Self { api }
    }

    /// Exit status wins over a broken log stream.
    async fn start_and_wait(&self, id: &str) -> Result<()> {
        self.api.start(id).await?;

        let (logs, exit) = tokio::join!(self.copy_logs(id), self.wait(id));
        exit?;
        logs.with_context(|| format!("could not stream logs of container {id}"))
    }

    async fn copy_logs(&self, id: &str) -> Result<()> {
        let mut logs = self.api.logs(id);
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = logs.next().await {
            let chunk = chunk.context("log stream interrupted")?;
            stdout.write_all(&chunk).await?;
        }
        stdout.flush().await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<()> {
        let mut wait = self.api.wait(id);
        match wait.next().await {
            Some(Ok(response)) if response.status_code == 0 => Ok(()),
            Some(Ok(response)) => bail!(Error::ContainerExit {
                code: response.status_code
            }),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                bail!(Error::ContainerExit { code })
            }
            Some(Err(e)) => Err(anyhow!(e).context(format!("could not wait for container {id}"))),
            None => bail!("wait stream for container {id} ended without a status"),
        }
    }

    async fn remove(&self, id: &str) {
        match self.api.remove(id).await {
            Ok(()) => debug!(container = %id, "removed container"),
            Err(e) => warn!(container = %id, error = %e, "could not remove container"),
        }
    }
}

#[async_trait]
impl ContainerExecutor for DockerExecutor {
    async fn run_and_wait(&self, cancel: &CancellationToken, config: ContainerConfig) -> Result<()> {
        if cancel.is_cancelled() {
            bail!(Error::Cancelled);
        }
        let id = self.api.create(&config).await?;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!(Error::Cancelled)),
            result = self.start_and_wait(&id) => result,
        };
        self.remove(&id).await;
        result
    }
}
