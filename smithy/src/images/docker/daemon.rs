use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, CreateImageOptions, PushImageOptions, TagImageOptions};
use bollard::Docker;
use futures::StreamExt;

use super::{BuildRequest, ImageDaemon, ProgressMessage, ProgressStream};
use crate::creds::Credential;
use crate::images::ImageReference;

/// [`ImageDaemon`] backed by the local Docker engine.
#[derive(Clone)]
pub struct BollardDaemon {
    docker: Docker,
}

impl BollardDaemon {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects using `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("could not connect to the Docker daemon")?;
        Ok(Self::new(docker))
    }
}

fn docker_credentials(host: &str, credential: Option<Credential>) -> Option<DockerCredentials> {
    credential.map(|c| DockerCredentials {
        username: Some(c.username),
        password: Some(c.password),
        serveraddress: Some(host.to_string()),
        ..Default::default()
    })
}

/// Tag or digest component used by the pull and push endpoints.
fn reference_tag(image: &ImageReference) -> String {
    image
        .digest()
        .map(str::to_string)
        .unwrap_or_else(|| image.tag().to_string())
}

#[async_trait]
impl ImageDaemon for BollardDaemon {
    async fn platform(&self) -> Result<String> {
        let version = self
            .docker
            .version()
            .await
            .context("could not query the Docker daemon version")?;
        let os = version.os.unwrap_or_else(|| "linux".to_string());
        let arch = version.arch.unwrap_or_else(|| "amd64".to_string());
        Ok(format!("{os}/{arch}"))
    }

    fn pull<'a>(
        &'a self,
        image: &'a ImageReference,
        credential: Option<Credential>,
    ) -> ProgressStream<'a> {
        let options = CreateImageOptions {
            from_image: image.repository_name(),
            tag: reference_tag(image),
            ..Default::default()
        };
        self.docker
            .create_image(
                Some(options),
                None,
                docker_credentials(image.registry(), credential),
            )
            .map(|item| {
                item.map(|info| ProgressMessage {
                    id: info.id,
                    status: info.status,
                    progress: info.progress,
                    error: info.error,
                    ..Default::default()
                })
                .map_err(anyhow::Error::from)
            })
            .boxed()
    }

    fn build<'a>(&'a self, request: BuildRequest, context: Vec<u8>) -> ProgressStream<'a> {
        let options = BuildImageOptions {
            dockerfile: request.dockerfile,
            t: request.tag,
            pull: request.pull_parent,
            rm: true,
            platform: request.platform,
            buildargs: request.build_args.into_iter().collect::<HashMap<_, _>>(),
            labels: request.labels.into_iter().collect::<HashMap<_, _>>(),
            ..Default::default()
        };
        self.docker
            .build_image(options, None, Some(context.into()))
            .map(|item| {
                item.map(|info| ProgressMessage {
                    id: info.id,
                    stream: info.stream,
                    status: info.status,
                    progress: info.progress,
                    error: info
                        .error
                        .or_else(|| info.error_detail.and_then(|d| d.message)),
                })
                .map_err(anyhow::Error::from)
            })
            .boxed()
    }

    async fn tag(&self, source: &str, target: &ImageReference) -> Result<()> {
        let options = TagImageOptions {
            repo: target.repository_name(),
            tag: target.tag().to_string(),
        };
        self.docker
            .tag_image(source, Some(options))
            .await
            .with_context(|| format!("could not tag {source} as {target}"))
    }

    fn push<'a>(
        &'a self,
        image: &'a ImageReference,
        credential: Option<Credential>,
    ) -> ProgressStream<'a> {
        let options = PushImageOptions {
            tag: reference_tag(image),
        };
        self.docker
            .push_image(
                &image.repository_name(),
                Some(options),
                docker_credentials(image.registry(), credential),
            )
            .map(|item| {
                item.map(|info| ProgressMessage {
                    status: info.status,
                    progress: info.progress,
                    error: info.error,
                    ..Default::default()
                })
                .map_err(anyhow::Error::from)
            })
            .boxed()
    }
}
