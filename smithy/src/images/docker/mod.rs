//! Docker-backed image provider.
//!
//! The daemon is reached through [`ImageDaemon`] so the puller and builder can
//! be exercised without a running Docker engine.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::creds::Credential;
use crate::images::ImageReference;

mod builder;
mod daemon;
mod puller;
mod resolver_builder;

pub use builder::{BuilderOptions, DockerBuilder};
pub use daemon::BollardDaemon;
pub use puller::DockerPuller;
pub use resolver_builder::{DockerResolverFactory, ResolverBuilder};

/// Labels stamped on every component image built from source.
pub fn default_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "org.opencontainers.image.source".to_string(),
            "https://github.com/smithy-security/smithy".to_string(),
        ),
        (
            "org.opencontainers.image.vendor".to_string(),
            "smithy-security".to_string(),
        ),
    ])
}

/// One decoded line of a daemon progress stream (pull, build or push).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgressMessage {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProgressMessage {
    pub fn stream(line: impl Into<String>) -> Self {
        Self {
            stream: Some(line.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    fn display_line(&self) -> Option<String> {
        if let Some(stream) = self.stream.as_deref() {
            let trimmed = stream.trim_end_matches('\n');
            return (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        if let Some(error) = self.error.as_deref() {
            return Some(error.to_string());
        }
        let status = self.status.as_deref()?;
        let line = match (&self.id, &self.progress) {
            (Some(id), Some(progress)) => format!("{id}: {status} {progress}"),
            (Some(id), None) => format!("{id}: {status}"),
            (None, _) => status.to_string(),
        };
        Some(line)
    }
}

pub type ProgressStream<'a> = BoxStream<'a, Result<ProgressMessage>>;

/// What the builder asks the daemon to build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    pub dockerfile: String,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub platform: String,
    pub pull_parent: bool,
}

/// The slice of the container daemon's image API used by the provider.
#[async_trait]
pub trait ImageDaemon: Send + Sync {
    /// `os/arch` of the daemon.
    async fn platform(&self) -> Result<String>;
    fn pull<'a>(
        &'a self,
        image: &'a ImageReference,
        credential: Option<Credential>,
    ) -> ProgressStream<'a>;
    fn build<'a>(&'a self, request: BuildRequest, context: Vec<u8>) -> ProgressStream<'a>;
    async fn tag(&self, source: &str, target: &ImageReference) -> Result<()>;
    fn push<'a>(
        &'a self,
        image: &'a ImageReference,
        credential: Option<Credential>,
    ) -> ProgressStream<'a>;
}

/// Writes each progress line to `out`. Fails when the last message carries an error.
pub async fn drain_progress<W>(mut stream: ProgressStream<'_>, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut last = None;
    while let Some(message) = stream.next().await {
        let message = message?;
        if let Some(line) = message.display_line() {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        last = Some(message);
    }
    out.flush().await?;

    if let Some(error) = last.and_then(|m| m.error).filter(|e| !e.is_empty()) {
        bail!("{error}");
    }
    Ok(())
}

/// Stands in for the daemon when none is reachable. Every call fails.
#[derive(Debug, Clone, Default)]
pub struct OfflineDaemon;

const OFFLINE: &str = "no Docker daemon is available";

#[async_trait]
impl ImageDaemon for OfflineDaemon {
    async fn platform(&self) -> Result<String> {
        bail!(OFFLINE)
    }

    fn pull<'a>(&'a self, _: &'a ImageReference, _: Option<Credential>) -> ProgressStream<'a> {
        futures::stream::once(async { Err(anyhow::anyhow!(OFFLINE)) }).boxed()
    }

    fn build<'a>(&'a self, _: BuildRequest, _: Vec<u8>) -> ProgressStream<'a> {
        futures::stream::once(async { Err(anyhow::anyhow!(OFFLINE)) }).boxed()
    }

    async fn tag(&self, _: &str, _: &ImageReference) -> Result<()> {
        bail!(OFFLINE)
    }

    fn push<'a>(&'a self, _: &'a ImageReference, _: Option<Credential>) -> ProgressStream<'a> {
        futures::stream::once(async { Err(anyhow::anyhow!(OFFLINE)) }).boxed()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use futures::stream;

    use super::*;

    /// Records every daemon call; replays canned build output.
    #[derive(Default, Clone)]
    pub struct FakeDaemon {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub builds: Arc<Mutex<Vec<(BuildRequest, Vec<u8>)>>>,
        pub credentials: Arc<Mutex<Vec<Option<Credential>>>>,
        pub build_output: Vec<ProgressMessage>,
        pub pull_output: Vec<ProgressMessage>,
    }

    #[async_trait]
    impl ImageDaemon for FakeDaemon {
        async fn platform(&self) -> Result<String> {
            Ok("linux/amd64".into())
        }

        fn pull<'a>(
            &'a self,
            image: &'a ImageReference,
            credential: Option<Credential>,
        ) -> ProgressStream<'a> {
            self.calls.lock().unwrap().push(format!("pull {}", image.raw()));
            self.credentials.lock().unwrap().push(credential);
            stream::iter(self.pull_output.clone().into_iter().map(Ok)).boxed()
        }

        fn build<'a>(&'a self, request: BuildRequest, context: Vec<u8>) -> ProgressStream<'a> {
            self.calls.lock().unwrap().push(format!("build {}", request.tag));
            self.builds.lock().unwrap().push((request, context));
            stream::iter(self.build_output.clone().into_iter().map(Ok)).boxed()
        }

        async fn tag(&self, source: &str, target: &ImageReference) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("tag {source} {}", target.raw()));
            Ok(())
        }

        fn push<'a>(
            &'a self,
            image: &'a ImageReference,
            credential: Option<Credential>,
        ) -> ProgressStream<'a> {
            self.calls.lock().unwrap().push(format!("push {}", image.raw()));
            self.credentials.lock().unwrap().push(credential);
            stream::iter(vec![Ok(ProgressMessage {
                status: Some("Pushed".into()),
                ..Default::default()
            })])
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn offline_daemon_fails_every_call() {
        let daemon = OfflineDaemon;
        let image: ImageReference = "alpine:3.19".parse().unwrap();
        assert!(daemon.platform().await.is_err());
        let mut sink = Vec::new();
        let err = drain_progress(daemon.pull(&image, None), &mut sink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no Docker daemon"));
    }

    #[tokio::test]
    async fn drain_writes_lines_and_succeeds() {
        let messages = vec![
            Ok(ProgressMessage::stream("Step 1/2 : FROM alpine\n")),
            Ok(ProgressMessage {
                status: Some("Downloading".into()),
                id: Some("abc".into()),
                progress: Some("[==>  ]".into()),
                ..Default::default()
            }),
            Ok(ProgressMessage::stream("\n")),
        ];
        let mut out = Vec::new();
        drain_progress(stream::iter(messages).boxed(), &mut out)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "Step 1/2 : FROM alpine\nabc: Downloading [==>  ]\n");
    }

    #[tokio::test]
    async fn drain_fails_on_final_error_line() {
        let messages = vec![
            Ok(ProgressMessage::stream("Step 1/2 : FROM alpine\n")),
            Ok(ProgressMessage::error("COPY failed: no such file")),
        ];
        let mut out = Vec::new();
        let err = drain_progress(stream::iter(messages).boxed(), &mut out)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("COPY failed"));
    }

    #[tokio::test]
    async fn drain_ignores_errors_that_are_not_last() {
        let messages = vec![
            Ok(ProgressMessage::error("transient")),
            Ok(ProgressMessage::stream("Successfully built\n")),
        ];
        let mut out = Vec::new();
        drain_progress(stream::iter(messages).boxed(), &mut out)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drain_propagates_stream_errors() {
        let messages = vec![Err(anyhow::anyhow!("connection reset"))];
        let mut out = Vec::new();
        assert!(
            drain_progress(stream::iter(messages).boxed(), &mut out)
                .await
                .is_err()
        );
    }

    #[test]
    fn progress_message_decodes_daemon_json() {
        let msg: ProgressMessage =
            serde_json::from_str(r#"{"error":"boom","errorDetail":{"message":"boom"}}"#).unwrap();
        assert_eq!(msg.error.as_deref(), Some("boom"));
    }
}
