use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, instrument};

use super::{drain_progress, ImageDaemon};
use crate::creds::CredentialStore;
use crate::images::{ImageReference, Report, ResolutionOptions, Resolver};

/// Pulls external images and returns the reference unchanged.
pub struct DockerPuller {
    daemon: Arc<dyn ImageDaemon>,
    credentials: Arc<dyn CredentialStore>,
    dry_run: bool,
    pulled: Mutex<BTreeSet<String>>,
}

impl DockerPuller {
    pub fn new(
        daemon: Arc<dyn ImageDaemon>,
        credentials: Arc<dyn CredentialStore>,
        dry_run: bool,
    ) -> Self {
        Self {
            daemon,
            credentials,
            dry_run,
            pulled: Mutex::new(BTreeSet::new()),
        }
    }

    #[instrument(skip(self), fields(image = %image_ref))]
    pub async fn pull(&self, image_ref: &str) -> Result<String> {
        let reference: ImageReference = image_ref
            .parse()
            .with_context(|| format!("could not parse image reference '{image_ref}'"))?;

        if let Ok(mut pulled) = self.pulled.lock() {
            pulled.insert(image_ref.to_string());
        }
        if self.dry_run {
            return Ok(image_ref.to_string());
        }

        info!("pulling image");
        let credential = self.credentials.get(reference.registry());
        let mut stderr = tokio::io::stderr();
        drain_progress(self.daemon.pull(&reference, credential), &mut stderr)
            .await
            .with_context(|| format!("{image_ref}: could not pull image"))?;

        Ok(image_ref.to_string())
    }
}

#[async_trait]
impl Resolver for DockerPuller {
    async fn resolve(&self, image_ref: &str, _options: &ResolutionOptions) -> Result<String> {
        self.pull(image_ref).await
    }

    fn report(&self) -> Report {
        Report {
            external_images: self
                .pulled
                .lock()
                .map(|p| p.clone())
                .unwrap_or_default(),
            custom_images: vec![],
        }
    }
}
