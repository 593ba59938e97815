//! Component packages stored as OCI artifacts.
//!
//! A package is a manifest with a single layer holding the component YAML,
//! an empty config blob and a fixed set of `smithy.*` annotations.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::OciImageManifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::component::Component;
use crate::creds::CredentialStore;
use crate::error::Error;
use crate::images::ImageReference;

pub const COMPONENT_MEDIA_TYPE: &str = "application/vnd.custom.smithy-component+yaml";
pub const EMPTY_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";
pub const DEFAULT_REGISTRY_HOST: &str = "ghcr.io";
pub const DEFAULT_REGISTRY_NAMESPACE: &str = "smithy-security/smithy/manifests/components";
pub const DEFAULT_COMPONENT_VERSION: &str = "latest";

const SOURCE_TREE_URL: &str = "https://github.com/smithy-security/smithy/tree/main";
const SOURCE_ROOT: &str = "new-components";

/// Manifest annotation keys.
pub mod annotations {
    pub const SDK_VERSION: &str = "smithy.sdk.version";
    pub const COMPONENT_DESCRIPTION: &str = "smithy.component.description";
    pub const COMPONENT_NAME: &str = "smithy.component.name";
    pub const COMPONENT_TYPE: &str = "smithy.component.type";
    pub const COMPONENT_VERSION: &str = "smithy.component.version";
    pub const COMPONENT_SOURCE: &str = "smithy.component.source";
    pub const COMPONENT_URL: &str = "smithy.component.url";

    pub const ALL: [&str; 7] = [
        SDK_VERSION,
        COMPONENT_DESCRIPTION,
        COMPONENT_NAME,
        COMPONENT_TYPE,
        COMPONENT_VERSION,
        COMPONENT_SOURCE,
        COMPONENT_URL,
    ];
}

#[derive(Debug, Clone)]
pub struct PackageRequest {
    pub component: Component,
    /// Repository path under the namespace; `<kind plural>/<name>` when unset.
    pub component_path: Option<String>,
    pub sdk_version: String,
    /// Manifest tag; `latest` when unset.
    pub component_version: Option<String>,
}

impl PackageRequest {
    pub fn new(component: Component, sdk_version: impl Into<String>) -> Self {
        Self {
            component,
            component_path: None,
            sdk_version: sdk_version.into(),
            component_version: None,
        }
    }

    pub fn with_component_path(mut self, path: impl Into<String>) -> Self {
        self.component_path = Some(path.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.component_version = Some(version.into());
        self
    }

    fn component_path(&self) -> String {
        self.component_path
            .clone()
            .filter(|p| !p.trim_matches('/').is_empty())
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_else(|| {
                format!("{}/{}", self.component.kind.plural(), self.component.name)
            })
    }

    fn version(&self) -> &str {
        self.component_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_COMPONENT_VERSION)
    }

    fn annotations(&self) -> BTreeMap<String, String> {
        let source = format!("{SOURCE_ROOT}/{}", self.component_path());
        let url = format!("{SOURCE_TREE_URL}/{source}");
        [
            (annotations::SDK_VERSION, self.sdk_version.clone()),
            (
                annotations::COMPONENT_DESCRIPTION,
                self.component.description.clone(),
            ),
            (annotations::COMPONENT_NAME, self.component.name.clone()),
            (annotations::COMPONENT_TYPE, self.component.kind.to_string()),
            (annotations::COMPONENT_VERSION, self.version().to_string()),
            (annotations::COMPONENT_SOURCE, source),
            (annotations::COMPONENT_URL, url),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPackageResponse {
    pub component: Component,
    pub annotations: BTreeMap<String, String>,
}

/// Retrieves packaged components by OCI reference.
#[async_trait]
pub trait ComponentFetcher: Send + Sync {
    async fn fetch_package(&self, reference: &ImageReference) -> Result<FetchPackageResponse>;
}

/// Package registry speaking the OCI distribution API.
pub struct OciRegistry {
    host: String,
    namespace: String,
    credentials: Arc<dyn CredentialStore>,
    client: Client,
}

impl OciRegistry {
    /// `insecure` switches to plain HTTP.
    pub fn new(
        host: impl Into<String>,
        namespace: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
        insecure: bool,
    ) -> Result<Self> {
        let host = host.into();
        let namespace = namespace.into().trim_matches('/').to_string();

        if host.is_empty() {
            bail!(Error::Configuration("registry host is required".into()));
        }
        if host.contains("://") || host.contains('/') || host.contains(char::is_whitespace) {
            bail!(Error::Configuration(format!(
                "registry host '{host}' must be a bare host[:port]"
            )));
        }
        if namespace.is_empty() {
            bail!(Error::Configuration("registry namespace is required".into()));
        }

        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });

        Ok(Self {
            host,
            namespace,
            credentials,
            client,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn auth(&self, registry: &str) -> RegistryAuth {
        match self.credentials.get(registry) {
            Some(credential) => RegistryAuth::Basic(credential.username, credential.password),
            None => RegistryAuth::Anonymous,
        }
    }

    /// Pushes the component as a tagged manifest and returns its reference.
    #[instrument(skip(self, request), fields(
        component = %request.component.name,
        kind = %request.component.kind,
        version = request.version(),
        sdk_version = %request.sdk_version,
    ))]
    pub async fn package(&self, request: PackageRequest) -> Result<String> {
        if request.sdk_version.is_empty() {
            bail!(Error::Validation("SDK version is required".into()));
        }
        if request.component.name.is_empty() {
            bail!(Error::Validation("component name is required".into()));
        }

        let repository = format!("{}/{}", self.namespace, request.component_path());
        let version = request.version().to_string();
        let reference = Reference::with_tag(self.host.clone(), repository.clone(), version.clone());

        let blob = serde_yaml::to_string(&request.component)
            .context("could not marshal component")?
            .into_bytes();
        let layers = vec![ImageLayer::new(blob, COMPONENT_MEDIA_TYPE.to_string(), None)];
        let config = Config::new(b"{}".to_vec(), EMPTY_CONFIG_MEDIA_TYPE.to_string(), None);

        let mut manifest = OciImageManifest::build(
            &layers,
            &config,
            Some(request.annotations().into_iter().collect()),
        );
        manifest.artifact_type = Some(COMPONENT_MEDIA_TYPE.to_string());

        debug!(repository = %repository, "pushing component package");
        let response = self
            .client
            .push(&reference, &layers, config, &self.auth(&self.host), Some(manifest))
            .await
            .map_err(|e| registry_error(e, format!("could not push package {repository}:{version}")))?;

        let reference = format!("{}/{repository}:{version}", self.host);
        info!(reference = %reference, manifest = %response.manifest_url, "packaged component");
        Ok(reference)
    }

    /// Fetches a package by `host/path:tag`. The tag is mandatory.
    #[instrument(skip(self), fields(reference = %reference.raw()))]
    pub async fn fetch_package(&self, reference: &ImageReference) -> Result<FetchPackageResponse> {
        if reference.explicit_tag().is_none() {
            bail!(Error::Validation(format!(
                "package reference '{}' must carry a tag",
                reference.raw()
            )));
        }

        let image = self
            .client
            .pull(
                reference.as_oci(),
                &self.auth(reference.registry()),
                vec![COMPONENT_MEDIA_TYPE],
            )
            .await
            .map_err(|e| registry_error(e, format!("could not pull package {}", reference.raw())))?;

        let Some(layer) = image.layers.first() else {
            bail!(Error::RegistryProtocol(format!(
                "package {} has no layers",
                reference.raw()
            )));
        };
        if let Some(other) = image
            .layers
            .iter()
            .find(|l| l.media_type != COMPONENT_MEDIA_TYPE)
        {
            bail!(Error::RegistryProtocol(format!(
                "package {} has a layer with unsupported media type '{}'",
                reference.raw(),
                other.media_type
            )));
        }

        let manifest = image.manifest.as_ref();
        if let Some(manifest) = manifest {
            for (descriptor, pulled) in manifest.layers.iter().zip(&image.layers) {
                let actual = sha256_digest(&pulled.data);
                if actual != descriptor.digest {
                    bail!(Error::RegistryProtocol(format!(
                        "digest mismatch for layer '{}': got '{actual}'",
                        descriptor.digest
                    )));
                }
            }
        }

        let component: Component = serde_yaml::from_slice(&layer.data)
            .with_context(|| format!("could not decode component from {}", reference.raw()))?;
        let annotations: BTreeMap<String, String> = manifest
            .and_then(|m| m.annotations.as_ref())
            .map(|a| a.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        debug!(component = %component.name, "fetched package");
        Ok(FetchPackageResponse {
            component,
            annotations,
        })
    }
}

#[async_trait]
impl ComponentFetcher for OciRegistry {
    async fn fetch_package(&self, reference: &ImageReference) -> Result<FetchPackageResponse> {
        OciRegistry::fetch_package(self, reference).await
    }
}

/// `sha256:<hex>` content digest.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn registry_error<E>(err: E, action: String) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    anyhow::Error::new(err).context(Error::RegistryProtocol(action))
}
