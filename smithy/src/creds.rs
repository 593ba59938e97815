use std::fmt;

use anyhow::bail;

use crate::error::Error;

/// Username and password for a registry host.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Looks up credentials by registry host.
pub trait CredentialStore: Send + Sync {
    fn get(&self, host: &str) -> Option<Credential>;
}

/// Serves a single credential for exactly one host.
#[derive(Debug, Clone)]
pub struct StaticStore {
    host: String,
    credential: Credential,
}

impl StaticStore {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let host = host.into();
        let username = username.into();
        let password = password.into();

        if host.is_empty() {
            bail!(Error::Configuration("registry host is empty".into()));
        }
        if host.contains(char::is_whitespace) {
            bail!(Error::Configuration(format!("invalid registry host '{host}'")));
        }
        if username.is_empty() {
            bail!(Error::Configuration("registry username is empty".into()));
        }
        if password.is_empty() {
            bail!(Error::Configuration("registry password is empty".into()));
        }

        Ok(Self {
            host,
            credential: Credential { username, password },
        })
    }
}

impl CredentialStore for StaticStore {
    fn get(&self, host: &str) -> Option<Credential> {
        (host == self.host).then(|| self.credential.clone())
    }
}

/// Never returns credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl CredentialStore for NoopStore {
    fn get(&self, _host: &str) -> Option<Credential> {
        None
    }
}
