//! Source addresses.
//!
//! Camera URIs are assembled from named configuration fields as
//! `scheme://[username[:password]@]host:port/path`. Credentials are kept in
//! the URI handed to connectors; everything that logs uses `redacted()` (or
//! `Display`, which is the redacted form).

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_SCHEME: &str = "rtsp";
pub const DEFAULT_RTSP_PORT: u16 = 554;
pub const DEFAULT_ENDPOINT: &str = "live";

/// Per-camera connection fields.
///
/// `url` wins when set; otherwise the URI is assembled from the other fields.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CameraSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            url: None,
            scheme: default_scheme(),
            username: String::new(),
            password: String::new(),
            address: String::new(),
            port: DEFAULT_RTSP_PORT,
            endpoint: default_endpoint(),
        }
    }
}

impl CameraSettings {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn source_uri(&self) -> Result<SourceUri> {
        if let Some(url) = self.url.as_deref().filter(|url| !url.trim().is_empty()) {
            return SourceUri::parse(url);
        }
        SourceUri::from_parts(
            &self.scheme,
            &self.username,
            &self.password,
            &self.address,
            self.port,
            &self.endpoint,
        )
    }
}

/// A parsed source address.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceUri(Url);

impl SourceUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim()).with_context(|| format!("parse source uri '{}'", redact_raw(raw)))?;
        if url.scheme() != "file" && url.host_str().map_or(true, str::is_empty) {
            return Err(anyhow!("source uri '{}' has no host", redact_raw(raw)));
        }
        Ok(Self(url))
    }

    pub fn from_parts(
        scheme: &str,
        username: &str,
        password: &str,
        host: &str,
        port: u16,
        path: &str,
    ) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(anyhow!("camera address is empty"));
        }
        let mut url = Url::parse(&format!(
            "{}://{}:{}/{}",
            scheme,
            host.trim(),
            port,
            path.trim_start_matches('/')
        ))
        .with_context(|| format!("assemble {} uri for host {}", scheme, host))?;
        if !username.is_empty() {
            url.set_username(username)
                .map_err(|_| anyhow!("scheme {} cannot carry credentials", scheme))?;
            if !password.is_empty() {
                url.set_password(Some(password))
                    .map_err(|_| anyhow!("scheme {} cannot carry credentials", scheme))?;
            }
        }
        Ok(Self(url))
    }

    pub fn from_file_path(path: &Path) -> Result<Self> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("resolve current directory")?
                .join(path)
        };
        let url = Url::from_file_path(&absolute)
            .map_err(|_| anyhow!("cannot express {} as a file uri", absolute.display()))?;
        Ok(Self(url))
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    pub fn host(&self) -> Option<&str> {
        self.0.host_str()
    }

    /// Full URI including credentials. Never log this.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        if self.scheme() == "file" {
            self.0.to_file_path().ok()
        } else {
            None
        }
    }

    pub fn query_value(&self, key: &str) -> Option<String> {
        self.0
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// URI with the password replaced by `***`.
    pub fn redacted(&self) -> String {
        if self.0.password().is_none() {
            return self.0.to_string();
        }
        let mut url = self.0.clone();
        // cannot fail: the url already carries a password
        let _ = url.set_password(Some("***"));
        url.to_string()
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceUri").field(&self.redacted()).finish()
    }
}

/// Everything between the scheme and the last `@` is treated as userinfo,
/// so passwords containing `@` are hidden too.
fn redact_raw(raw: &str) -> String {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{}://***@{}", scheme, host),
        None => raw.to_string(),
    }
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

fn default_port() -> u16 {
    DEFAULT_RTSP_PORT
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
