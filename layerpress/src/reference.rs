use std::fmt;
use std::str::FromStr;

use crate::error::{ExportError, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DOCKER_HUB_REGISTRY_URL: &str = "https://registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

/// A parsed `[registry/]repository[:tag][@digest]` image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parses an image name, applying the Docker Hub defaults:
    ///
    /// - `alpine` → `docker.io/library/alpine:latest`
    /// - `me/app:v1` → `docker.io/me/app:v1`
    /// - `localhost:5000/app` → `localhost:5000/app:latest`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let invalid = || ExportError::InvalidReference(reference.to_string());
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if crate::digest::sha256_hex(digest).is_none() {
                    return Err(invalid());
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon only separates the tag when it comes after the last slash,
        // otherwise it belongs to a registry port.
        let last_slash = name_tag.rfind('/').map_or(0, |pos| pos + 1);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], &name_tag[split + 1..])
            }
            None => (name_tag, DEFAULT_TAG),
        };
        if name.is_empty() || tag.is_empty() {
            return Err(invalid());
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid());
        }

        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
            digest,
        })
    }

    /// Base URL of the registry API. Loopback registries are reached over
    /// plain http.
    pub fn registry_url(&self) -> String {
        if self.registry == DEFAULT_REGISTRY {
            return DOCKER_HUB_REGISTRY_URL.to_string();
        }
        let host = self.registry.split(':').next().unwrap_or_default();
        if host == "localhost" || host == "127.0.0.1" {
            format!("http://{}", self.registry)
        } else {
            format!("https://{}", self.registry)
        }
    }

    /// The manifest reference to fetch: the digest when pinned, else the tag.
    pub fn manifest_reference(&self) -> &str {
        self.digest.as_deref().unwrap_or(&self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
