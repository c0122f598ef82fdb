use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::{StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::progress::{NoopProgress, ProgressTracker};
use crate::config;
use crate::export::Manifest;
use crate::manifest::{
    Descriptor, ImageManifest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST, ManifestList,
};
use crate::store::ContentStore;

const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Header not found: {0}")]
    HeaderNotFound(String),

    #[error("Token fetch failed with status code {0}")]
    TokenFetchFailed(u16),

    #[error("Token not found")]
    TokenNotFound,

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Manifest not found")]
    ManifestNotFound,

    #[error("Manifest parse error: {0}")]
    ManifestParseError(#[from] serde_json::Error),

    #[error("Download error with status code {0}")]
    DownloadError(u16),

    #[error("Upload of {digest} failed with status code {status}")]
    UploadError { digest: String, status: u16 },

    #[error("Invalid upload location: {0}")]
    InvalidLocation(String),

    #[error("Manifest upload failed with status code {0}")]
    ManifestUploadError(u16),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Deserialize, Serialize)]
struct TokenResponse {
    pub token: Option<String>,
    pub access_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// A manifest as served by a registry: either a single image or an index of
/// per-platform images.
#[derive(Debug)]
pub enum FetchedManifest {
    Image(ImageManifest),
    Index(ManifestList),
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Default, PartialEq, Eq)]
struct AuthChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parses a bearer challenge such as
/// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push"`.
/// Quoted values may contain commas. Returns `None` for other schemes.
fn parse_challenge(value: &str) -> Option<AuthChallenge> {
    let (scheme, params) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut challenge = AuthChallenge::default();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let after = after.trim_start();
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = value.to_string(),
            "service" => challenge.service = Some(value.to_string()),
            "scope" => challenge.scope = Some(value.to_string()),
            _ => {}
        }
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    (!challenge.realm.is_empty()).then_some(challenge)
}

#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    registry_url: String,
    auth_token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    progress: Arc<dyn ProgressTracker>,
}

impl RegistryClient {
    pub fn new(registry_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            registry_url: registry_url.trim_end_matches('/').to_string(),
            auth_token: None,
            username: None,
            password: None,
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_credentials(registry_url: &str, username: &str, password: &str) -> Self {
        let mut client = Self::new(registry_url);
        client.username = Some(username.to_string());
        client.password = Some(password.to_string());
        client
    }

    pub fn with_token(registry_url: &str, token: &str) -> Self {
        let mut client = Self::new(registry_url);
        client.auth_token = Some(token.to_string());
        client
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    #[cfg(feature = "progress")]
    pub fn enable_progress(self) -> Self {
        self.with_progress(Arc::new(super::progress::IndicatifProgress::new()))
    }

    /// Fetches a bearer token for `repository` with the given actions
    /// (`pull` or `pull,push`) when the registry asks for one. Registries
    /// using basic auth get the credentials on every request instead.
    async fn authenticate(&mut self, repository: &str, actions: &str) -> Result<()> {
        if self.auth_token.is_some() {
            return Ok(());
        }

        let response = self
            .http
            .get(format!("{}/v2/", self.registry_url))
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(());
        }

        let auth_header = header::WWW_AUTHENTICATE.as_str();
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .ok_or_else(|| RegistryError::HeaderNotFound(auth_header.to_string()))?
            .to_str()
            .map_err(|_| RegistryError::HeaderNotFound(auth_header.to_string()))?;
        let Some(challenge) = parse_challenge(challenge) else {
            return Ok(());
        };

        let scope = format!("repository:{repository}:{actions}");
        let mut request = self
            .http
            .get(&challenge.realm)
            .query(&[("scope", scope.as_str())]);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::TokenFetchFailed(response.status().as_u16()));
        }

        let auth_response: TokenResponse = response.json().await?;
        let token = auth_response
            .token
            .or(auth_response.access_token)
            .ok_or(RegistryError::TokenNotFound)?;
        self.auth_token = Some(token);

        Ok(())
    }

    fn with_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        } else if let (Some(username), Some(password)) = (&self.username, &self.password) {
            request = request.basic_auth(username, Some(password));
        }
        request
    }

    pub async fn get_image_manifest(
        &mut self,
        repository: &str,
        tag_or_digest: &str,
    ) -> Result<FetchedManifest> {
        self.authenticate(repository, "pull").await?;

        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, repository, tag_or_digest
        );
        let accept = [
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        ]
        .join(", ");
        let response = self
            .with_auth(self.http.get(&url).header(header::ACCEPT, accept))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(RegistryError::ManifestNotFound),
            status if !status.is_success() => {
                return Err(RegistryError::DownloadError(status.as_u16()));
            }
            _ => {}
        }

        let content_type_header = header::CONTENT_TYPE.as_str();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .ok_or_else(|| RegistryError::HeaderNotFound(content_type_header.to_string()))?
            .to_str()
            .map_err(|_| RegistryError::HeaderNotFound(content_type_header.to_string()))?;
        let content_type = content_type.split(';').next().unwrap_or_default().trim();

        match content_type {
            MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST => {
                Ok(FetchedManifest::Image(response.json().await?))
            }
            MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST => {
                Ok(FetchedManifest::Index(response.json().await?))
            }
            other => Err(RegistryError::UnsupportedContentType(other.to_string())),
        }
    }

    pub async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{}/blobs/{}", self.registry_url, repository, digest);
        let response = self.with_auth(self.http.head(url)).send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RegistryError::UploadError {
                digest: digest.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    /// Monolithic upload: opens an upload session, then sends the whole blob
    /// with the closing `PUT`.
    pub async fn push_blob(&self, repository: &str, digest: &str, data: Vec<u8>) -> Result<()> {
        let upload_error = |status: StatusCode| RegistryError::UploadError {
            digest: digest.to_string(),
            status: status.as_u16(),
        };

        let url = format!("{}/v2/{}/blobs/uploads/", self.registry_url, repository);
        let response = self.with_auth(self.http.post(url)).send().await?;
        if !response.status().is_success() {
            return Err(upload_error(response.status()));
        }
        let location_header = header::LOCATION.as_str();
        let location = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| RegistryError::HeaderNotFound(location_header.to_string()))?
            .to_str()
            .map_err(|_| RegistryError::HeaderNotFound(location_header.to_string()))?;
        let upload_url = upload_url(&self.registry_url, location, digest)?;

        let total = data.len() as u64;
        self.progress.start_upload(digest, total);
        match self.put_blob_data(upload_url, digest, Bytes::from(data)).await {
            Ok(()) => {
                self.progress.finish(digest, false);
                debug!(digest, size = total, "pushed blob");
                Ok(())
            }
            Err(e) => {
                self.progress.fail(digest);
                Err(e)
            }
        }
    }

    async fn put_blob_data(&self, upload_url: Url, digest: &str, data: Bytes) -> Result<()> {
        let total = data.len() as u64;
        let progress = Arc::clone(&self.progress);
        let key = digest.to_string();
        let body = reqwest::Body::wrap_stream(stream::iter(upload_chunks(data)).map(move |chunk| {
            progress.update(&key, chunk.len() as u64);
            Ok::<_, io::Error>(chunk)
        }));

        let response = self
            .with_auth(self.http.put(upload_url))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, total)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::UploadError {
                digest: digest.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, repository, reference
        );
        let response = self
            .with_auth(self.http.put(url))
            .header(header::CONTENT_TYPE, media_type)
            .body(bytes)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::ManifestUploadError(response.status().as_u16()));
        }
        Ok(())
    }

    /// Pushes every blob of `manifest` that the registry does not have yet,
    /// then the manifest itself under `tag`.
    pub async fn push_image(
        &mut self,
        repository: &str,
        tag: &str,
        manifest: &Manifest,
        store: &dyn ContentStore,
    ) -> Result<()> {
        self.authenticate(repository, "pull,push").await?;

        let tasks: Vec<_> = manifest
            .blobs()
            .map(|descriptor| self.upload_if_missing(repository, descriptor, store))
            .collect();
        stream::iter(tasks)
            .buffer_unordered(config::get_concurrent_uploads())
            .try_collect::<Vec<_>>()
            .await?;

        self.put_manifest(repository, tag, &manifest.media_type, manifest.bytes.clone())
            .await?;
        debug!(repository, tag, digest = %manifest.digest, "pushed manifest");
        Ok(())
    }

    async fn upload_if_missing(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        store: &dyn ContentStore,
    ) -> Result<()> {
        if self.blob_exists(repository, &descriptor.digest).await? {
            debug!(digest = %descriptor.digest, "blob already in registry");
            self.progress.finish(&descriptor.digest, true);
            return Ok(());
        }
        let data = store.get(&descriptor.digest)?;
        self.push_blob(repository, &descriptor.digest, data).await
    }
}

/// Splits `data` into upload-sized views of the same buffer.
fn upload_chunks(data: Bytes) -> impl Iterator<Item = Bytes> + Send + 'static {
    let len = data.len();
    (0..len)
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(move |start| data.slice(start..len.min(start + UPLOAD_CHUNK_SIZE)))
}

/// Resolves an upload `Location` (absolute or relative to the registry) and
/// appends the `digest` query parameter that closes the upload.
fn upload_url(registry_url: &str, location: &str, digest: &str) -> Result<Url> {
    let invalid = |e: &dyn std::fmt::Display| RegistryError::InvalidLocation(format!("{location}: {e}"));
    let base = Url::parse(registry_url).map_err(|e| invalid(&e))?;
    let mut url = base.join(location).map_err(|e| invalid(&e))?;
    url.query_pairs_mut().append_pair("digest", digest);
    Ok(url)
}
