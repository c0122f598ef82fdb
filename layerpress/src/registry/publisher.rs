use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::client::{RegistryClient, RegistryError};
use crate::export::Manifest;
use crate::reference::ImageReference;
use crate::store::ContentStore;

/// Destination for finished images.
///
/// Called at most once per export, after the manifest and every blob it
/// references are in `store`.
pub trait Publisher: Send + Sync {
    fn publish<'a>(
        &'a self,
        target: &'a ImageReference,
        manifest: &'a Manifest,
        store: Arc<dyn ContentStore>,
    ) -> BoxFuture<'a, Result<(), RegistryError>>;
}

/// Pushes images to the registry named in their target reference.
#[derive(Debug, Clone, Default)]
pub struct RegistryPublisher {
    username: Option<String>,
    password: Option<String>,
    progress: bool,
}

impl RegistryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Shows upload progress bars when the `progress` feature is enabled.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    fn client_for(&self, target: &ImageReference) -> RegistryClient {
        let registry_url = target.registry_url();
        let client = match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                RegistryClient::with_credentials(&registry_url, username, password)
            }
            _ => RegistryClient::new(&registry_url),
        };

        #[cfg(feature = "progress")]
        if self.progress {
            return client.enable_progress();
        }
        client
    }
}

impl Publisher for RegistryPublisher {
    fn publish<'a>(
        &'a self,
        target: &'a ImageReference,
        manifest: &'a Manifest,
        store: Arc<dyn ContentStore>,
    ) -> BoxFuture<'a, Result<(), RegistryError>> {
        Box::pin(async move {
            let mut client = self.client_for(target);
            client
                .push_image(&target.repository, &target.tag, manifest, store.as_ref())
                .await
        })
    }
}
