//! OCI registry client and the publisher used to push exported images.

pub mod client;
pub mod progress;
pub mod publisher;

/// Re-export of the high level registry client.
pub use client::{FetchedManifest, RegistryClient, RegistryError};
pub use publisher::{Publisher, RegistryPublisher};
