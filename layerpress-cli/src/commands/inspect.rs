use anyhow::Result;
use console::style;
use tabled::{Table, Tabled};

use layerpress::digest::sha256_hex;
use layerpress::manifest::{ImageManifest, ManifestList};
use layerpress::registry::{FetchedManifest, RegistryClient};
use layerpress::{ContentStore, ImageReference, LayoutStore, config};

use super::export::LayerRow;
use crate::error::{self, LayerpressCliError};
use crate::utils;

#[derive(Tabled)]
struct PlatformRow {
    #[tabled(rename = "Platform")]
    platform: String,
    #[tabled(rename = "Digest")]
    digest: String,
    #[tabled(rename = "Size")]
    size: String,
}

/// Shows the layers of a stored manifest, looked up by digest or image name,
/// falling back to the registry for names that were never exported here.
pub async fn execute(image: &str) -> Result<()> {
    let store = LayoutStore::open(config::get_layerpress_dir())?;

    if let Some((digest, manifest)) = find_local(&store, image)? {
        utils::print_header(&format!("Manifest {digest}"));
        print_manifest(&manifest);
        return Ok(());
    }

    match fetch_remote(image).await? {
        FetchedManifest::Image(manifest) => print_manifest(&manifest),
        FetchedManifest::Index(index) => print_index(&index),
    }
    Ok(())
}

async fn fetch_remote(image: &str) -> error::Result<FetchedManifest> {
    let reference = ImageReference::parse(image)?;
    utils::print_header(&format!("Fetching {reference}"));
    let pb = utils::spinner("Contacting registry...");
    let mut client = RegistryClient::new(&reference.registry_url());
    let fetched = client
        .get_image_manifest(&reference.repository, reference.manifest_reference())
        .await;
    pb.finish_and_clear();
    Ok(fetched?)
}

fn find_local(store: &LayoutStore, image: &str) -> error::Result<Option<(String, ImageManifest)>> {
    let digest = if sha256_hex(image).is_some() {
        if !store.contains(image) {
            return Err(LayerpressCliError::Input(format!(
                "manifest {image} is not in the local store"
            )));
        }
        Some(image.to_string())
    } else {
        let canonical = ImageReference::parse(image).ok().map(|r| r.to_string());
        store
            .list_images()?
            .into_iter()
            .find(|(name, _)| name == image || canonical.as_deref() == Some(name.as_str()))
            .map(|(_, descriptor)| descriptor.digest)
    };

    let Some(digest) = digest else {
        return Ok(None);
    };
    let manifest: ImageManifest = serde_json::from_slice(&store.get(&digest)?)?;
    Ok(Some((digest, manifest)))
}

fn print_manifest(manifest: &ImageManifest) {
    println!("{} {}", style("Media type:").bold(), manifest.media_type);
    println!(
        "{} {}",
        style("Config:").bold(),
        utils::short_digest(&manifest.config.digest)
    );

    let rows: Vec<LayerRow> = manifest
        .layers
        .iter()
        .enumerate()
        .map(|(index, layer)| LayerRow {
            index,
            digest: utils::short_digest(&layer.digest).to_string(),
            media_type: layer.media_type.clone(),
            size: utils::format_size(layer.size),
        })
        .collect();
    println!("{}", Table::new(rows));

    let total: u64 = manifest.layers.iter().map(|layer| layer.size).sum();
    utils::print_info(&format!(
        "{} layer(s), {} total",
        manifest.layers.len(),
        utils::format_size(total)
    ));
}

fn print_index(index: &ManifestList) {
    utils::print_warning("Reference points at a multi-platform index");
    let rows: Vec<PlatformRow> = index
        .manifests
        .iter()
        .map(|entry| PlatformRow {
            platform: entry
                .platform
                .as_ref()
                .map(|p| match &p.variant {
                    Some(variant) => format!("{}/{}/{}", p.os, p.architecture, variant),
                    None => format!("{}/{}", p.os, p.architecture),
                })
                .unwrap_or_else(|| "unknown".to_string()),
            digest: utils::short_digest(&entry.digest).to_string(),
            size: utils::format_size(entry.size),
        })
        .collect();
    println!("{}", Table::new(rows));
}
