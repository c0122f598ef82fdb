use anyhow::Result;
use tabled::{Table, Tabled};

use layerpress::manifest::ImageManifest;
use layerpress::{ContentStore, LayoutStore, config};

use crate::utils;

#[derive(Tabled)]
struct ImageInfo {
    #[tabled(rename = "Image")]
    name: String,
    #[tabled(rename = "Manifest")]
    digest: String,
    #[tabled(rename = "Layers")]
    layers: usize,
    #[tabled(rename = "Size")]
    size: String,
}

pub async fn execute() -> Result<()> {
    utils::print_header("Exported Images");
    let store = LayoutStore::open(config::get_layerpress_dir())?;

    let images: Vec<ImageInfo> = store
        .list_images()?
        .into_iter()
        .filter_map(|(name, descriptor)| {
            let bytes = store.get(&descriptor.digest).ok()?;
            let manifest: ImageManifest = serde_json::from_slice(&bytes).ok()?;
            let size = manifest.layers.iter().map(|layer| layer.size).sum();
            Some(ImageInfo {
                name,
                digest: utils::short_digest(&descriptor.digest).to_string(),
                layers: manifest.layers.len(),
                size: utils::format_size(size),
            })
        })
        .collect();

    if images.is_empty() {
        utils::print_info("No exported images found.");
        utils::print_info("Use 'layerpress export --name <image> --layer <tar>' to export one.");
    } else {
        let len = images.len();
        let table = Table::new(images);
        println!("{}", table);
        println!();
        utils::print_info(&format!("Found {} exported image(s)", len));
    }

    Ok(())
}
