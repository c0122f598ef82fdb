use layerpress::{ImageReference, LayoutStore, config};

use crate::error::{LayerpressCliError, Result};
use crate::utils;

/// Untags an exported image. Its blobs stay in the layout.
pub async fn execute(image: &str) -> Result<()> {
    let store = LayoutStore::open(config::get_layerpress_dir())?;
    let removed = untag(&store, image)?;
    utils::print_success(&format!("Successfully removed {removed}"));
    Ok(())
}

/// Drops `image` under its canonical name, or as written when it was
/// recorded that way. Returns the name that was removed.
fn untag(store: &LayoutStore, image: &str) -> Result<String> {
    let canonical = ImageReference::parse(image)?.to_string();
    if store.remove_image(&canonical)? {
        return Ok(canonical);
    }
    if canonical != image && store.remove_image(image)? {
        return Ok(image.to_string());
    }
    Err(LayerpressCliError::Input(format!(
        "image {image} is not in the local store"
    )))
}
