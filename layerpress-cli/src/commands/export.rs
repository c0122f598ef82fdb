use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use tabled::{Table, Tabled};
use tracing::debug;

use layerpress::registry::RegistryPublisher;
use layerpress::{ExportRequest, Exporter, LayerDiff, LayoutStore, config};

use crate::utils;

#[derive(Args)]
pub struct ExportArgs {
    /// Layer tarballs in build order (plain, gzip or zstd)
    #[arg(short, long = "layer", required = true)]
    layers: Vec<PathBuf>,
    /// Compression: uncompressed, gzip, zstd or nydus
    #[arg(short, long, default_value = "gzip")]
    compression: String,
    /// Recompress layers already in the target format
    #[arg(long)]
    force_compression: bool,
    /// Use OCI media types instead of Docker v2 ones
    #[arg(long)]
    oci_mediatypes: bool,
    #[arg(long)]
    compression_level: Option<i32>,
    /// Image name (e.g., localhost:5000/app:v1)
    #[arg(short, long)]
    name: Option<String>,
    /// Push the image to its registry after exporting
    #[arg(long, requires = "name")]
    push: bool,
    #[arg(short, long, requires = "password")]
    username: Option<String>,
    #[arg(short, long, requires = "username")]
    password: Option<String>,
}

#[derive(Tabled)]
pub(crate) struct LayerRow {
    #[tabled(rename = "#")]
    pub index: usize,
    #[tabled(rename = "Digest")]
    pub digest: String,
    #[tabled(rename = "Media Type")]
    pub media_type: String,
    #[tabled(rename = "Size")]
    pub size: String,
}

impl ExportArgs {
    fn attrs(&self) -> Vec<(&'static str, String)> {
        let mut attrs = vec![
            ("compression", self.compression.clone()),
            ("force-compression", self.force_compression.to_string()),
            ("oci-mediatypes", self.oci_mediatypes.to_string()),
            ("push", self.push.to_string()),
        ];
        if let Some(level) = self.compression_level {
            attrs.push(("compression-level", level.to_string()));
        }
        if let Some(name) = &self.name {
            attrs.push(("name", name.clone()));
        }
        attrs
    }
}

pub async fn execute(args: ExportArgs) -> Result<()> {
    let layers = read_layers(&args.layers)?;
    let attrs = args.attrs();
    let request = ExportRequest::from_attrs(
        layers,
        attrs.iter().map(|(key, value)| (*key, value.as_str())),
    )?;

    utils::print_header(&format!(
        "Exporting {} layer(s) with {}",
        request.layers.len(),
        request.spec.compression
    ));

    let layerpress_dir = config::get_layerpress_dir();
    let store = Arc::new(
        LayoutStore::open(&layerpress_dir)
            .with_context(|| format!("opening {}", layerpress_dir.display()))?,
    );

    let mut exporter = Exporter::new(store.clone());
    if args.push {
        let mut publisher = RegistryPublisher::new().with_progress(true);
        if let (Some(username), Some(password)) = (&args.username, &args.password) {
            publisher = publisher.with_credentials(username, password);
        }
        exporter = exporter.with_publisher(Arc::new(publisher));
    }

    let pb = utils::spinner("Compressing layers...");
    let exported = match exporter.export(request).await {
        Ok(exported) => {
            pb.finish_and_clear();
            exported
        }
        Err(e) => {
            pb.finish_and_clear();
            utils::print_error(&format!("Export failed: {e}"));
            return Err(e.into());
        }
    };

    if let Some(target) = &exported.target {
        store.record_image(&target.to_string(), &exported.manifest.descriptor())?;
        debug!(target = %target, "recorded image in layout index");
    }

    let rows: Vec<LayerRow> = exported
        .manifest
        .image
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
    println!();

    utils::print_success(&format!("Exported {}", exported.manifest.digest));
    if let Some(target) = &exported.target {
        if exported.pushed {
            utils::print_success(&format!("Pushed {}", style(target).cyan()));
        } else {
            utils::print_info(&format!("Tagged {}", style(target).cyan()));
        }
    }
    utils::print_info(&format!(
        "Image stored in: {}",
        style(layerpress_dir.display()).cyan()
    ));

    Ok(())
}

fn read_layers(paths: &[PathBuf]) -> Result<Vec<LayerDiff>> {
    paths
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let payload = std::fs::read(path)
                .with_context(|| format!("reading layer {}", path.display()))?;
            LayerDiff::new(index, payload)
                .with_context(|| format!("decoding layer {}", path.display()))
        })
        .collect()
}
