use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use layerpress::compression::{
    MEDIA_TYPE_NYDUS_BLOB, MEDIA_TYPE_NYDUS_BOOTSTRAP, MEDIA_TYPE_OCI_LAYER_GZIP,
    MEDIA_TYPE_OCI_LAYER_ZSTD,
};
use layerpress::digest::sha256_digest;
use layerpress::manifest::{ImageConfig, ImageManifest, MEDIA_TYPE_OCI_MANIFEST};
use layerpress::nydus::bootstrap::Bootstrap;
use layerpress::nydus::{ANNOTATION_NYDUS_BLOB, ANNOTATION_NYDUS_BOOTSTRAP};
use layerpress::registry::{Publisher, RegistryError};
use layerpress::{
    Compression, CompressionSpec, ContentStore, ExportError, ExportRequest, Exporter,
    ImageReference, LayerDiff, LayoutStore, Manifest, MemoryStore,
};

fn tar_layer<D: AsRef<[u8]>>(files: &[(&str, D)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let data = data.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, path, data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn zstd_with_checksum(raw: &[u8]) -> Vec<u8> {
    let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3).unwrap();
    encoder.include_checksum(true).unwrap();
    std::io::Write::write_all(&mut encoder, raw).unwrap();
    encoder.finish().unwrap()
}

/// The two layers of the reference build: `foo` then `bar`.
fn two_diffs() -> Vec<LayerDiff> {
    vec![
        LayerDiff::new(0, tar_layer(&[("foo", b"")])).unwrap(),
        LayerDiff::new(1, tar_layer(&[("bar", b"")])).unwrap(),
    ]
}

#[derive(Default)]
struct RecordingPublisher {
    /// (target, manifest digest, every referenced blob was stored)
    calls: Mutex<Vec<(String, String, bool)>>,
    fail: bool,
}

impl RecordingPublisher {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(String, String, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish<'a>(
        &'a self,
        target: &'a ImageReference,
        manifest: &'a Manifest,
        store: Arc<dyn ContentStore>,
    ) -> BoxFuture<'a, Result<(), RegistryError>> {
        let complete = store.contains(&manifest.digest)
            && manifest.blobs().all(|blob| store.contains(&blob.digest));
        self.calls
            .lock()
            .unwrap()
            .push((target.to_string(), manifest.digest.clone(), complete));
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                Err(RegistryError::ManifestUploadError(500))
            } else {
                Ok(())
            }
        })
    }
}

fn stored_manifest(store: &MemoryStore, digest: &str) -> ImageManifest {
    serde_json::from_slice(&store.get(digest).unwrap()).unwrap()
}

fn stored_config(store: &MemoryStore, manifest: &ImageManifest) -> ImageConfig {
    serde_json::from_slice(&store.get(&manifest.config.digest).unwrap()).unwrap()
}

#[tokio::test]
async fn test_nydus_two_layers() {
    let store = Arc::new(MemoryStore::new());
    let exporter = Exporter::new(store.clone());
    let request = ExportRequest::new(two_diffs(), CompressionSpec::new(Compression::Nydus));

    let exported = exporter.export(request).await.unwrap();

    let manifest = stored_manifest(&store, &exported.manifest.digest);
    assert_eq!(manifest.media_type, MEDIA_TYPE_OCI_MANIFEST);
    let media_types: Vec<&str> = manifest.layers.iter().map(|l| l.media_type.as_str()).collect();
    assert_eq!(
        media_types,
        [MEDIA_TYPE_NYDUS_BLOB, MEDIA_TYPE_NYDUS_BLOB, MEDIA_TYPE_NYDUS_BOOTSTRAP]
    );
    assert_eq!(manifest.layers[0].annotation(ANNOTATION_NYDUS_BLOB), Some("true"));
    assert_eq!(manifest.layers[1].annotation(ANNOTATION_NYDUS_BLOB), Some("true"));
    assert_eq!(
        manifest.layers[2].annotation(ANNOTATION_NYDUS_BOOTSTRAP),
        Some("true")
    );
    assert_eq!(manifest.layers[2].annotation(ANNOTATION_NYDUS_BLOB), None);
    assert_eq!(stored_config(&store, &manifest).rootfs.diff_ids.len(), 3);
}

#[tokio::test]
async fn test_gzip_two_layers() {
    let store = Arc::new(MemoryStore::new());
    let exporter = Exporter::new(store.clone());
    let diffs = two_diffs();
    let diff_ids: Vec<String> = diffs.iter().map(|d| d.diff_id().to_string()).collect();
    let spec = CompressionSpec::new(Compression::Gzip).with_oci_media_types(true);

    let exported = exporter.export(ExportRequest::new(diffs, spec)).await.unwrap();

    let manifest = stored_manifest(&store, &exported.manifest.digest);
    assert_eq!(manifest.layers.len(), 2);
    for layer in &manifest.layers {
        assert_eq!(layer.media_type, MEDIA_TYPE_OCI_LAYER_GZIP);
        assert!(layer.annotations.is_none());
        let blob = store.get(&layer.digest).unwrap();
        assert_eq!(&blob[..2], &[0x1f, 0x8b]);
    }
    assert_eq!(stored_config(&store, &manifest).rootfs.diff_ids, diff_ids);
}

#[tokio::test]
async fn test_zstd_forced_recompression() {
    let store = Arc::new(MemoryStore::new());
    let exporter = Exporter::new(store.clone());
    let inputs: Vec<Vec<u8>> = [("foo", "foo"), ("bar", "bar")]
        .into_iter()
        .map(|(name, data)| zstd_with_checksum(&tar_layer(&[(name, data)])))
        .collect();
    let diffs: Vec<LayerDiff> = inputs
        .iter()
        .enumerate()
        .map(|(i, payload)| LayerDiff::new(i, payload.clone()).unwrap())
        .collect();
    let spec = CompressionSpec::new(Compression::Zstd).with_force(true);

    let exported = exporter.export(ExportRequest::new(diffs, spec)).await.unwrap();

    let layers = &exported.manifest.image.layers;
    assert_eq!(layers.len(), 2);
    for (layer, input) in layers.iter().zip(&inputs) {
        assert_eq!(layer.media_type, MEDIA_TYPE_OCI_LAYER_ZSTD);
        assert_ne!(layer.digest, sha256_digest(input));
    }
    // zstd has no Docker media type, so the manifest is OCI even though the
    // request did not ask for it.
    assert_eq!(exported.manifest.media_type, MEDIA_TYPE_OCI_MANIFEST);
}

#[tokio::test]
async fn test_empty_layer_set_publishes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let exporter = Exporter::new(store.clone()).with_publisher(publisher.clone());
    let request = ExportRequest::new(Vec::new(), CompressionSpec::default())
        .with_target(ImageReference::parse("localhost:5000/app:v1").unwrap())
        .with_push(true);

    let err = exporter.export(request).await.unwrap_err();

    assert!(matches!(err, ExportError::EmptyLayerSet));
    assert!(publisher.calls().is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_duplicate_ordinals_write_nothing() {
    for compression in [Compression::Gzip, Compression::Nydus] {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let exporter = Exporter::new(store.clone()).with_publisher(publisher.clone());
        let diffs = vec![
            LayerDiff::new(0, tar_layer(&[("foo", b"")])).unwrap(),
            LayerDiff::new(0, tar_layer(&[("bar", b"")])).unwrap(),
        ];
        let request = ExportRequest::new(diffs, CompressionSpec::new(compression))
            .with_target(ImageReference::parse("localhost:5000/app:v1").unwrap())
            .with_push(true);

        let err = exporter.export(request).await.unwrap_err();

        assert!(matches!(err, ExportError::DuplicateLayerIndex(0)));
        assert!(publisher.calls().is_empty());
        assert!(store.is_empty());
    }
}

#[tokio::test]
async fn test_unknown_algorithm_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let attrs = [("compression", "brotli"), ("push", "false")];

    let err = ExportRequest::from_attrs(two_diffs(), attrs).unwrap_err();

    assert!(matches!(err, ExportError::UnsupportedAlgorithm(ref name) if name == "brotli"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_layer_order_survives_concurrency() {
    let store = Arc::new(MemoryStore::new());
    let exporter = Exporter::new(store.clone()).with_concurrency(8);
    // Bigger layers first so later ordinals tend to finish earlier.
    let diffs: Vec<LayerDiff> = (0..8)
        .map(|i| {
            let name = format!("file-{i}");
            let body = vec![b'a' + i as u8; (8 - i) * 200_000];
            LayerDiff::new(i, tar_layer(&[(name.as_str(), &body)])).unwrap()
        })
        .collect();
    let diff_ids: Vec<String> = diffs.iter().map(|d| d.diff_id().to_string()).collect();

    for compression in [Compression::Gzip, Compression::Nydus] {
        let request = ExportRequest::new(diffs.clone(), CompressionSpec::new(compression));
        let exported = exporter.export(request).await.unwrap();
        let config = stored_config(&store, &exported.manifest.image);

        match compression {
            Compression::Nydus => {
                let layers = &exported.manifest.image.layers;
                assert_eq!(layers.len(), 9);
                let bootstrap = layers.last().unwrap();
                assert_eq!(bootstrap.media_type, MEDIA_TYPE_NYDUS_BOOTSTRAP);

                let bootstrap = Bootstrap::from_tar(&store.get(&bootstrap.digest).unwrap()).unwrap();
                assert_eq!(bootstrap.blobs.len(), 8);
                for (i, blob) in bootstrap.blobs.iter().enumerate() {
                    assert_eq!(blob.digest, layers[i].digest);
                    assert_eq!(blob.source_diff_id, diff_ids[i]);
                    let inode = bootstrap.lookup(&format!("file-{i}")).unwrap();
                    assert_eq!(inode.layer, i);
                    assert_eq!(inode.size, (8 - i as u64) * 200_000);
                }
            }
            _ => assert_eq!(config.rootfs.diff_ids, diff_ids),
        }
    }
}

#[tokio::test]
async fn test_repeated_exports_are_deterministic() {
    let store = Arc::new(MemoryStore::new());
    let exporter = Exporter::new(store.clone());
    let spec = CompressionSpec::new(Compression::Gzip);

    let first = exporter
        .export(ExportRequest::new(two_diffs(), spec))
        .await
        .unwrap();
    let blobs = store.len();
    let second = exporter
        .export(ExportRequest::new(two_diffs(), spec))
        .await
        .unwrap();

    assert_eq!(first.manifest.digest, second.manifest.digest);
    assert_eq!(store.len(), blobs);
}

#[tokio::test]
async fn test_hybrid_exports_never_mix_formats() {
    let store = Arc::new(MemoryStore::new());
    let exporter = Exporter::new(store.clone());
    let specs = [
        CompressionSpec::new(Compression::Gzip).with_oci_media_types(true),
        CompressionSpec::new(Compression::Nydus),
        CompressionSpec::new(Compression::Zstd).with_force(true),
        CompressionSpec::new(Compression::Uncompressed),
        CompressionSpec::new(Compression::Nydus),
        CompressionSpec::new(Compression::Gzip).with_force(true),
    ];

    for spec in specs {
        let exported = exporter
            .export(ExportRequest::new(two_diffs(), spec))
            .await
            .unwrap();
        let layers = &exported.manifest.image.layers;
        let nydus = layers
            .iter()
            .filter(|l| l.media_type.contains("nydus"))
            .count();

        if spec.compression == Compression::Nydus {
            assert_eq!(layers.len(), 3);
            assert_eq!(nydus, 3);
        } else {
            assert_eq!(layers.len(), 2);
            assert_eq!(nydus, 0);
            let first = &layers[0].media_type;
            assert!(layers.iter().all(|l| &l.media_type == first));
        }
    }
}

#[tokio::test]
async fn test_push_hands_complete_image_to_publisher() {
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let exporter = Exporter::new(store.clone()).with_publisher(publisher.clone());
    let request = ExportRequest::from_attrs(
        two_diffs(),
        [
            ("name", "localhost:5000/team/app:v1"),
            ("push", "true"),
            ("compression", "zstd"),
        ],
    )
    .unwrap();

    let exported = exporter.export(request).await.unwrap();

    assert!(exported.pushed);
    assert_eq!(
        publisher.calls(),
        vec![(
            "localhost:5000/team/app:v1".to_string(),
            exported.manifest.digest.clone(),
            true
        )]
    );
}

#[tokio::test]
async fn test_failed_conversion_is_not_published() {
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let exporter = Exporter::new(store.clone()).with_publisher(publisher.clone());
    let tar = tar_layer(&[("bar", b"tampered")]);
    let size = tar.len() as u64;
    let diffs = vec![
        LayerDiff::new(0, tar_layer(&[("foo", b"")])).unwrap(),
        LayerDiff::from_parts(1, sha256_digest(b"declared"), size, tar),
    ];
    let request = ExportRequest::new(diffs, CompressionSpec::new(Compression::Nydus))
        .with_target(ImageReference::parse("app").unwrap())
        .with_push(true);

    let err = exporter.export(request).await.unwrap_err();

    assert!(matches!(err, ExportError::Conversion { index: 1, .. }));
    assert!(publisher.calls().is_empty());
}

#[tokio::test]
async fn test_publish_failure_surfaces() {
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(RecordingPublisher::failing());
    let exporter = Exporter::new(store).with_publisher(publisher.clone());
    let request = ExportRequest::new(two_diffs(), CompressionSpec::default())
        .with_target(ImageReference::parse("app").unwrap())
        .with_push(true);

    let err = exporter.export(request).await.unwrap_err();

    assert!(matches!(
        err,
        ExportError::Publish(RegistryError::ManifestUploadError(500))
    ));
    assert_eq!(publisher.calls().len(), 1);
}

#[tokio::test]
async fn test_push_requires_target_and_publisher() {
    let store = Arc::new(MemoryStore::new());

    let no_target = Exporter::new(store.clone())
        .with_publisher(Arc::new(RecordingPublisher::default()))
        .export(ExportRequest::new(two_diffs(), CompressionSpec::default()).with_push(true))
        .await
        .unwrap_err();
    assert!(matches!(no_target, ExportError::InvalidAttribute { .. }));

    let no_publisher = Exporter::new(store.clone())
        .export(
            ExportRequest::new(two_diffs(), CompressionSpec::default())
                .with_target(ImageReference::parse("app").unwrap())
                .with_push(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(no_publisher, ExportError::InvalidAttribute { .. }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_concurrent_exports_share_a_layout_store() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Arc::new(LayoutStore::open(dir.path()).unwrap());
    let exporter = Arc::new(Exporter::new(layout.clone()));

    let handles: Vec<_> = [Compression::Gzip, Compression::Zstd, Compression::Nydus]
        .into_iter()
        .map(|compression| {
            let exporter = Arc::clone(&exporter);
            tokio::spawn(async move {
                let request = ExportRequest::new(two_diffs(), CompressionSpec::new(compression));
                exporter.export(request).await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let exported = handle.await.unwrap().unwrap();
        layout
            .record_image(&format!("app:{i}"), &exported.manifest.descriptor())
            .unwrap();
        for blob in exported.manifest.blobs() {
            assert!(layout.contains(&blob.digest));
        }
    }

    let images = layout.list_images().unwrap();
    assert_eq!(images.len(), 3);
    assert!(dir.path().join("oci-layout").is_file());
}
