//! Request handling end to end, without HTTP

use super::fixtures::*;
use super::init_test_logging;
use image::{Rgb, RgbImage};
use sdlora::{RawRequest, ServingConfig};
use sdlora_serve::storage::{ObjectMetadata, StoredObject};
use sdlora_serve::{LocalObjectStore, ObjectStore, ObjectUri, Orchestrator, ServeError, ServeResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn raw(value: serde_json::Value) -> RawRequest {
    serde_json::from_value(value).unwrap()
}

fn stored_path(root: &Path, uri: &str) -> PathBuf {
    let rest = uri.strip_prefix("s3://").unwrap();
    root.join("store").join(rest)
}

#[test]
fn test_load_fuses_configured_adapter() {
    init_test_logging();
    let (_guard, root) = create_test_dir();
    let orchestrator = create_orchestrator(&root, test_config(&root));

    let q_proj = orchestrator
        .pipeline()
        .components()
        .text_encoder
        .tensor(TE_Q_PROJ)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    // rank 1, no alpha, default multiplier 0.5
    assert!(q_proj.iter().all(|v| (v - 1.5).abs() < 1e-6));
}

#[test]
fn test_text_to_image_request_stores_jpegs() {
    init_test_logging();
    let (_guard, root) = create_test_dir();
    let mut orchestrator = create_orchestrator(&root, test_config(&root));

    let mut body = small_request();
    body["count"] = 2.into();
    let uris = orchestrator.try_handle(raw(body)).unwrap();

    assert_eq!(uris.len(), 2);
    assert_ne!(uris[0], uris[1]);
    for uri in &uris {
        assert!(uri.starts_with("s3://outputs/stablediffusion/asyncinvoke/images/"));
        assert!(uri.ends_with(".jpg"));

        let path = stored_path(&root, uri);
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));

        let sidecar: StoredObject = serde_json::from_slice(
            &std::fs::read(LocalObjectStore::sidecar_path(&path)).unwrap(),
        )
        .unwrap();
        assert_eq!(sidecar.content_type, "image/jpeg");
        assert_eq!(sidecar.metadata.get("prompt"), Some("a lighthouse at dusk"));
        assert_eq!(sidecar.metadata.get("seed"), Some("11"));
    }
}

#[test]
fn test_request_output_location_overrides_default() {
    let (_guard, root) = create_test_dir();
    let mut orchestrator = create_orchestrator(&root, test_config(&root));

    let mut body = small_request();
    body["output_s3uri"] = "s3://custom/run-7/".into();
    let uris = orchestrator.try_handle(raw(body)).unwrap();

    assert_eq!(uris.len(), 1);
    assert!(uris[0].starts_with("s3://custom/run-7/"));
    assert!(stored_path(&root, &uris[0]).is_file());
}

#[test]
fn test_image_to_image_from_local_file() {
    let (_guard, root) = create_test_dir();
    let mut orchestrator = create_orchestrator(&root, test_config(&root));

    let input = root.join("input.png");
    RgbImage::from_pixel(100, 80, Rgb([120, 60, 30]))
        .save(&input)
        .unwrap();

    let mut body = small_request();
    body["input_image"] = format!("file://{}", input.display()).into();
    let uris = orchestrator.try_handle(raw(body)).unwrap();
    assert_eq!(uris.len(), 1);
}

#[test]
fn test_failed_input_fetch_stores_nothing() {
    let (_guard, root) = create_test_dir();
    let mut orchestrator = create_orchestrator(&root, test_config(&root));

    let mut body = small_request();
    body["input_image"] = "s3://bucket/input.png".into();

    let err = orchestrator.try_handle(raw(body)).unwrap_err();
    assert!(matches!(err, ServeError::RemoteFetch(_)));
    assert!(!root.join("store").exists());
}

/// Local store whose puts start failing after `allowed` successes
struct FailingStore {
    inner: LocalObjectStore,
    allowed: usize,
    puts: AtomicUsize,
}

impl ObjectStore for FailingStore {
    fn put(
        &self,
        uri: &ObjectUri,
        body: &[u8],
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> ServeResult<()> {
        if self.puts.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(ServeError::storage("bucket is full"));
        }
        self.inner.put(uri, body, content_type, metadata)
    }

    fn delete(&self, uri: &ObjectUri) -> ServeResult<()> {
        self.inner.delete(uri)
    }
}

#[test]
fn test_partial_store_failure_removes_stored_images() {
    init_test_logging();
    let (_guard, root) = create_test_dir();
    create_model(&root.join("model"));
    create_adapter(&root.join("adapter.safetensors"));
    let store = Arc::new(FailingStore {
        inner: LocalObjectStore::new(root.join("store")),
        allowed: 1,
        puts: AtomicUsize::new(0),
    });
    let mut orchestrator = Orchestrator::load(
        Arc::new(test_config(&root)),
        Arc::new(MockRuntime),
        store.clone(),
    )
    .unwrap();

    let mut body = small_request();
    body["count"] = 3.into();
    let err = orchestrator.try_handle(raw(body)).unwrap_err();

    assert!(matches!(err, ServeError::Storage(_)));
    assert_eq!(store.puts.load(Ordering::SeqCst), 2);
    let images = root.join("store/outputs/stablediffusion/asyncinvoke/images");
    let left: Vec<_> = std::fs::read_dir(&images).unwrap().collect();
    assert!(left.is_empty(), "{:?}", left);
}

#[test]
fn test_unresolvable_adapter_fails_load() {
    let (_guard, root) = create_test_dir();
    create_model(&root.join("model"));
    sdlora::lora::store::write_tensors(
        root.join("adapter.safetensors"),
        &[(
            "lora_unet_no_such_block_proj.lora_up.weight".to_string(),
            candle_core::Tensor::ones((4, 1), candle_core::DType::F32, &candle_core::Device::Cpu)
                .unwrap(),
        )]
        .into_iter()
        .collect(),
    )
    .unwrap();

    let err = Orchestrator::load(
        Arc::new(test_config(&root)),
        Arc::new(MockRuntime),
        Arc::new(LocalObjectStore::new(root.join("store"))),
    )
    .unwrap_err();
    assert_eq!(err.code(), "ADAPTER_ERROR");
}

#[test]
fn test_watermark_requires_asset() {
    let (_guard, root) = create_test_dir();
    create_model(&root.join("model"));
    create_adapter(&root.join("adapter.safetensors"));

    let config = ServingConfig {
        watermark: true,
        watermark_image: root.join("missing-logo.png"),
        ..test_config(&root)
    };
    let err = Orchestrator::load(
        Arc::new(config),
        Arc::new(MockRuntime),
        Arc::new(LocalObjectStore::new(root.join("store"))),
    )
    .unwrap_err();
    assert!(matches!(err, ServeError::Config(_)));
}

#[test]
fn test_watermark_is_applied() {
    let (_guard, root) = create_test_dir();
    let logo = root.join("logo.png");
    RgbImage::from_pixel(200, 39, Rgb([255, 255, 255]))
        .save(&logo)
        .unwrap();

    let config = ServingConfig {
        watermark: true,
        watermark_image: logo,
        max_height: 256,
        max_width: 256,
        ..test_config(&root)
    };
    let mut orchestrator = create_orchestrator(&root, config);

    let mut body = small_request();
    body["height"] = 256.into();
    body["width"] = 256.into();
    let uris = orchestrator.try_handle(raw(body)).unwrap();

    let stored = image::open(stored_path(&root, &uris[0])).unwrap().to_rgb8();
    // Inside the pasted block at (46, 207); JPEG keeps a flat white area near white
    let pixel = stored.get_pixel(140, 225);
    assert!(pixel.0.iter().all(|&c| c > 240), "{:?}", pixel);
}
