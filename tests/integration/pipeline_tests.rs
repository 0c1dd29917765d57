//! Composing and running pipelines against a mock runtime

use super::fixtures::*;
use super::init_test_logging;
use image::{Rgb, RgbImage};
use sdlora::pipeline::scheduler::SchedulerConfig;
use sdlora::{
    load_model, Error, GenerationRequest, LoadOptions, ModelPipeline, PipelineMode, RawRequest,
    RequestLimits, SamplerKind,
};
use std::sync::atomic::Ordering;

fn pipeline(safety_checker: bool) -> (tempfile::TempDir, ModelPipeline) {
    let (guard, dir) = create_test_dir();
    create_model(&dir);
    let adapter = create_adapter(&dir, "style.safetensors", adapter_tensors());
    let options = LoadOptions {
        safety_checker,
        ..Default::default()
    };
    let pipeline = load_model(&dir, Some(&adapter), &options).unwrap();
    (guard, pipeline)
}

fn request(raw: RawRequest) -> GenerationRequest {
    GenerationRequest::normalize(raw, &RequestLimits::default())
}

fn small(sampler: &str, seed: i64) -> RawRequest {
    RawRequest {
        prompt: Some("a red bicycle".to_string()),
        sampler: Some(sampler.to_string()),
        height: Some(64),
        width: Some(64),
        count: Some(2),
        seed: Some(seed),
        ..Default::default()
    }
}

#[test]
fn test_compose_selects_mode_and_shares_components() {
    init_test_logging();
    let (_guard, mut pipeline) = pipeline(false);
    let shared = pipeline.components().clone();

    let text = request(small("ddim", 1));
    let composed = pipeline.compose(&text);
    assert_eq!(composed.mode(), PipelineMode::TextToImage);
    assert_eq!(composed.sampler(), SamplerKind::Ddim);
    assert!(composed.components().shares_with(&shared));

    let image = request(RawRequest {
        input_image: Some("https://example.com/cat.png".to_string()),
        ..small("heun", 1)
    });
    let composed = pipeline.compose(&image);
    assert_eq!(composed.mode(), PipelineMode::ImageToImage);
    assert_eq!(composed.sampler(), SamplerKind::Heun);
    assert!(composed.components().shares_with(&shared));
}

#[test]
fn test_scheduler_swap_keeps_model_schedule() {
    let (_guard, mut pipeline) = pipeline(false);
    let config = pipeline.scheduler().config().clone();
    assert_eq!(config, SchedulerConfig::default());

    for name in ["eular", "heun", "lms", "dpm2", "dpm2_a", "ddim", "euler_a"] {
        let req = request(small(name, 1));
        pipeline.compose(&req);
        assert_eq!(pipeline.scheduler().kind().name(), name);
        assert_eq!(pipeline.scheduler().config(), &config);
    }
}

#[test]
fn test_unknown_sampler_falls_back_to_default() {
    let (_guard, mut pipeline) = pipeline(false);
    let req = request(small("not_a_sampler", 1));
    assert_eq!(pipeline.compose(&req).sampler(), SamplerKind::EulerAncestral);
}

#[test]
fn test_text_to_image_is_seed_deterministic() {
    init_test_logging();
    let (_guard, mut pipeline) = pipeline(false);
    let runtime = MockRuntime::default();

    let req = request(small("euler_a", 7));
    let first = pipeline.compose(&req).generate(&runtime, &req, None).unwrap();
    let second = pipeline.compose(&req).generate(&runtime, &req, None).unwrap();

    assert_eq!(first.len(), 2);
    for image in &first {
        assert_eq!(image.dimensions(), (64, 64));
    }
    assert_eq!(first, second);

    let other_seed = request(small("euler_a", 8));
    let third = pipeline
        .compose(&other_seed)
        .generate(&runtime, &other_seed, None)
        .unwrap();
    assert_ne!(first, third);
}

#[test]
fn test_model_evaluations_per_sampler() {
    let (_guard, mut pipeline) = pipeline(false);

    for (name, expected) in [("eular", 20), ("ddim", 20), ("heun", 39), ("dpm2", 39)] {
        let runtime = MockRuntime::default();
        let req = request(small(name, 3));
        pipeline.compose(&req).generate(&runtime, &req, None).unwrap();
        assert_eq!(runtime.unet_calls.load(Ordering::SeqCst), expected, "{name}");
    }
}

#[test]
fn test_image_to_image_skips_early_steps() {
    let (_guard, mut pipeline) = pipeline(false);
    let runtime = MockRuntime::default();
    let req = request(RawRequest {
        input_image: Some("file:///tmp/in.png".to_string()),
        ..small("eular", 3)
    });
    let init = RgbImage::from_pixel(64, 64, Rgb([200, 40, 40]));

    let images = pipeline
        .compose(&req)
        .generate(&runtime, &req, Some(&init))
        .unwrap();
    assert_eq!(images.len(), 2);
    // strength 0.8 of 20 steps
    assert_eq!(runtime.unet_calls.load(Ordering::SeqCst), 16);
}

#[test]
fn test_image_to_image_requires_an_image() {
    let (_guard, mut pipeline) = pipeline(false);
    let runtime = MockRuntime::default();
    let req = request(RawRequest {
        input_image: Some("https://example.com/in.png".to_string()),
        ..small("ddim", 3)
    });

    let err = pipeline
        .compose(&req)
        .generate(&runtime, &req, None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let wrong_size = RgbImage::new(128, 64);
    let err = pipeline
        .compose(&req)
        .generate(&runtime, &req, Some(&wrong_size))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(runtime.unet_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_safety_checker_blanks_flagged_images() {
    let runtime = MockRuntime {
        flag_unsafe: true,
        ..Default::default()
    };
    let req = request(small("ddim", 5));

    let (_guard, mut checked) = pipeline(true);
    let images = checked.compose(&req).generate(&runtime, &req, None).unwrap();
    assert!(images
        .iter()
        .all(|image| image.pixels().all(|p| p.0 == [0, 0, 0])));

    let (_guard, mut unchecked) = pipeline(false);
    let images = unchecked.compose(&req).generate(&runtime, &req, None).unwrap();
    assert!(images
        .iter()
        .any(|image| image.pixels().any(|p| p.0 != [0, 0, 0])));
}

#[test]
fn test_invalid_schedule_is_rejected_at_construction() {
    let (_guard, dir) = create_test_dir();
    create_model(&dir);
    let weights =
        sdlora::load_weights(&dir, &candle_core::Device::Cpu, candle_core::DType::F32).unwrap();

    let config = SchedulerConfig {
        num_train_timesteps: 0,
        ..Default::default()
    };
    let err = ModelPipeline::new(weights, config).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
