//! Loading and fusing adapters end to end

use super::fixtures::*;
use super::init_test_logging;
use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use sdlora::model::save_weights;
use sdlora::{
    fuse, load_model, load_weights, read_adapter, ComponentKind, Error, FusionOptions,
    LoadOptions, ModelWeights,
};

fn all_values(weights: &ModelWeights, kind: ComponentKind, name: &str) -> Vec<f32> {
    weights
        .component(kind)
        .tensor(name)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

fn assert_all(values: &[f32], expected: f32) {
    for v in values {
        assert_abs_diff_eq!(*v, expected, epsilon = 1e-6);
    }
}

#[test]
fn test_fuse_adapter_into_loaded_weights() {
    init_test_logging();
    let (_guard, dir) = create_test_dir();
    create_model(&dir.join("model"));
    let adapter_path = create_adapter(&dir, "style.safetensors", adapter_tensors());

    let mut weights = load_weights(&dir.join("model"), &Device::Cpu, DType::F32).unwrap();
    let adapter = read_adapter(&adapter_path, &Device::Cpu).unwrap();
    let report = fuse(&mut weights, &adapter, &FusionOptions::default()).unwrap();

    assert_eq!(report.groups, 3);
    assert_eq!(report.per_component[&ComponentKind::TextEncoder], 1);
    assert_eq!(report.per_component[&ComponentKind::Unet], 2);
    assert_eq!(report.parameters_touched, 16 + 30 + 16);
    assert!(report.ignored_keys.is_empty());

    // up·down is 2 everywhere; alpha 1 over rank 2 halves the text encoder delta
    assert_all(&all_values(&weights, ComponentKind::TextEncoder, TE_Q_PROJ), 1.5);
    assert_all(&all_values(&weights, ComponentKind::Unet, UNET_PROJ_IN), 2.0);
    assert_all(&all_values(&weights, ComponentKind::Unet, UNET_TO_Q), 2.0);

    // Untargeted weights are left alone
    assert_all(&all_values(&weights, ComponentKind::Unet, "conv_in.weight"), 1.0);
    assert_all(&all_values(&weights, ComponentKind::Vae, VAE_CONV_IN), 1.0);
    assert_all(
        &all_values(
            &weights,
            ComponentKind::TextEncoder,
            "text_model.encoder.layers.0.self_attn.q_proj.bias",
        ),
        1.0,
    );
}

#[test]
fn test_load_model_fuses_before_serving() {
    init_test_logging();
    let (_guard, dir) = create_test_dir();
    create_model(&dir.join("model"));
    let adapter_path = create_adapter(&dir, "style.safetensors", adapter_tensors());

    let options = LoadOptions {
        fusion: FusionOptions::with_multiplier(1.0),
        ..Default::default()
    };
    let pipeline = load_model(&dir.join("model"), Some(&adapter_path), &options).unwrap();

    let q_proj = pipeline
        .components()
        .text_encoder
        .tensor(TE_Q_PROJ)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert_all(&q_proj, 2.0);
}

#[test]
fn test_load_model_without_adapter_keeps_base_weights() {
    let (_guard, dir) = create_test_dir();
    create_model(&dir);

    let pipeline = load_model(&dir, None, &LoadOptions::default()).unwrap();
    let to_q = pipeline
        .components()
        .unet
        .tensor(UNET_TO_Q)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert_all(&to_q, 1.0);
}

#[test]
fn test_unresolvable_adapter_fails_load() {
    init_test_logging();
    let (_guard, dir) = create_test_dir();
    create_model(&dir.join("model"));

    let mut tensors = adapter_tensors();
    tensors.push((
        "lora_unet_up_blocks_9_attentions_0_proj_out.lora_up.weight",
        Tensor::ones((4, 2), DType::F32, &Device::Cpu).unwrap(),
    ));
    tensors.push((
        "lora_unet_up_blocks_9_attentions_0_proj_out.lora_down.weight",
        Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap(),
    ));
    let adapter_path = create_adapter(&dir, "broken.safetensors", tensors);

    let err = load_model(&dir.join("model"), Some(&adapter_path), &LoadOptions::default())
        .unwrap_err();
    match err {
        Error::Resolution { key, .. } => assert!(key.contains("up_blocks_9")),
        other => panic!("expected a resolution error, got {other:?}"),
    }
}

#[test]
fn test_shape_mismatch_leaves_weights_untouched() {
    let (_guard, dir) = create_test_dir();
    create_model(&dir.join("model"));

    let mut tensors = adapter_tensors();
    // Valid pair for q_proj plus an up factor of the wrong width for to_q
    tensors.retain(|(name, _)| !name.contains("to_q.lora_up"));
    tensors.push((
        "lora_unet_mid_block_attentions_0_transformer_blocks_0_attn1_to_q.lora_up.weight",
        Tensor::ones((5, 2), DType::F32, &Device::Cpu).unwrap(),
    ));
    let adapter_path = create_adapter(&dir, "mismatch.safetensors", tensors);

    let mut weights = load_weights(&dir.join("model"), &Device::Cpu, DType::F32).unwrap();
    let adapter = read_adapter(&adapter_path, &Device::Cpu).unwrap();
    let err = fuse(&mut weights, &adapter, &FusionOptions::default()).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));

    assert_all(&all_values(&weights, ComponentKind::TextEncoder, TE_Q_PROJ), 1.0);
    assert_all(&all_values(&weights, ComponentKind::Unet, UNET_PROJ_IN), 1.0);
}

#[test]
fn test_fused_weights_survive_a_save() {
    let (_guard, dir) = create_test_dir();
    create_model(&dir.join("model"));
    let adapter_path = create_adapter(&dir, "style.safetensors", adapter_tensors());

    let mut weights = load_weights(&dir.join("model"), &Device::Cpu, DType::F32).unwrap();
    let adapter = read_adapter(&adapter_path, &Device::Cpu).unwrap();
    fuse(&mut weights, &adapter, &FusionOptions::default()).unwrap();
    save_weights(&weights, &dir.join("fused")).unwrap();

    let reloaded = load_weights(&dir.join("fused"), &Device::Cpu, DType::F32).unwrap();
    assert_all(&all_values(&reloaded, ComponentKind::TextEncoder, TE_Q_PROJ), 1.5);
    assert_eq!(reloaded.num_parameters(), weights.num_parameters());
}

#[test]
fn test_half_precision_model_fuses_in_place() {
    let (_guard, dir) = create_test_dir();
    create_model(&dir.join("model"));
    let adapter_path = create_adapter(&dir, "style.safetensors", adapter_tensors());

    let mut weights = load_weights(&dir.join("model"), &Device::Cpu, DType::F16).unwrap();
    let adapter = read_adapter(&adapter_path, &Device::Cpu).unwrap();
    fuse(&mut weights, &adapter, &FusionOptions::default()).unwrap();

    let q_proj = weights.text_encoder.tensor(TE_Q_PROJ).unwrap();
    assert_eq!(q_proj.dtype(), DType::F16);
    let values = q_proj
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert_all(&values, 1.5);
}
