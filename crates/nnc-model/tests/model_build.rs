//! End-to-end build pipeline tests over small networks, including an
//! executed training run.

mod exec;

use exec::{Instance, Val};
use nnc_model::{
    ActivationKind, Layer, LossKind, Model, ModelOptions, PerMode, WeightDistribution,
};
use nnc_wasm::WasmExportKind;

fn xor_data() -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    (
        vec![
            vec![0.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
        ],
        vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        ],
    )
}

fn xor_model(options: ModelOptions) -> Model {
    let mut model = Model::new("xor", options);
    let (rows, labels) = xor_data();
    model
        .add_layer(Layer::input(2))
        .add_layer(Layer::hidden(
            2,
            ActivationKind::Sigmoid,
            WeightDistribution::XavierUniform,
        ))
        .add_layer(Layer::output(
            2,
            ActivationKind::Sigmoid,
            WeightDistribution::LeCunUniform,
        ))
        .set_training_data(rows, labels);
    model
}

fn export_names(module: &nnc_wasm::WasmModule) -> Vec<String> {
    module
        .exports()
        .iter()
        .filter(|e| matches!(e.kind, WasmExportKind::Func(_)))
        .map(|e| e.name.clone())
        .collect()
}

#[test]
fn test_xor_build_verifies_and_exports_entry_points() {
    let module = xor_model(ModelOptions::default()).build().unwrap();
    module.verify().unwrap();

    let names = export_names(&module);
    for expected in [
        "feedforward",
        "backpropagation",
        "train",
        "predict",
        "prediction_data_offset",
        "prediction_result_offset",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing export {expected}");
    }
    // No testing set, so no test entry point.
    assert!(!names.iter().any(|n| n == "test"));
}

#[test]
fn test_data_segments_cover_weights_rate_and_datasets() {
    let module = xor_model(ModelOptions::default()).build().unwrap();
    // Two weighted layers contribute a weight and a bias segment each,
    // plus the learning-rate cell and the transposed data and labels.
    assert_eq!(module.data_segments().len(), 7);

    let lr_bytes = 0.01f32.to_le_bytes();
    assert!(module
        .data_segments()
        .iter()
        .any(|s| s.bytes == lr_bytes));

    // 4 samples x 2 features x 4 bytes.
    assert!(module.data_segments().iter().any(|s| s.bytes.len() == 32));
}

#[test]
fn test_same_seed_reproduces_module() {
    let a = xor_model(ModelOptions::default()).build().unwrap();
    let b = xor_model(ModelOptions::default()).build().unwrap();

    let bytes = |m: &nnc_wasm::WasmModule| {
        m.data_segments()
            .iter()
            .flat_map(|s| s.bytes.clone())
            .collect::<Vec<u8>>()
    };
    assert_eq!(bytes(&a), bytes(&b));
    assert_eq!(a.to_wasm().unwrap(), b.to_wasm().unwrap());
}

#[test]
fn test_seed_changes_weight_streams() {
    let a = xor_model(ModelOptions::default()).build().unwrap();
    let b = xor_model(ModelOptions {
        seed: 99,
        ..ModelOptions::default()
    })
    .build()
    .unwrap();

    // The weight segments differ, the datasets do not.
    let differing = a
        .data_segments()
        .iter()
        .zip(b.data_segments().iter())
        .filter(|(x, y)| x.bytes != y.bytes)
        .count();
    assert!(differing >= 2, "expected weight segments to change with the seed");
}

#[test]
fn test_full_featured_build() {
    let options = ModelOptions {
        batch_size: PerMode {
            training: 2,
            testing: 2,
            prediction: 1,
        },
        epochs: 50,
        log_training_error: true,
        log_training_time: true,
        training_accuracy: true,
        testing_accuracy: true,
        training_confusion: true,
        testing_confusion: true,
        export_weights: true,
        l1_regularizer: Some(0.001),
        l2_regularizer: Some(0.01),
        ..ModelOptions::default()
    };

    let (rows, labels) = xor_data();
    let mut model = Model::new("featured", options);
    model
        .add_layer(Layer::input(2))
        .add_layer(
            Layer::hidden(
                4,
                ActivationKind::LeakyRelu,
                WeightDistribution::XavierNormal,
            )
            .keep_prob(0.8)
            .unwrap(),
        )
        .add_layer(Layer::output(
            2,
            ActivationKind::Softmax,
            WeightDistribution::LeCunNormal,
        ))
        .set_loss(LossKind::CrossEntropy)
        .set_training_data(rows.clone(), labels.clone())
        .set_testing_data(rows, labels);

    let module = model.build().unwrap();
    module.verify().unwrap();

    let names = export_names(&module);
    for expected in [
        "feedforward",
        "backpropagation",
        "train",
        "test",
        "predict",
        "layer1_weights_offset",
        "layer1_weights_byte_size",
        "layer2_biases_offset",
        "layer2_nodes",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing export {expected}");
    }
}

#[test]
fn test_simd_disabled_emits_no_vector_code() {
    let mut options = ModelOptions::default();
    options.wasm.simd_enabled = false;

    let module = xor_model(options).build().unwrap();
    let wat = module.to_wat();
    assert!(!wat.contains("v128"));
    assert!(!wat.contains("f32x4"));
}

#[test]
fn test_simd_enabled_emits_vector_code() {
    let mut options = ModelOptions::default();
    options.batch_size.training = 4;
    options.wasm.simd_enabled = true;

    let mut model = Model::new("wide", options);
    let (rows, labels) = xor_data();
    model
        .add_layer(Layer::input(2))
        .add_layer(Layer::hidden(
            8,
            ActivationKind::Sigmoid,
            WeightDistribution::XavierUniform,
        ))
        .add_layer(Layer::output(
            2,
            ActivationKind::Sigmoid,
            WeightDistribution::LeCunUniform,
        ))
        .set_training_data(rows, labels);

    let wat = model.build().unwrap().to_wat();
    assert!(wat.contains("f32x4"));
}

#[test]
fn test_train_descends_on_xor() {
    let mut options = ModelOptions::default();
    options.learning_rate = 0.02;
    options.epochs = 3000;
    options.log_training_error = true;
    options.wasm.simd_enabled = false;

    let module = xor_model(options).build().unwrap();
    let mut instance = Instance::new(&module);

    // Host imports by declaration index: 0 is Math.exp, 6 is
    // Message.log_training_error.
    let mut errors: Vec<(f32, i32)> = Vec::new();
    {
        let mut host = |idx: u32, stack: &mut Vec<Val>| match idx {
            0 => {
                let x = stack.pop().unwrap().as_f64();
                stack.push(Val::F64(x.exp()));
            }
            6 => {
                let epoch = stack.pop().unwrap().as_i32();
                let error = stack.pop().unwrap().as_f32();
                errors.push((error, epoch));
            }
            other => panic!("unexpected host call {other}"),
        };
        instance.call("train", &[], &mut host);
    }

    assert_eq!(errors.len(), 3000);
    assert_eq!(errors.last().unwrap().1, 2999);
    let first = errors.first().unwrap().0;
    let last = errors.last().unwrap().0;
    assert!(first.is_finite() && last.is_finite());
    assert!(
        last < first,
        "mean training cost should descend, got {first} -> {last}"
    );
}

#[test]
fn test_predict_runs_on_trained_module() {
    let mut options = ModelOptions::default();
    options.learning_rate = 0.02;
    options.epochs = 100;
    options.wasm.simd_enabled = false;

    let module = xor_model(options).build().unwrap();
    let mut instance = Instance::new(&module);
    let mut host = |idx: u32, stack: &mut Vec<Val>| match idx {
        0 => {
            let x = stack.pop().unwrap().as_f64();
            stack.push(Val::F64(x.exp()));
        }
        other => panic!("unexpected host call {other}"),
    };

    instance.call("train", &[], &mut host);

    let data = instance.call("prediction_data_offset", &[], &mut host)[0].as_i32() as u32;
    let result = instance.call("prediction_result_offset", &[], &mut host)[0].as_i32() as u32;
    instance.write_f32s(data, &[1.0, 0.0]);
    instance.call("predict", &[], &mut host);

    // Sigmoid outputs stay in the open unit interval.
    for v in instance.read_f32s(result, 2) {
        assert!(v > 0.0 && v < 1.0, "prediction out of range: {v}");
    }
}

#[test]
fn test_module_serializes_to_binary() {
    let module = xor_model(ModelOptions::default()).build().unwrap();
    let bytes = module.to_wasm().unwrap();
    assert_eq!(&bytes[..4], b"\0asm");
    assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);

    let wat = module.to_wat();
    assert!(wat.starts_with("(module"));
    assert!(wat.contains("(import \"Math\" \"exp\""));
}
