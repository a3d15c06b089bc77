use burn::prelude::Backend;
use burn::tensor::{Int, Tensor, TensorData, Tolerance};
use delta_loss::LossError;
use delta_loss::config::LossConfig;
use delta_loss::loss::Reduction;
type TB = burn::backend::NdArray<f32>;

fn device() -> <TB as Backend>::Device {
    <TB as Backend>::Device::default()
}

#[test]
fn saved_cross_entropy_config_reloads_and_evaluates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loss.json");
    let config = match LossConfig::from_name("CrossEntropyLoss").unwrap() {
        LossConfig::CrossEntropy(config) => {
            LossConfig::CrossEntropy(config.with_reduction(Reduction::Sum))
        }
        other => panic!("Unexpected loss {other:?}"),
    };
    config.save(&path).unwrap();

    let LossConfig::CrossEntropy(config) = LossConfig::load(&path).unwrap() else {
        panic!("Reloaded a different loss");
    };
    let logits = Tensor::<TB, 2>::from_data([[2.0, 1.0, 0.1], [0.1, 2.0, 1.0]], &device());
    let targets = Tensor::<TB, 1, Int>::from_data([0, 2], &device());

    let loss = config.loss.init().forward(logits, targets, config.reduction);

    loss.into_data().assert_approx_eq::<f32>(
        &TensorData::from([0.417_030 + 1.417_030]),
        Tolerance::default(),
    );
}

#[test]
fn ctc_from_json_scores_a_certain_alignment_near_zero() {
    let LossConfig::Ctc(config) =
        LossConfig::from_json(r#"{ "type": "Ctc", "blank_index": 0 }"#).unwrap()
    else {
        panic!("Expected a CTC configuration");
    };
    // The frames spell `1 0 2`, which collapses to the label `1 2`.
    let logits = Tensor::<TB, 3>::from_data(
        [[[0.0, 50.0, 0.0], [50.0, 0.0, 0.0], [0.0, 0.0, 50.0]]],
        &device(),
    );
    let labels = Tensor::<TB, 2, Int>::from_data([[1, 2]], &device());
    let input_lengths = Tensor::<TB, 1, Int>::from_data([3], &device());
    let label_lengths = Tensor::<TB, 1, Int>::from_data([2], &device());

    let loss = config
        .init()
        .forward(logits, labels, input_lengths, label_lengths);

    let value: f32 = loss.into_data().iter::<f32>().next().unwrap();
    assert!(value.abs() < 1e-4, "loss {value}");
}

#[test]
fn partial_ctc_file_handles_examples_without_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctc.json");
    std::fs::write(&path, r#"{ "type": "CTCLoss" }"#).unwrap();

    let LossConfig::Ctc(config) = LossConfig::load(&path).unwrap() else {
        panic!("Expected a CTC configuration");
    };
    let logits = Tensor::<TB, 3>::from_data(
        [
            [[0.0, 50.0, 0.0], [50.0, 0.0, 0.0], [0.0, 0.0, 50.0]],
            [[0.0, 5.0, 0.0], [0.0, 5.0, 0.0], [0.0, 5.0, 0.0]],
            [[5.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
        ],
        &device(),
    );
    let labels = Tensor::<TB, 2, Int>::from_data([[1, 2], [1, 0], [0, 0]], &device());
    let input_lengths = Tensor::<TB, 1, Int>::from_data([3, 0, 0], &device());
    let label_lengths = Tensor::<TB, 1, Int>::from_data([2, 1, 0], &device());

    let loss: Vec<f32> = config
        .init()
        .forward(logits, labels, input_lengths, label_lengths)
        .into_data()
        .iter::<f32>()
        .collect();

    assert!(loss[0].abs() < 1e-4, "loss {}", loss[0]);
    assert!(loss[1].is_finite() && loss[1] > 1e29, "loss {}", loss[1]);
    assert_eq!(loss[2], 0.0);
}

#[test]
fn crf_decoded_path_is_at_least_as_likely_as_any_labelling() {
    let LossConfig::Crf(config) =
        LossConfig::from_json(r#"{ "type": "Crf", "num_tags": 3 }"#).unwrap()
    else {
        panic!("Expected a CRF configuration");
    };
    let crf = config.init::<TB>(&device());
    let emissions = Tensor::<TB, 3>::from_data(
        [[[0.5, -0.3, 1.2], [0.9, 0.1, -0.4], [-0.2, 0.7, 0.3], [0.0, 0.4, 0.1]]],
        &device(),
    );
    let lengths = Tensor::<TB, 1, Int>::from_data([4], &device());

    let paths = crf.decode(emissions.clone(), lengths.clone());
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].len(), 4);

    let decoded: Vec<i64> = paths[0].iter().map(|&tag| tag as i64).collect();
    let decoded = Tensor::<TB, 2, Int>::from_data(TensorData::new(decoded, [1, 4]), &device());
    let best = crf.log_likelihood(emissions.clone(), decoded, lengths.clone());
    let best: f32 = best.into_data().iter::<f32>().next().unwrap();
    assert!(best <= 0.0);

    for first in 0..3 {
        for last in 0..3 {
            let tags = Tensor::<TB, 2, Int>::from_data([[first, 1, 2, last]], &device());
            let other = crf.log_likelihood(emissions.clone(), tags, lengths.clone());
            let other: f32 = other.into_data().iter::<f32>().next().unwrap();
            assert!(other <= best + 1e-5, "{other} > {best}");
        }
    }
}

#[test]
fn sequence_loss_by_name_ignores_padding() {
    let LossConfig::SequenceCrossEntropy(config) =
        LossConfig::from_name("SequenceCrossEntropyLoss").unwrap()
    else {
        panic!("Expected a sequence loss configuration");
    };
    let logits = Tensor::<TB, 3>::from_data(
        [[[2.0, 1.0, 0.1], [9.0, -9.0, 0.0]]],
        &device(),
    );
    let labels = Tensor::<TB, 2, Int>::from_data([[0, 1]], &device());
    let lengths = Tensor::<TB, 1, Int>::from_data([1], &device());

    let loss = config.init().forward(logits, labels, Some(lengths));

    loss.into_data()
        .assert_approx_eq::<f32>(&TensorData::from([0.417_030]), Tolerance::default());
}

#[test]
fn arcface_from_json_produces_class_logits() {
    let LossConfig::ArcFace(config) = LossConfig::from_json(
        r#"{ "type": "ArcFace", "embedding_dim": 4, "num_classes": 3, "scale": 8.0 }"#,
    )
    .unwrap() else {
        panic!("Expected an ArcFace configuration");
    };
    let arcface = config.init::<TB>(&device());
    let embedding = Tensor::<TB, 2>::from_data(
        [[1.0, 0.0, 0.5, -0.5], [0.0, 2.0, 0.0, 1.0]],
        &device(),
    );
    let labels = Tensor::<TB, 1, Int>::from_data([2, 0], &device());

    let logits = arcface.forward(embedding, labels);

    assert_eq!(logits.dims(), [2, 3]);
    // s * cos(theta) and the margin penalties stay within s * (1 + m).
    assert!(logits
        .into_data()
        .iter::<f32>()
        .all(|value| value.abs() <= 8.0 * 1.5 + 1e-4));
}

#[test]
fn loading_reports_missing_files_and_bad_json() {
    let dir = tempfile::tempdir().unwrap();

    let missing = LossConfig::load(dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(missing, LossError::Io(_)));

    let path = dir.path().join("broken.json");
    std::fs::write(&path, r#"{ "type": "Focal" }"#).unwrap();
    let broken = LossConfig::load(&path).unwrap_err();
    assert!(matches!(broken, LossError::Config(_)));
}
