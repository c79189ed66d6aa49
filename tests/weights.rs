mod common;

use std::fs::File;

use candle_core::{DType, Device, Tensor};
use flate2::write::GzEncoder;
use flate2::Compression;
use yolo_v3_darknet::layer::LayerNode;
use yolo_v3_darknet::{Darknet, DarknetError, WeightState};

use common::{sentinel_values, weight_file, TINY_CFG, TINY_PARAMS};

fn values_of(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

fn range(start: usize, end: usize) -> Vec<f32> {
    (start..end).map(|i| i as f32).collect()
}

#[test]
fn predicted_param_count() {
    let net = Darknet::new(TINY_CFG, &Device::Cpu).unwrap();
    assert_eq!(net.num_params(), TINY_PARAMS);
    assert_eq!(TINY_PARAMS, 154);
}

#[test]
fn sentinel_values_land_in_file_order() {
    let mut net = Darknet::new(TINY_CFG, &Device::Cpu).unwrap();
    let bytes = weight_file(12_345, &sentinel_values(TINY_PARAMS));
    net.load_weights_from_bytes(&bytes).unwrap();

    assert_eq!(net.weight_state(), WeightState::Loaded);
    let header = net.header().unwrap();
    assert_eq!((header.major, header.minor, header.revision), (0, 2, 0));
    assert_eq!(header.seen, 12_345);

    let (first, second) = match (&net.layers()[0], &net.layers()[1]) {
        (LayerNode::Convolutional(a), LayerNode::Convolutional(b)) => (a, b),
        _ => panic!("expected two convolutional layers"),
    };

    let bn = first.batch_norm().unwrap();
    assert_eq!(values_of(bn.bias()), range(0, 4));
    assert_eq!(values_of(bn.scale()), range(4, 8));
    assert_eq!(values_of(bn.running_mean()), range(8, 12));
    assert_eq!(values_of(bn.running_var()), range(12, 16));
    assert_eq!(first.weight().dims(), &[4, 3, 3, 3]);
    assert_eq!(values_of(first.weight()), range(16, 124));
    assert!(first.bias().is_none());

    assert_eq!(values_of(second.bias().unwrap()), range(124, 130));
    assert_eq!(second.weight().dims(), &[6, 4, 1, 1]);
    assert_eq!(values_of(second.weight()), range(130, 154));
}

#[test]
fn one_float_short_is_truncated() {
    let mut net = Darknet::new(TINY_CFG, &Device::Cpu).unwrap();
    let bytes = weight_file(0, &sentinel_values(TINY_PARAMS - 1));
    match net.load_weights_from_bytes(&bytes) {
        Err(DarknetError::TruncatedWeightFile {
            index,
            kind,
            needed,
            remaining,
        }) => {
            assert_eq!((index, kind), (1, "convolutional"));
            assert_eq!((needed, remaining), (24, 23));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // 途中まで書き込まれたモデルは推論できない
    assert_eq!(net.weight_state(), WeightState::Partial);
    let x = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
    assert!(matches!(net.forward(&x), Err(DarknetError::PartiallyLoaded)));

    // 正しい重みで読み直せば推論できる
    let bytes = weight_file(0, &common::tiny_values());
    net.load_weights_from_bytes(&bytes).unwrap();
    assert_eq!(net.weight_state(), WeightState::Loaded);
    assert!(net.forward(&x).is_ok());
}

#[test]
fn extra_floats_are_rejected() {
    let mut net = Darknet::new(TINY_CFG, &Device::Cpu).unwrap();
    let bytes = weight_file(0, &sentinel_values(TINY_PARAMS + 1));
    assert!(matches!(
        net.load_weights_from_bytes(&bytes),
        Err(DarknetError::TrailingWeights { remaining: 1 })
    ));
    assert_eq!(net.weight_state(), WeightState::Partial);
}

#[test]
fn loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.weights");
    std::fs::write(&path, weight_file(7, &sentinel_values(TINY_PARAMS))).unwrap();

    let mut net = Darknet::new(TINY_CFG, &Device::Cpu).unwrap();
    net.load_weights(&path).unwrap();
    assert_eq!(net.header().map(|h| h.seen), Some(7));
}

#[test]
fn loads_from_tar_gz_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.tar.gz");

    let readme = b"toy weights".to_vec();
    let weights = weight_file(3, &sentinel_values(TINY_PARAMS));
    {
        let gz = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in [("model/README", &readme), ("model/tiny.weights", &weights)] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_slice()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    let mut net = Darknet::new(TINY_CFG, &Device::Cpu).unwrap();
    net.load_weights_archive(&path).unwrap();
    assert_eq!(net.weight_state(), WeightState::Loaded);
    assert_eq!(net.header().map(|h| h.seen), Some(3));
}

#[test]
fn archive_without_weights_entry_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.tar.gz");
    {
        let gz = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let builder = tar::Builder::new(gz);
        builder.into_inner().unwrap().finish().unwrap();
    }

    let mut net = Darknet::new(TINY_CFG, &Device::Cpu).unwrap();
    assert!(matches!(
        net.load_weights_archive(&path),
        Err(DarknetError::ArchiveEntryNotFound(_))
    ));
    assert_eq!(net.weight_state(), WeightState::Unloaded);
}
