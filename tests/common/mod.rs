#![allow(dead_code)]

/// conv(BN) -> conv -> yolo の最小構成
pub const TINY_CFG: &str = "\
[net]
width=4
height=4
channels=3

[convolutional]
batch_normalize=1
filters=4
size=3
stride=1
pad=1
activation=leaky

[convolutional]
filters=6
size=1
stride=1
pad=0
activation=linear

[yolo]
mask=0
anchors=2,3
classes=1
";

/// TINY_CFG が読む float の数
pub const TINY_PARAMS: usize = (4 * 4 + 4 * 3 * 3 * 3) + (6 + 6 * 4);

/// ヘッダ付きの重みファイルを作ります。
pub fn weight_file(seen: u64, values: &[f32]) -> Vec<u8> {
    let header = [0u32, 2, 0, seen as u32, (seen >> 32) as u32];
    header
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .chain(values.iter().flat_map(|v| v.to_le_bytes()))
        .collect()
}

/// 添字をそのまま値にした重み
pub fn sentinel_values(len: usize) -> Vec<f32> {
    (0..len).map(|i| i as f32).collect()
}

/// TINY_CFG 用の、推論して意味のある値になる重み
pub fn tiny_values() -> Vec<f32> {
    let mut v = Vec::with_capacity(TINY_PARAMS);
    v.extend([0.1f32; 4]); // BN bias
    v.extend([1.0f32; 4]); // BN scale
    v.extend([0.0f32; 4]); // running mean
    v.extend([1.0f32; 4]); // running var
    v.extend((0..108).map(|i| ((i % 7) as f32 - 3.) * 0.05));
    v.extend([0.0f32; 6]); // conv bias
    v.extend((0..24).map(|i| ((i % 5) as f32 - 2.) * 0.1));
    assert_eq!(v.len(), TINY_PARAMS);
    v
}

pub fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-4
}
