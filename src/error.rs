//! ネットワークの構築・重み読み込み・推論で発生するエラー

use std::path::PathBuf;

use thiserror::Error;

/// このクレートのエラー型
#[derive(Debug, Error)]
pub enum DarknetError {
    /// cfg テキストの書式エラー
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// 未対応のレイヤタイプ
    #[error("unsupported layer type `{kind}` at layer {index}")]
    UnsupportedLayer { index: usize, kind: String },

    #[error("layer {index} ({kind}): missing key `{key}`")]
    MissingKey {
        index: usize,
        kind: &'static str,
        key: &'static str,
    },

    #[error("layer {index} ({kind}): invalid value `{value}` for `{key}`")]
    InvalidValue {
        index: usize,
        kind: &'static str,
        key: &'static str,
        value: String,
    },

    /// route / shortcut が存在しない（または前方の）レイヤを参照している
    #[error("layer {index} ({kind}): reference {reference} does not point to an earlier layer")]
    LayerIndex {
        index: usize,
        kind: &'static str,
        reference: isize,
    },

    #[error("layer {index} ({kind}): shape mismatch, expected {expected:?} but got {actual:?}")]
    ShapeMismatch {
        index: usize,
        kind: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// 重みファイルの float が足りない
    #[error(
        "weight file truncated at layer {index} ({kind}): needed {needed} floats, {remaining} remaining"
    )]
    TruncatedWeightFile {
        index: usize,
        kind: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("weight file header is incomplete: {len} bytes")]
    TruncatedHeader { len: usize },

    #[error("weight payload of {len} bytes is not a multiple of 4")]
    MisalignedWeights { len: usize },

    #[error("weight file has {remaining} unread floats after the last layer")]
    TrailingWeights { remaining: usize },

    #[error("model weights are partially loaded; reload weights before running")]
    PartiallyLoaded,

    #[error("network has no yolo layer")]
    NoDetectionLayer,

    #[error("no `.weights` entry in archive {0}")]
    ArchiveEntryNotFound(PathBuf),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DarknetError>;
