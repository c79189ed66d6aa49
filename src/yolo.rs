//! YOLO 検出レイヤの出力をバウンディングボックスに変換するモジュール

use candle_core::{Tensor, D};

use crate::cfg::NetInfo;
use crate::error::{DarknetError, Result};

/// アンカーボックス (ピクセル単位)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub width: f32,
    pub height: f32,
}

/// YOLO 検出レイヤ
#[derive(Debug, Clone, PartialEq)]
pub struct Yolo {
    /// mask で選ばれたアンカー
    pub anchors: Vec<Anchor>,
    /// クラス数
    pub classes: usize,
}

impl Yolo {
    /// 1セルあたりの出力チャネル数 (anchors * (5 + classes))
    pub fn expected_channels(&self) -> usize {
        self.anchors.len() * (5 + self.classes)
    }

    /// 検出レイヤへの入力を (batch, anchors * grid_h * grid_w, 5 + classes) に変換します。
    pub fn forward(&self, index: usize, x: &Tensor, net: &NetInfo) -> Result<Tensor> {
        let dims = x.dims();
        if dims.len() != 4 || dims[1] != self.expected_channels() {
            return Err(DarknetError::ShapeMismatch {
                index,
                kind: "yolo",
                expected: vec![self.expected_channels()],
                actual: dims.to_vec(),
            });
        }
        predict_transform(x, (net.width, net.height), &self.anchors, self.classes)
    }
}

/// 特徴マップの生の出力を入力画像の座標系のボックスに変換します。
///
/// # Args
/// * `x` - (batch, anchors * (5 + classes), grid_h, grid_w) のテンソル
/// * `input_size` - ネットワークの入力サイズ (width, height)
/// * `anchors` - このレイヤのアンカー
/// * `num_classes` - クラス数
///
/// # Return
/// * (batch, anchors * grid_h * grid_w, 5 + classes) のテンソル。
///   最後の次元は (x, y, w, h, objectness, class scores...)、並びはアンカー、行、列の順
pub fn predict_transform(
    x: &Tensor,
    input_size: (usize, usize),
    anchors: &[Anchor],
    num_classes: usize,
) -> Result<Tensor> {
    let (batch, _, grid_h, grid_w) = x.dims4()?;
    let device = x.device();
    let dtype = x.dtype();
    let attrs = 5 + num_classes;
    let num_anchors = anchors.len();
    let cells = grid_h * grid_w;

    let stride_x = input_size.0 as f32 / grid_w as f32;
    let stride_y = input_size.1 as f32 / grid_h as f32;

    // (batch, anchors, cells, attrs)
    let p = x
        .reshape((batch, num_anchors, attrs, cells))?
        .transpose(2, 3)?
        .contiguous()?;

    // セル内の相対位置 -> グリッド座標
    let offsets: Vec<f32> = (0..grid_h)
        .flat_map(|row| (0..grid_w).flat_map(move |col| [col as f32, row as f32]))
        .collect();
    let offsets = Tensor::from_vec(offsets, (1, 1, cells, 2), device)?.to_dtype(dtype)?;
    let stride = Tensor::from_vec(vec![stride_x, stride_y], (1, 1, 1, 2), device)?.to_dtype(dtype)?;

    // アンカーをグリッド単位に正規化
    let grid_anchors: Vec<f32> = anchors
        .iter()
        .flat_map(|a| [a.width / stride_x, a.height / stride_y])
        .collect();
    let grid_anchors =
        Tensor::from_vec(grid_anchors, (1, num_anchors, 1, 2), device)?.to_dtype(dtype)?;

    let xy = candle_nn::ops::sigmoid(&p.narrow(D::Minus1, 0, 2)?)?
        .broadcast_add(&offsets)?
        .broadcast_mul(&stride)?;
    let wh = p
        .narrow(D::Minus1, 2, 2)?
        .exp()?
        .broadcast_mul(&grid_anchors)?
        .broadcast_mul(&stride)?;
    let scores = candle_nn::ops::sigmoid(&p.narrow(D::Minus1, 4, attrs - 4)?)?;

    let out = Tensor::cat(&[&xy, &wh, &scores], D::Minus1)?;
    Ok(out.reshape((batch, num_anchors * cells, attrs))?)
}
