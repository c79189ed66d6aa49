//! YOLOのレイヤに関するモジュール

use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig};

use crate::darknet::OutputCache;
use crate::error::{DarknetError, Result};
use crate::weights::WeightReader;
use crate::yolo::Yolo;

/// leaky ReLU の負側の傾き
pub const LEAKY_SLOPE: f64 = 0.1;

/// バッチ正規化の分母に足す値
pub const BN_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 活性化関数の種類を表す列挙型
pub enum Activation {
    Linear,
    Leaky,
}

/// バッチ正規化のパラメータ
///
/// 推論時の正規化は `candle_nn::BatchNorm` が行います。
#[derive(Debug, Clone)]
pub struct BatchNorm {
    bias: Tensor,
    scale: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    inner: candle_nn::BatchNorm,
}

impl BatchNorm {
    fn new(bias: Tensor, scale: Tensor, running_mean: Tensor, running_var: Tensor) -> Result<Self> {
        let inner = candle_nn::BatchNorm::new(
            scale.elem_count(),
            running_mean.clone(),
            running_var.clone(),
            scale.clone(),
            bias.clone(),
            BN_EPS,
        )?;
        Ok(Self {
            bias,
            scale,
            running_mean,
            running_var,
            inner,
        })
    }

    /// 恒等変換になる初期値 (scale 1, bias 0, mean 0, var 1) で作成します。
    fn identity(channels: usize, device: &Device) -> Result<Self> {
        Self::new(
            Tensor::zeros(channels, DType::F32, device)?,
            Tensor::ones(channels, DType::F32, device)?,
            Tensor::zeros(channels, DType::F32, device)?,
            Tensor::ones(channels, DType::F32, device)?,
        )
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Tensor {
        &self.running_var
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.apply_t(&self.inner, false)?)
    }
}

/// 畳み込みレイヤ (conv -> [batch norm] -> [leaky])
#[derive(Debug, Clone)]
pub struct Convolutional {
    /// 入力のチャネル数
    pub in_channels: usize,
    /// 出力のチャネル数
    pub filters: usize,
    /// カーネルサイズ
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
    conv: Conv2d,
    batch_norm: Option<BatchNorm>,
}

impl Convolutional {
    /// 新しい畳み込みレイヤを作成します。パラメータは重みを読み込むまでゼロ (BNは恒等) です。
    ///
    /// # Args
    /// * `in_channels` - 入力のチャネル数
    /// * `filters` - 出力のチャネル数
    /// * `kernel` - カーネルサイズ
    /// * `stride` - ストライド
    /// * `padding` - パディング
    /// * `batch_normalize` - バッチ正規化を行うか (行う場合は畳み込みのバイアスを持たない)
    /// * `activation` - 活性化関数の種類
    /// * `device` - パラメータを置くデバイス
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        filters: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        batch_normalize: bool,
        activation: Activation,
        device: &Device,
    ) -> Result<Self> {
        let weight = Tensor::zeros((filters, in_channels, kernel, kernel), DType::F32, device)?;
        let (bias, batch_norm) = if batch_normalize {
            (None, Some(BatchNorm::identity(filters, device)?))
        } else {
            (Some(Tensor::zeros(filters, DType::F32, device)?), None)
        };
        Ok(Self {
            in_channels,
            filters,
            kernel,
            stride,
            padding,
            activation,
            conv: Conv2d::new(weight, bias, conv_config(padding, stride)),
            batch_norm,
        })
    }

    /// 畳み込みの重み (filters, in_channels, kernel, kernel)
    pub fn weight(&self) -> &Tensor {
        self.conv.weight()
    }

    /// 畳み込みのバイアス。バッチ正規化を行う場合は `None`
    pub fn bias(&self) -> Option<&Tensor> {
        self.conv.bias()
    }

    pub fn batch_norm(&self) -> Option<&BatchNorm> {
        self.batch_norm.as_ref()
    }

    /// このレイヤが重みファイルから読む float の数
    pub fn num_params(&self) -> usize {
        let shift = if self.batch_norm.is_some() { 4 } else { 1 };
        self.filters * shift + self.weight().elem_count()
    }

    /// 重みファイルからパラメータを読み込みます。
    ///
    /// 順序は [BN bias, BN scale, running mean, running var] または [conv bias]、その後に畳み込みの重みです。
    pub(crate) fn load(&mut self, index: usize, reader: &mut WeightReader<'_>) -> Result<()> {
        let device = self.weight().device().clone();
        let n = [self.filters];

        let bias = if self.batch_norm.is_some() {
            let bias = read_tensor(reader, index, &n, &device)?;
            let scale = read_tensor(reader, index, &n, &device)?;
            let mean = read_tensor(reader, index, &n, &device)?;
            let var = read_tensor(reader, index, &n, &device)?;
            self.batch_norm = Some(BatchNorm::new(bias, scale, mean, var)?);
            None
        } else {
            Some(read_tensor(reader, index, &n, &device)?)
        };

        let shape = self.weight().dims().to_vec();
        let weight = read_tensor(reader, index, &shape, &device)?;
        self.conv = Conv2d::new(weight, bias, conv_config(self.padding, self.stride));
        Ok(())
    }

    pub fn forward(&self, index: usize, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims();
        if dims.len() != 4 || dims[1] != self.in_channels {
            return Err(DarknetError::ShapeMismatch {
                index,
                kind: "convolutional",
                expected: vec![self.in_channels],
                actual: dims.to_vec(),
            });
        }

        let mut y = x.contiguous()?.apply(&self.conv)?;
        if let Some(bn) = &self.batch_norm {
            y = bn.forward(&y)?;
        }
        match self.activation {
            Activation::Leaky => Ok(candle_nn::ops::leaky_relu(&y, LEAKY_SLOPE)?),
            Activation::Linear => Ok(y),
        }
    }
}

fn conv_config(padding: usize, stride: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    }
}

/// `shape` の要素数だけ float を読み、その形のテンソルにします。
fn read_tensor(
    reader: &mut WeightReader<'_>,
    index: usize,
    shape: &[usize],
    device: &Device,
) -> Result<Tensor> {
    let len = shape.iter().product();
    let block = reader.take(len, index, "convolutional")?;
    Ok(Tensor::from_slice(block, shape, device)?)
}

/// 双線形補間によるアップサンプリング (align_corners = false)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsample {
    pub scale: usize,
}

impl Upsample {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        Ok(x.upsample_bilinear2d(h * self.scale, w * self.scale, false)?)
    }
}

/// 以前のレイヤの出力をそのまま、または2つをチャネル方向に結合して出力する
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// 参照するレイヤの相対位置 (常に負)
    pub offsets: Vec<isize>,
}

impl Route {
    pub fn forward(&self, index: usize, cache: &OutputCache) -> Result<Tensor> {
        let inputs = self
            .offsets
            .iter()
            .map(|&offset| cache.get(index, offset, "route"))
            .collect::<Result<Vec<_>>>()?;

        if let [first, rest @ ..] = inputs.as_slice() {
            let (_, _, h, w) = first.dims4()?;
            for t in rest {
                let (b, c, th, tw) = t.dims4()?;
                if (th, tw) != (h, w) {
                    return Err(DarknetError::ShapeMismatch {
                        index,
                        kind: "route",
                        expected: first.dims().to_vec(),
                        actual: vec![b, c, th, tw],
                    });
                }
            }
        }
        match inputs.as_slice() {
            [single] => Ok((*single).clone()),
            many => Ok(Tensor::cat(many, 1)?),
        }
    }
}

/// 直前のレイヤの出力と `from` が指すレイヤの出力の和 (残差接続)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortcut {
    /// 足し合わせるレイヤの相対位置 (常に負)
    pub from: isize,
}

impl Shortcut {
    pub fn forward(&self, index: usize, cache: &OutputCache) -> Result<Tensor> {
        let prev = cache.get(index, -1, "shortcut")?;
        let other = cache.get(index, self.from, "shortcut")?;
        if prev.dims() != other.dims() {
            return Err(DarknetError::ShapeMismatch {
                index,
                kind: "shortcut",
                expected: prev.dims().to_vec(),
                actual: other.dims().to_vec(),
            });
        }
        Ok(prev.add(other)?)
    }
}

/// グラフを構成するレイヤ
#[derive(Debug, Clone)]
pub enum LayerNode {
    Convolutional(Convolutional),
    Upsample(Upsample),
    Route(Route),
    Shortcut(Shortcut),
    Yolo(Yolo),
}

impl LayerNode {
    /// cfg 上のレイヤタイプ名
    pub fn kind(&self) -> &'static str {
        match self {
            LayerNode::Convolutional(_) => "convolutional",
            LayerNode::Upsample(_) => "upsample",
            LayerNode::Route(_) => "route",
            LayerNode::Shortcut(_) => "shortcut",
            LayerNode::Yolo(_) => "yolo",
        }
    }
}
