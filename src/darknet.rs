//! cfg と重みファイルから組み立てる Darknet ネットワーク

use std::path::Path;

use candle_core::{Device, Tensor};
use log::{info, warn};

use crate::builder::build_graph;
use crate::cfg::{self, LayerSpec, NetInfo};
use crate::error::{DarknetError, Result};
use crate::layer::LayerNode;
use crate::weights::{self, WeightFile, WeightHeader};

/// 1回の推論の間だけ保持する各レイヤの出力
///
/// 添字はレイヤ番号と一致し、レイヤ `i` の出力は `i` より後のレイヤからしか参照されません。
#[derive(Debug, Default)]
pub struct OutputCache {
    outputs: Vec<Tensor>,
}

impl OutputCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            outputs: Vec::with_capacity(capacity),
        }
    }

    /// 次のレイヤの出力を格納します。
    pub fn push(&mut self, output: Tensor) {
        self.outputs.push(output);
    }

    /// レイヤ `index` から見て `offset` だけ前のレイヤの出力を取得します。
    pub fn get(&self, index: usize, offset: isize, kind: &'static str) -> Result<&Tensor> {
        let target = index as isize + offset;
        if offset >= 0 || target < 0 {
            return Err(DarknetError::LayerIndex {
                index,
                kind,
                reference: offset,
            });
        }
        self.outputs
            .get(target as usize)
            .ok_or(DarknetError::LayerIndex {
                index,
                kind,
                reference: offset,
            })
    }
}

/// 重みの読み込み状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightState {
    /// 初期値のまま
    Unloaded,
    /// 読み込みが途中で失敗した
    Partial,
    Loaded,
}

/// cfg から組み立てたネットワーク
#[derive(Debug)]
pub struct Darknet {
    net_info: NetInfo,
    layers: Vec<LayerNode>,
    channels: Vec<usize>,
    header: Option<WeightHeader>,
    weight_state: WeightState,
    device: Device,
}

impl Darknet {
    /// cfg テキストからネットワークを組み立てます。
    pub fn new(text: &str, device: &Device) -> Result<Self> {
        Self::from_specs(&cfg::parse_cfg(text)?, device)
    }

    /// cfg ファイルからネットワークを組み立てます。
    pub fn from_file<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        Self::from_specs(&cfg::read_cfg(path)?, device)
    }

    /// パース済みのレイヤ設定の列 (先頭は `[net]`) からネットワークを組み立てます。
    pub fn from_specs(specs: &[LayerSpec], device: &Device) -> Result<Self> {
        let (net_spec, layer_specs) = specs.split_first().ok_or_else(|| DarknetError::Parse {
            line: 0,
            message: "no [section] headers found".to_string(),
        })?;
        let net_info = NetInfo::from_spec(net_spec)?;
        let graph = build_graph(layer_specs, net_info.channels, device)?;

        let num_yolo = graph
            .layers
            .iter()
            .filter(|l| matches!(l, LayerNode::Yolo(_)))
            .count();
        info!(
            "built {} layers ({} yolo) for {}x{} input, {} weight values expected",
            graph.layers.len(),
            num_yolo,
            net_info.width,
            net_info.height,
            weights::num_params(&graph.layers)
        );

        Ok(Self {
            net_info,
            layers: graph.layers,
            channels: graph.channels,
            header: None,
            weight_state: WeightState::Unloaded,
            device: device.clone(),
        })
    }

    pub fn net_info(&self) -> &NetInfo {
        &self.net_info
    }

    pub fn layers(&self) -> &[LayerNode] {
        &self.layers
    }

    /// 各レイヤの出力チャネル数 (`layers()` と同じ添字)
    pub fn output_channels(&self) -> &[usize] {
        &self.channels
    }

    /// 最後に読み込んだ重みファイルのヘッダ
    pub fn header(&self) -> Option<&WeightHeader> {
        self.header.as_ref()
    }

    pub fn weight_state(&self) -> WeightState {
        self.weight_state
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// 重みファイルが持つべき float の数
    pub fn num_params(&self) -> usize {
        weights::num_params(&self.layers)
    }

    /// 重みファイルを読み込みます。
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = WeightFile::read(path)?;
        self.bind_weights(file)
    }

    /// メモリ上の重みファイルを読み込みます。
    pub fn load_weights_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let file = WeightFile::from_bytes(bytes)?;
        self.bind_weights(file)
    }

    /// `.tar.gz` アーカイブ内の `.weights` ファイルを読み込みます。
    pub fn load_weights_archive<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = WeightFile::read_archive(path)?;
        self.bind_weights(file)
    }

    /// 解釈済みの重みをレイヤに割り当てます。
    ///
    /// 失敗した場合、ネットワークは `WeightState::Partial` になり推論できません。
    pub fn bind_weights(&mut self, file: WeightFile) -> Result<()> {
        let h = file.header;
        info!(
            "weights v{}.{}.{}, seen {} images, {} values",
            h.major,
            h.minor,
            h.revision,
            h.seen,
            file.values.len()
        );

        self.header = Some(h);
        self.weight_state = WeightState::Partial;
        if let Err(e) = weights::load_into(&mut self.layers, &file.values) {
            warn!("weight loading failed: {}", e);
            return Err(e);
        }
        self.weight_state = WeightState::Loaded;
        Ok(())
    }

    /// 推論を行います。
    ///
    /// # Args
    /// * `x` - (batch, channels, height, width) の入力
    ///
    /// # Return
    /// * 全ての yolo レイヤの検出結果を結合した (batch, boxes, 5 + classes) のテンソル
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.weight_state == WeightState::Partial {
            return Err(DarknetError::PartiallyLoaded);
        }

        let mut cache = OutputCache::with_capacity(self.layers.len());
        let mut detections: Option<Tensor> = None;
        let mut x = x.clone();

        for (index, layer) in self.layers.iter().enumerate() {
            x = match layer {
                LayerNode::Convolutional(conv) => conv.forward(index, &x)?,
                LayerNode::Upsample(upsample) => upsample.forward(&x)?,
                LayerNode::Route(route) => route.forward(index, &cache)?,
                LayerNode::Shortcut(shortcut) => shortcut.forward(index, &cache)?,
                LayerNode::Yolo(yolo) => {
                    let d = yolo.forward(index, &x, &self.net_info)?;
                    detections = Some(match detections.take() {
                        Some(acc) => Tensor::cat(&[&acc, &d], 1)?,
                        None => d,
                    });
                    // キャッシュには変換前の入力を残す
                    x
                }
            };
            cache.push(x.clone());
        }

        detections.ok_or(DarknetError::NoDetectionLayer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn cache_only_returns_earlier_outputs() {
        let mut cache = OutputCache::default();
        cache.push(Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        cache.push(Tensor::ones(1, DType::F32, &Device::Cpu).unwrap());

        let t = cache.get(2, -1, "route").unwrap();
        assert_eq!(t.to_vec1::<f32>().unwrap(), vec![1.0]);
        assert!(cache.get(2, 0, "route").is_err());
        assert!(cache.get(2, -3, "route").is_err());
        // まだ格納されていないレイヤ
        assert!(cache.get(4, -1, "route").is_err());
    }

    #[test]
    fn network_without_yolo_reports_it() {
        let net = Darknet::new(
            "[net]\nwidth=4\nheight=4\n[convolutional]\nfilters=2\nsize=1\nstride=1\npad=0\nactivation=linear\n",
            &Device::Cpu,
        )
        .unwrap();
        let x = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(net.forward(&x), Err(DarknetError::NoDetectionLayer)));
    }
}
