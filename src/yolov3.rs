//! YOLOv3 のモデルをコントロールするモジュール

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::darknet::Darknet;
use crate::detection_result::DetectionData;
use crate::img_proc;
use crate::postprocess;

/// YOLOv3 のモデルをコントロールする構造体
pub struct YoloV3 {
    net: Darknet,
    obj_threshold: f32,
    nms_threshold: f32,
}

impl YoloV3 {
    /// 新しい `YoloV3` インスタンスを作成します。
    ///
    /// # Args
    /// * `cfg_path` - ネットワーク定義 (cfg) のパス
    /// * `weights_path` - 重みファイルのパス (`.weights` または `.tar.gz`)
    /// * `obj_threshold` - オブジェクトの閾値
    /// * `nms_threshold` - NMSの閾値
    /// * `device` - 推論に使うデバイス
    ///
    /// # Return
    /// * 新たな `YoloV3` インスタンス
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        cfg_path: P,
        weights_path: Q,
        obj_threshold: f32,
        nms_threshold: f32,
        device: &Device,
    ) -> Result<Self> {
        let cfg_path = cfg_path.as_ref();
        let net = Darknet::from_file(cfg_path, device)
            .with_context(|| format!("failed to build network from {}", cfg_path.display()))?;

        let mut s = Self {
            net,
            obj_threshold,
            nms_threshold,
        };
        s.init(weights_path)?;

        Ok(s)
    }

    /// 重みを読み込みます。拡張子が `.gz` の場合は tar.gz アーカイブとして扱います。
    ///
    /// # Args
    /// * `weights_path` - 重みファイルのパス
    pub fn init<P: AsRef<Path>>(&mut self, weights_path: P) -> Result<()> {
        let path = weights_path.as_ref();
        let is_archive = path.extension().is_some_and(|e| e == "gz");
        let loaded = if is_archive {
            self.net.load_weights_archive(path)
        } else {
            self.net.load_weights(path)
        };
        loaded.with_context(|| format!("failed to load weights from {}", path.display()))
    }

    pub fn net(&self) -> &Darknet {
        &self.net
    }

    /// 入力データの処理を開始します。
    ///
    /// # Args
    /// * `input_data` - (batch, 3, height, width) の入力
    ///
    /// # Return
    /// * 全検出レイヤを結合した生の検出テンソル
    pub fn start_processing(&self, input_data: &Tensor) -> Result<Tensor> {
        self.net.forward(input_data).context("forward pass failed")
    }

    /// 入力データから物体を検出します。
    ///
    /// # Args
    /// * `input_data` - (batch, 3, height, width) の入力
    ///
    /// # Return
    /// * 物体検出結果
    pub fn start(&self, input_data: &Tensor) -> Result<Vec<DetectionData>> {
        let detections = self.start_processing(input_data)?;
        let pp = postprocess::post_process(&detections, self.obj_threshold, self.nms_threshold)?;
        Ok(pp)
    }

    /// 画像の処理を開始します。
    ///
    /// # Args
    /// * `img` - 入力画像
    ///
    /// # Return
    /// * 元の画像の座標系での物体検出結果
    pub fn start_with_img_proc(&self, img: &DynamicImage) -> Result<Vec<DetectionData>> {
        let info = self.net.net_info();
        let img_size = (info.width as u32, info.height as u32);
        let letterboxed = img_proc::letterbox(img, img_size.0, img_size.1);
        let input_data = img_proc::image_to_tensor(&letterboxed, self.net.device())?;

        let objs_rev = self
            .start(&input_data)?
            .iter()
            .map(|d| d.reverse_transform(img.width(), img.height(), img_size))
            .collect();

        Ok(objs_rev)
    }
}
