//! # Darknet YOLOv3 推論ライブラリ
//!
//! このクレートは、Darknet 形式のネットワーク定義 (cfg) と重みファイルから YOLOv3 を組み立てて推論するための Rust ライブラリです。
//! テンソル演算には candle を使います。
//!
//! ## 主な機能
//!
//! 1. **cfg の読み込み**: `[section]` と `key=value` からなるネットワーク定義をレイヤ設定の列に変換します。
//! 2. **ネットワークの構築**: レイヤ設定から畳み込み・アップサンプル・route・shortcut・yolo レイヤを組み立てます。
//! 3. **重みの読み込み**: Darknet 形式の重みファイル (または tar.gz アーカイブ) をレイヤのパラメータに割り当てます。
//! 4. **推論と後処理**: 検出レイヤの出力を入力画像の座標系のボックスに変換し、NMS をかけます。
//!
//! ## Example
//! ```no_run
//! use candle_core::Device;
//! use yolo_v3_darknet::yolov3::YoloV3;
//!
//! let yolo = YoloV3::new("yolov3.cfg", "yolov3.weights", 0.5, 0.4, &Device::Cpu)?;
//! let img = image::open("dog.jpg")?;
//! let result = yolo.start_with_img_proc(&img)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod builder;
pub mod cfg;
pub mod darknet;
pub mod detection_result;
pub mod error;
pub mod img_proc;
pub mod layer;
pub mod postprocess;
pub mod weights;
pub mod yolo;
pub mod yolov3;

mod nms;

pub use darknet::{Darknet, WeightState};
pub use error::{DarknetError, Result};
