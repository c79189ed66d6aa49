//! 物体検出の結果を処理するモジュール

/// 検出テンソルの1行から作るバウンディングボックス
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionData {
    /// バッチ内の番号
    pub batch: usize,
    /// クラス
    pub class: usize,
    /// バウンディングボックス左上のx
    pub x1: f32,
    /// バウンディングボックス左上のy
    pub y1: f32,
    /// バウンディングボックス右下のx
    pub x2: f32,
    /// バウンディングボックス右下のy
    pub y2: f32,
    /// コンフィデンス (objectness)
    pub confidence: f32,
    /// 選ばれたクラスのスコア
    pub class_score: f32,
}

impl DetectionData {
    /// YOLOの結果から新しいDetectionDataを作成します。
    ///
    /// # Args
    ///
    /// * `yolo_result` - (x, y, w, h, objectness, class scores...) の配列
    /// * `batch` - バッチ内の番号
    ///
    /// # Return
    /// * 新たなDetectionDataインスタンス。クラススコアがない場合は `None`
    pub fn new_from_yolo(yolo_result: &[f32], batch: usize) -> Option<Self> {
        if yolo_result.len() < 6 {
            return None;
        }
        // 中心座標
        let cx = yolo_result[0];
        let cy = yolo_result[1];

        // BBoxのサイズ
        let cw = yolo_result[2];
        let ch = yolo_result[3];

        let (class, class_score) = yolo_result[5..]
            .iter()
            .copied()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))?;

        Some(Self {
            batch,
            class,
            x1: cx - cw / 2.,
            y1: cy - ch / 2.,
            x2: cx + cw / 2.,
            y2: cy + ch / 2.,
            confidence: yolo_result[4],
            class_score,
        })
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    /// レターボックス上の座標を元の画像の座標系に戻します。
    ///
    /// # Args
    ///
    /// * `width` - 画像の幅
    /// * `height` - 画像の高さ
    /// * `input_size` - ネットワークの入力サイズ (width, height)
    ///
    /// # Return
    /// * 新たなDetectionDataインスタンス
    pub fn reverse_transform(&self, width: u32, height: u32, input_size: (u32, u32)) -> Self {
        let mut new_d = *self;
        (new_d.x1, new_d.y1) = point_reverse_transform(width, height, input_size, self.x1, self.y1);
        (new_d.x2, new_d.y2) = point_reverse_transform(width, height, input_size, self.x2, self.y2);
        new_d
    }
}

/// レターボックス上の座標を元の画像の座標系に戻します。
fn point_reverse_transform(
    width: u32,
    height: u32,
    input_size: (u32, u32),
    x: f32,
    y: f32,
) -> (f32, f32) {
    let (in_w, in_h) = (input_size.0 as f32, input_size.1 as f32);

    let wratio = in_w / width as f32;
    let hratio = in_h / height as f32;
    let ratio = f32::min(wratio, hratio);
    let nw = width as f32 * ratio;
    let nh = height as f32 * ratio;

    let pad_w = (in_w - nw) / 2.;
    let pad_h = (in_h - nh) / 2.;

    ((x - pad_w) / ratio, (y - pad_h) / ratio)
}
