//! 検出テンソルを人間が扱いやすいバウンディングボックスに変換するモジュール

use candle_core::{DType, Tensor};

use crate::detection_result::DetectionData;
use crate::error::Result;
use crate::nms::nms_process;

/// `Darknet::forward` の出力からバウンディングボックスを取り出します。
///
/// # Args
/// * `detections` - (batch, boxes, 5 + classes) のテンソル
/// * `obj_threshold` - objectness の閾値 (これ以下のボックスは捨てる)
/// * `nms_threshold` - NMS の IoU 閾値
///
/// # Return
/// * バッチ順に並んだ、NMS 後のバウンディングボックス
pub fn post_process(
    detections: &Tensor,
    obj_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<DetectionData>> {
    let (_, _, attrs) = detections.dims3()?;
    let cls_num = attrs.saturating_sub(5);
    let rows = detections.to_dtype(DType::F32)?.to_vec3::<f32>()?;

    let mut result = Vec::new();
    for (batch, boxes) in rows.iter().enumerate() {
        let candidates: Vec<DetectionData> = boxes
            .iter()
            .filter_map(|row| DetectionData::new_from_yolo(row, batch))
            .collect();
        result.extend(nms_process(&candidates, cls_num, obj_threshold, nms_threshold));
    }
    Ok(result)
}
