use crate::detection_result::DetectionData;

fn iou(a: &DetectionData, b: &DetectionData) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    if x1 >= x2 || y1 >= y2 {
        return 0.0;
    }
    let inter = (x2 - x1) * (y2 - y1);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

fn nms(bb: &[DetectionData], nms_threshold: f32) -> Vec<DetectionData> {
    let mut sorted_bb = bb.to_vec();
    sorted_bb.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<DetectionData> = Vec::with_capacity(sorted_bb.len());
    for d in sorted_bb {
        if kept.iter().all(|k| iou(k, &d) <= nms_threshold) {
            kept.push(d);
        }
    }
    kept
}

pub fn nms_process(
    bb: &[DetectionData],
    cls_num: usize,
    obj_threshold: f32,
    nms_threshold: f32,
) -> Vec<DetectionData> {
    // クラス別に分割
    let mut cls: Vec<Vec<DetectionData>> = vec![vec![]; cls_num];
    for &detection in bb {
        if detection.confidence > obj_threshold && detection.class < cls_num {
            cls[detection.class].push(detection);
        }
    }

    // 各クラスに Non-Maximum Suppression (NMS) を適用し，重なっているBBoxの中でコンフィデンスが最大のものを集める
    cls.into_iter()
        .flat_map(|d| nms(&d, nms_threshold))
        .collect()
}
