use std::time::Instant;

use anyhow::{bail, Result};
use candle_core::Device;
use log::info;

use yolo_v3_darknet::img_proc::draw_bbox;
use yolo_v3_darknet::yolov3::YoloV3;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        bail!("usage: {} <cfg> <weights|weights.tar.gz> <image>", args[0]);
    }

    // YOLOのモデルを初期化
    let yolo = YoloV3::new(&args[1], &args[2], 0.5, 0.4, &Device::Cpu)?;

    // テスト画像を読み込む
    let test_img = image::open(&args[3])?;

    let start = Instant::now();

    // YOLOの処理を開始
    let result = yolo.start_with_img_proc(&test_img)?;

    let t = start.elapsed().as_secs_f64() * 1000.0;
    for d in &result {
        info!(
            "class {} ({:.2}) conf {:.2}: ({:.1}, {:.1}) - ({:.1}, {:.1})",
            d.class, d.class_score, d.confidence, d.x1, d.y1, d.x2, d.y2
        );
    }
    println!("{} objects, processing time:{:.03}ms", result.len(), t);

    // BBox描画のためDynamicImageをRGB画像に変換
    let mut rgb_img = test_img.to_rgb8();
    draw_bbox(&mut rgb_img, &result, 3.);

    // 画像を保存
    std::fs::create_dir_all("./out")?;
    rgb_img.save("./out/out.png")?;

    Ok(())
}
