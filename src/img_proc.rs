//! YOLOに関する画像処理モジュール

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, Pixel, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use crate::detection_result::DetectionData;
use crate::error::Result;

/// 画像をリサイズし、ネットワークの入力サイズに整形します。
///
/// # Args
///
/// * `img` - リサイズを行う画像
/// * `width` - リサイズ後の画像の幅
/// * `height` - リサイズ後の画像の高さ
///
/// # Return
///
/// * アスペクト比を保ったまま縮小し、中央に配置したRGB画像 (余白は黒)
pub fn letterbox(img: &DynamicImage, width: u32, height: u32) -> RgbImage {
    let resized = img.resize(width, height, FilterType::Nearest);

    let pad_w = resized.width().abs_diff(width) / 2;
    let pad_h = resized.height().abs_diff(height) / 2;

    let mut new_img = RgbImage::new(width, height);
    for (x, y, &pixel) in resized.to_rgb8().enumerate_pixels() {
        new_img.put_pixel(x + pad_w, y + pad_h, pixel);
    }
    new_img
}

/// RGB画像を (1, 3, height, width) のテンソルに変換します。画素値は [0, 1] に正規化します。
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let data: Vec<f32> = img.as_raw().iter().map(|&v| f32::from(v)).collect();
    let t = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .affine(1. / 255., 0.)?
        .unsqueeze(0)?;
    Ok(t)
}

const COLORS: [[u8; 3]; 10] = [
    [255, 0, 0],
    [255, 255, 0],
    [0, 0, 255],
    [14, 23, 50],
    [28, 105, 80],
    [190, 159, 53],
    [46, 194, 148],
    [242, 30, 131],
    [97, 101, 198],
    [115, 11, 87],
];

/// 画像上に線を描画します。
///
/// # Args
///
/// * `img` - 線を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 線の始点と終点の座標 (水平または垂直)
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_line(
    img: &mut RgbImage,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    thickness: f32,
    color: image::Rgb<u8>,
) {
    let (bx, by) = (
        x1.min(x2) - (thickness / 2.).floor(),
        y1.min(y2) - (thickness / 2.).floor(),
    );

    let (w, h) = if x1 == x2 {
        (thickness, (y2 - y1).abs() + thickness)
    } else {
        ((x2 - x1).abs() + thickness, thickness)
    };

    let rect = Rect::at(bx as i32, by as i32).of_size((w as u32).max(1), (h as u32).max(1));
    draw_filled_rect_mut(img, rect, color);
}

/// 画像上にバウンディングボックスを描画します。
///
/// # Args
///
/// * `img` - バウンディングボックスを描画する画像 (in-place)
/// * `d_result` - 検出結果の配列
/// * `line_thickness` - バウンディングボックスの線の太さ
pub fn draw_bbox(img: &mut RgbImage, d_result: &[DetectionData], line_thickness: f32) {
    let mut sorted = d_result.to_vec();
    sorted.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    for d in sorted.iter() {
        let color = *image::Rgb::from_slice(&COLORS[d.class % COLORS.len()]);

        let x1 = d.x1.round();
        let y1 = d.y1.round();
        let x2 = d.x2.round();
        let y2 = d.y2.round();

        draw_line(img, x1, y1, x1, y2, line_thickness, color);
        draw_line(img, x1, y2, x2, y2, line_thickness, color);
        draw_line(img, x1, y1, x2, y1, line_thickness, color);
        draw_line(img, x2, y1, x2, y2, line_thickness, color);
    }
}
