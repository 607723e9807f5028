//! 学習時のデータ拡張
//!
//! 回転、ズーム、せん断、左右反転を1つのアフィン変換にまとめて適用します。
//! 画像の外側は端の画素で埋めます。拡張結果は保存しません。

use image::{imageops, DynamicImage, Rgb, RgbImage};
use rand::Rng;

use crate::model::config::AugmentationSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationPolicy {
    /// 回転範囲（度）
    pub rotation_range: f32,
    /// ズーム範囲
    pub zoom_range: f32,
    /// せん断範囲（度）
    pub shear_range: f32,
    pub horizontal_flip: bool,
    /// 画素値を [0, 1] に縮める（前処理側で適用）
    pub rescale: bool,
}

impl AugmentationPolicy {
    pub fn from_settings(settings: &AugmentationSettings) -> Self {
        Self {
            rotation_range: settings.rotation_range,
            zoom_range: settings.zoom_range,
            shear_range: settings.shear_range,
            horizontal_flip: settings.horizontal_flip,
            rescale: settings.rescale,
        }
    }

    /// 検証用（rescale のみ）
    pub fn validation(&self) -> Self {
        Self {
            rotation_range: 0.0,
            zoom_range: 0.0,
            shear_range: 0.0,
            horizontal_flip: false,
            rescale: self.rescale,
        }
    }

    pub fn is_stochastic(&self) -> bool {
        self.rotation_range > 0.0
            || self.zoom_range > 0.0
            || self.shear_range > 0.0
            || self.horizontal_flip
    }

    /// ランダムな拡張を1回適用した画像を返す
    pub fn apply<R: Rng + ?Sized>(&self, image: &DynamicImage, rng: &mut R) -> DynamicImage {
        if !self.is_stochastic() {
            return image.clone();
        }

        let mut rgb = image.to_rgb8();
        if self.horizontal_flip && rng.gen_bool(0.5) {
            rgb = imageops::flip_horizontal(&rgb);
        }

        let theta = symmetric_sample(rng, self.rotation_range).to_radians();
        let shear = symmetric_sample(rng, self.shear_range).to_radians();
        let (zx, zy) = if self.zoom_range > 0.0 {
            let low = 1.0 - self.zoom_range;
            let high = 1.0 + self.zoom_range;
            (rng.gen_range(low..=high), rng.gen_range(low..=high))
        } else {
            (1.0, 1.0)
        };

        if theta == 0.0 && shear == 0.0 && zx == 1.0 && zy == 1.0 {
            return DynamicImage::ImageRgb8(rgb);
        }

        // 出力座標 → 入力座標: 回転 * せん断 * ズーム
        let (sin_t, cos_t) = theta.sin_cos();
        let (sin_s, cos_s) = shear.sin_cos();
        let a = [[cos_t, -sin_t], [sin_t, cos_t]];
        let b = [[1.0, -sin_s], [0.0, cos_s]];
        let ab = mat_mul(a, b);
        let m = [[ab[0][0] * zx, ab[0][1] * zy], [ab[1][0] * zx, ab[1][1] * zy]];

        DynamicImage::ImageRgb8(warp(&rgb, m))
    }
}

fn symmetric_sample<R: Rng + ?Sized>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

fn mat_mul(a: [[f32; 2]; 2], b: [[f32; 2]; 2]) -> [[f32; 2]; 2] {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}

/// 画像中心まわりの線形変換で再サンプリング（バイリニア、端の画素で埋める）
fn warp(src: &RgbImage, m: [[f32; 2]; 2]) -> RgbImage {
    let (width, height) = src.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = cx + m[0][0] * dx + m[0][1] * dy;
        let sy = cy + m[1][0] * dx + m[1][1] * dy;
        sample_bilinear(src, sx, sy)
    })
}

fn sample_bilinear(src: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = src.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = src.get_pixel(x0, y0);
    let p10 = src.get_pixel(x1, y0);
    let p01 = src.get_pixel(x0, y1);
    let p11 = src.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
