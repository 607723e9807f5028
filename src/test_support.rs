//! テスト用の共通部品

use image::{DynamicImage, Rgb, RgbImage};
use std::path::Path;

use crate::backbone::{BackboneKind, FeatureExtractor};
use crate::error::{Result, VisionError};
use crate::types::{FeatureVector, LabelSet, LabeledSample};

/// 平均色を特徴ベクトルにする決定的な抽出器
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorStatsExtractor;

impl FeatureExtractor for ColorStatsExtractor {
    fn feature_len(&self) -> usize {
        3
    }

    fn input_size(&self) -> u32 {
        8
    }

    fn extract(&self, image: &DynamicImage) -> Result<FeatureVector> {
        let rgb = image.to_rgb8();
        let count = (rgb.width() * rgb.height()) as f32;
        if count == 0.0 {
            return Err(VisionError::InvalidImage {
                path: "<memory>".to_string(),
                reason: "image has zero area".to_string(),
            });
        }
        let mut sums = [0f32; 3];
        for pixel in rgb.pixels() {
            for c in 0..3 {
                sums[c] += pixel[c] as f32 / 255.0;
            }
        }
        Ok(FeatureVector::new(sums.iter().map(|s| s / count).collect()))
    }
}

/// バックボーンの種類とリスケール設定を名乗る平均色抽出器
#[derive(Debug, Clone, Copy)]
pub struct TaggedExtractor {
    pub kind: BackboneKind,
    pub rescale: bool,
}

impl FeatureExtractor for TaggedExtractor {
    fn feature_len(&self) -> usize {
        ColorStatsExtractor.feature_len()
    }

    fn input_size(&self) -> u32 {
        ColorStatsExtractor.input_size()
    }

    fn extract(&self, image: &DynamicImage) -> Result<FeatureVector> {
        ColorStatsExtractor.extract(image)
    }

    fn backbone(&self) -> Option<BackboneKind> {
        Some(self.kind)
    }

    fn rescale(&self) -> Option<bool> {
        Some(self.rescale)
    }
}

/// 単色のPNGを書き出す
pub fn write_solid_png(path: &Path, color: [u8; 3]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    RgbImage::from_pixel(8, 8, Rgb(color)).save(path).unwrap();
}

/// 赤系（Ripe）と青系（Unripe）の小さな画像群を作る
pub fn write_color_pool(dir: &Path, per_class: usize) -> (LabelSet, Vec<LabeledSample>) {
    let labels = LabelSet::new(["Ripe", "Unripe"]).unwrap();
    let mut pool = Vec::new();
    for i in 0..per_class {
        let shade = (i * 7 % 40) as u8;
        let ripe = dir.join(format!("ripe_{}.png", i));
        write_solid_png(&ripe, [215 + shade, 20 + shade, 20]);
        pool.push(LabeledSample::new(ripe, "Ripe"));

        let unripe = dir.join(format!("unripe_{}.png", i));
        write_solid_png(&unripe, [20, 20 + shade, 215 + shade]);
        pool.push(LabeledSample::new(unripe, "Unripe"));
    }
    (labels, pool)
}
